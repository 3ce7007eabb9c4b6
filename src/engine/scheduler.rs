// Round-robin worker selection.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::worker::{WorkerId, WorkerRegistry};

pub struct Scheduler {
    registry: Arc<WorkerRegistry>,
    counter: AtomicUsize,
}

impl Scheduler {
    pub fn new(registry: Arc<WorkerRegistry>) -> Self {
        Self {
            registry,
            counter: AtomicUsize::new(0),
        }
    }

    /// Pick the next healthy worker not in `excluding`.
    ///
    /// Over N consecutive calls against a stable healthy set of size N with
    /// no exclusions, every worker is returned exactly once.
    pub fn pick_worker(&self, excluding: &HashSet<WorkerId>) -> Option<WorkerId> {
        let healthy = self.registry.list_healthy();
        if healthy.is_empty() {
            return None;
        }
        let start = self.counter.fetch_add(1, Ordering::Relaxed) % healthy.len();
        (0..healthy.len())
            .map(|offset| &healthy[(start + offset) % healthy.len()])
            .find(|id| !excluding.contains(*id))
            .cloned()
    }

    /// Next worker with no exclusions.
    pub fn next(&self) -> Option<WorkerId> {
        self.pick_worker(&HashSet::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use crate::worker::{LocalChannel, WorkerMessage};
    use tokio::sync::mpsc;

    fn registry_with(n: usize) -> (Arc<WorkerRegistry>, Vec<mpsc::Receiver<WorkerMessage>>) {
        let registry = Arc::new(WorkerRegistry::new(3));
        let mut receivers = Vec::new();
        for i in 0..n {
            let (ch, rx) = LocalChannel::new(4);
            registry.register(&format!("w{}", i), Arc::new(ch));
            receivers.push(rx);
        }
        (registry, receivers)
    }

    #[test]
    fn every_worker_once_per_round() {
        let (registry, _rx) = registry_with(3);
        let scheduler = Scheduler::new(Arc::clone(&registry));
        let picks: HashSet<WorkerId> = (0..3).filter_map(|_| scheduler.next()).collect();
        assert_eq!(picks.len(), 3);
    }

    fn spread(picks: impl IntoIterator<Item = WorkerId>) -> Vec<usize> {
        let mut counts: HashMap<WorkerId, usize> = HashMap::new();
        for id in picks {
            *counts.entry(id).or_default() += 1;
        }
        let mut counts: Vec<usize> = counts.into_values().collect();
        counts.sort_unstable();
        counts
    }

    #[test]
    fn uneven_rounds_differ_by_at_most_one() {
        let (registry, _rx) = registry_with(3);
        let scheduler = Scheduler::new(Arc::clone(&registry));
        let picks: Vec<WorkerId> = (0..7).filter_map(|_| scheduler.next()).collect();
        assert_eq!(picks.len(), 7);
        assert_eq!(spread(picks), vec![2, 2, 3]);
    }

    #[test]
    fn concurrent_callers_are_spread_evenly() {
        let (registry, _rx) = registry_with(3);
        let scheduler = Scheduler::new(Arc::clone(&registry));
        let picks: Vec<WorkerId> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| s.spawn(|| (0..25).filter_map(|_| scheduler.next()).collect::<Vec<_>>()))
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });
        assert_eq!(picks.len(), 100);
        assert_eq!(spread(picks), vec![33, 33, 34]);
    }

    #[test]
    fn exclusions_are_skipped_and_exhaustion_is_none() {
        let (registry, _rx) = registry_with(2);
        let scheduler = Scheduler::new(Arc::clone(&registry));
        let all: HashSet<WorkerId> = registry.list_all().into_iter().collect();
        assert!(scheduler.pick_worker(&all).is_none());

        let first = registry.list_all()[0].clone();
        let only_first: HashSet<WorkerId> = [first.clone()].into_iter().collect();
        for _ in 0..4 {
            assert_ne!(scheduler.pick_worker(&only_first), Some(first.clone()));
        }
    }

    #[test]
    fn empty_registry_has_no_pick() {
        let registry = Arc::new(WorkerRegistry::new(3));
        assert!(Scheduler::new(registry).next().is_none());
    }
}
