// Live counters: task outcomes, placement hit rate, replication throughput.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::EngineError;

struct StatsSample {
    at: Instant,
    replicated_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    pub in_flight_tasks: usize,
    pub healthy_workers: usize,
    pub cached_files: usize,
    pub cached_bytes: u64,
    pub perfect_hits: u64,
    pub placement_misses: u64,
    pub hit_rate: f64,
    pub replications: u64,
    pub replication_failures: u64,
    pub replication_bps: u64,
    pub ledger_resets: u64,
    pub evictions: u64,
}

/// Gauges the counters do not own, supplied when a snapshot is taken.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gauges {
    pub in_flight_tasks: usize,
    pub healthy_workers: usize,
    pub cached_files: usize,
    pub cached_bytes: u64,
}

pub struct EngineStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    perfect_hits: AtomicU64,
    misses: AtomicU64,
    replications: AtomicU64,
    replication_failures: AtomicU64,
    replicated_bytes: AtomicU64,
    resets: AtomicU64,
    evictions: AtomicU64,
    last_sample: Mutex<StatsSample>,
}

impl EngineStats {
    pub fn new() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            perfect_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            replications: AtomicU64::new(0),
            replication_failures: AtomicU64::new(0),
            replicated_bytes: AtomicU64::new(0),
            resets: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            last_sample: Mutex::new(StatsSample {
                at: Instant::now(),
                replicated_bytes: 0,
            }),
        }
    }

    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed task; cancellations are tracked separately.
    pub fn record_failed(&self, err: &EngineError) {
        match err {
            EngineError::Cancelled { .. } => self.cancelled.fetch_add(1, Ordering::Relaxed),
            _ => self.failed.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_placement(&self, perfect_hit: bool) {
        if perfect_hit {
            self.perfect_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_replicated(&self, bytes: u64) {
        self.replications.fetch_add(1, Ordering::Relaxed);
        self.replicated_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_replication_failure(&self) {
        self.replication_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reset(&self) {
        self.resets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evicted(&self, count: usize) {
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self, gauges: Gauges) -> StatsSnapshot {
        let now = Instant::now();
        let replicated = self.replicated_bytes.load(Ordering::Relaxed);

        let replication_bps = {
            let mut sample = self.last_sample.lock();
            let elapsed = now.duration_since(sample.at).as_secs_f64();
            let bps = if elapsed > 0.1 {
                (replicated.saturating_sub(sample.replicated_bytes) as f64 / elapsed) as u64
            } else {
                0
            };
            sample.at = now;
            sample.replicated_bytes = replicated;
            bps
        };

        let perfect_hits = self.perfect_hits.load(Ordering::Relaxed);
        let placement_misses = self.misses.load(Ordering::Relaxed);
        let placements = perfect_hits + placement_misses;
        let hit_rate = if placements > 0 {
            perfect_hits as f64 / placements as f64
        } else {
            0.0
        };

        StatsSnapshot {
            tasks_submitted: self.submitted.load(Ordering::Relaxed),
            tasks_completed: self.completed.load(Ordering::Relaxed),
            tasks_failed: self.failed.load(Ordering::Relaxed),
            tasks_cancelled: self.cancelled.load(Ordering::Relaxed),
            in_flight_tasks: gauges.in_flight_tasks,
            healthy_workers: gauges.healthy_workers,
            cached_files: gauges.cached_files,
            cached_bytes: gauges.cached_bytes,
            perfect_hits,
            placement_misses,
            hit_rate,
            replications: self.replications.load(Ordering::Relaxed),
            replication_failures: self.replication_failures.load(Ordering::Relaxed),
            replication_bps,
            ledger_resets: self.resets.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate_and_outcomes() {
        let stats = EngineStats::new();
        stats.record_placement(true);
        stats.record_placement(true);
        stats.record_placement(true);
        stats.record_placement(false);
        stats.record_replicated(1000);
        stats.record_failed(&EngineError::Cancelled {
            correlation_id: "t".into(),
        });
        stats.record_failed(&EngineError::no_capacity("none"));

        let snap = stats.snapshot(Gauges {
            in_flight_tasks: 2,
            ..Gauges::default()
        });
        assert_eq!(snap.in_flight_tasks, 2);
        assert_eq!(snap.tasks_cancelled, 1);
        assert_eq!(snap.tasks_failed, 1);
        assert_eq!(snap.replications, 1);
        assert!((snap.hit_rate - 0.75).abs() < f64::EPSILON);
    }
}
