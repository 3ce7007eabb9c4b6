// Which workers hold a remote copy of which cached content.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::CONTENT_NAME_PREFIX;
use crate::engine::store::Fingerprint;
use crate::worker::WorkerId;

/// Identifier of a remote copy as reported by the worker that made it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

impl RemoteFile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uri: None,
        }
    }

    /// What to put into an outgoing file reference.
    pub fn reference(&self) -> &str {
        self.uri.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaState {
    Pending,
    Synced { remote: RemoteFile, synced_at: Instant },
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaStatus {
    Pending,
    Synced,
    Expired,
}

impl ReplicaState {
    fn status(&self) -> ReplicaStatus {
        match self {
            ReplicaState::Pending => ReplicaStatus::Pending,
            ReplicaState::Synced { .. } => ReplicaStatus::Synced,
            ReplicaState::Expired => ReplicaStatus::Expired,
        }
    }
}

/// Placement decision for a set of fingerprints.
#[derive(Debug, Clone, PartialEq)]
pub enum Placement {
    /// The initially picked worker already holds fresh copies of everything.
    Hit {
        worker: WorkerId,
        remotes: Vec<(Fingerprint, RemoteFile)>,
    },
    Miss {
        /// Worker with the fewest missing copies; the task goes here.
        target: WorkerId,
        target_synced: Vec<(Fingerprint, RemoteFile)>,
        target_missing: Vec<Fingerprint>,
        /// Round-robin pick, healed in the background when it is not the target.
        initial: WorkerId,
        initial_missing: Vec<Fingerprint>,
    },
}

#[derive(Default)]
struct LedgerInner {
    replicas: HashMap<Fingerprint, HashMap<WorkerId, ReplicaState>>,
    reverse: HashMap<String, Fingerprint>,
}

impl LedgerInner {
    fn fresh_remote(
        &self,
        fingerprint: &Fingerprint,
        worker: &WorkerId,
        now: Instant,
        ttl: Duration,
    ) -> Option<&RemoteFile> {
        match self.replicas.get(fingerprint)?.get(worker)? {
            ReplicaState::Synced { remote, synced_at }
                if now.saturating_duration_since(*synced_at) < ttl =>
            {
                Some(remote)
            }
            _ => None,
        }
    }

    fn set(&mut self, fingerprint: &Fingerprint, worker: &WorkerId, state: ReplicaState) {
        let per_worker = self.replicas.entry(fingerprint.clone()).or_default();
        if let Some(ReplicaState::Synced { remote, .. }) = per_worker.insert(worker.clone(), state)
        {
            self.reverse.remove(&remote.name);
        }
    }

    fn remove(&mut self, fingerprint: &Fingerprint, worker: &WorkerId) -> Option<ReplicaState> {
        let per_worker = self.replicas.get_mut(fingerprint)?;
        let old = per_worker.remove(worker);
        if per_worker.is_empty() {
            self.replicas.remove(fingerprint);
        }
        if let Some(ReplicaState::Synced { remote, .. }) = &old {
            self.reverse.remove(&remote.name);
        }
        old
    }
}

/// Forward map (`fingerprint → worker → state`) and reverse index
/// (`remote name → fingerprint`) behind one lock.
///
/// Every `Synced` entry has exactly one reverse row; `Pending` and `Expired`
/// entries have none.
pub struct ReplicationLedger {
    inner: Mutex<LedgerInner>,
    replica_ttl: Duration,
}

impl ReplicationLedger {
    /// `replica_ttl` is how long a remote copy is trusted after it was made.
    pub fn new(replica_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(LedgerInner::default()),
            replica_ttl,
        }
    }

    /// A transfer to `worker` is starting. Any previous copy there is forgotten.
    pub fn mark_pending(&self, fingerprint: &Fingerprint, worker: &WorkerId) {
        self.inner
            .lock()
            .set(fingerprint, worker, ReplicaState::Pending);
    }

    pub fn mark_synced(&self, fingerprint: &Fingerprint, worker: &WorkerId, remote: RemoteFile) {
        let mut inner = self.inner.lock();
        let name = remote.name.clone();
        inner.set(
            fingerprint,
            worker,
            ReplicaState::Synced {
                remote,
                synced_at: Instant::now(),
            },
        );
        inner.reverse.insert(name, fingerprint.clone());
    }

    /// A transfer failed; drop its pending marker.
    pub fn clear_pending(&self, fingerprint: &Fingerprint, worker: &WorkerId) {
        let mut inner = self.inner.lock();
        let pending = matches!(
            inner.replicas.get(fingerprint).and_then(|m| m.get(worker)),
            Some(ReplicaState::Pending)
        );
        if pending {
            inner.remove(fingerprint, worker);
        }
    }

    /// Upstream reported `fingerprint` missing on `reporter`.
    ///
    /// The reporter's entry goes to `Expired`; every other entry goes back to
    /// `Pending` because the whole replica set is now suspect. All reverse rows
    /// for the fingerprint are removed. Returns the number of entries touched.
    pub fn reset(&self, fingerprint: &Fingerprint, reporter: &WorkerId) -> usize {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let per_worker = inner.replicas.entry(fingerprint.clone()).or_default();
        per_worker
            .entry(reporter.clone())
            .or_insert(ReplicaState::Expired);
        for (worker, state) in per_worker.iter_mut() {
            let next = if worker == reporter {
                ReplicaState::Expired
            } else {
                ReplicaState::Pending
            };
            if let ReplicaState::Synced { remote, .. } = std::mem::replace(state, next) {
                inner.reverse.remove(&remote.name);
            }
        }
        per_worker.len()
    }

    /// Fresh remote copy of `fingerprint` on `worker`, if any.
    pub fn replica(&self, fingerprint: &Fingerprint, worker: &WorkerId) -> Option<RemoteFile> {
        self.inner
            .lock()
            .fresh_remote(fingerprint, worker, Instant::now(), self.replica_ttl)
            .cloned()
    }

    pub fn status(&self, fingerprint: &Fingerprint, worker: &WorkerId) -> Option<ReplicaStatus> {
        self.inner
            .lock()
            .replicas
            .get(fingerprint)
            .and_then(|m| m.get(worker))
            .map(ReplicaState::status)
    }

    /// Workers holding a `Synced` copy of `fingerprint`, sorted.
    pub fn replica_set(&self, fingerprint: &Fingerprint) -> Vec<WorkerId> {
        let inner = self.inner.lock();
        let mut workers: Vec<WorkerId> = inner
            .replicas
            .get(fingerprint)
            .map(|m| {
                m.iter()
                    .filter(|(_, s)| matches!(s, ReplicaState::Synced { .. }))
                    .map(|(w, _)| w.clone())
                    .collect()
            })
            .unwrap_or_default();
        workers.sort();
        workers
    }

    /// First of `candidates` holding a fresh copy of `fingerprint`.
    pub fn synced_on(
        &self,
        fingerprint: &Fingerprint,
        candidates: &[WorkerId],
    ) -> Option<(WorkerId, RemoteFile)> {
        let now = Instant::now();
        let inner = self.inner.lock();
        candidates.iter().find_map(|w| {
            inner
                .fresh_remote(fingerprint, w, now, self.replica_ttl)
                .map(|r| (w.clone(), r.clone()))
        })
    }

    /// Split `fingerprints` into fresh copies on `worker` and the ones it lacks.
    pub fn partition(
        &self,
        fingerprints: &[Fingerprint],
        worker: &WorkerId,
    ) -> (Vec<(Fingerprint, RemoteFile)>, Vec<Fingerprint>) {
        let now = Instant::now();
        let inner = self.inner.lock();
        let mut synced = Vec::new();
        let mut missing = Vec::new();
        for fp in fingerprints {
            match inner.fresh_remote(fp, worker, now, self.replica_ttl) {
                Some(remote) => synced.push((fp.clone(), remote.clone())),
                None => missing.push(fp.clone()),
            }
        }
        (synced, missing)
    }

    /// Decide where a task referencing `fingerprints` should run.
    ///
    /// `initial` is the round-robin pick. If it holds fresh copies of all
    /// fingerprints the result is a hit. Otherwise the candidate missing the
    /// fewest copies becomes the target; the initial pick wins ties, other ties
    /// are broken at random.
    pub fn plan(
        &self,
        fingerprints: &[Fingerprint],
        initial: &WorkerId,
        candidates: &[WorkerId],
        now: Instant,
    ) -> Placement {
        let inner = self.inner.lock();
        let split = |worker: &WorkerId| {
            let mut synced = Vec::new();
            let mut missing = Vec::new();
            for fp in fingerprints {
                match inner.fresh_remote(fp, worker, now, self.replica_ttl) {
                    Some(remote) => synced.push((fp.clone(), remote.clone())),
                    None => missing.push(fp.clone()),
                }
            }
            (synced, missing)
        };

        let (initial_synced, initial_missing) = split(initial);
        if initial_missing.is_empty() {
            return Placement::Hit {
                worker: initial.clone(),
                remotes: initial_synced,
            };
        }

        let mut scored: Vec<(&WorkerId, usize)> = candidates
            .iter()
            .map(|w| {
                let missing = fingerprints
                    .iter()
                    .filter(|fp| {
                        inner
                            .fresh_remote(fp, w, now, self.replica_ttl)
                            .is_none()
                    })
                    .count();
                (w, missing)
            })
            .collect();
        scored.push((initial, initial_missing.len()));
        let fewest = scored.iter().map(|(_, m)| *m).min().unwrap_or(0);
        let best: Vec<&WorkerId> = scored
            .iter()
            .filter(|(_, m)| *m == fewest)
            .map(|(w, _)| *w)
            .collect();

        let target = if best.contains(&initial) {
            initial.clone()
        } else {
            best.choose(&mut rand::rng())
                .map(|w| (*w).clone())
                .unwrap_or_else(|| initial.clone())
        };

        let (target_synced, target_missing) = if target == *initial {
            (initial_synced, initial_missing.clone())
        } else {
            split(&target)
        };
        debug!(
            "placement miss: initial {} lacks {}, target {} lacks {}",
            initial,
            initial_missing.len(),
            target,
            target_missing.len()
        );
        Placement::Miss {
            target,
            target_synced,
            target_missing,
            initial: initial.clone(),
            initial_missing,
        }
    }

    /// Map a remote reference back to cached content.
    ///
    /// Accepts a remote name, or a URI whose path ends in one.
    pub fn resolve_remote(&self, reference: &str) -> Option<Fingerprint> {
        let inner = self.inner.lock();
        if let Some(fp) = inner.reverse.get(reference) {
            return Some(fp.clone());
        }
        let idx = reference.rfind(CONTENT_NAME_PREFIX)?;
        inner.reverse.get(&reference[idx..]).cloned()
    }

    /// Drop every entry for `fingerprint`; returns the copies that were synced.
    pub fn forget(&self, fingerprint: &Fingerprint) -> Vec<(WorkerId, RemoteFile)> {
        let mut inner = self.inner.lock();
        let Some(per_worker) = inner.replicas.remove(fingerprint) else {
            return Vec::new();
        };
        let mut synced = Vec::new();
        for (worker, state) in per_worker {
            if let ReplicaState::Synced { remote, .. } = state {
                inner.reverse.remove(&remote.name);
                synced.push((worker, remote));
            }
        }
        synced
    }

    /// Drop every entry for a worker that went away. Returns the number removed.
    pub fn detach_worker(&self, worker: &WorkerId) -> usize {
        let mut inner = self.inner.lock();
        let held: Vec<Fingerprint> = inner
            .replicas
            .iter()
            .filter(|(_, m)| m.contains_key(worker))
            .map(|(fp, _)| fp.clone())
            .collect();
        for fp in &held {
            inner.remove(fp, worker);
        }
        held.len()
    }

    /// Drop entries for any worker not in `live`.
    pub fn retain_workers(&self, live: &HashSet<WorkerId>) -> usize {
        let mut inner = self.inner.lock();
        let stale: Vec<(Fingerprint, WorkerId)> = inner
            .replicas
            .iter()
            .flat_map(|(fp, m)| {
                m.keys()
                    .filter(|w| !live.contains(*w))
                    .map(move |w| (fp.clone(), w.clone()))
            })
            .collect();
        for (fp, w) in &stale {
            inner.remove(fp, w);
        }
        stale.len()
    }

    /// Number of reverse rows; equals the number of `Synced` entries.
    pub fn reverse_len(&self) -> usize {
        self.inner.lock().reverse.len()
    }

    pub fn synced_len(&self) -> usize {
        self.inner
            .lock()
            .replicas
            .values()
            .flat_map(|m| m.values())
            .filter(|s| matches!(s, ReplicaState::Synced { .. }))
            .count()
    }
}
