// Set of currently connected workers and their health.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

use super::traits::WorkerChannel;
use crate::config::WORKER_EVENT_CAPACITY;

/// Unique id of one worker connection (`<name>#<seq>`).
///
/// A worker that reconnects under the same name gets a new id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The display name the worker connected with.
    pub fn name(&self) -> &str {
        self.0.rsplit_once('#').map(|(name, _)| name).unwrap_or(&self.0)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Unhealthy,
    Unknown,
}

impl Health {
    /// Whether the scheduler may pick a worker in this state.
    pub fn is_schedulable(self) -> bool {
        !matches!(self, Health::Unhealthy)
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Health::Healthy => "healthy",
            Health::Unhealthy => "unhealthy",
            Health::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Registered(WorkerId),
    HealthChanged {
        worker: WorkerId,
        from: Health,
        to: Health,
    },
    Deregistered(WorkerId),
}

/// Point-in-time view of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub id: WorkerId,
    pub health: Health,
    pub idle_secs: u64,
    pub connected_secs: u64,
    pub consecutive_failures: u32,
}

struct WorkerEntry {
    channel: Arc<dyn WorkerChannel>,
    health: Health,
    connected_at: Instant,
    last_seen: Instant,
    failures: u32,
    ack: Arc<Notify>,
}

#[derive(Default)]
struct RegistryInner {
    order: Vec<WorkerId>,
    entries: HashMap<WorkerId, WorkerEntry>,
}

pub struct WorkerRegistry {
    inner: RwLock<RegistryInner>,
    next_seq: AtomicU64,
    failure_threshold: u32,
    events: broadcast::Sender<WorkerEvent>,
}

impl WorkerRegistry {
    pub fn new(failure_threshold: u32) -> Self {
        let (events, _) = broadcast::channel(WORKER_EVENT_CAPACITY);
        Self {
            inner: RwLock::new(RegistryInner::default()),
            next_seq: AtomicU64::new(1),
            failure_threshold: failure_threshold.max(1),
            events,
        }
    }

    /// Subscribe to registration and health transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    /// Add a newly connected worker. It starts in `Unknown` and is schedulable.
    pub fn register(&self, name: &str, channel: Arc<dyn WorkerChannel>) -> WorkerId {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let id = WorkerId(format!("{}#{}", name, seq));
        let now = Instant::now();
        {
            let mut inner = self.inner.write();
            inner.order.push(id.clone());
            inner.entries.insert(
                id.clone(),
                WorkerEntry {
                    channel,
                    health: Health::Unknown,
                    connected_at: now,
                    last_seen: now,
                    failures: 0,
                    ack: Arc::new(Notify::new()),
                },
            );
        }
        info!("worker {} registered", id);
        let _ = self.events.send(WorkerEvent::Registered(id.clone()));
        id
    }

    /// Remove a worker. Returns false if it was already gone.
    pub fn deregister(&self, id: &WorkerId) -> bool {
        let removed = {
            let mut inner = self.inner.write();
            let removed = inner.entries.remove(id).is_some();
            if removed {
                inner.order.retain(|w| w != id);
            }
            removed
        };
        if removed {
            info!("worker {} deregistered", id);
            let _ = self.events.send(WorkerEvent::Deregistered(id.clone()));
        }
        removed
    }

    /// Schedulable workers (`Healthy` or `Unknown`) in registration order.
    pub fn list_healthy(&self) -> Vec<WorkerId> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter(|id| {
                inner
                    .entries
                    .get(*id)
                    .is_some_and(|e| e.health.is_schedulable() && !e.channel.is_closed())
            })
            .cloned()
            .collect()
    }

    /// Every registered worker in registration order.
    pub fn list_all(&self) -> Vec<WorkerId> {
        self.inner.read().order.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &WorkerId) -> bool {
        self.inner.read().entries.contains_key(id)
    }

    pub fn health(&self, id: &WorkerId) -> Option<Health> {
        self.inner.read().entries.get(id).map(|e| e.health)
    }

    pub fn channel(&self, id: &WorkerId) -> Option<Arc<dyn WorkerChannel>> {
        self.inner.read().entries.get(id).map(|e| Arc::clone(&e.channel))
    }

    /// Channel plus the notifier fired when the worker acknowledges a probe.
    pub fn probe_handle(&self, id: &WorkerId) -> Option<(Arc<dyn WorkerChannel>, Arc<Notify>)> {
        self.inner
            .read()
            .entries
            .get(id)
            .map(|e| (Arc::clone(&e.channel), Arc::clone(&e.ack)))
    }

    pub fn status(&self) -> Vec<WorkerStatus> {
        let now = Instant::now();
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| {
                inner.entries.get(id).map(|e| WorkerStatus {
                    id: id.clone(),
                    health: e.health,
                    idle_secs: now.saturating_duration_since(e.last_seen).as_secs(),
                    connected_secs: now.saturating_duration_since(e.connected_at).as_secs(),
                    consecutive_failures: e.failures,
                })
            })
            .collect()
    }

    /// Record inbound traffic from a worker.
    pub fn touch(&self, id: &WorkerId) {
        if let Some(entry) = self.inner.write().entries.get_mut(id) {
            entry.last_seen = Instant::now();
        }
    }

    /// A probe acknowledgement: the worker is healthy and its failures are forgiven.
    pub fn heartbeat(&self, id: &WorkerId) {
        let (transition, ack) = {
            let mut inner = self.inner.write();
            let Some(entry) = inner.entries.get_mut(id) else {
                return;
            };
            entry.last_seen = Instant::now();
            entry.failures = 0;
            let from = entry.health;
            entry.health = Health::Healthy;
            (
                (from != Health::Healthy).then_some(from),
                Arc::clone(&entry.ack),
            )
        };
        ack.notify_waiters();
        if let Some(from) = transition {
            self.publish_transition(id, from, Health::Healthy);
        }
    }

    /// A dispatch to this worker failed or timed out.
    ///
    /// The first failure demotes `Healthy` to `Unknown`; reaching the threshold
    /// marks the worker `Unhealthy`.
    pub fn mark_observed_failure(&self, id: &WorkerId) {
        let transition = {
            let mut inner = self.inner.write();
            let Some(entry) = inner.entries.get_mut(id) else {
                return;
            };
            entry.failures = entry.failures.saturating_add(1);
            let from = entry.health;
            let to = if entry.failures >= self.failure_threshold {
                Health::Unhealthy
            } else if from == Health::Healthy {
                Health::Unknown
            } else {
                from
            };
            entry.health = to;
            (from != to).then_some((from, to))
        };
        if let Some((from, to)) = transition {
            self.publish_transition(id, from, to);
        }
    }

    /// The worker did not answer its probes.
    pub fn mark_unhealthy(&self, id: &WorkerId) {
        let transition = {
            let mut inner = self.inner.write();
            let Some(entry) = inner.entries.get_mut(id) else {
                return;
            };
            let from = entry.health;
            entry.health = Health::Unhealthy;
            (from != Health::Unhealthy).then_some(from)
        };
        if let Some(from) = transition {
            self.publish_transition(id, from, Health::Unhealthy);
        }
    }

    fn publish_transition(&self, id: &WorkerId, from: Health, to: Health) {
        match to {
            Health::Unhealthy => warn!("worker {} {} -> {}", id, from, to),
            _ => debug!("worker {} {} -> {}", id, from, to),
        }
        let _ = self.events.send(WorkerEvent::HealthChanged {
            worker: id.clone(),
            from,
            to,
        });
    }
}
