// Periodic liveness probing of every registered worker.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::WorkerMessage;
use super::registry::{WorkerId, WorkerRegistry};
use crate::engine::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Acked,
    /// Every attempt went unanswered.
    Missed,
    /// The channel is gone; the worker was deregistered.
    Lost,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub acked: Vec<WorkerId>,
    pub missed: Vec<WorkerId>,
    pub lost: Vec<WorkerId>,
}

pub struct HealthMonitor {
    registry: Arc<WorkerRegistry>,
    interval: Duration,
    probe_timeout: Duration,
    retry: RetryPolicy,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        interval: Duration,
        probe_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            interval,
            probe_timeout,
            retry,
        }
    }

    /// Probe all workers every interval until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately; new workers get their first probe one interval in.
        ticker.tick().await;
        info!("health monitor started, interval {:?}", self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.probe_all().await;
                    debug!(
                        "health round: {} acked, {} missed, {} lost",
                        report.acked.len(),
                        report.missed.len(),
                        report.lost.len()
                    );
                }
            }
        }
        info!("health monitor stopped");
    }

    /// Probe every registered worker concurrently.
    pub async fn probe_all(&self) -> ProbeReport {
        let workers = self.registry.list_all();
        let outcomes = join_all(workers.iter().map(|id| self.probe(id))).await;

        let mut report = ProbeReport::default();
        for (id, outcome) in workers.into_iter().zip(outcomes) {
            match outcome {
                ProbeOutcome::Acked => report.acked.push(id),
                ProbeOutcome::Missed => report.missed.push(id),
                ProbeOutcome::Lost => report.lost.push(id),
            }
        }
        report
    }

    /// Probe one worker, retrying unanswered probes per the retry policy.
    pub async fn probe(&self, id: &WorkerId) -> ProbeOutcome {
        let mut attempt = 0;
        loop {
            let Some((channel, ack)) = self.registry.probe_handle(id) else {
                return ProbeOutcome::Lost;
            };

            let notified = ack.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Err(e) = channel.send_control(WorkerMessage::HealthProbe).await {
                warn!("probe to worker {} failed to send: {}", id, e);
                self.registry.deregister(id);
                return ProbeOutcome::Lost;
            }

            if tokio::time::timeout(self.probe_timeout, notified).await.is_ok() {
                return ProbeOutcome::Acked;
            }

            if !self.retry.should_retry(attempt) {
                warn!(
                    "worker {} missed {} probe(s), marking unhealthy",
                    id,
                    attempt + 1
                );
                self.registry.mark_unhealthy(id);
                return ProbeOutcome::Missed;
            }
            tokio::time::sleep(self.retry.delay_for(attempt)).await;
            attempt += 1;
        }
    }
}
