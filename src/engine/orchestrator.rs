// Entry point: accepts tasks and content, wires the engine parts together.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Instant;

use anyhow::Result;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::dispatch::{DispatchRequest, Dispatcher, TaskStream};
use super::ledger::ReplicationLedger;
use super::references::{self, FileRewrite};
use super::replication::{ReplicationEngine, Resolution};
use super::scheduler::Scheduler;
use super::stats::{EngineStats, Gauges, StatsSnapshot};
use super::store::{ContentInfo, ContentMetadata, ContentPage, ContentStore, Fingerprint};
use crate::api::task::{ContentReceipt, ResolvedContent, TaskDescriptor, TaskKind, TaskOutput};
use crate::config::{EngineConfig, CONTENT_NAME_PREFIX};
use crate::error::{EngineError, EngineResult};
use crate::worker::{
    CorrelationId, HealthMonitor, WorkerChannel, WorkerEvent, WorkerId, WorkerMessage,
    WorkerRegistry,
};

pub struct RequestOrchestrator {
    config: EngineConfig,
    registry: Arc<WorkerRegistry>,
    scheduler: Arc<Scheduler>,
    store: Arc<ContentStore>,
    ledger: Arc<ReplicationLedger>,
    dispatcher: Arc<Dispatcher>,
    replication: Arc<ReplicationEngine>,
    stats: Arc<EngineStats>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RequestOrchestrator {
    /// Build the engine. Background loops do not run until [`start`](Self::start).
    pub fn new(config: EngineConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let registry = Arc::new(WorkerRegistry::new(config.failure_threshold));
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&registry)));
        let store = Arc::new(ContentStore::open(&config)?);
        let ledger = Arc::new(ReplicationLedger::new(config.upstream_ttl()));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            config.stream_buffer,
        ));
        let stats = Arc::new(EngineStats::new());
        let shutdown = CancellationToken::new();
        let replication = Arc::new(ReplicationEngine::new(
            &config,
            Arc::clone(&store),
            Arc::clone(&ledger),
            Arc::clone(&registry),
            Arc::clone(&scheduler),
            Arc::clone(&dispatcher),
            Arc::clone(&stats),
            shutdown.clone(),
        ));

        info!(
            "orchestrator ready: content at {}, {} cached file(s)",
            config.content_dir,
            store.len()
        );
        Ok(Arc::new(Self {
            config,
            registry,
            scheduler,
            store,
            ledger,
            dispatcher,
            replication,
            stats,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<ReplicationLedger> {
        &self.ledger
    }

    pub fn replication(&self) -> &Arc<ReplicationEngine> {
        &self.replication
    }

    /// Spawn the health monitor, the eviction sweeper and the worker event listener.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        let monitor = HealthMonitor::new(
            Arc::clone(&self.registry),
            self.config.health_interval(),
            self.config.probe_timeout(),
            self.config.probe_retry(),
        );
        tasks.push(tokio::spawn(monitor.run(self.shutdown.clone())));

        let sweeper = Arc::clone(&self.replication).run_sweeper(self.config.sweep_interval());
        tasks.push(tokio::spawn(sweeper));

        let events = self.registry.subscribe();
        tasks.push(tokio::spawn(listen_worker_events(
            Arc::downgrade(self),
            events,
            self.shutdown.clone(),
        )));
        info!("orchestrator started");
    }

    /// Stop background loops and refuse new background replication.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("orchestrator stopped");
    }

    // Worker lifecycle

    /// Register a newly connected worker.
    pub fn attach_worker(&self, name: &str, channel: Arc<dyn WorkerChannel>) -> WorkerId {
        self.registry.register(name, channel)
    }

    /// Forget a disconnected worker: its tasks fail, its replicas are dropped.
    pub fn detach_worker(&self, worker: &WorkerId) {
        self.registry.deregister(worker);
        self.on_worker_lost(worker);
    }

    fn on_worker_lost(&self, worker: &WorkerId) {
        let failed = self.dispatcher.fail_worker(worker, "disconnected");
        let dropped = self.ledger.detach_worker(worker);
        if failed > 0 || dropped > 0 {
            info!(
                "worker {} gone: {} task(s) failed, {} replica(s) dropped",
                worker, failed, dropped
            );
        }
    }

    /// Reconcile after missing worker events.
    fn reconcile_workers(&self) {
        let live = self.registry.list_all();
        self.dispatcher.fail_orphans(&live);
        let live: HashSet<WorkerId> = live.into_iter().collect();
        let dropped = self.ledger.retain_workers(&live);
        debug!("reconciled workers, {} stale replica(s) dropped", dropped);
    }

    /// Route one message received from a worker.
    pub fn handle_message(&self, worker: &WorkerId, message: WorkerMessage) {
        self.dispatcher.handle_inbound(worker, message);
    }

    // Content

    /// Store caller bytes and make sure at least one worker holds a copy.
    ///
    /// Bytes stay cached even if no worker can take them yet.
    pub async fn ingest(&self, bytes: &[u8], metadata: ContentMetadata) -> EngineResult<ContentReceipt> {
        let fingerprint = self.store.put(bytes, metadata).await?;
        let content = self
            .store
            .metadata(&fingerprint)
            .ok_or_else(|| EngineError::ContentNotFound {
                reference: fingerprint.content_name(),
            })?;

        let healthy = self.registry.list_healthy();
        let (worker, remote) = match self.ledger.synced_on(&fingerprint, &healthy) {
            Some(placed) => {
                debug!("{} already on {}", fingerprint.short(), placed.0);
                placed
            }
            None => self.replication.upload(&fingerprint).await?,
        };
        Ok(ContentReceipt {
            name: fingerprint.content_name(),
            fingerprint,
            display_name: content.display_name,
            media_type: content.media_type,
            size_bytes: content.size_bytes,
            worker,
            remote,
        })
    }

    /// Map a caller reference to cached content.
    ///
    /// Accepts `files/<fingerprint>`, a bare fingerprint, or any remote name or
    /// URI previously reported by a worker.
    pub fn resolve_reference(&self, reference: &str) -> Option<Fingerprint> {
        let reference = reference.trim();
        let local = reference
            .rfind(CONTENT_NAME_PREFIX)
            .map(|idx| &reference[idx + CONTENT_NAME_PREFIX.len()..])
            .unwrap_or(reference);
        if let Some(fp) = Fingerprint::parse(local).filter(|fp| self.store.contains(fp)) {
            return Some(fp);
        }
        self.ledger
            .resolve_remote(reference)
            .filter(|fp| self.store.contains(fp))
    }

    /// Resolve a single reference to a fresh remote copy on some worker.
    pub async fn resolve_content(&self, reference: &str) -> EngineResult<ResolvedContent> {
        let fingerprint = self
            .resolve_reference(reference)
            .ok_or_else(|| EngineError::ContentNotFound {
                reference: reference.to_string(),
            })?;
        let mut resolution = self.replication.resolve(std::slice::from_ref(&fingerprint)).await?;
        let remote = resolution.remotes.remove(&fingerprint).ok_or_else(|| {
            EngineError::protocol(format!("no remote copy of {} after placement", fingerprint))
        })?;
        Ok(ResolvedContent {
            fingerprint,
            worker: resolution.worker,
            remote,
            perfect_hit: resolution.perfect_hit,
        })
    }

    pub fn describe(&self, reference: &str) -> Option<ContentInfo> {
        let fingerprint = self.resolve_reference(reference)?;
        self.store.info(&fingerprint)
    }

    pub fn list_content(&self, page_size: usize, page_token: Option<&str>) -> EngineResult<ContentPage> {
        self.store.list(page_size, page_token)
    }

    /// Delete cached content and, best effort, its remote copies.
    pub async fn delete_content(&self, reference: &str) -> EngineResult<bool> {
        match self.resolve_reference(reference) {
            Some(fp) => self.replication.forget(&fp).await,
            None => Ok(false),
        }
    }

    // Tasks

    /// Run a task on a worker.
    ///
    /// File references in the payload are resolved and rewritten first. If the
    /// worker's upstream reports one of the rewritten files as gone, its copies
    /// are rebuilt and the task is re-dispatched once. Other upstream errors
    /// reach the caller untouched.
    pub async fn submit(&self, task: TaskDescriptor) -> EngineResult<TaskOutput> {
        self.stats.record_submitted();
        let id = task.correlation_id.clone();
        let outcome = self.run(task).await;
        match &outcome {
            Ok(_) => self.stats.record_completed(),
            Err(e) => {
                self.stats.record_failed(e);
                debug!("task {} failed: {}", id, e);
            }
        }
        outcome
    }

    async fn run(&self, task: TaskDescriptor) -> EngineResult<TaskOutput> {
        let TaskDescriptor {
            correlation_id,
            kind,
            operation,
            model,
            payload,
            cancel,
        } = task;

        let mut by_reference: HashMap<String, Fingerprint> = HashMap::new();
        let mut fingerprints: Vec<Fingerprint> = Vec::new();
        for reference in references::file_references(&payload) {
            if by_reference.contains_key(&reference) {
                continue;
            }
            let fp = self
                .resolve_reference(&reference)
                .ok_or_else(|| EngineError::ContentNotFound {
                    reference: reference.clone(),
                })?;
            if !fingerprints.contains(&fp) {
                fingerprints.push(fp.clone());
            }
            by_reference.insert(reference, fp);
        }

        let mut resolution = if fingerprints.is_empty() {
            None
        } else {
            Some(self.replication.resolve(&fingerprints).await?)
        };
        let mut recovered = false;

        loop {
            let (worker, body) = match &resolution {
                Some(r) => (r.worker.clone(), self.rewrite(&payload, &by_reference, r)),
                None => {
                    let worker = self
                        .scheduler
                        .next()
                        .ok_or_else(|| EngineError::no_capacity("no healthy worker"))?;
                    (worker, payload.clone())
                }
            };
            let request = DispatchRequest {
                correlation_id: correlation_id.clone(),
                operation: operation.clone(),
                model: model.clone(),
                payload: body,
            };

            let outcome = match kind {
                TaskKind::Unary => self
                    .dispatcher
                    .call(&worker, request, self.config.request_timeout(), cancel.clone())
                    .await
                    .map(TaskOutput::Unary),
                TaskKind::Stream => {
                    let recoverable = resolution.as_ref().filter(|_| !recovered);
                    self.open_stream(&worker, request, cancel.clone(), recoverable)
                        .await
                        .map(TaskOutput::Stream)
                }
            };

            let err = match outcome {
                Err(err) if !recovered => err,
                other => return other,
            };
            let affected = expired_fingerprints(&err, resolution.as_ref());
            if affected.is_empty() {
                return Err(err);
            }
            warn!(
                "task {}: {} reported {} file(s) gone upstream, rebuilding",
                correlation_id,
                worker,
                affected.len()
            );
            let target = self.replication.recover_expired(&affected, &worker).await?;
            resolution = Some(self.replication.resolve_on(&target, &fingerprints).await?);
            recovered = true;
        }
    }

    /// Open a stream and wait for its first event.
    ///
    /// A first event reporting one of `recoverable`'s files as gone is returned
    /// as an error so the caller can recover before anything was delivered.
    async fn open_stream(
        &self,
        worker: &WorkerId,
        request: DispatchRequest,
        cancel: Option<CancellationToken>,
        recoverable: Option<&Resolution>,
    ) -> EngineResult<TaskStream> {
        let mut stream = self
            .dispatcher
            .open_stream(worker, request, self.config.stream_idle_timeout(), cancel)
            .await?;
        match stream.next().await {
            Some(Err(err)) if !expired_fingerprints(&err, recoverable).is_empty() => Err(err),
            Some(item) => {
                stream.push_front(item);
                Ok(stream)
            }
            None => Ok(stream),
        }
    }

    fn rewrite(&self, payload: &Value, by_reference: &HashMap<String, Fingerprint>, resolution: &Resolution) -> Value {
        let mut body = payload.clone();
        let rewritten = references::rewrite_file_data(&mut body, |reference| {
            let fp = by_reference.get(reference)?;
            let remote = resolution.remotes.get(fp)?;
            let content = self.store.metadata(fp)?;
            Some(FileRewrite {
                uri: remote.reference().to_string(),
                media_type: content.media_type,
                display_name: content.display_name,
            })
        });
        debug!("rewrote {} file reference(s) for {}", rewritten, resolution.worker);
        body
    }

    /// Cancel an in-flight task. Returns false if it is unknown or already resolved.
    pub async fn cancel(&self, id: &CorrelationId) -> bool {
        self.dispatcher.cancel(id).await
    }

    pub fn in_flight(&self) -> usize {
        self.dispatcher.in_flight()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot(Gauges {
            in_flight_tasks: self.dispatcher.in_flight(),
            healthy_workers: self.registry.list_healthy().len(),
            cached_files: self.store.len(),
            cached_bytes: self.store.stored_bytes(),
        })
    }

    /// Run a sweep now instead of waiting for the next interval.
    pub fn sweep_now(&self, now: Instant) -> Vec<Fingerprint> {
        self.replication.sweep(now)
    }
}

/// Fingerprints whose remote copy an upstream error reports as gone.
///
/// Empty unless the error is a missing-file report that names one of the
/// remote files the task was rewritten to.
fn expired_fingerprints(err: &EngineError, resolution: Option<&Resolution>) -> Vec<Fingerprint> {
    let (Some(resolution), EngineError::Upstream { detail, .. }) = (resolution, err) else {
        return Vec::new();
    };
    if !err.is_expired_reference() {
        return Vec::new();
    }
    let text = detail.to_string();
    resolution
        .remotes
        .iter()
        .filter(|(_, remote)| {
            text.contains(&remote.name) || remote.uri.as_deref().is_some_and(|u| text.contains(u))
        })
        .map(|(fp, _)| fp.clone())
        .collect()
}

async fn listen_worker_events(
    orchestrator: Weak<RequestOrchestrator>,
    mut events: tokio::sync::broadcast::Receiver<WorkerEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(orchestrator) = orchestrator.upgrade() else {
            break;
        };
        match event {
            Ok(WorkerEvent::Deregistered(worker)) => orchestrator.on_worker_lost(&worker),
            Ok(WorkerEvent::HealthChanged { worker, to, .. }) => {
                debug!("worker {} is now {}", worker, to)
            }
            Ok(WorkerEvent::Registered(_)) => {}
            Err(RecvError::Lagged(missed)) => {
                warn!("worker event listener lagged by {} event(s)", missed);
                orchestrator.reconcile_workers();
            }
            Err(RecvError::Closed) => break,
        }
    }
}
