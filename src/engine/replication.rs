// Moves cached content onto workers and keeps the ledger in step.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::try_join_all;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::dispatch::{DispatchRequest, Dispatcher};
use super::ledger::{Placement, RemoteFile, ReplicationLedger};
use super::retry::RetryPolicy;
use super::scheduler::Scheduler;
use super::stats::EngineStats;
use super::store::{CachedContent, ContentStore, Fingerprint};
use crate::config::{EngineConfig, DELETE_OPERATION, UPLOAD_OPERATION};
use crate::error::{EngineError, EngineResult};
use crate::worker::{CorrelationId, WorkerId, WorkerRegistry};

/// Where a task's references live and what they are called there.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub worker: WorkerId,
    pub remotes: HashMap<Fingerprint, RemoteFile>,
    pub perfect_hit: bool,
}

/// Remote file description parsed from an upload reply.
struct UploadReport {
    remote: RemoteFile,
    size_bytes: Option<u64>,
    sha256: Option<String>,
}

fn parse_size(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_upload_reply(reply: &Value) -> EngineResult<UploadReport> {
    let file = reply
        .get("file")
        .or_else(|| reply.get("body").and_then(|b| b.get("file")))
        .unwrap_or(reply);
    let name = file
        .get("name")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| EngineError::protocol("upload reply carries no file name"))?;
    Ok(UploadReport {
        remote: RemoteFile {
            name: name.to_string(),
            uri: file.get("uri").and_then(Value::as_str).map(str::to_string),
        },
        size_bytes: file.get("sizeBytes").and_then(parse_size),
        sha256: file
            .get("sha256Hash")
            .or_else(|| file.get("sha256"))
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

pub struct ReplicationEngine {
    store: Arc<ContentStore>,
    ledger: Arc<ReplicationLedger>,
    registry: Arc<WorkerRegistry>,
    scheduler: Arc<Scheduler>,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<EngineStats>,
    retry: RetryPolicy,
    upload_timeout: Duration,
    public_base_url: String,
    max_references: usize,
    background: Arc<Semaphore>,
    in_flight: Mutex<HashSet<(Fingerprint, WorkerId)>>,
    shutdown: CancellationToken,
}

impl ReplicationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &EngineConfig,
        store: Arc<ContentStore>,
        ledger: Arc<ReplicationLedger>,
        registry: Arc<WorkerRegistry>,
        scheduler: Arc<Scheduler>,
        dispatcher: Arc<Dispatcher>,
        stats: Arc<EngineStats>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            ledger,
            registry,
            scheduler,
            dispatcher,
            stats,
            retry: config.upload_retry(),
            upload_timeout: config.upload_timeout(),
            public_base_url: config.public_base_url.trim_end_matches('/').to_string(),
            max_references: config.max_references,
            background: Arc::new(Semaphore::new(config.background_concurrency)),
            in_flight: Mutex::new(HashSet::new()),
            shutdown,
        }
    }

    /// URL a worker fetches `fingerprint` from, valid once.
    fn download_url(&self, fingerprint: &Fingerprint, token: &str) -> String {
        format!(
            "{}/internal/content/{}/{}",
            self.public_base_url, fingerprint, token
        )
    }

    /// Place freshly ingested content on one scheduled worker.
    pub async fn upload(&self, fingerprint: &Fingerprint) -> EngineResult<(WorkerId, RemoteFile)> {
        let worker = self
            .scheduler
            .next()
            .ok_or_else(|| EngineError::no_capacity("no healthy worker to upload to"))?;
        let remote = self.replicate_to(&worker, fingerprint).await?;
        Ok((worker, remote))
    }

    /// One transfer attempt: grant, dispatch, verify.
    async fn transfer(&self, worker: &WorkerId, content: &CachedContent) -> EngineResult<RemoteFile> {
        let fingerprint = &content.fingerprint;
        let token = self.store.grant(fingerprint);
        let payload = json!({
            "downloadUrl": self.download_url(fingerprint, &token),
            "file": {
                "displayName": content.display_name,
                "mimeType": content.media_type,
                "sizeBytes": content.size_bytes.to_string(),
                "sha256": fingerprint.as_str(),
            }
        });
        let request = DispatchRequest::new(CorrelationId::prefixed("replicate"), UPLOAD_OPERATION, payload);
        let reply = self
            .dispatcher
            .call(worker, request, self.upload_timeout, None)
            .await;
        self.store.revoke(&token);
        let report = parse_upload_reply(&reply?)?;

        if let Some(size) = report.size_bytes {
            if size != content.size_bytes {
                return Err(EngineError::ContentIntegrity {
                    fingerprint: fingerprint.to_string(),
                    detail: format!("worker reported {} bytes, expected {}", size, content.size_bytes),
                });
            }
        }
        if let Some(reported) = report.sha256.as_deref() {
            // Upstream may report a base64 digest; only compare hex digests.
            if let Some(hex) = Fingerprint::parse(reported) {
                if hex != *fingerprint {
                    return Err(EngineError::ContentIntegrity {
                        fingerprint: fingerprint.to_string(),
                        detail: format!("worker reported digest {}", hex),
                    });
                }
            }
        }
        Ok(report.remote)
    }

    /// Copy `fingerprint` onto `worker`, retrying transfers that arrive corrupted.
    pub async fn replicate_to(&self, worker: &WorkerId, fingerprint: &Fingerprint) -> EngineResult<RemoteFile> {
        let content = self
            .store
            .metadata(fingerprint)
            .ok_or_else(|| EngineError::ContentNotFound {
                reference: fingerprint.content_name(),
            })?;
        self.ledger.mark_pending(fingerprint, worker);

        let mut attempt = 0;
        loop {
            match self.transfer(worker, &content).await {
                Ok(remote) => {
                    self.ledger.mark_synced(fingerprint, worker, remote.clone());
                    self.store.mark_replicated(fingerprint);
                    self.stats.record_replicated(content.size_bytes);
                    info!(
                        "replicated {} to {} as {}",
                        fingerprint.short(),
                        worker,
                        remote.name
                    );
                    return Ok(remote);
                }
                Err(err @ EngineError::ContentIntegrity { .. }) if self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "replication of {} to {} failed ({}), retrying in {:?}",
                        fingerprint.short(),
                        worker,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    self.ledger.clear_pending(fingerprint, worker);
                    self.stats.record_replication_failure();
                    warn!(
                        "replication of {} to {} failed: {}",
                        fingerprint.short(),
                        worker,
                        err
                    );
                    return Err(err);
                }
            }
        }
    }

    /// Make every fingerprint available on `worker`, replicating what it lacks.
    pub async fn resolve_on(&self, worker: &WorkerId, fingerprints: &[Fingerprint]) -> EngineResult<Resolution> {
        let (synced, missing) = self.ledger.partition(fingerprints, worker);
        let perfect_hit = missing.is_empty();
        let replicated = try_join_all(missing.iter().map(|fp| async move {
            self.replicate_to(worker, fp).await.map(|remote| (fp.clone(), remote))
        }))
        .await?;

        let remotes: HashMap<Fingerprint, RemoteFile> = synced.into_iter().chain(replicated).collect();
        for fp in remotes.keys() {
            self.store.touch(fp);
        }
        Ok(Resolution {
            worker: worker.clone(),
            remotes,
            perfect_hit,
        })
    }

    /// Pick a worker for a task referencing `fingerprints` and make sure it holds them.
    ///
    /// Only the chosen worker is waited on. When the round-robin pick was not
    /// chosen, its missing copies are made in the background.
    pub async fn resolve(self: &Arc<Self>, fingerprints: &[Fingerprint]) -> EngineResult<Resolution> {
        let mut unique: Vec<Fingerprint> = Vec::with_capacity(fingerprints.len());
        for fp in fingerprints {
            if !unique.contains(fp) {
                unique.push(fp.clone());
            }
        }
        if unique.len() > self.max_references {
            return Err(EngineError::TooManyReferences {
                count: unique.len(),
                limit: self.max_references,
            });
        }
        if let Some(missing) = unique.iter().find(|fp| !self.store.contains(fp)) {
            return Err(EngineError::ContentNotFound {
                reference: missing.content_name(),
            });
        }

        let initial = self
            .scheduler
            .next()
            .ok_or_else(|| EngineError::no_capacity("no healthy worker"))?;
        let candidates = self.registry.list_healthy();

        match self.ledger.plan(&unique, &initial, &candidates, Instant::now()) {
            Placement::Hit { worker, remotes } => {
                self.stats.record_placement(true);
                for (fp, _) in &remotes {
                    self.store.touch(fp);
                }
                debug!("perfect hit on {} for {} file(s)", worker, remotes.len());
                Ok(Resolution {
                    worker,
                    remotes: remotes.into_iter().collect(),
                    perfect_hit: true,
                })
            }
            Placement::Miss {
                target,
                target_missing,
                initial,
                initial_missing,
                ..
            } => {
                self.stats.record_placement(false);
                if target != initial {
                    self.spawn_background(&initial, initial_missing);
                }
                info!(
                    "placement miss: dispatching to {}, replicating {} file(s) first",
                    target,
                    target_missing.len()
                );
                let mut resolution = self.resolve_on(&target, &unique).await?;
                resolution.perfect_hit = false;
                Ok(resolution)
            }
        }
    }

    /// Replicate `fingerprints` onto `worker` without anyone waiting.
    ///
    /// Idempotent per (fingerprint, worker): a pair already being copied is skipped.
    /// Returns the number of transfers started.
    pub fn spawn_background(self: &Arc<Self>, worker: &WorkerId, fingerprints: Vec<Fingerprint>) -> usize {
        if self.shutdown.is_cancelled() {
            return 0;
        }
        let mut started = 0;
        for fp in fingerprints {
            let key = (fp.clone(), worker.clone());
            if !self.in_flight.lock().insert(key.clone()) {
                continue;
            }
            started += 1;
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                let permit = tokio::select! {
                    permit = Arc::clone(&engine.background).acquire_owned() => permit.ok(),
                    _ = engine.shutdown.cancelled() => None,
                };
                if permit.is_some()
                    && engine.registry.contains(&key.1)
                    && engine.ledger.replica(&key.0, &key.1).is_none()
                {
                    match engine.replicate_to(&key.1, &key.0).await {
                        Ok(_) => debug!("background copy of {} on {} done", key.0.short(), key.1),
                        Err(e) => warn!("background copy of {} on {} failed: {}", key.0.short(), key.1, e),
                    }
                }
                drop(permit);
                engine.in_flight.lock().remove(&key);
            });
        }
        started
    }

    /// Background transfers queued or running.
    pub fn background_in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Recover from upstream reporting `fingerprints` missing on `reporter`.
    ///
    /// The replica sets are reset and fresh copies are made on a worker other
    /// than the reporter when one exists. Returns that worker.
    pub async fn recover_expired(&self, fingerprints: &[Fingerprint], reporter: &WorkerId) -> EngineResult<WorkerId> {
        for fp in fingerprints {
            let cleared = self.ledger.reset(fp, reporter);
            self.stats.record_reset();
            warn!(
                "{} reported {} missing upstream, {} replica(s) reset",
                reporter,
                fp.short(),
                cleared
            );
        }
        let excluding: HashSet<WorkerId> = [reporter.clone()].into_iter().collect();
        let worker = self
            .scheduler
            .pick_worker(&excluding)
            .or_else(|| self.scheduler.next())
            .ok_or_else(|| EngineError::no_capacity("no healthy worker to re-upload to"))?;
        try_join_all(fingerprints.iter().map(|fp| self.replicate_to(&worker, fp))).await?;
        Ok(worker)
    }

    /// Evict aged content and drop its remote copies. Returns what was evicted.
    pub fn sweep(&self, now: Instant) -> Vec<Fingerprint> {
        let evicted = self.store.sweep(now);
        self.stats.record_evicted(evicted.len());
        for fp in &evicted {
            let remotes = self.ledger.forget(fp);
            self.delete_remotes(remotes);
        }
        evicted
    }

    /// Remove content from the store, the ledger and (best effort) every worker.
    pub async fn forget(&self, fingerprint: &Fingerprint) -> EngineResult<bool> {
        let removed = self.store.remove(fingerprint).await?;
        let remotes = self.ledger.forget(fingerprint);
        self.delete_remotes(remotes);
        Ok(removed)
    }

    fn delete_remotes(&self, remotes: Vec<(WorkerId, RemoteFile)>) {
        for (worker, remote) in remotes {
            if !self.registry.contains(&worker) {
                continue;
            }
            let dispatcher = Arc::clone(&self.dispatcher);
            let timeout = self.upload_timeout;
            tokio::spawn(async move {
                let request = DispatchRequest::new(
                    CorrelationId::prefixed("delete"),
                    DELETE_OPERATION,
                    json!({ "name": remote.name }),
                );
                match dispatcher.call(&worker, request, timeout, None).await {
                    Ok(_) => debug!("deleted {} from {}", remote.name, worker),
                    Err(e) => debug!("delete of {} on {} failed: {}", remote.name, worker, e),
                }
            });
        }
    }

    /// Periodic eviction until shutdown.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep(Instant::now());
                }
            }
        }
        debug!("sweeper stopped");
    }
}
