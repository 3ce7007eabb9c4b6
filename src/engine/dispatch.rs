// Pending-task table: sends dispatches to workers and routes their replies back.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::Stream;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Sleep;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, trace, warn};

use crate::api::task::TaskKind;
use crate::config::CANCELLED_STATUS;
use crate::error::{EngineError, EngineResult};
use crate::worker::{CorrelationId, WorkerId, WorkerMessage, WorkerRegistry};

/// What to send to a worker for one task.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub correlation_id: CorrelationId,
    pub operation: String,
    pub model: Option<String>,
    pub payload: Value,
}

impl DispatchRequest {
    pub fn new(correlation_id: CorrelationId, operation: impl Into<String>, payload: Value) -> Self {
        Self {
            correlation_id,
            operation: operation.into(),
            model: None,
            payload,
        }
    }
}

/// How a stream ended. Read by the consumer once the chunk channel closes.
#[derive(Debug)]
enum StreamEnd {
    Finished(Option<Value>),
    Failed(EngineError),
}

/// Router side of a stream. Partial events go through a bounded channel that
/// is only ever written with `try_send`; the terminal event is parked in `end`
/// and the channel is closed by dropping the sender.
struct StreamSink {
    tx: mpsc::Sender<Value>,
    end: Arc<Mutex<Option<StreamEnd>>>,
}

impl StreamSink {
    fn close(self, end: StreamEnd) {
        *self.end.lock() = Some(end);
    }
}

enum Reply {
    Unary(oneshot::Sender<EngineResult<Value>>),
    Stream(StreamSink),
}

struct PendingTask {
    worker: WorkerId,
    kind: TaskKind,
    created_at: Instant,
    cancelled: bool,
    reply: Reply,
    // Fires once the entry leaves the table, whichever way it leaves.
    _settled: DropGuard,
}

/// Inbound message addressed to a pending task.
enum Inbound {
    Data { value: Value, finished: bool },
    Error { code: u16, detail: Value },
}

impl Inbound {
    fn is_terminal(&self) -> bool {
        match self {
            Inbound::Data { finished, .. } => *finished,
            Inbound::Error { .. } => true,
        }
    }
}

pub struct Dispatcher {
    registry: Arc<WorkerRegistry>,
    pending: Mutex<HashMap<CorrelationId, PendingTask>>,
    stream_buffer: usize,
}

impl Dispatcher {
    pub fn new(registry: Arc<WorkerRegistry>, stream_buffer: usize) -> Self {
        Self {
            registry,
            pending: Mutex::new(HashMap::new()),
            stream_buffer: stream_buffer.max(1),
        }
    }

    /// Add a pending task. The returned token is cancelled when the task settles.
    fn register(&self, id: &CorrelationId, worker: &WorkerId, reply: Reply) -> EngineResult<CancellationToken> {
        let kind = match reply {
            Reply::Unary(_) => TaskKind::Unary,
            Reply::Stream(_) => TaskKind::Stream,
        };
        let mut pending = self.pending.lock();
        if pending.contains_key(id) {
            return Err(EngineError::DuplicateTask {
                correlation_id: id.to_string(),
            });
        }
        let settled = CancellationToken::new();
        pending.insert(
            id.clone(),
            PendingTask {
                worker: worker.clone(),
                kind,
                created_at: Instant::now(),
                cancelled: false,
                reply,
                _settled: settled.clone().drop_guard(),
            },
        );
        Ok(settled)
    }

    /// Remove a pending task without resolving it. Whoever removes it owns the outcome.
    fn take(&self, id: &CorrelationId) -> Option<PendingTask> {
        self.pending.lock().remove(id)
    }

    async fn send_dispatch(&self, worker: &WorkerId, request: DispatchRequest) -> EngineResult<()> {
        let channel = self
            .registry
            .channel(worker)
            .ok_or_else(|| EngineError::WorkerFailure {
                worker: worker.clone(),
                reason: "worker is not connected".to_string(),
            })?;
        let message = WorkerMessage::Dispatch {
            correlation_id: request.correlation_id,
            operation: request.operation,
            model: request.model,
            payload: request.payload,
        };
        channel.send(message).await.map_err(|e| {
            self.registry.mark_observed_failure(worker);
            EngineError::WorkerFailure {
                worker: worker.clone(),
                reason: e.to_string(),
            }
        })
    }

    /// Dispatch a unary task and wait for its terminal response.
    ///
    /// Cancelling `cancel` forwards a cancellation to the worker; the call still
    /// resolves with whatever the worker answers (normally `Cancelled`).
    pub async fn call(
        &self,
        worker: &WorkerId,
        request: DispatchRequest,
        timeout: Duration,
        cancel: Option<CancellationToken>,
    ) -> EngineResult<Value> {
        let id = request.correlation_id.clone();
        let (tx, mut rx) = oneshot::channel();
        self.register(&id, worker, Reply::Unary(tx))?;
        if let Err(e) = self.send_dispatch(worker, request).await {
            self.take(&id);
            return Err(e);
        }
        debug!("task {} dispatched to {}", id, worker);

        let cancel = cancel.unwrap_or_default();
        let mut cancel_forwarded = false;
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                reply = &mut rx => {
                    return reply.unwrap_or_else(|_| Err(EngineError::WorkerFailure {
                        worker: worker.clone(),
                        reason: "task dropped without a reply".to_string(),
                    }));
                }
                _ = cancel.cancelled(), if !cancel_forwarded => {
                    cancel_forwarded = true;
                    self.cancel(&id).await;
                }
                _ = &mut deadline => {
                    if self.take(&id).is_some() {
                        warn!("task {} on {} timed out after {:?}", id, worker, timeout);
                        self.registry.mark_observed_failure(worker);
                        return Err(EngineError::Timeout { after: timeout });
                    }
                    // Resolved concurrently with the deadline; the reply is already queued.
                    return (&mut rx).await.unwrap_or(Err(EngineError::Timeout { after: timeout }));
                }
            }
        }
    }

    /// Dispatch a streaming task. Events arrive through the returned stream.
    ///
    /// Cancelling `cancel` forwards a cancellation to the worker for as long
    /// as the task is pending.
    pub async fn open_stream(
        self: &Arc<Self>,
        worker: &WorkerId,
        request: DispatchRequest,
        idle_timeout: Duration,
        cancel: Option<CancellationToken>,
    ) -> EngineResult<TaskStream> {
        let id = request.correlation_id.clone();
        let (tx, rx) = mpsc::channel(self.stream_buffer);
        let end = Arc::new(Mutex::new(None));
        let sink = StreamSink {
            tx,
            end: Arc::clone(&end),
        };
        let settled = self.register(&id, worker, Reply::Stream(sink))?;
        if let Err(e) = self.send_dispatch(worker, request).await {
            self.take(&id);
            return Err(e);
        }
        debug!("stream {} dispatched to {}", id, worker);

        if let Some(token) = cancel {
            let dispatcher = Arc::clone(self);
            let id = id.clone();
            tokio::spawn(async move {
                tokio::select! {
                    biased;
                    _ = settled.cancelled() => {}
                    _ = token.cancelled() => {
                        dispatcher.cancel(&id).await;
                    }
                }
            });
        }

        Ok(TaskStream {
            correlation_id: id,
            worker: worker.clone(),
            rx,
            end,
            dispatcher: Arc::clone(self),
            idle_timeout,
            idle: Box::pin(tokio::time::sleep(idle_timeout)),
            buffered: None,
            done: false,
        })
    }

    /// Ask the owning worker to stop a task. Returns false if no such task is pending.
    ///
    /// The pending entry stays until the worker answers, so the caller still
    /// sees exactly one terminal outcome.
    pub async fn cancel(&self, id: &CorrelationId) -> bool {
        let worker = {
            let mut pending = self.pending.lock();
            let Some(task) = pending.get_mut(id) else {
                return false;
            };
            if task.cancelled {
                return true;
            }
            task.cancelled = true;
            task.worker.clone()
        };
        match self.registry.channel(&worker) {
            Some(channel) => {
                let message = WorkerMessage::Cancel {
                    correlation_id: id.clone(),
                };
                if let Err(e) = channel.send_control(message).await {
                    warn!("failed to forward cancel of {} to {}: {}", id, worker, e);
                } else {
                    info!("task {} cancel forwarded to {}", id, worker);
                }
            }
            None => debug!("task {} cancelled but {} is gone", id, worker),
        }
        true
    }

    /// Route one message received from `worker`. Never waits on a caller.
    pub fn handle_inbound(&self, worker: &WorkerId, message: WorkerMessage) {
        self.registry.touch(worker);
        match message {
            WorkerMessage::HealthAck => self.registry.heartbeat(worker),
            WorkerMessage::Chunk {
                correlation_id,
                data,
                finished,
            } => {
                let inbound = Inbound::Data {
                    value: data,
                    finished,
                };
                self.route(worker, &correlation_id, inbound);
            }
            WorkerMessage::Result {
                correlation_id,
                payload,
                finished,
            } => {
                let inbound = Inbound::Data {
                    value: payload,
                    finished,
                };
                self.route(worker, &correlation_id, inbound);
            }
            WorkerMessage::Error {
                correlation_id,
                code,
                detail,
            } => {
                self.route(worker, &correlation_id, Inbound::Error { code, detail });
            }
            other => warn!("unexpected {} message from worker {}", other.kind(), worker),
        }
    }

    fn route(&self, worker: &WorkerId, id: &CorrelationId, inbound: Inbound) {
        let mut pending = self.pending.lock();
        let terminal = match pending.get(id) {
            None => {
                trace!("late or unknown reply {} from {}, dropped", id, worker);
                return;
            }
            Some(task) if task.worker != *worker => {
                warn!(
                    "worker {} replied to task {} owned by {}, dropped",
                    worker, id, task.worker
                );
                return;
            }
            Some(task) => task.kind == TaskKind::Unary || inbound.is_terminal(),
        };

        if !terminal {
            let overflowed = match (pending.get(id).map(|t| &t.reply), inbound) {
                (Some(Reply::Stream(sink)), Inbound::Data { value, .. }) => {
                    // Closed means the caller dropped the stream and its cancel is on the way.
                    matches!(sink.tx.try_send(value), Err(TrySendError::Full(_)))
                }
                _ => false,
            };
            if overflowed {
                let task = pending.remove(id);
                drop(pending);
                if let Some(task) = task {
                    self.overflow(id, task);
                }
            }
            return;
        }

        let task = pending.remove(id);
        drop(pending);
        if let Some(task) = task {
            self.finish(id, task, inbound);
        }
    }

    /// The caller fell `stream_buffer` events behind: fail its stream and stop the worker.
    fn overflow(&self, id: &CorrelationId, task: PendingTask) {
        warn!(
            "stream {} on {} fell {} event(s) behind, cancelling",
            id, task.worker, self.stream_buffer
        );
        if let Reply::Stream(sink) = task.reply {
            sink.close(StreamEnd::Failed(EngineError::StreamOverflow {
                correlation_id: id.to_string(),
                capacity: self.stream_buffer,
            }));
        }
        let Some(channel) = self.registry.channel(&task.worker) else {
            return;
        };
        let message = WorkerMessage::Cancel {
            correlation_id: id.clone(),
        };
        let worker = task.worker;
        tokio::spawn(async move {
            if let Err(e) = channel.send_control(message).await {
                warn!("failed to send cancel to {}: {}", worker, e);
            }
        });
    }

    fn finish(&self, id: &CorrelationId, task: PendingTask, inbound: Inbound) {
        let elapsed = task.created_at.elapsed();
        let outcome = match inbound {
            Inbound::Data { value, .. } => Ok(value),
            Inbound::Error { code, detail } => {
                if code == CANCELLED_STATUS || task.cancelled {
                    Err(EngineError::Cancelled {
                        correlation_id: id.to_string(),
                    })
                } else {
                    Err(EngineError::Upstream {
                        status: code,
                        detail,
                    })
                }
            }
        };
        debug!(
            "task {} on {} resolved in {:?} ({})",
            id,
            task.worker,
            elapsed,
            match &outcome {
                Ok(_) => "ok",
                Err(e) => e.as_label(),
            }
        );

        match task.reply {
            Reply::Unary(tx) => {
                let _ = tx.send(outcome);
            }
            Reply::Stream(sink) => sink.close(match outcome {
                Ok(value) => StreamEnd::Finished(Some(value).filter(|v| !v.is_null())),
                Err(e) => StreamEnd::Failed(e),
            }),
        }
    }

    /// Fail every task pending on a worker that went away.
    pub fn fail_worker(&self, worker: &WorkerId, reason: &str) -> usize {
        let orphaned: Vec<(CorrelationId, PendingTask)> = {
            let mut pending = self.pending.lock();
            let ids: Vec<CorrelationId> = pending
                .iter()
                .filter(|(_, t)| t.worker == *worker)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|t| (id, t)))
                .collect()
        };
        let failed = orphaned.len();
        for (id, task) in orphaned {
            debug!("task {} failed: worker {} {}", id, worker, reason);
            let error = EngineError::WorkerFailure {
                worker: worker.clone(),
                reason: reason.to_string(),
            };
            match task.reply {
                Reply::Unary(tx) => {
                    let _ = tx.send(Err(error));
                }
                Reply::Stream(sink) => sink.close(StreamEnd::Failed(error)),
            }
        }
        failed
    }

    /// Drop a pending task whose caller gave up. Returns true if it was still pending.
    pub fn expire(&self, id: &CorrelationId) -> bool {
        self.take(id).is_some()
    }

    pub fn is_pending(&self, id: &CorrelationId) -> bool {
        self.pending.lock().contains_key(id)
    }

    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    /// Fail tasks owned by workers not in `live`.
    pub fn fail_orphans(&self, live: &[WorkerId]) {
        let owners: Vec<WorkerId> = {
            let pending = self.pending.lock();
            let mut owners: Vec<WorkerId> = pending
                .values()
                .map(|t| t.worker.clone())
                .filter(|w| !live.contains(w))
                .collect();
            owners.sort();
            owners.dedup();
            owners
        };
        for worker in owners {
            self.fail_worker(&worker, "disconnected");
        }
    }
}

/// Events of one streaming task, in the order the worker produced them.
///
/// Yields `Ok(chunk)` for every partial event and ends after the final one.
/// A failure is yielded as one `Err` and ends the stream. Dropping the stream
/// before it ends cancels the task on its worker.
pub struct TaskStream {
    correlation_id: CorrelationId,
    worker: WorkerId,
    rx: mpsc::Receiver<Value>,
    end: Arc<Mutex<Option<StreamEnd>>>,
    dispatcher: Arc<Dispatcher>,
    idle_timeout: Duration,
    idle: Pin<Box<Sleep>>,
    buffered: Option<EngineResult<Value>>,
    done: bool,
}

impl TaskStream {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    /// Put an already received item back at the head of the stream.
    pub(crate) fn push_front(&mut self, item: EngineResult<Value>) {
        self.buffered = Some(item);
    }
}

impl Stream for TaskStream {
    type Item = EngineResult<Value>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(item) = this.buffered.take() {
            return Poll::Ready(Some(item));
        }
        if this.done {
            return Poll::Ready(None);
        }

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(value)) => {
                let next = tokio::time::Instant::now() + this.idle_timeout;
                this.idle.as_mut().reset(next);
                Poll::Ready(Some(Ok(value)))
            }
            Poll::Ready(None) => {
                this.done = true;
                let end = this.end.lock().take();
                match end {
                    Some(StreamEnd::Finished(Some(value))) => Poll::Ready(Some(Ok(value))),
                    Some(StreamEnd::Finished(None)) => Poll::Ready(None),
                    Some(StreamEnd::Failed(e)) => Poll::Ready(Some(Err(e))),
                    None => Poll::Ready(Some(Err(EngineError::WorkerFailure {
                        worker: this.worker.clone(),
                        reason: "stream closed before it finished".to_string(),
                    }))),
                }
            }
            Poll::Pending => match this.idle.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    this.done = true;
                    if this.dispatcher.expire(&this.correlation_id) {
                        warn!(
                            "stream {} on {} idle for {:?}",
                            this.correlation_id, this.worker, this.idle_timeout
                        );
                        this.dispatcher.registry.mark_observed_failure(&this.worker);
                    }
                    Poll::Ready(Some(Err(EngineError::Timeout {
                        after: this.idle_timeout,
                    })))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl Drop for TaskStream {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let dispatcher = Arc::clone(&self.dispatcher);
        let id = self.correlation_id.clone();
        let grace = self.idle_timeout;
        handle.spawn(async move {
            if dispatcher.cancel(&id).await {
                // Give the worker time to acknowledge, then stop waiting for it.
                tokio::time::sleep(grace).await;
                dispatcher.expire(&id);
            }
        });
    }
}

impl std::fmt::Debug for TaskStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStream")
            .field("correlation_id", &self.correlation_id)
            .field("worker", &self.worker)
            .field("done", &self.done)
            .finish()
    }
}
