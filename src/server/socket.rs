// WebSocket transport for worker connections.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::orchestrator::RequestOrchestrator;
use crate::worker::{WorkerChannel, WorkerMessage};

const DATA_QUEUE: usize = 64;
const CONTROL_QUEUE: usize = 16;

/// Outbound half of a worker socket.
///
/// All writes go through one writer task, so frames are never interleaved.
/// Control messages (probes, cancellations) are written ahead of queued dispatches.
pub struct SocketChannel {
    data: mpsc::Sender<WorkerMessage>,
    control: mpsc::Sender<WorkerMessage>,
    closed: CancellationToken,
}

#[async_trait]
impl WorkerChannel for SocketChannel {
    async fn send(&self, message: WorkerMessage) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(anyhow!("worker socket closed"));
        }
        self.data
            .send(message)
            .await
            .map_err(|_| anyhow!("worker socket closed"))
    }

    async fn send_control(&self, message: WorkerMessage) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(anyhow!("worker socket closed"));
        }
        self.control
            .send(message)
            .await
            .map_err(|_| anyhow!("worker socket closed"))
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Serve one worker connection until either side closes it.
pub async fn serve_worker(orchestrator: Arc<RequestOrchestrator>, name: String, socket: WebSocket) {
    let (mut sink, mut frames) = socket.split();
    let (data_tx, mut data_rx) = mpsc::channel::<WorkerMessage>(DATA_QUEUE);
    let (control_tx, mut control_rx) = mpsc::channel::<WorkerMessage>(CONTROL_QUEUE);
    let closed = CancellationToken::new();

    let channel = Arc::new(SocketChannel {
        data: data_tx,
        control: control_tx,
        closed: closed.clone(),
    });
    let worker = orchestrator.attach_worker(&name, channel);
    info!("worker {} connected", worker);

    let writer_closed = closed.clone();
    let writer_id = worker.clone();
    let writer = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                biased;
                _ = writer_closed.cancelled() => break,
                Some(m) = control_rx.recv() => m,
                Some(m) = data_rx.recv() => m,
                else => break,
            };
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!("dropping unencodable {} for {}: {}", message.kind(), writer_id, e);
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                debug!("write to {} failed: {}", writer_id, e);
                break;
            }
        }
        writer_closed.cancel();
        let _ = sink.close().await;
    });

    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<WorkerMessage>(text.as_str()) {
                Ok(message) => orchestrator.handle_message(&worker, message),
                Err(e) => warn!("malformed frame from {}: {}", worker, e),
            },
            Some(Ok(Message::Binary(_))) => warn!("binary frame from {} ignored", worker),
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!("read from {} failed: {}", worker, e);
                break;
            }
        }
    }

    closed.cancel();
    orchestrator.detach_worker(&worker);
    let _ = writer.await;
    info!("worker {} disconnected", worker);
}
