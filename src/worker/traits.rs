use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use super::protocol::WorkerMessage;

/// Outbound half of a worker connection.
///
/// Implementations must deliver messages in the order `send` is called and
/// must never interleave two writes on the underlying transport.
#[async_trait]
pub trait WorkerChannel: Send + Sync {
    async fn send(&self, message: WorkerMessage) -> Result<()>;

    /// Send on the reserved control lane used by probes and cancellations.
    async fn send_control(&self, message: WorkerMessage) -> Result<()> {
        self.send(message).await
    }

    fn is_closed(&self) -> bool;
}

/// In-process channel backed by a tokio mpsc queue.
///
/// Used to embed workers in the same process and by tests.
pub struct LocalChannel {
    tx: mpsc::Sender<WorkerMessage>,
}

impl LocalChannel {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<WorkerMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl WorkerChannel for LocalChannel {
    async fn send(&self, message: WorkerMessage) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| anyhow!("local worker channel closed"))
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
