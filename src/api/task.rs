// Caller-facing task and content types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::engine::dispatch::TaskStream;
use crate::engine::ledger::RemoteFile;
use crate::engine::store::Fingerprint;
use crate::worker::{CorrelationId, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Unary,
    Stream,
}

/// One request to execute against the upstream API through a worker.
#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    pub correlation_id: CorrelationId,
    pub kind: TaskKind,
    pub operation: String,
    pub model: Option<String>,
    /// Request body; `fileData` references inside it are rewritten before dispatch.
    pub payload: Value,
    /// Cancelling this token cancels the task on its worker.
    pub cancel: Option<CancellationToken>,
}

impl TaskDescriptor {
    pub fn unary(operation: impl Into<String>, payload: Value) -> Self {
        Self::new(TaskKind::Unary, operation, payload)
    }

    pub fn stream(operation: impl Into<String>, payload: Value) -> Self {
        Self::new(TaskKind::Stream, operation, payload)
    }

    fn new(kind: TaskKind, operation: impl Into<String>, payload: Value) -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            kind,
            operation: operation.into(),
            model: None,
            payload,
            cancel: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = id;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

pub enum TaskOutput {
    Unary(Value),
    Stream(TaskStream),
}

impl TaskOutput {
    pub fn into_unary(self) -> Option<Value> {
        match self {
            TaskOutput::Unary(v) => Some(v),
            TaskOutput::Stream(_) => None,
        }
    }

    pub fn into_stream(self) -> Option<TaskStream> {
        match self {
            TaskOutput::Stream(s) => Some(s),
            TaskOutput::Unary(_) => None,
        }
    }
}

impl std::fmt::Debug for TaskOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskOutput::Unary(v) => f.debug_tuple("Unary").field(v).finish(),
            TaskOutput::Stream(s) => f.debug_tuple("Stream").field(s.correlation_id()).finish(),
        }
    }
}

/// Result of ingesting caller bytes.
#[derive(Debug, Clone, Serialize)]
pub struct ContentReceipt {
    /// Stable caller-visible name, `files/<fingerprint>`.
    pub name: String,
    pub fingerprint: Fingerprint,
    pub display_name: String,
    pub media_type: String,
    pub size_bytes: u64,
    pub worker: WorkerId,
    pub remote: RemoteFile,
}

/// A content reference resolved to a usable remote copy.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedContent {
    pub fingerprint: Fingerprint,
    pub worker: WorkerId,
    pub remote: RemoteFile,
    pub perfect_hit: bool,
}
