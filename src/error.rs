// Error taxonomy of the relay engine: what callers of the orchestrator see.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::config::CANCELLED_STATUS;
use crate::worker::WorkerId;

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum EngineError {
    /// No healthy worker can take the task.
    #[error("no capacity: {reason}")]
    NoCapacity { reason: String },

    /// The task references more content than one dispatch may replicate.
    #[error("task references {count} files, limit is {limit}")]
    TooManyReferences { count: usize, limit: usize },

    /// The worker accepted the dispatch but never answered.
    #[error("worker did not respond within {after:?}")]
    Timeout { after: Duration },

    /// The worker went away while the task was in flight.
    #[error("worker {worker} failed: {reason}")]
    WorkerFailure { worker: WorkerId, reason: String },

    /// The upstream call made by the worker failed; status and detail are verbatim.
    #[error("upstream error {status}: {detail}")]
    Upstream { status: u16, detail: Value },

    /// Bytes did not survive a transfer or a read intact.
    #[error("integrity check failed for {fingerprint}: {detail}")]
    ContentIntegrity { fingerprint: String, detail: String },

    /// A referenced file is unknown to the content store.
    #[error("file {reference} not found in cache")]
    ContentNotFound { reference: String },

    /// The task was cancelled and the worker acknowledged it.
    #[error("task {correlation_id} cancelled")]
    Cancelled { correlation_id: String },

    /// The caller read a stream too slowly and the task was cancelled.
    #[error("stream {correlation_id} fell {capacity} events behind its consumer")]
    StreamOverflow { correlation_id: String, capacity: usize },

    /// A task with the same correlation id is already in flight.
    #[error("task {correlation_id} is already in flight")]
    DuplicateTask { correlation_id: String },

    /// A worker sent something the engine cannot interpret.
    #[error("protocol error: {detail}")]
    Protocol { detail: String },

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
}

impl EngineError {
    pub fn no_capacity(reason: impl Into<String>) -> Self {
        EngineError::NoCapacity {
            reason: reason.into(),
        }
    }

    pub fn protocol(detail: impl Into<String>) -> Self {
        EngineError::Protocol {
            detail: detail.into(),
        }
    }

    /// Stable snake_case label for logs and counters.
    pub fn as_label(&self) -> &'static str {
        match self {
            EngineError::NoCapacity { .. } => "no_capacity",
            EngineError::TooManyReferences { .. } => "too_many_references",
            EngineError::Timeout { .. } => "timeout",
            EngineError::WorkerFailure { .. } => "worker_failure",
            EngineError::Upstream { .. } => "upstream_error",
            EngineError::ContentIntegrity { .. } => "content_integrity",
            EngineError::ContentNotFound { .. } => "content_not_found",
            EngineError::Cancelled { .. } => "cancelled",
            EngineError::StreamOverflow { .. } => "stream_overflow",
            EngineError::DuplicateTask { .. } => "duplicate_task",
            EngineError::Protocol { .. } => "protocol_error",
            EngineError::Storage(_) => "storage_error",
        }
    }

    /// Whether the caller may reasonably submit the same task again.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::NoCapacity { .. }
            | EngineError::TooManyReferences { .. }
            | EngineError::Timeout { .. }
            | EngineError::WorkerFailure { .. } => true,
            EngineError::Upstream { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// HTTP status the caller-facing layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::NoCapacity { .. } | EngineError::TooManyReferences { .. } => 503,
            EngineError::Timeout { .. } => 504,
            EngineError::WorkerFailure { .. } => 502,
            EngineError::Upstream { status, .. } => *status,
            EngineError::ContentIntegrity { .. } => 502,
            EngineError::ContentNotFound { .. } => 404,
            EngineError::Cancelled { .. } => CANCELLED_STATUS,
            EngineError::StreamOverflow { .. } => 503,
            EngineError::DuplicateTask { .. } => 409,
            EngineError::Protocol { .. } => 502,
            EngineError::Storage(_) => 500,
        }
    }

    /// Whether this is an upstream report that some file no longer exists.
    ///
    /// The status alone is not enough: a 404 may just as well name a model.
    pub fn is_expired_reference(&self) -> bool {
        let EngineError::Upstream { detail, .. } = self else {
            return false;
        };
        let text = match detail {
            Value::String(s) => s.to_lowercase(),
            other => other.to_string().to_lowercase(),
        };
        text.contains("not found") || text.contains("does not exist") || text.contains("not_found")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn expired_reference_is_detected_from_text() {
        let bare_404 = EngineError::Upstream {
            status: 404,
            detail: json!({}),
        };
        assert!(!bare_404.is_expired_reference());

        let by_text = EngineError::Upstream {
            status: 400,
            detail: json!({"message": "File files/abc does not exist"}),
        };
        assert!(by_text.is_expired_reference());

        let rate_limited = EngineError::Upstream {
            status: 429,
            detail: json!({"message": "quota"}),
        };
        assert!(!rate_limited.is_expired_reference());
        assert!(rate_limited.is_retryable());
    }

    #[test]
    fn capacity_errors_map_to_service_unavailable() {
        assert_eq!(EngineError::no_capacity("none").status_code(), 503);
        let err = EngineError::TooManyReferences { count: 40, limit: 16 };
        assert_eq!(err.status_code(), 503);
        assert_eq!(err.as_label(), "too_many_references");

        let overflow = EngineError::StreamOverflow {
            correlation_id: "s1".to_string(),
            capacity: 64,
        };
        assert_eq!(overflow.status_code(), 503);
        assert!(!overflow.is_retryable());
    }
}
