// Wire messages exchanged with a worker over its bidirectional channel.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Correlates every non-probe message with exactly one pending task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// A fresh id tagged with a readable prefix (`replicate-…`, `delete-…`).
    pub fn prefixed(prefix: &str) -> Self {
        Self(format!("{}-{}", prefix, Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

fn finished_by_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WorkerMessage {
    /// Engine → worker: execute `operation` with `payload`.
    Dispatch {
        correlation_id: CorrelationId,
        operation: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default)]
        payload: Value,
    },
    /// Worker → engine: one partial event of a streaming task.
    Chunk {
        correlation_id: CorrelationId,
        #[serde(default)]
        data: Value,
        #[serde(default)]
        finished: bool,
    },
    /// Worker → engine: a (usually terminal) response.
    Result {
        correlation_id: CorrelationId,
        #[serde(default)]
        payload: Value,
        #[serde(default = "finished_by_default")]
        finished: bool,
    },
    /// Worker → engine: the upstream call failed or was cancelled.
    Error {
        correlation_id: CorrelationId,
        code: u16,
        #[serde(default)]
        detail: Value,
    },
    /// Engine → worker: stop working on a task.
    Cancel { correlation_id: CorrelationId },
    HealthProbe,
    HealthAck,
}

impl WorkerMessage {
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        match self {
            WorkerMessage::Dispatch { correlation_id, .. }
            | WorkerMessage::Chunk { correlation_id, .. }
            | WorkerMessage::Result { correlation_id, .. }
            | WorkerMessage::Error { correlation_id, .. }
            | WorkerMessage::Cancel { correlation_id } => Some(correlation_id),
            WorkerMessage::HealthProbe | WorkerMessage::HealthAck => None,
        }
    }

    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerMessage::Dispatch { .. } => "dispatch",
            WorkerMessage::Chunk { .. } => "chunk",
            WorkerMessage::Result { .. } => "result",
            WorkerMessage::Error { .. } => "error",
            WorkerMessage::Cancel { .. } => "cancel",
            WorkerMessage::HealthProbe => "healthProbe",
            WorkerMessage::HealthAck => "healthAck",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dispatch_uses_camel_case_tags_and_fields() {
        let msg = WorkerMessage::Dispatch {
            correlation_id: CorrelationId::from("abc"),
            operation: "generateContent".to_string(),
            model: Some("models/x".to_string()),
            payload: json!({"contents": []}),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "dispatch");
        assert_eq!(value["correlationId"], "abc");
        assert_eq!(value["model"], "models/x");
    }

    #[test]
    fn probe_round_trips_without_correlation_id() {
        let text = serde_json::to_string(&WorkerMessage::HealthProbe).unwrap();
        assert_eq!(text, r#"{"type":"healthProbe"}"#);
        let ack: WorkerMessage = serde_json::from_str(r#"{"type":"healthAck"}"#).unwrap();
        assert_eq!(ack, WorkerMessage::HealthAck);
        assert!(ack.correlation_id().is_none());
    }

    #[test]
    fn result_without_finished_flag_is_terminal() {
        let msg: WorkerMessage =
            serde_json::from_str(r#"{"type":"result","correlationId":"t1","payload":{"ok":true}}"#)
                .unwrap();
        match msg {
            WorkerMessage::Result { finished, .. } => assert!(finished),
            other => panic!("unexpected {:?}", other),
        }
    }
}
