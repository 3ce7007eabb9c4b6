// In-process fake workers driving a real orchestrator over LocalChannel.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use relay_proxy_engine::config::{CANCELLED_STATUS, DELETE_OPERATION, UPLOAD_OPERATION};
use relay_proxy_engine::engine::references::file_references;
use relay_proxy_engine::worker::{CorrelationId, LocalChannel, WorkerId, WorkerMessage};
use relay_proxy_engine::{EngineConfig, RequestOrchestrator};

pub const GENERATE: &str = "generateContent";
pub const STREAM_GENERATE: &str = "streamGenerateContent";

/// Short timings so failure paths finish quickly.
pub fn test_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        content_dir: dir.to_string_lossy().into_owned(),
        request_timeout_ms: 2_000,
        stream_idle_timeout_ms: 2_000,
        upload_timeout_ms: 2_000,
        probe_timeout_ms: 200,
        retry_base_delay_ms: 10,
        ..EngineConfig::default()
    }
}

/// Knobs and observations shared with a running fake worker.
#[derive(Default)]
pub struct WorkerState {
    pub received: Vec<WorkerMessage>,
    /// Remote names the upstream claims no longer exist.
    pub expired: HashSet<String>,
    /// Ignore health probes.
    pub silent: bool,
    /// Never answer dispatches (cancels are still acknowledged).
    pub hang: bool,
    /// Number of upcoming uploads answered with a wrong size.
    pub corrupt_uploads: usize,
    /// Upstream error returned for every task that is not a file operation.
    pub reject: Option<(u16, Value)>,
    uploads: usize,
}

pub struct FakeWorker {
    pub id: WorkerId,
    pub name: String,
    pub state: Arc<Mutex<WorkerState>>,
    task: JoinHandle<()>,
}

impl FakeWorker {
    pub fn operations(&self) -> Vec<String> {
        self.state
            .lock()
            .received
            .iter()
            .filter_map(|m| match m {
                WorkerMessage::Dispatch { operation, .. } => Some(operation.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.operations().iter().filter(|o| *o == operation).count()
    }

    pub fn dispatched(&self, id: &CorrelationId) -> bool {
        self.state.lock().received.iter().any(|m| {
            matches!(m, WorkerMessage::Dispatch { correlation_id, .. } if correlation_id == id)
        })
    }

    pub fn cancels(&self) -> usize {
        self.state
            .lock()
            .received
            .iter()
            .filter(|m| matches!(m, WorkerMessage::Cancel { .. }))
            .count()
    }

    pub fn set(&self, f: impl FnOnce(&mut WorkerState)) {
        f(&mut self.state.lock());
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

/// Attach a fake worker named `name` to `orchestrator`.
pub fn spawn_worker(orchestrator: &Arc<RequestOrchestrator>, name: &str) -> FakeWorker {
    let (channel, mut rx) = LocalChannel::new(64);
    let id = orchestrator.attach_worker(name, Arc::new(channel));
    let state = Arc::new(Mutex::new(WorkerState::default()));

    let worker_id = id.clone();
    let worker_name = name.to_string();
    let shared = Arc::clone(&state);
    let orchestrator = Arc::clone(orchestrator);
    let task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let replies = {
                let mut state = shared.lock();
                state.received.push(message.clone());
                respond(&worker_name, &mut state, message)
            };
            for reply in replies {
                orchestrator.handle_message(&worker_id, reply);
            }
        }
    });

    FakeWorker {
        id,
        name: name.to_string(),
        state,
        task,
    }
}

fn respond(name: &str, state: &mut WorkerState, message: WorkerMessage) -> Vec<WorkerMessage> {
    match message {
        WorkerMessage::HealthProbe if !state.silent => vec![WorkerMessage::HealthAck],
        WorkerMessage::Cancel { correlation_id } => vec![WorkerMessage::Error {
            correlation_id,
            code: CANCELLED_STATUS,
            detail: json!({"message": "cancelled by client"}),
        }],
        WorkerMessage::Dispatch { .. } if state.hang => Vec::new(),
        WorkerMessage::Dispatch {
            correlation_id,
            operation,
            payload,
            ..
        } => dispatch(name, state, correlation_id, &operation, payload),
        _ => Vec::new(),
    }
}

fn dispatch(
    name: &str,
    state: &mut WorkerState,
    correlation_id: CorrelationId,
    operation: &str,
    payload: Value,
) -> Vec<WorkerMessage> {
    if operation == UPLOAD_OPERATION {
        state.uploads += 1;
        let remote = format!("files/{}-{}", name, state.uploads);
        let mut size: u64 = payload["file"]["sizeBytes"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        if state.corrupt_uploads > 0 {
            state.corrupt_uploads -= 1;
            size += 1;
        }
        return vec![WorkerMessage::Result {
            correlation_id,
            payload: json!({"file": {
                "name": remote,
                "uri": format!("https://upstream.test/v1beta/{}", remote),
                "sizeBytes": size.to_string(),
                "state": "ACTIVE",
            }}),
            finished: true,
        }];
    }
    if operation == DELETE_OPERATION {
        return vec![WorkerMessage::Result {
            correlation_id,
            payload: json!({}),
            finished: true,
        }];
    }

    if let Some((code, detail)) = state.reject.clone() {
        return vec![WorkerMessage::Error {
            correlation_id,
            code,
            detail,
        }];
    }

    let references = file_references(&payload);
    if let Some(gone) = references
        .iter()
        .find(|r| state.expired.iter().any(|e| r.ends_with(e.as_str())))
    {
        return vec![WorkerMessage::Error {
            correlation_id,
            code: 400,
            detail: json!({"message": format!("File {} does not exist", gone)}),
        }];
    }

    if operation == STREAM_GENERATE {
        return vec![
            WorkerMessage::Chunk {
                correlation_id: correlation_id.clone(),
                data: json!({"part": 0, "worker": name}),
                finished: false,
            },
            WorkerMessage::Chunk {
                correlation_id: correlation_id.clone(),
                data: json!({"part": 1, "worker": name}),
                finished: false,
            },
            WorkerMessage::Result {
                correlation_id,
                payload: json!({"part": 2, "worker": name}),
                finished: true,
            },
        ];
    }

    vec![WorkerMessage::Result {
        correlation_id,
        payload: json!({"worker": name, "echo": payload}),
        finished: true,
    }]
}

/// Poll `condition` every 10 ms until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A user turn referencing `reference` through `fileData`.
pub fn request_with_file(reference: &str) -> Value {
    json!({
        "contents": [{
            "role": "user",
            "parts": [
                {"text": "summarize"},
                {"fileData": {"fileUri": reference, "mimeType": "application/octet-stream"}}
            ]
        }]
    })
}
