// Integration test for the RelayServer: a worker connected over a real
// WebSocket pulls content through the one-time download endpoint.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use relay_proxy_engine::config::UPLOAD_OPERATION;
use relay_proxy_engine::worker::WorkerMessage;
use relay_proxy_engine::{
    ContentMetadata, EngineConfig, RelayServer, RequestOrchestrator, TaskDescriptor,
};

/// Reserve a free local port.
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Generate deterministic test content.
fn generate_content(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

/// What the fake browser worker observed.
#[derive(Debug)]
struct Download {
    url: String,
    bytes: Vec<u8>,
    content_type: String,
}

/// A browser-like worker: downloads what it is asked to upload and answers
/// every other dispatch with a canned reply.
async fn run_socket_worker(url: String, downloads: mpsc::UnboundedSender<Download>) {
    let (socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    let (mut sink, mut frames) = socket.split();
    let http = reqwest::Client::new();
    let mut uploads = 0;

    while let Some(Ok(frame)) = frames.next().await {
        let Message::Text(text) = frame else {
            continue;
        };
        let message: WorkerMessage = serde_json::from_str(text.as_str()).unwrap();
        let reply = match message {
            WorkerMessage::HealthProbe => WorkerMessage::HealthAck,
            WorkerMessage::Dispatch {
                correlation_id,
                operation,
                payload,
                ..
            } if operation == UPLOAD_OPERATION => {
                let url = payload["downloadUrl"].as_str().unwrap().to_string();
                let response = http.get(&url).send().await.unwrap();
                assert_eq!(response.status(), 200);
                let content_type = response
                    .headers()
                    .get("content-type")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let bytes = response.bytes().await.unwrap().to_vec();
                uploads += 1;
                let name = format!("files/ws-{}", uploads);
                let reply = WorkerMessage::Result {
                    correlation_id,
                    payload: json!({"file": {
                        "name": name,
                        "uri": format!("https://upstream.test/v1beta/{}", name),
                        "sizeBytes": bytes.len().to_string(),
                    }}),
                    finished: true,
                };
                let _ = downloads.send(Download {
                    url,
                    bytes,
                    content_type,
                });
                reply
            }
            WorkerMessage::Dispatch {
                correlation_id,
                payload,
                ..
            } => WorkerMessage::Result {
                correlation_id,
                payload: json!({"via": "socket", "echo": payload}),
                finished: true,
            },
            _ => continue,
        };
        let text = serde_json::to_string(&reply).unwrap();
        if sink.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
}

async fn start(dir: &std::path::Path) -> (Arc<RequestOrchestrator>, RelayServer) {
    let port = free_port();
    let config = EngineConfig {
        content_dir: dir.to_string_lossy().into_owned(),
        public_base_url: format!("http://127.0.0.1:{}", port),
        request_timeout_ms: 5_000,
        upload_timeout_ms: 5_000,
        ..EngineConfig::default()
    };
    let orchestrator = RequestOrchestrator::new(config).unwrap();
    let server = RelayServer::start(Arc::clone(&orchestrator), &format!("127.0.0.1:{}", port))
        .await
        .unwrap();
    assert_eq!(server.port(), port);
    (orchestrator, server)
}

async fn wait_for_workers(orchestrator: &RequestOrchestrator, count: usize) {
    for _ in 0..200 {
        if orchestrator.registry().len() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {} connected worker(s)", count);
}

#[tokio::test]
async fn test_socket_worker_replicates_and_serves_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, server) = start(dir.path()).await;

    let (tx, mut downloads) = mpsc::unbounded_channel();
    let worker = tokio::spawn(run_socket_worker(server.url_for_worker("tab-1"), tx));
    wait_for_workers(&orchestrator, 1).await;

    let content = generate_content(256 * 1024);
    let receipt = orchestrator
        .ingest(
            &content,
            ContentMetadata {
                display_name: Some("blob.bin".to_string()),
                media_type: Some("application/octet-stream".to_string()),
            },
        )
        .await
        .unwrap();
    assert_eq!(receipt.remote.name, "files/ws-1");
    assert_eq!(receipt.worker.name(), "tab-1");

    let download = downloads.recv().await.unwrap();
    assert_eq!(download.bytes, content);
    assert_eq!(download.content_type, "application/octet-stream");

    // Grants are single use.
    let again = reqwest::get(download.url.as_str()).await.unwrap();
    assert_eq!(again.status(), 403);

    let payload = json!({"contents": [{"parts": [{"fileData": {"fileUri": receipt.name}}]}]});
    let out = orchestrator
        .submit(TaskDescriptor::unary("generateContent", payload))
        .await
        .unwrap()
        .into_unary()
        .unwrap();
    assert_eq!(out["via"], "socket");
    assert_eq!(
        out["echo"]["contents"][0]["parts"][0]["fileData"]["fileUri"],
        "https://upstream.test/v1beta/files/ws-1"
    );

    worker.abort();
    wait_for_workers(&orchestrator, 0).await;
    assert_eq!(orchestrator.ledger().reverse_len(), 0);
    server.shutdown();
}

#[tokio::test]
async fn test_status_and_download_guards() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, server) = start(dir.path()).await;
    let base = format!("http://127.0.0.1:{}", server.port());

    let body = reqwest::get(format!("{}/", base))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let status: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(status["status"], "running");
    assert_eq!(status["workers"], json!([]));
    assert_eq!(status["stats"]["tasks_submitted"], 0);

    let malformed = reqwest::get(format!("{}/internal/content/not-a-hash/token", base))
        .await
        .unwrap();
    assert_eq!(malformed.status(), 400);

    let fp = orchestrator
        .store()
        .put(b"guarded", ContentMetadata::default())
        .await
        .unwrap();
    let forged = reqwest::get(format!("{}/internal/content/{}/forged", base, fp))
        .await
        .unwrap();
    assert_eq!(forged.status(), 403);

    let token = orchestrator.store().grant(&fp);
    let ok = reqwest::get(format!("{}/internal/content/{}/{}", base, fp, token))
        .await
        .unwrap();
    assert_eq!(ok.status(), 200);
    assert_eq!(ok.headers()["content-type"], "text/plain");
    assert_eq!(&ok.bytes().await.unwrap()[..], b"guarded");

    server.shutdown();
}
