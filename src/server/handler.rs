// Axum front: worker sockets, one-time content downloads, status.

use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use super::socket::serve_worker;
use crate::engine::orchestrator::RequestOrchestrator;
use crate::engine::store::Fingerprint;
use crate::error::EngineError;

type AppState = Arc<RequestOrchestrator>;

pub struct RelayServer {
    port: u16,
    orchestrator: Arc<RequestOrchestrator>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl RelayServer {
    /// Bind `addr` (use port 0 for a random port) and serve until shut down.
    pub async fn start(orchestrator: Arc<RequestOrchestrator>, addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let port = listener.local_addr()?.port();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let app = Router::new()
            .route("/", get(status_handler))
            .route("/ws/{worker_name}", get(worker_handler))
            .route(
                "/internal/content/{fingerprint}/{token}",
                get(content_handler),
            )
            .with_state(Arc::clone(&orchestrator));

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
            {
                error!("relay server stopped: {}", e);
            }
        });
        info!("relay server listening on port {}", port);

        Ok(Self {
            port,
            orchestrator,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// WebSocket URL a worker named `name` connects to.
    pub fn url_for_worker(&self, name: &str) -> String {
        format!("ws://127.0.0.1:{}/ws/{}", self.port, name)
    }

    pub fn orchestrator(&self) -> &Arc<RequestOrchestrator> {
        &self.orchestrator
    }

    /// Stop accepting connections; open sockets drain gracefully.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// GET /: liveness plus engine counters and worker health.
async fn status_handler(State(orchestrator): State<AppState>) -> Response {
    Json(json!({
        "status": "running",
        "stats": orchestrator.snapshot(),
        "workers": orchestrator.registry().status(),
    }))
    .into_response()
}

/// GET /ws/{worker_name}: upgrade to a worker connection.
async fn worker_handler(
    State(orchestrator): State<AppState>,
    Path(worker_name): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| serve_worker(orchestrator, worker_name, socket))
}

/// GET /internal/content/{fingerprint}/{token}: one-time download for a worker.
async fn content_handler(
    State(orchestrator): State<AppState>,
    Path((fingerprint, token)): Path<(String, String)>,
) -> Response {
    let Some(fingerprint) = Fingerprint::parse(&fingerprint) else {
        return (StatusCode::BAD_REQUEST, "malformed fingerprint").into_response();
    };
    let store = orchestrator.store();
    if !store.redeem(&fingerprint, &token) {
        debug!("rejected download of {} with stale token", fingerprint.short());
        return (StatusCode::FORBIDDEN, "download grant invalid or expired").into_response();
    }
    let Some(content) = store.metadata(&fingerprint) else {
        return (StatusCode::NOT_FOUND, "content not cached").into_response();
    };

    match store.get(&fingerprint).await {
        Ok(bytes) => {
            let content_type = HeaderValue::from_str(&content.media_type)
                .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, content_type),
                    (header::CONTENT_LENGTH, HeaderValue::from(bytes.len())),
                ],
                bytes,
            )
                .into_response()
        }
        Err(EngineError::ContentNotFound { .. }) => {
            (StatusCode::NOT_FOUND, "content not cached").into_response()
        }
        Err(e) => {
            error!("serving {} failed: {}", fingerprint.short(), e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
