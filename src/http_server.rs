//! Per-agent HTTP peer server: `GET /api/status`, `POST /api/message`,
//! `POST /api/message-multi`, `POST /api/task`.
//!
//! Grounded in an axum MCP adapter's wiring style (`Router` built from per-route closures
//! capturing cloned `Arc` state, bound via `TcpListener` + `axum::serve` spawned onto a
//! `JoinHandle`), generalized from a single tools-dispatch endpoint to the four peer endpoints
//! this runtime needs, plus graceful shutdown via `tokio::sync::Notify`.

use crate::message_bus::{Attachment, Envelope, MessageBus, MessageContent, MessageHandler, MessageType};
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;

struct ServerState {
    bus: Arc<MessageBus>,
    handler: Arc<dyn MessageHandler>,
}

/// A bound, running peer server. Dropping or calling [`shutdown`](HttpServerInstance::shutdown)
/// releases the port.
pub struct HttpServerInstance {
    pub addr: SocketAddr,
    shutdown_notify: Arc<Notify>,
    join_handle: tokio::task::JoinHandle<()>,
}

impl HttpServerInstance {
    pub async fn shutdown(self) {
        self.shutdown_notify.notify_one();
        let _ = self.join_handle.await;
    }
}

async fn status_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"ok": true})))
}

async fn message_handler(
    State(state): State<Arc<ServerState>>,
    Json(envelope): Json<Envelope>,
) -> impl IntoResponse {
    match state.bus.process(&envelope, state.handler.as_ref()).await {
        Ok(_) => (StatusCode::ACCEPTED, Json(json!({"ok": true, "status": "accepted"}))),
        Err(e) => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"ok": false, "status": "rejected", "statusText": e.to_string()})),
        ),
    }
}

async fn message_multi_handler(
    State(state): State<Arc<ServerState>>,
    mut multipart: Multipart,
) -> impl IntoResponse {
    let mut from = String::new();
    let mut to = String::new();
    let mut message_type = MessageType::Message;
    let mut content = String::new();
    let mut timestamp = chrono::Utc::now();
    let mut attachments = Vec::new();

    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "from" => from = field.text().await.unwrap_or_default(),
            "to" => to = field.text().await.unwrap_or_default(),
            "type" => {
                message_type = match field.text().await.unwrap_or_default().as_str() {
                    "task_assign" => MessageType::TaskAssign,
                    "task_complete" => MessageType::TaskComplete,
                    "question" => MessageType::Question,
                    "status_update" => MessageType::StatusUpdate,
                    "shutdown" => MessageType::Shutdown,
                    _ => MessageType::Message,
                };
            }
            "content" => content = field.text().await.unwrap_or_default(),
            "timestamp" => {
                if let Ok(t) = field.text().await.unwrap_or_default().parse() {
                    timestamp = t;
                }
            }
            "attachments[]" => {
                let filename = field.file_name().unwrap_or("attachment").to_string();
                let mime_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                if let Ok(bytes) = field.bytes().await {
                    attachments.push(Attachment {
                            filename,
                            mime_type,
                            bytes: bytes.to_vec(),
                    });
                }
            }
            _ => {}
        }
    }

    let envelope = Envelope {
        id: uuid::Uuid::new_v4().to_string(),
        from,
        to,
        message_type,
        content: MessageContent::Text(content),
        timestamp,
        delivered: false,
        delivered_at: None,
        attachments,
        nonce: uuid::Uuid::new_v4().to_string(),
        signature: None,
    };

    match state.bus.process(&envelope, state.handler.as_ref()).await {
        Ok(_) => (StatusCode::ACCEPTED, Json(json!({"ok": true, "status": "accepted"}))),
        Err(e) => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"ok": false, "status": "rejected", "statusText": e.to_string()})),
        ),
    }
}

async fn task_handler(
    State(state): State<Arc<ServerState>>,
    Json(mut payload): Json<serde_json::Value>,
) -> impl IntoResponse {
    payload["type"] = json!("task_assign");
    let envelope: Envelope = match serde_json::from_value(payload) {
        Ok(e) => e,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"ok": false, "statusText": e.to_string()})),
            )
        }
    };
    match state.bus.process(&envelope, state.handler.as_ref()).await {
        Ok(_) => (StatusCode::ACCEPTED, Json(json!({"ok": true, "status": "accepted"}))),
        Err(e) => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"ok": false, "statusText": e.to_string()})),
        ),
    }
}

fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/message", post(message_handler))
        .route("/api/message-multi", post(message_multi_handler))
        .route("/api/task", post(task_handler))
        .with_state(state)
}

/// Scan `[start, end]` in order, bind the first available port, serve until
/// [`HttpServerInstance::shutdown`] is called.
pub async fn start(
    port_start: u16,
    port_end: u16,
    bus: Arc<MessageBus>,
    handler: Arc<dyn MessageHandler>,
) -> Result<HttpServerInstance, std::io::Error> {
    let state = Arc::new(ServerState { bus, handler });
    let app = build_router(state);

    let mut listener = None;
    let mut bound_port = port_start;
    for port in port_start..=port_end {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        match TcpListener::bind(addr).await {
            Ok(l) => {
                listener = Some(l);
                bound_port = port;
                break;
            }
            Err(_) => continue,
        }
    }
    let listener = listener.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                format!("no free port in {}..={}", port_start, port_end),
            )
    })?;
    let addr = SocketAddr::from(([127, 0, 0, 1], bound_port));
    let shutdown_notify = Arc::new(Notify::new());
    let notify_for_task = shutdown_notify.clone();

    let join_handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async move {
                    notify_for_task.notified().await;
            })
                .await;
    });

    Ok(HttpServerInstance {
            addr,
            shutdown_notify,
            join_handle,
    })
}
