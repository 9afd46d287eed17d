//! HTTP/WebSocket server for the response pipeline
//!
//! Exposes the pipeline over two surfaces: a WebSocket channel for chat
//! clients (one session per connection) and a one-shot REST endpoint.
//! The socket handler is the only code that touches the transport; the
//! pipeline stays behind the session registry.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::models::{InboundMessage, OutboundMessage, Request};
use crate::pipeline::PipelineController;
use crate::session::SessionRegistry;

const WELCOME_TEXT: &str =
    "Welcome! Ask about stock prices, market news, code, or company policies.";

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
pub struct RespondRequest {
    pub text: String,
    pub client_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub client_id: Option<String>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub pipeline: Arc<PipelineController>,
    pub sessions: Arc<SessionRegistry>,
}

/// =============================
/// Helpers — Stable Client IDs
/// =============================

fn stable_uuid_from_string(input: &str) -> Uuid {
    use sha2::{Digest, Sha256};

    let hash = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);

    // Set UUID version (4) and variant (RFC4122) bits.
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    Uuid::from_bytes(bytes)
}

fn parse_or_stable_uuid(value: Option<&str>, fallback_seed: &str) -> Uuid {
    match value {
        Some(v) if !v.trim().is_empty() => {
            Uuid::parse_str(v).unwrap_or_else(|_| stable_uuid_from_string(v))
        }
        _ => stable_uuid_from_string(fallback_seed),
    }
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// One-Shot Respond Endpoint
/// =============================

async fn respond(
    State(state): State<ApiState>,
    Json(req): Json<RespondRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let client_id = parse_or_stable_uuid(req.client_id.as_deref(), "anonymous-client");
    let request = Request::new(client_id, req.text);
    info!(request_id = %request.request_id, "received one-shot request");

    match state.pipeline.process(&request).await {
        Ok(response) => (StatusCode::OK, Json(ApiResponse::success(response))),
        Err(e) => {
            // Full detail stays in the logs; the client gets the uniform
            // fallback wording.
            warn!(request_id = %request.request_id, error = %e, "one-shot request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(
                    "Unable to process your request right now. Please try again.".to_string(),
                )),
            )
        }
    }
}

/// =============================
/// WebSocket Endpoint
/// =============================

async fn ws_handler(
    State(state): State<ApiState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let client_id = parse_or_stable_uuid(params.client_id.as_deref(), "anonymous-client");
    ws.on_upgrade(move |socket| client_session(state, socket, client_id))
}

/// Owns one client connection for its lifetime: bridges the session's
/// outbound channel to the socket sink and feeds inbound frames into the
/// pipeline, one spawned task per request.
async fn client_session(state: ApiState, mut socket: WebSocket, client_id: Uuid) {
    let Some(mut rx) = state.sessions.connect(client_id).await else {
        let _ = socket.send(Message::Close(None)).await;
        return;
    };

    let (mut sink, mut stream) = socket.split();
    state.sessions.mark_open(client_id).await;

    let forward = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(frame) => {
                    if sink.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!(%client_id, error = %e, "failed to encode outbound frame"),
            }
        }
    });

    let _ = state
        .sessions
        .send(client_id, OutboundMessage::notice(WELCOME_TEXT))
        .await;

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(raw)) => {
                // Accept both the structured envelope and bare text frames.
                let text = serde_json::from_str::<InboundMessage>(&raw)
                    .map(|m| m.text)
                    .unwrap_or(raw);

                if !state.sessions.begin_request(client_id).await {
                    let _ = state
                        .sessions
                        .send(
                            client_id,
                            OutboundMessage::notice(
                                "Too many requests in flight, please wait for a reply.",
                            ),
                        )
                        .await;
                    continue;
                }

                let request = Request::new(client_id, text);
                let pipeline = state.pipeline.clone();
                tokio::spawn(async move {
                    pipeline.handle(request).await;
                });
            }
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    state.sessions.disconnect(client_id).await;
    forward.abort();
}

/// =============================
/// Router
/// =============================

pub fn create_router(pipeline: Arc<PipelineController>, sessions: Arc<SessionRegistry>) -> Router {
    let state = ApiState { pipeline, sessions };

    Router::new()
        .route("/health", get(health))
        .route("/api/respond", post(respond))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    pipeline: Arc<PipelineController>,
    sessions: Arc<SessionRegistry>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(pipeline, sessions);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API server listening on http://0.0.0.0:{}", port);
    info!("WebSocket endpoint: ws://127.0.0.1:{}/ws", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_uuid_is_deterministic() {
        let a = stable_uuid_from_string("client-42");
        let b = stable_uuid_from_string("client-42");
        let c = stable_uuid_from_string("client-43");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.get_version_num(), 4);
    }

    #[test]
    fn test_parse_or_stable_uuid_accepts_real_uuids() {
        let id = Uuid::new_v4();
        assert_eq!(parse_or_stable_uuid(Some(&id.to_string()), "seed"), id);
        assert_eq!(
            parse_or_stable_uuid(None, "seed"),
            parse_or_stable_uuid(Some("  "), "seed")
        );
    }

    #[test]
    fn test_api_response_shapes() {
        let ok = ApiResponse::success(serde_json::json!({"x": 1}));
        assert!(ok.success);
        assert!(ok.error.is_none());

        let err = ApiResponse::error("nope".to_string());
        assert!(!err.success);
        assert_eq!(err.error.as_deref(), Some("nope"));
    }
}
