//! HTTP surface: the gateway webhook plus a few status endpoints.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::ledger::Ledger;
use crate::pipeline::{Dispatcher, Fetch, WebhookPayload};
use crate::whatsapp::Messenger;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub messenger: Arc<dyn Messenger>,
    /// Used directly only by the dev-mode test endpoint.
    pub fetcher: Arc<dyn Fetch>,
    pub ledger: Ledger,
    pub verify_token: String,
    pub dev_mode: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/webhook", get(verify_webhook).post(receive_webhook))
        .route("/test-download", post(test_download))
        .layer(middleware::from_fn(security_headers))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(addr: &str, state: AppState, shutdown: CancellationToken) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("🌐 Listening on {}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(header::REFERRER_POLICY, HeaderValue::from_static("strict-origin-when-cross-origin"));
    response
}

async fn root() -> Json<Value> {
    Json(json!({"message": "vidrelay is running!"}))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let waha_healthy = state.messenger.is_reachable().await;
    Json(json!({
        "status": if waha_healthy { "healthy" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "waha_healthy": waha_healthy,
    }))
}

async fn stats(State(state): State<AppState>) -> Response {
    match state.ledger.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => {
            warn!("Failed to read stats: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "stats unavailable"}))).into_response()
        }
    }
}

/// Subscription handshake: echo the challenge when the token matches.
async fn verify_webhook(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let (Some(mode), Some(token), Some(challenge)) = (
        params.get("hub.mode"),
        params.get("hub.verify_token"),
        params.get("hub.challenge"),
    ) else {
        return (StatusCode::BAD_REQUEST, "Missing parameters").into_response();
    };

    if mode == "subscribe" && *token == state.verify_token {
        info!("✅ Webhook verified");
        challenge.clone().into_response()
    } else {
        warn!("Webhook verification failed (mode={mode})");
        (StatusCode::FORBIDDEN, "Verification failed").into_response()
    }
}

/// Acknowledge immediately; each admitted event runs in its own task.
async fn receive_webhook(State(state): State<AppState>, body: Bytes) -> Response {
    let value: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            // Acknowledged with 200 like any other body.
            warn!("Rejected webhook body: {e}");
            return Json(json!({"status": "error", "message": "Invalid JSON payload"})).into_response();
        }
    };

    let events = WebhookPayload::decode(&value).into_events(Utc::now());
    if events.is_empty() {
        debug!("Webhook carried nothing to process");
    }

    for event in events {
        if !state.dispatcher.admit(&event, Instant::now()) {
            continue;
        }
        info!("📨 Message {} from {}", event.message_id, event.chat_id);
        let dispatcher = state.dispatcher.clone();
        tokio::spawn(async move {
            dispatcher.process(event).await;
        });
    }

    Json(json!({"status": "ok"})).into_response()
}

#[derive(Deserialize)]
struct TestDownloadRequest {
    #[serde(default)]
    url: String,
}

async fn test_download(State(state): State<AppState>, Json(request): Json<TestDownloadRequest>) -> Response {
    if !state.dev_mode {
        return (StatusCode::FORBIDDEN, Json(json!({"error": "Only available in dev mode"}))).into_response();
    }
    let url = request.url.trim();
    if url.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "url is required"}))).into_response();
    }

    match state.fetcher.fetch(url).await {
        Ok(media) => Json(json!({
            "status": "success",
            "file_path": media.local_path.to_string_lossy(),
            "size_mb": (media.size_mb() * 100.0).round() / 100.0,
            "title": media.title,
        }))
        .into_response(),
        Err(e) => Json(json!({"status": "error", "message": e.to_string()})).into_response(),
    }
}
