use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderName, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::warn;
use vigil_core::StatusSnapshot;

use crate::collect::Sampler;

static SECRET_KEY_HEADER: HeaderName = HeaderName::from_static("x-secret-key");

#[derive(Clone)]
pub struct AppState {
    pub secret: Option<String>,
    pub sampler: Arc<Mutex<Sampler>>,
}

impl AppState {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret,
            sampler: Arc::new(Mutex::new(Sampler::new())),
        }
    }
}

/// The secret check covers every path, the fallback included, and runs
/// before any measurement work.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_secret,
        ))
        .with_state(state)
}

async fn require_secret(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.secret.as_deref() else {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "SECRET_KEY is not configured on the agent",
        );
    };

    let presented = request
        .headers()
        .get(&SECRET_KEY_HEADER)
        .and_then(|value| value.to_str().ok());
    if presented != Some(expected) {
        warn!(path = %request.uri().path(), "request rejected: invalid secret key");
        return error_response(StatusCode::FORBIDDEN, "Invalid secret key");
    }

    next.run(request).await
}

async fn status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    let mut sampler = state.sampler.lock().await;
    Json(sampler.sample().await)
}

async fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "unknown path")
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
