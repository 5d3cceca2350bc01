//! HTTP trigger surface.
//!
//! Thin JSON endpoints over the orchestrator and digest aggregator. Every
//! response carries a `success` flag; failures add an `error` message.

mod routes;

use std::sync::Arc;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;

use crate::pipeline::{DigestAggregator, Orchestrator};
use crate::scheduler::Scheduler;

/// Default look-back for fetch, run and digest requests.
pub const DEFAULT_HOURS: u32 = 24;
/// Longest look-back a request may ask for (one week).
pub const MAX_HOURS: u32 = 168;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub digest: Arc<DigestAggregator>,
    /// Present when the daily trigger is running.
    pub scheduler: Option<Arc<Scheduler>>,
}

/// Build the Axum router with all trigger endpoints.
pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/api/status", get(routes::status))
        .route("/api/fetch", post(routes::fetch))
        .route("/api/classify", post(routes::classify))
        .route("/api/run-pipeline", post(routes::run_pipeline))
        .route("/api/send-digest", post(routes::send_digest))
        .fallback(routes::not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error response: `{ "success": false, "error": ... }` plus optional extra fields.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    extra: Option<Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            extra: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    /// Merge extra fields (an object) into the body.
    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = Some(extra);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({ "success": false, "error": self.message });
        if let (Some(Value::Object(extra)), Some(obj)) = (self.extra, body.as_object_mut()) {
            obj.extend(extra);
        }
        (self.status, Json(body)).into_response()
    }
}
