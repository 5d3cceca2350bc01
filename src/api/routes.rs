//! Endpoint handlers.

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::{ApiError, AppState, DEFAULT_HOURS, MAX_HOURS};
use crate::error::{ClassificationError, PipelineError};
use crate::pipeline::types::TimeWindow;

/// Emails echoed back by the fetch endpoint.
const FETCH_PREVIEW_LIMIT: usize = 10;

type ApiResult = Result<Json<Value>, ApiError>;

// ── Health / status ─────────────────────────────────────────────────

pub(super) async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now(),
        "scheduler_running": state.scheduler.is_some(),
    }))
}

pub(super) async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let scheduler = match &state.scheduler {
        Some(s) => json!({
            "running": true,
            "schedule": s.expression(),
            "next_run": s.next_fire_after(Utc::now()),
        }),
        None => json!({ "running": false }),
    };
    let last_run = state.orchestrator.last_run().await;
    let last_status = last_run
        .as_ref()
        .map_or_else(|| "Never run".to_string(), |r| r.status.clone());

    Json(json!({
        "success": true,
        "status": last_status,
        "last_run": last_run,
        "run_active": state.orchestrator.is_running(),
        "scheduler": scheduler,
        "source": state.orchestrator.source_name(),
        "store": state.orchestrator.store_name(),
        "sink": state.digest.sink_name(),
    }))
}

// ── Pipeline triggers ───────────────────────────────────────────────

pub(super) async fn fetch(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let hours = hours_from(&request_json(&body)?)?;
    let emails = state
        .orchestrator
        .fetch(TimeWindow::last_hours(hours))
        .await
        .map_err(|e| ApiError::new(StatusCode::BAD_GATEWAY, e.to_string()))?;

    info!(hours, count = emails.len(), "Fetch-only request");
    let preview: Vec<_> = emails.iter().take(FETCH_PREVIEW_LIMIT).collect();
    Ok(Json(json!({
        "success": true,
        "hours": hours,
        "count": emails.len(),
        "emails": preview,
    })))
}

pub(super) async fn classify(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let req = request_json(&body)?;
    let subject = req.get("subject").and_then(Value::as_str).unwrap_or_default();
    let text = req.get("body").and_then(Value::as_str).unwrap_or_default();
    if subject.trim().is_empty() && text.trim().is_empty() {
        return Err(ApiError::bad_request("subject or body is required"));
    }

    match state.orchestrator.classify(subject, text).await {
        Ok(result) => Ok(Json(json!({ "success": true, "classification": result }))),
        Err(e @ ClassificationError::SchemaViolation { .. }) => {
            Err(ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))
        }
        Err(e) => Err(ApiError::new(StatusCode::BAD_GATEWAY, e.to_string())),
    }
}

pub(super) async fn run_pipeline(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let hours = hours_from(&request_json(&body)?)?;
    match state.orchestrator.run(TimeWindow::last_hours(hours)).await {
        Ok(report) => Ok(Json(json!({
            "success": true,
            "hours": hours,
            "report": report,
        }))),
        Err(PipelineError::RunInProgress) => Err(ApiError::new(
            StatusCode::CONFLICT,
            PipelineError::RunInProgress.to_string(),
        )),
        Err(e) => {
            warn!(error = %e, "Pipeline run aborted");
            let partial = e.partial_report().cloned();
            Err(ApiError::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
                .with_extra(json!({ "partial_report": partial })))
        }
    }
}

pub(super) async fn send_digest(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let hours = hours_from(&request_json(&body)?)?;
    let delivery = state
        .digest
        .send_digest(TimeWindow::last_hours(hours))
        .await
        .map_err(|e| ApiError::new(StatusCode::BAD_GATEWAY, e.to_string()))?;

    Ok(Json(json!({
        "success": delivery.delivered,
        "hours": hours,
        "delivered": delivery.delivered,
        "error": delivery.error,
        "summary": delivery.summary,
        "text": delivery.text,
    })))
}

pub(super) async fn not_found() -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "Endpoint not found")
}

// ── Request parsing ─────────────────────────────────────────────────

/// Parse a JSON body. An empty body reads as `null`.
fn request_json(body: &Bytes) -> Result<Value, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("Invalid JSON body: {e}")))
}

/// `hours` from a request body: absent means the default, otherwise 1..=168.
fn hours_from(req: &Value) -> Result<u32, ApiError> {
    match req.get("hours") {
        None | Some(Value::Null) => Ok(DEFAULT_HOURS),
        Some(v) => v
            .as_u64()
            .and_then(|h| u32::try_from(h).ok())
            .filter(|h| (1..=MAX_HOURS).contains(h))
            .ok_or_else(|| {
                ApiError::bad_request(format!("hours must be an integer between 1 and {MAX_HOURS}"))
            }),
    }
}
