use crate::followup::{ScheduleOutcome, ScheduleRequest};
use crate::server::SdrState;
use axum::extract::Path;
use axum::routing::{get, post};
use axum::{Extension, Json};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CancelRequest {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SequenceRequest {
    owner_key: String,
    target_key: String,
    #[serde(default)]
    name: String,
}

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/followups", post(create_followup))
        .route("/api/v1/followups/sequence", post(create_sequence))
        .route("/api/v1/followups/{id}", get(get_followup))
        .route("/api/v1/followups/{id}/cancel", post(cancel_followup))
}

#[tracing::instrument(level = "info", skip_all)]
async fn create_followup(
    Extension(state): Extension<Arc<SdrState>>,
    Json(req): Json<ScheduleRequest>,
) -> Json<serde_json::Value> {
    match state.followups.schedule(req, Utc::now()).await {
        Ok(ScheduleOutcome::Scheduled { task }) => {
            Json(serde_json::json!({ "status": "scheduled", "followup": task }))
        }
        Ok(ScheduleOutcome::Duplicate { existing_id }) => Json(serde_json::json!({
            "status": "duplicate",
            "existing_id": existing_id,
        })),
        Err(e) => Json(serde_json::json!({ "status": "error", "error": e.to_string() })),
    }
}

#[tracing::instrument(level = "info", skip_all)]
async fn create_sequence(
    Extension(state): Extension<Arc<SdrState>>,
    Json(req): Json<SequenceRequest>,
) -> Json<serde_json::Value> {
    match state
        .followups
        .schedule_sequence(&req.owner_key, &req.target_key, &req.name, Utc::now())
        .await
    {
        Ok(outcomes) => Json(serde_json::json!({ "status": "ok", "steps": outcomes })),
        Err(e) => Json(serde_json::json!({ "status": "error", "error": e.to_string() })),
    }
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_followup(
    Extension(state): Extension<Arc<SdrState>>,
    Path(id): Path<String>,
) -> Json<serde_json::Value> {
    match state.followups.get(&id).await {
        Ok(Some(task)) => Json(serde_json::json!({ "status": "ok", "followup": task })),
        Ok(None) => Json(serde_json::json!({ "status": "not_found" })),
        Err(e) => Json(serde_json::json!({ "status": "error", "error": e.to_string() })),
    }
}

#[tracing::instrument(level = "info", skip_all)]
async fn cancel_followup(
    Extension(state): Extension<Arc<SdrState>>,
    Path(id): Path<String>,
    body: Option<Json<CancelRequest>>,
) -> Json<serde_json::Value> {
    let reason = body
        .and_then(|Json(req)| req.reason)
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| "manual".to_string());
    match state.followups.cancel(&id, &reason).await {
        Ok(cancelled) => Json(serde_json::json!({
            "status": if cancelled { "cancelled" } else { "unchanged" },
        })),
        Err(e) => Json(serde_json::json!({ "status": "error", "error": e.to_string() })),
    }
}
