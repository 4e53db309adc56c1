use crate::server::SdrState;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/health", get(get_health))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(Extension(state): Extension<Arc<SdrState>>) -> Json<serde_json::Value> {
    let crm = match state.crm.as_ref() {
        Some(queue) => Some(queue.status_snapshot().await),
        None => None,
    };
    let scheduler = match state.scheduler.as_ref() {
        Some(scheduler) => Some(scheduler.status_snapshot().await),
        None => None,
    };
    let worker = match state.worker.as_ref() {
        Some(worker) => Some(worker.status_snapshot().await),
        None => None,
    };
    let buffer = state.buffer.status_snapshot().await;

    Json(serde_json::json!({
        "status": "ok",
        "checked_at": Utc::now(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "channel": state.channel.channel_id(),
        "checks": {
            "crm_queue": crm,
            "buffer": buffer,
            "followup_scheduler": scheduler,
            "followup_worker": worker,
        }
    }))
}
