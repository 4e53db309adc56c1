use crate::server::SdrState;
use axum::routing::post;
use axum::{Extension, Json};
use sdr_crm::{CrmOperation, QueueError};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct OperationRequest {
    operation: CrmOperation,
    #[serde(default)]
    wait: bool,
    #[serde(default)]
    priority: Option<u8>,
}

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/crm/operations", post(enqueue_operation))
}

#[tracing::instrument(level = "info", skip_all)]
async fn enqueue_operation(
    Extension(state): Extension<Arc<SdrState>>,
    Json(req): Json<OperationRequest>,
) -> Json<serde_json::Value> {
    let Some(queue) = state.crm.as_ref() else {
        return Json(serde_json::json!({ "status": "error", "error": "crm integration is disabled" }));
    };
    let kind = req.operation.kind();
    let result = match req.priority {
        Some(priority) => {
            queue
                .enqueue_with_priority(req.operation, priority, req.wait)
                .await
        }
        None => queue.enqueue(req.operation, req.wait).await,
    };
    match result {
        Ok(Some(value)) => Json(serde_json::json!({ "status": "ok", "kind": kind, "result": value })),
        Ok(None) => Json(serde_json::json!({ "status": "queued", "kind": kind })),
        Err(QueueError::Failed { attempts, source, .. }) => Json(serde_json::json!({
            "status": "error",
            "kind": kind,
            "attempts": attempts,
            "retryable": source.is_retryable(),
            "error": source.to_string(),
        })),
        Err(e) => Json(serde_json::json!({ "status": "error", "kind": kind, "error": e.to_string() })),
    }
}
