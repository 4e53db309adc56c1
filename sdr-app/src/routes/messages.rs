use crate::followup::MessageAuthor;
use crate::server::SdrState;
use axum::routing::post;
use axum::{Extension, Json};
use chrono::Utc;
use sdr_channels::{OutboundMessage, is_plausible_phone, normalize_phone};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct SendRequest {
    phone: String,
    message: String,
}

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/messages/send", post(send_message))
}

/// Agent replies go out through here so the conversation log sees them.
#[tracing::instrument(level = "info", skip_all)]
async fn send_message(
    Extension(state): Extension<Arc<SdrState>>,
    Json(req): Json<SendRequest>,
) -> Json<serde_json::Value> {
    let Some(phone) =
        normalize_phone(&req.phone, &state.country_prefix).filter(|phone| is_plausible_phone(phone))
    else {
        return Json(serde_json::json!({ "status": "error", "error": "invalid phone" }));
    };

    if let Err(e) = state
        .channel
        .send(&phone, OutboundMessage::text(req.message.clone()))
        .await
    {
        return Json(serde_json::json!({ "status": "error", "error": e.to_string() }));
    }

    if let Err(e) = state
        .conversation_log
        .append(&phone, MessageAuthor::Agent, &req.message, Utc::now())
        .await
    {
        tracing::warn!(error = %e, phone = %phone, "failed to record agent message");
    }
    Json(serde_json::json!({ "status": "ok" }))
}
