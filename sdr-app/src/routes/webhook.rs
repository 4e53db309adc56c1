use crate::followup::MessageAuthor;
use crate::message_buffer::{AddOutcome, Fragment};
use crate::server::SdrState;
use axum::routing::post;
use axum::{Extension, Json};
use sdr_channels::{is_plausible_phone, normalize_phone, parse_webhook_event};
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/webhook/evolution", post(evolution_webhook))
}

#[tracing::instrument(level = "info", skip_all)]
async fn evolution_webhook(
    Extension(state): Extension<Arc<SdrState>>,
    Json(event): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    let message = match parse_webhook_event(&event) {
        Ok(Some(message)) => message,
        Ok(None) => return Json(serde_json::json!({ "status": "ignored" })),
        Err(e) => {
            tracing::warn!(error = %e, "invalid evolution webhook payload");
            return Json(serde_json::json!({ "status": "error", "error": e.to_string() }));
        }
    };

    let Some(phone) = normalize_phone(&message.sender_phone, &state.country_prefix)
        .filter(|phone| is_plausible_phone(phone))
    else {
        tracing::warn!(sender = %message.sender_phone, "dropping inbound message with implausible phone");
        return Json(serde_json::json!({ "status": "ignored", "reason": "invalid_phone" }));
    };

    if let Err(e) = state
        .conversation_log
        .append(&phone, MessageAuthor::User, &message.content, message.received_at)
        .await
    {
        tracing::warn!(error = %e, phone = %phone, "failed to record inbound message");
    }

    let fragment = Fragment {
        content: message.content,
        message_id: Some(message.message_id.as_str().to_string()),
        sender_name: message.sender_name,
        received_at: message.received_at,
    };
    match state.buffer.add_fragment(&phone, fragment).await {
        AddOutcome::Dropped => Json(serde_json::json!({ "status": "dropped" })),
        AddOutcome::Started | AddOutcome::Appended => {
            Json(serde_json::json!({ "status": "buffered" }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BusinessHoursConfig, FollowUpConfig};
    use crate::followup::testing::{Fixture, TARGET};
    use crate::followup::{BusinessHours, ConversationLog, FollowUpService};
    use crate::message_buffer::{Batch, BatchHandler, BufferSettings, MessageBuffer};
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use sdr_channels::{ChannelAdapter, InboundMessage, OutboundMessage};
    use std::time::{Duration, Instant};
    use tokio::sync::mpsc;

    struct NullChannel;

    #[async_trait]
    impl ChannelAdapter for NullChannel {
        fn channel_id(&self) -> &str {
            "null"
        }

        async fn start(&self, _tx: mpsc::Sender<InboundMessage>) -> Result<()> {
            Ok(())
        }

        async fn send(&self, _recipient_id: &str, _message: OutboundMessage) -> Result<()> {
            Ok(())
        }
    }

    struct IgnoreBatches;

    #[async_trait]
    impl BatchHandler for IgnoreBatches {
        async fn handle(&self, _batch: Batch) -> Result<()> {
            Ok(())
        }
    }

    fn state(fx: &Fixture) -> Arc<SdrState> {
        let followups = FollowUpService::new(
            fx.store.clone(),
            BusinessHours::from_config(&BusinessHoursConfig::default()).expect("business hours"),
            "55",
            ChronoDuration::minutes(30),
            FollowUpConfig::default().sequence,
        );
        Arc::new(SdrState {
            channel: Arc::new(NullChannel),
            buffer: MessageBuffer::new(
                BufferSettings {
                    idle_timeout: Duration::from_secs(600),
                    max_fragments: 10,
                },
                Arc::new(IgnoreBatches),
            ),
            crm: None,
            followups: Arc::new(followups),
            conversation_log: fx.store.clone(),
            scheduler: None,
            worker: None,
            country_prefix: "55".to_string(),
            started_at: Instant::now(),
        })
    }

    fn upsert(remote_jid: &str, text: &str) -> serde_json::Value {
        serde_json::json!({
            "event": "messages.upsert",
            "data": {
                "key": { "remoteJid": remote_jid, "fromMe": false, "id": "wamid-1" },
                "pushName": "Ana",
                "message": { "conversation": text },
                "messageTimestamp": 1_760_000_000
            }
        })
    }

    #[tokio::test]
    async fn accepted_message_is_logged_and_buffered() {
        let fx = Fixture::new().await;
        let state = state(&fx);

        let Json(body) = evolution_webhook(
            Extension(state.clone()),
            Json(upsert(&format!("{TARGET}@s.whatsapp.net"), "oi, quero saber do plano")),
        )
        .await;
        assert_eq!(body["status"], "buffered");

        let times = fx.store.last_message_times(TARGET).await.expect("times");
        assert!(times.last_user_at.is_some());
        assert!(times.last_agent_at.is_none());
        let snapshot = state.buffer.status_snapshot().await;
        assert_eq!(snapshot.active_keys, 1);
        assert_eq!(snapshot.pending_fragments, 1);
    }

    #[tokio::test]
    async fn implausible_sender_is_dropped_before_buffering() {
        let fx = Fixture::new().await;
        let state = state(&fx);

        let Json(body) = evolution_webhook(
            Extension(state.clone()),
            Json(upsert("1111111111@s.whatsapp.net", "oi")),
        )
        .await;
        assert_eq!(body["status"], "ignored");
        assert_eq!(body["reason"], "invalid_phone");

        let snapshot = state.buffer.status_snapshot().await;
        assert_eq!(snapshot.active_keys, 0);
        assert_eq!(snapshot.accepted, 0);
        let times = fx.store.last_message_times("551111111111").await.expect("times");
        assert!(times.last_user_at.is_none());
    }

    #[tokio::test]
    async fn own_messages_are_ignored() {
        let fx = Fixture::new().await;
        let state = state(&fx);
        let mut event = upsert(&format!("{TARGET}@s.whatsapp.net"), "resposta do agente");
        event["data"]["key"]["fromMe"] = serde_json::json!(true);

        let Json(body) = evolution_webhook(Extension(state.clone()), Json(event)).await;
        assert_eq!(body["status"], "ignored");
        assert_eq!(state.buffer.status_snapshot().await.accepted, 0);
    }
}
