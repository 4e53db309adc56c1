use crate::phone::{digits_only, whatsapp_jid};
use crate::traits::ChannelAdapter;
use crate::types::{ChannelId, InboundContentKind, InboundMessage, MessageId, OutboundMessage};
use anyhow::{Result, anyhow};
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Url;
use serde_json::Value;
use tokio::sync::mpsc;

pub const EVOLUTION_CHANNEL_ID: &str = "evolution";

/// WhatsApp transport through a self-hosted Evolution API instance.
#[derive(Clone)]
pub struct EvolutionAdapter {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    instance: String,
}

impl EvolutionAdapter {
    pub fn new(base_url: &str, api_key: &str, instance: &str) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(anyhow!("evolution base url is required"));
        }
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(anyhow!("evolution api key is required"));
        }
        let instance = instance.trim();
        if instance.is_empty() {
            return Err(anyhow!("evolution instance name is required"));
        }
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
            instance: instance.to_string(),
        })
    }

    fn send_text_url(&self) -> Result<Url> {
        Url::parse(&format!(
            "{}/message/sendText/{}",
            self.base_url, self.instance
        ))
        .map_err(|e| anyhow!("invalid evolution API URL: {e}"))
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for EvolutionAdapter {
    fn channel_id(&self) -> &str {
        EVOLUTION_CHANNEL_ID
    }

    async fn start(&self, _tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        // Inbound events arrive through the webhook route in sdr-app.
        Ok(())
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()> {
        let phone = digits_only(recipient_id);
        if phone.is_empty() {
            return Err(anyhow!("recipient_id (phone number) is required"));
        }
        let text = message.content.trim();
        if text.is_empty() {
            return Err(anyhow!("message content is empty"));
        }

        let payload = serde_json::json!({
            "number": whatsapp_jid(&phone),
            "text": text,
        });
        let response = self
            .http
            .post(self.send_text_url()?)
            .header("apikey", &self.api_key)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "evolution send failed: status={} body={}",
                status,
                body
            ));
        }
        tracing::debug!(recipient = %phone, chars = text.len(), "evolution message sent");
        Ok(())
    }
}

/// Extracts an inbound text message from an Evolution webhook event.
///
/// Returns `Ok(None)` for events that should be ignored: anything other than
/// `messages.upsert`, our own outgoing messages, group chats, and payloads
/// without text.
pub fn parse_webhook_event(event: &Value) -> Result<Option<InboundMessage>> {
    let event_name = event
        .get("event")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if !event_name.eq_ignore_ascii_case("messages.upsert") {
        return Ok(None);
    }
    let data = event
        .get("data")
        .ok_or_else(|| anyhow!("evolution event missing data"))?;
    let key = data
        .get("key")
        .ok_or_else(|| anyhow!("evolution event missing data.key"))?;

    if key.get("fromMe").and_then(Value::as_bool).unwrap_or(false) {
        return Ok(None);
    }
    let remote_jid = key
        .get("remoteJid")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("evolution event missing data.key.remoteJid"))?;
    if remote_jid.ends_with("@g.us") {
        return Ok(None);
    }

    let Some((kind, content)) = data.get("message").and_then(extract_content) else {
        return Ok(None);
    };

    let message_id = key
        .get("id")
        .and_then(Value::as_str)
        .map(MessageId::new)
        .unwrap_or_else(|| MessageId::new(format!("evo-{}", Utc::now().timestamp_millis())));
    let received_at = data
        .get("messageTimestamp")
        .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        .and_then(timestamp_to_utc)
        .unwrap_or_else(Utc::now);

    Ok(Some(InboundMessage {
        message_id,
        channel_id: ChannelId::new(EVOLUTION_CHANNEL_ID),
        sender_phone: digits_only(remote_jid),
        sender_name: data
            .get("pushName")
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|s| !s.trim().is_empty()),
        kind,
        content,
        received_at,
    }))
}

fn extract_content(message: &Value) -> Option<(InboundContentKind, String)> {
    let text = message
        .get("conversation")
        .and_then(Value::as_str)
        .or_else(|| {
            message
                .get("extendedTextMessage")
                .and_then(|m| m.get("text"))
                .and_then(Value::as_str)
        });
    if let Some(text) = text.map(str::trim).filter(|t| !t.is_empty()) {
        return Some((InboundContentKind::Text, text.to_string()));
    }
    for media in ["imageMessage", "videoMessage", "documentMessage"] {
        let caption = message
            .get(media)
            .and_then(|m| m.get("caption"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|c| !c.is_empty());
        if let Some(caption) = caption {
            return Some((InboundContentKind::MediaCaption, caption.to_string()));
        }
    }
    None
}

fn timestamp_to_utc(seconds: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_text_message_upsert() {
        let event = json!({
            "event": "messages.upsert",
            "instance": "sdr",
            "data": {
                "key": { "remoteJid": "5581999998888@s.whatsapp.net", "fromMe": false, "id": "ABC123" },
                "pushName": "Maria",
                "message": { "conversation": "  oi, tudo bem?  " },
                "messageTimestamp": 1_760_000_000
            }
        });
        let msg = parse_webhook_event(&event)
            .expect("parse")
            .expect("message");
        assert_eq!(msg.sender_phone, "5581999998888");
        assert_eq!(msg.message_id.as_str(), "ABC123");
        assert_eq!(msg.sender_name.as_deref(), Some("Maria"));
        assert_eq!(msg.content, "oi, tudo bem?");
        assert_eq!(msg.kind, InboundContentKind::Text);
        assert_eq!(msg.received_at.timestamp(), 1_760_000_000);
    }

    #[test]
    fn ignores_own_group_and_non_message_events() {
        let own = json!({
            "event": "messages.upsert",
            "data": { "key": { "remoteJid": "5581999998888@s.whatsapp.net", "fromMe": true }, "message": { "conversation": "hi" } }
        });
        assert!(parse_webhook_event(&own).expect("parse").is_none());

        let group = json!({
            "event": "messages.upsert",
            "data": { "key": { "remoteJid": "120363@g.us", "fromMe": false }, "message": { "conversation": "hi" } }
        });
        assert!(parse_webhook_event(&group).expect("parse").is_none());

        let status = json!({ "event": "connection.update", "data": {} });
        assert!(parse_webhook_event(&status).expect("parse").is_none());
    }

    #[test]
    fn uses_media_caption_when_no_text() {
        let event = json!({
            "event": "messages.upsert",
            "data": {
                "key": { "remoteJid": "5581999998888@s.whatsapp.net", "fromMe": false, "id": "X" },
                "message": { "imageMessage": { "caption": "comprovante" } }
            }
        });
        let msg = parse_webhook_event(&event)
            .expect("parse")
            .expect("message");
        assert_eq!(msg.kind, InboundContentKind::MediaCaption);
        assert_eq!(msg.content, "comprovante");
    }
}
