//! Downstream consumer of coalesced conversation batches.

use crate::followup::{FollowUpService, REASON_USER_REPLIED};
use crate::message_buffer::{Batch, BatchHandler};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use sdr_crm::{CrmOperation, OperationQueue};
use std::sync::Arc;
use std::time::Duration;

pub struct ConversationHandler {
    followups: Arc<FollowUpService>,
    crm: Option<Arc<OperationQueue>>,
    http: reqwest::Client,
    forward_url: Option<String>,
}

impl ConversationHandler {
    pub fn new(
        followups: Arc<FollowUpService>,
        crm: Option<Arc<OperationQueue>>,
        forward_url: Option<String>,
        forward_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(forward_timeout).build()?;
        Ok(Self {
            followups,
            crm,
            http,
            forward_url: forward_url.filter(|url| !url.trim().is_empty()),
        })
    }

    async fn forward(&self, url: &str, batch: &Batch, content: &str) -> Result<()> {
        let payload = serde_json::json!({
            "phone": batch.key,
            "content": content,
            "message_id": batch.last_message_id(),
            "sender_name": batch.sender_name(),
            "fragments": batch.fragments.len(),
        });
        let response = self.http.post(url).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "conversation forward failed: status={} body={}",
                status,
                body
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl BatchHandler for ConversationHandler {
    #[tracing::instrument(level = "info", skip_all)]
    async fn handle(&self, batch: Batch) -> Result<()> {
        let content = batch.joined();

        match self
            .followups
            .cancel_pending_for_target(&batch.key, REASON_USER_REPLIED)
            .await
        {
            Ok(0) => {}
            Ok(cancelled) => {
                tracing::info!(phone = %batch.key, cancelled, "user replied; pending followups cancelled");
            }
            Err(e) => {
                tracing::warn!(error = %e, phone = %batch.key, "failed to cancel followups for replying user");
            }
        }

        if let Some(crm) = self.crm.as_ref() {
            let upsert = CrmOperation::Upsert {
                phone: batch.key.clone(),
                name: batch.sender_name().map(str::to_string),
                fields: serde_json::json!({}),
            };
            if let Err(e) = crm.enqueue(upsert, false).await {
                tracing::warn!(error = %e, phone = %batch.key, "failed to queue crm upsert");
            }
        }

        match self.forward_url.as_deref() {
            Some(url) => self.forward(url, &batch, &content).await,
            None => {
                tracing::info!(
                    phone = %batch.key,
                    fragments = batch.fragments.len(),
                    chars = content.len(),
                    "conversation batch ready; no forward_url configured"
                );
                Ok(())
            }
        }
    }
}
