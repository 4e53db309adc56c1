//! Consumes the follow-up work queue and performs the sends.

use super::coordination::Coordinator;
use super::model::{EXECUTE_FOLLOWUP, FollowUpStatus, MessageAuthor, WorkItem};
use super::store::{ConversationLog, FollowUpStore, TransitionDetails};
use crate::config::FollowUpConfig;
use anyhow::Result;
use chrono::{DateTime, Utc};
use sdr_channels::{ChannelAdapter, OutboundMessage};
use sdr_crm::{CrmOperation, OperationQueue};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Follow-up type of the last reminder in a sequence.
pub const SEQUENCE_FINAL: &str = "sequence_final";

pub fn execute_lock_key(followup_id: &str) -> String {
    format!("followup_execute:{followup_id}")
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub queue_name: String,
    pub pop_timeout: Duration,
    pub execute_lock_ttl: Duration,
    /// CRM stage applied once the final sequence reminder goes out.
    pub final_stage: String,
}

impl WorkerSettings {
    pub fn from_config(cfg: &FollowUpConfig) -> Self {
        Self {
            queue_name: cfg.queue_name.clone(),
            pop_timeout: Duration::from_secs(cfg.worker_pop_timeout_seconds.max(1)),
            execute_lock_ttl: Duration::from_secs(300),
            final_stage: "desqualificado".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    Executed,
    Failed,
    /// Record missing, already terminal, or being handled elsewhere.
    Skipped,
    Malformed,
}

#[derive(Debug, Clone, Default)]
struct WorkerState {
    processed: u64,
    executed: u64,
    failed: u64,
    skipped: u64,
    malformed: u64,
    last_executed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatusSnapshot {
    pub queue_name: String,
    pub processed: u64,
    pub executed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub malformed: u64,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

pub struct FollowUpWorker {
    settings: WorkerSettings,
    store: Arc<dyn FollowUpStore>,
    conversation_log: Arc<dyn ConversationLog>,
    coordinator: Arc<dyn Coordinator>,
    channel: Arc<dyn ChannelAdapter>,
    crm: Option<Arc<OperationQueue>>,
    state: RwLock<WorkerState>,
    shutdown: CancellationToken,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FollowUpWorker {
    pub fn new(
        settings: WorkerSettings,
        store: Arc<dyn FollowUpStore>,
        conversation_log: Arc<dyn ConversationLog>,
        coordinator: Arc<dyn Coordinator>,
        channel: Arc<dyn ChannelAdapter>,
        crm: Option<Arc<OperationQueue>>,
    ) -> Self {
        Self {
            settings,
            store,
            conversation_log,
            coordinator,
            channel,
            crm,
            state: RwLock::new(WorkerState::default()),
            shutdown: CancellationToken::new(),
            background_tasks: Mutex::new(Vec::new()),
        }
    }

    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.background_tasks.lock().await;
        if !tasks.is_empty() || self.shutdown.is_cancelled() {
            return;
        }
        let worker = self.clone();
        let shutdown = self.shutdown.child_token();
        tasks.push(tokio::spawn(async move {
            loop {
                let popped = tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("followup worker loop received shutdown signal");
                        break;
                    }
                    popped = worker
                        .coordinator
                        .blocking_pop(&worker.settings.queue_name, worker.settings.pop_timeout) => popped,
                };
                match popped {
                    Ok(Some(raw)) => {
                        worker.process(&raw).await;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "followup work queue pop failed");
                        worker.state.write().await.last_error = Some(e.to_string());
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        }
                    }
                }
            }
        }));
        tracing::info!(queue = %self.settings.queue_name, "followup worker started");
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles = {
            let mut guard = self.background_tasks.lock().await;
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "followup worker task join failed");
                }
                Err(_) => {
                    tracing::warn!("timed out waiting for followup worker shutdown");
                }
            }
        }
    }

    /// Handles one raw work-queue item and records the outcome in the stats.
    pub async fn process(&self, raw: &str) -> WorkOutcome {
        let outcome = match self.try_process(raw).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(error = %e, "followup work item processing failed");
                self.state.write().await.last_error = Some(e.to_string());
                WorkOutcome::Skipped
            }
        };
        let mut state = self.state.write().await;
        state.processed = state.processed.saturating_add(1);
        match outcome {
            WorkOutcome::Executed => {
                state.executed = state.executed.saturating_add(1);
                state.last_executed_at = Some(Utc::now());
            }
            WorkOutcome::Failed => state.failed = state.failed.saturating_add(1),
            WorkOutcome::Skipped => state.skipped = state.skipped.saturating_add(1),
            WorkOutcome::Malformed => state.malformed = state.malformed.saturating_add(1),
        }
        outcome
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn try_process(&self, raw: &str) -> Result<WorkOutcome> {
        let item: WorkItem = match serde_json::from_str(raw) {
            Ok(item) => item,
            Err(e) => {
                tracing::warn!(error = %e, "discarding malformed followup work item");
                return Ok(WorkOutcome::Malformed);
            }
        };
        if item.task_type != EXECUTE_FOLLOWUP {
            tracing::warn!(task_type = %item.task_type, "discarding unknown followup work item type");
            return Ok(WorkOutcome::Malformed);
        }

        let Some(record) = self.store.get(&item.followup_id).await? else {
            tracing::warn!(followup_id = %item.followup_id, "followup record no longer exists");
            return Ok(WorkOutcome::Skipped);
        };
        match record.status {
            FollowUpStatus::Queued => {}
            // Published but not yet marked by the scheduler.
            FollowUpStatus::Pending => {
                let claimed = self
                    .store
                    .transition(
                        &record.id,
                        FollowUpStatus::Pending,
                        FollowUpStatus::Queued,
                        TransitionDetails::default(),
                    )
                    .await?;
                if !claimed {
                    let current = self.store.get(&record.id).await?.map(|r| r.status);
                    if current != Some(FollowUpStatus::Queued) {
                        return Ok(WorkOutcome::Skipped);
                    }
                }
            }
            status => {
                tracing::info!(followup_id = %record.id, status = %status, "followup no longer queued; skipping");
                return Ok(WorkOutcome::Skipped);
            }
        }

        let lock_key = execute_lock_key(&record.id);
        if !self
            .coordinator
            .acquire_lock(&lock_key, self.settings.execute_lock_ttl)
            .await?
        {
            return Ok(WorkOutcome::Skipped);
        }

        let sent = self
            .channel
            .send(&record.target_key, OutboundMessage::text(record.message.clone()))
            .await;
        let outcome = match sent {
            Ok(()) => {
                let executed_at = Utc::now();
                let marked = self
                    .store
                    .transition(
                        &record.id,
                        FollowUpStatus::Queued,
                        FollowUpStatus::Executed,
                        TransitionDetails::executed(executed_at),
                    )
                    .await;
                let marked = match marked {
                    Ok(marked) => marked,
                    Err(e) => {
                        self.release_execute_lock(&lock_key, &record.id).await;
                        return Err(e);
                    }
                };
                if !marked {
                    tracing::warn!(followup_id = %record.id, "followup sent but record changed state during send");
                }
                if let Err(e) = self
                    .conversation_log
                    .append(&record.target_key, MessageAuthor::Agent, &record.message, executed_at)
                    .await
                {
                    tracing::warn!(error = %e, followup_id = %record.id, "failed to record followup in conversation log");
                }
                tracing::info!(
                    followup_id = %record.id,
                    owner_key = %record.owner_key,
                    followup_type = %record.followup_type,
                    "followup executed"
                );
                self.notify_crm(&record.owner_key, &record.followup_type, &record.message)
                    .await;
                WorkOutcome::Executed
            }
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!(error = %reason, followup_id = %record.id, "followup send failed");
                let marked = self
                    .store
                    .transition(
                        &record.id,
                        FollowUpStatus::Queued,
                        FollowUpStatus::Failed,
                        TransitionDetails::reason(reason),
                    )
                    .await;
                if let Err(e) = marked {
                    self.release_execute_lock(&lock_key, &record.id).await;
                    return Err(e);
                }
                WorkOutcome::Failed
            }
        };
        self.release_execute_lock(&lock_key, &record.id).await;
        Ok(outcome)
    }

    async fn release_execute_lock(&self, lock_key: &str, followup_id: &str) {
        if let Err(e) = self.coordinator.release_lock(lock_key).await {
            tracing::warn!(error = %e, followup_id = %followup_id, "failed to release followup execute lock");
        }
    }

    async fn notify_crm(&self, owner_key: &str, followup_type: &str, message: &str) {
        let Some(crm) = self.crm.as_ref() else {
            return;
        };
        let Ok(lead_id) = owner_key.parse::<u64>() else {
            return;
        };
        let note = format!("Follow-up automático enviado ({followup_type}): {message}");
        if let Err(e) = crm.add_note(lead_id, &note).await {
            tracing::warn!(error = %e, lead_id, "failed to queue crm note for followup");
        }
        if followup_type == SEQUENCE_FINAL {
            let stage = CrmOperation::UpdateStage {
                lead_id,
                stage: self.settings.final_stage.clone(),
            };
            if let Err(e) = crm.enqueue(stage, false).await {
                tracing::warn!(error = %e, lead_id, "failed to queue crm stage change after final followup");
            }
        }
    }

    pub async fn status_snapshot(&self) -> WorkerStatusSnapshot {
        let state = self.state.read().await;
        WorkerStatusSnapshot {
            queue_name: self.settings.queue_name.clone(),
            processed: state.processed,
            executed: state.executed,
            failed: state.failed,
            skipped: state.skipped,
            malformed: state.malformed,
            last_executed_at: state.last_executed_at,
            last_error: state.last_error.clone(),
        }
    }
}
