//! Periodic scan that moves due follow-ups onto the shared work queue.

use super::coordination::Coordinator;
use super::model::{FollowUpStatus, FollowUpTask, WorkItem};
use super::store::{ConversationLog, FollowUpStore, TransitionDetails};
use crate::config::FollowUpConfig;
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const TICK_LOCK_KEY: &str = "followup_scheduler_lock";
pub const REASON_MAX_ATTEMPTS: &str = "max_attempts_reached";
pub const REASON_USER_REPLIED: &str = "user_replied";

const MAX_WINDOW_HOURS: u64 = 24 * 365;

pub fn record_lock_key(followup_id: &str) -> String {
    format!("followup_enqueue:{followup_id}")
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub interval: Duration,
    pub tick_lock_ttl: Duration,
    pub record_lock_ttl: Duration,
    pub max_attempts: u32,
    pub attempt_window: ChronoDuration,
    pub queue_name: String,
    pub batch_limit: usize,
}

impl SchedulerSettings {
    pub fn from_config(cfg: &FollowUpConfig) -> Self {
        Self {
            interval: Duration::from_secs(cfg.scheduler_interval_seconds.max(1)),
            tick_lock_ttl: Duration::from_secs(cfg.tick_lock_ttl_seconds),
            record_lock_ttl: Duration::from_secs(cfg.record_lock_ttl_seconds),
            max_attempts: cfg.max_attempts,
            attempt_window: ChronoDuration::hours(cfg.attempt_window_hours.min(MAX_WINDOW_HOURS) as i64),
            queue_name: cfg.queue_name.clone(),
            batch_limit: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DueOutcome {
    Enqueued,
    CancelledCeiling,
    CancelledStale,
    /// Another tick holds the record lock, or the record left `pending` meanwhile.
    Skipped,
    PublishFailed,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub lock_held_elsewhere: bool,
    pub due: usize,
    pub enqueued: usize,
    pub cancelled_ceiling: usize,
    pub cancelled_stale: usize,
    pub skipped: usize,
    pub publish_failures: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Default)]
struct SchedulerState {
    ticks: u64,
    skipped_ticks: u64,
    enqueued: u64,
    cancelled_ceiling: u64,
    cancelled_stale: u64,
    publish_failures: u64,
    last_tick_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatusSnapshot {
    pub interval_seconds: u64,
    pub ticks: u64,
    pub skipped_ticks: u64,
    pub enqueued: u64,
    pub cancelled_ceiling: u64,
    pub cancelled_stale: u64,
    pub publish_failures: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

pub struct FollowUpScheduler {
    settings: SchedulerSettings,
    store: Arc<dyn FollowUpStore>,
    conversation_log: Arc<dyn ConversationLog>,
    coordinator: Arc<dyn Coordinator>,
    state: RwLock<SchedulerState>,
    shutdown: CancellationToken,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FollowUpScheduler {
    pub fn new(
        settings: SchedulerSettings,
        store: Arc<dyn FollowUpStore>,
        conversation_log: Arc<dyn ConversationLog>,
        coordinator: Arc<dyn Coordinator>,
    ) -> Self {
        Self {
            settings,
            store,
            conversation_log,
            coordinator,
            state: RwLock::new(SchedulerState::default()),
            shutdown: CancellationToken::new(),
            background_tasks: Mutex::new(Vec::new()),
        }
    }

    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.background_tasks.lock().await;
        if !tasks.is_empty() || self.shutdown.is_cancelled() {
            return;
        }
        let scheduler = self.clone();
        let shutdown = self.shutdown.child_token();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.settings.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("followup scheduler loop received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {}
                }
                if let Err(e) = scheduler.tick(Utc::now()).await {
                    tracing::warn!(error = %e, "followup scheduler tick failed");
                    scheduler.state.write().await.last_error = Some(e.to_string());
                }
            }
        }));
        tracing::info!(
            interval_seconds = self.settings.interval.as_secs(),
            queue = %self.settings.queue_name,
            "followup scheduler started"
        );
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
                    tracing::warn!(error = %e, "followup scheduler task join failed");
                }
                Err(_) => {
                    tracing::warn!("timed out waiting for followup scheduler shutdown");
                }
            }
        }
    }

    /// One scheduling pass. Safe to run concurrently from several processes.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();
        if !self
            .coordinator
            .acquire_lock(TICK_LOCK_KEY, self.settings.tick_lock_ttl)
            .await?
        {
            report.lock_held_elsewhere = true;
            let mut state = self.state.write().await;
            state.skipped_ticks = state.skipped_ticks.saturating_add(1);
            tracing::debug!("followup scheduler tick skipped; lock held elsewhere");
            return Ok(report);
        }

        let result = self.run_due(now, &mut report).await;
        if let Err(e) = self.coordinator.release_lock(TICK_LOCK_KEY).await {
            tracing::warn!(error = %e, "failed to release followup scheduler lock");
        }
        result?;

        {
            let mut state = self.state.write().await;
            state.ticks = state.ticks.saturating_add(1);
            state.enqueued = state.enqueued.saturating_add(report.enqueued as u64);
            state.cancelled_ceiling = state
                .cancelled_ceiling
                .saturating_add(report.cancelled_ceiling as u64);
            state.cancelled_stale = state
                .cancelled_stale
                .saturating_add(report.cancelled_stale as u64);
            state.publish_failures = state
                .publish_failures
                .saturating_add(report.publish_failures as u64);
            state.last_tick_at = Some(now);
            state.last_error = None;
        }
        if report.due > 0 {
            tracing::info!(
                due = report.due,
                enqueued = report.enqueued,
                cancelled_ceiling = report.cancelled_ceiling,
                cancelled_stale = report.cancelled_stale,
                skipped = report.skipped,
                publish_failures = report.publish_failures,
                "followup scheduler tick completed"
            );
        }
        Ok(report)
    }

    async fn run_due(&self, now: DateTime<Utc>, report: &mut TickReport) -> Result<()> {
        let due = self.store.list_due(now, self.settings.batch_limit).await?;
        report.due = due.len();
        for task in due {
            match self.process_due(&task, now).await {
                Ok(DueOutcome::Enqueued) => report.enqueued += 1,
                Ok(DueOutcome::CancelledCeiling) => report.cancelled_ceiling += 1,
                Ok(DueOutcome::CancelledStale) => report.cancelled_stale += 1,
                Ok(DueOutcome::Skipped) => report.skipped += 1,
                Ok(DueOutcome::PublishFailed) => report.publish_failures += 1,
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(error = %e, followup_id = %task.id, "failed to process due followup");
                }
            }
        }
        Ok(())
    }

    async fn process_due(&self, task: &FollowUpTask, now: DateTime<Utc>) -> Result<DueOutcome> {
        let since = now - self.settings.attempt_window;
        let attempts = self
            .store
            .count_terminal_since(&task.owner_key, since)
            .await?;
        if attempts >= u64::from(self.settings.max_attempts) {
            if !self.cancel(task, REASON_MAX_ATTEMPTS).await? {
                return Ok(DueOutcome::Skipped);
            }
            tracing::info!(
                followup_id = %task.id,
                owner_key = %task.owner_key,
                attempts,
                max_attempts = self.settings.max_attempts,
                "followup cancelled; attempt ceiling reached"
            );
            return Ok(DueOutcome::CancelledCeiling);
        }

        let times = self
            .conversation_log
            .last_message_times(&task.target_key)
            .await?;
        if times.user_replied_last() {
            if !self.cancel(task, REASON_USER_REPLIED).await? {
                return Ok(DueOutcome::Skipped);
            }
            tracing::info!(
                followup_id = %task.id,
                target_key = %task.target_key,
                "followup cancelled; user replied after last agent message"
            );
            return Ok(DueOutcome::CancelledStale);
        }

        let lock_key = record_lock_key(&task.id);
        if !self
            .coordinator
            .acquire_lock(&lock_key, self.settings.record_lock_ttl)
            .await?
        {
            return Ok(DueOutcome::Skipped);
        }

        let item = serde_json::to_string(&WorkItem::for_task(task, now))?;
        if let Err(e) = self.coordinator.push(&self.settings.queue_name, &item).await {
            tracing::warn!(error = %e, followup_id = %task.id, "failed to publish followup; releasing record lock");
            if let Err(release_err) = self.coordinator.release_lock(&lock_key).await {
                tracing::warn!(error = %release_err, followup_id = %task.id, "failed to release followup record lock");
            }
            return Ok(DueOutcome::PublishFailed);
        }

        // The worker may already have claimed it; either way it is no longer pending.
        let marked = self
            .store
            .transition(
                &task.id,
                FollowUpStatus::Pending,
                FollowUpStatus::Queued,
                TransitionDetails::default(),
            )
            .await?;
        if !marked {
            tracing::debug!(followup_id = %task.id, "followup left pending before it was marked queued");
        }
        Ok(DueOutcome::Enqueued)
    }

    /// Returns false when the record already left pending elsewhere.
    async fn cancel(&self, task: &FollowUpTask, reason: &str) -> Result<bool> {
        let cancelled = self
            .store
            .transition(
                &task.id,
                FollowUpStatus::Pending,
                FollowUpStatus::Cancelled,
                TransitionDetails::reason(reason),
            )
            .await?;
        if !cancelled {
            tracing::debug!(followup_id = %task.id, reason, "followup left pending before it could be cancelled");
        }
        Ok(cancelled)
    }

    pub async fn status_snapshot(&self) -> SchedulerStatusSnapshot {
        let state = self.state.read().await;
        SchedulerStatusSnapshot {
            interval_seconds: self.settings.interval.as_secs(),
            ticks: state.ticks,
            skipped_ticks: state.skipped_ticks,
            enqueued: state.enqueued,
            cancelled_ceiling: state.cancelled_ceiling,
            cancelled_stale: state.cancelled_stale,
            publish_failures: state.publish_failures,
            last_tick_at: state.last_tick_at,
            last_error: state.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::followup::coordination::SqliteCoordinator;
    use crate::followup::model::MessageAuthor;
    use crate::followup::testing::{Fixture, pending_task};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings() -> SchedulerSettings {
        SchedulerSettings::from_config(&FollowUpConfig::default())
    }

    fn scheduler(fx: &Fixture) -> FollowUpScheduler {
        FollowUpScheduler::new(
            settings(),
            fx.store.clone(),
            fx.store.clone(),
            fx.coordinator.clone(),
        )
    }

    async fn queued_items(fx: &Fixture) -> u64 {
        fx.coordinator
            .queue_len(&settings().queue_name)
            .await
            .expect("queue len")
    }

    #[tokio::test]
    async fn owner_at_attempt_ceiling_is_cancelled_without_enqueue() {
        let fx = Fixture::new().await;
        let now = Utc::now();
        for i in 0..3 {
            let id = format!("old-{i}");
            fx.insert(pending_task(&id, "O1", now - ChronoDuration::hours(40 - i)))
                .await;
            fx.force(&id, &[FollowUpStatus::Queued, FollowUpStatus::Failed])
                .await;
        }
        fx.insert(pending_task("fourth", "O1", now - ChronoDuration::minutes(1)))
            .await;

        let report = scheduler(&fx).tick(now).await.expect("tick");
        assert_eq!(report.due, 1);
        assert_eq!(report.cancelled_ceiling, 1);
        assert_eq!(report.enqueued, 0);

        let record = fx.get("fourth").await;
        assert_eq!(record.status, FollowUpStatus::Cancelled);
        assert_eq!(record.error_reason.as_deref(), Some(REASON_MAX_ATTEMPTS));
        assert_eq!(queued_items(&fx).await, 0);
    }

    #[tokio::test]
    async fn cancel_lost_to_another_process_is_skipped() {
        let fx = Fixture::new().await;
        let now = Utc::now();
        for i in 0..3 {
            let id = format!("old-{i}");
            fx.insert(pending_task(&id, "O1", now - ChronoDuration::hours(40 - i)))
                .await;
            fx.force(&id, &[FollowUpStatus::Queued, FollowUpStatus::Failed])
                .await;
        }
        fx.insert(pending_task("raced", "O1", now - ChronoDuration::minutes(1)))
            .await;
        let listed = fx.get("raced").await;
        fx.force("raced", &[FollowUpStatus::Cancelled]).await;

        let scheduler = scheduler(&fx);
        let outcome = scheduler.process_due(&listed, now).await.expect("process due");
        assert_eq!(outcome, DueOutcome::Skipped);
        assert_eq!(fx.get("raced").await.error_reason, None);
    }

    #[tokio::test]
    async fn user_reply_after_agent_message_cancels_reminder() {
        let fx = Fixture::new().await;
        let now = Utc::now();
        let task = pending_task("fu-100", "lead-1", now - ChronoDuration::seconds(1));
        fx.store
            .append(&task.target_key, MessageAuthor::Agent, "msg", now - ChronoDuration::hours(1))
            .await
            .expect("agent message");
        fx.store
            .append(&task.target_key, MessageAuthor::User, "reply", now - ChronoDuration::minutes(30))
            .await
            .expect("user message");
        fx.insert(task).await;

        let report = scheduler(&fx).tick(now).await.expect("tick");
        assert_eq!(report.cancelled_stale, 1);
        let record = fx.get("fu-100").await;
        assert_eq!(record.status, FollowUpStatus::Cancelled);
        assert_eq!(record.error_reason.as_deref(), Some(REASON_USER_REPLIED));
        assert_eq!(queued_items(&fx).await, 0);
    }

    #[tokio::test]
    async fn replayed_tick_does_not_enqueue_twice() {
        let fx = Fixture::new().await;
        let now = Utc::now();
        fx.insert(pending_task("fu-1", "lead-1", now - ChronoDuration::minutes(5)))
            .await;
        fx.insert(pending_task("fu-future", "lead-2", now + ChronoDuration::hours(2)))
            .await;

        let scheduler = scheduler(&fx);
        let first = scheduler.tick(now).await.expect("first tick");
        let second = scheduler.tick(now).await.expect("second tick");
        assert_eq!(first.enqueued, 1);
        assert_eq!(second.due, 0);
        assert_eq!(queued_items(&fx).await, 1);
        assert_eq!(fx.get("fu-1").await.status, FollowUpStatus::Queued);
        assert_eq!(fx.get("fu-future").await.status, FollowUpStatus::Pending);

        let raw = fx
            .coordinator
            .blocking_pop(&settings().queue_name, Duration::from_millis(10))
            .await
            .expect("pop")
            .expect("item");
        let item: WorkItem = serde_json::from_str(&raw).expect("work item json");
        assert_eq!(item.followup_id, "fu-1");
        assert_eq!(item.task_type, "execute_followup");
    }

    #[tokio::test]
    async fn tick_is_skipped_while_lock_is_held_elsewhere() {
        let fx = Fixture::new().await;
        let now = Utc::now();
        fx.insert(pending_task("fu-1", "lead-1", now - ChronoDuration::minutes(5)))
            .await;
        assert!(
            fx.coordinator
                .acquire_lock(TICK_LOCK_KEY, Duration::from_secs(120))
                .await
                .expect("foreign lock")
        );

        let report = scheduler(&fx).tick(now).await.expect("tick");
        assert!(report.lock_held_elsewhere);
        assert_eq!(fx.get("fu-1").await.status, FollowUpStatus::Pending);
    }

    struct FlakyPush {
        inner: Arc<SqliteCoordinator>,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl Coordinator for FlakyPush {
        async fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<bool> {
            self.inner.acquire_lock(key, ttl).await
        }
        async fn release_lock(&self, key: &str) -> Result<()> {
            self.inner.release_lock(key).await
        }
        async fn push(&self, queue: &str, item: &str) -> Result<()> {
            let remaining = self.failures_left.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_left.store(remaining - 1, Ordering::SeqCst);
                return Err(anyhow::anyhow!("queue store unavailable"));
            }
            self.inner.push(queue, item).await
        }
        async fn blocking_pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>> {
            self.inner.blocking_pop(queue, timeout).await
        }
    }

    #[tokio::test]
    async fn failed_publish_releases_record_lock_for_next_tick() {
        let fx = Fixture::new().await;
        let now = Utc::now();
        fx.insert(pending_task("fu-1", "lead-1", now - ChronoDuration::minutes(5)))
            .await;
        let flaky = Arc::new(FlakyPush {
            inner: fx.coordinator.clone(),
            failures_left: AtomicUsize::new(1),
        });
        let scheduler = FollowUpScheduler::new(settings(), fx.store.clone(), fx.store.clone(), flaky);

        let first = scheduler.tick(now).await.expect("first tick");
        assert_eq!(first.publish_failures, 1);
        assert_eq!(fx.get("fu-1").await.status, FollowUpStatus::Pending);

        let second = scheduler.tick(now).await.expect("second tick");
        assert_eq!(second.enqueued, 1);
        assert_eq!(fx.get("fu-1").await.status, FollowUpStatus::Queued);
        assert_eq!(scheduler.status_snapshot().await.publish_failures, 1);
    }
}
