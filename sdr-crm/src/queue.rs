//! Rate-limited, retrying priority queue in front of the CRM API.
//!
//! A single consumer drains the queue so every remote call passes through one
//! `SlidingWindowLimiter`. Failed transient calls go to a delayed set keyed by
//! their backoff deadline and become ready again only once it passes.

use crate::client::{CrmApi, dispatch};
use crate::error::{CrmError, QueueError};
use crate::rate_limiter::{RateLimitPolicy, RateLimiterSnapshot, SlidingWindowLimiter};
use crate::types::{CrmOperation, LeadId, OperationId, OperationKind, QueuedOperation};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

type Waiter = oneshot::Sender<Result<Value, QueueError>>;

#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Total attempts per operation, including the first.
    pub max_attempts: u32,
    pub backoff_ceiling: Duration,
    /// How long a synchronous caller waits before giving up on the result.
    pub result_timeout: Duration,
    pub priority_overrides: HashMap<OperationKind, u8>,
    pub rate_limit: RateLimitPolicy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ceiling: Duration::from_secs(60),
            result_timeout: Duration::from_secs(120),
            priority_overrides: HashMap::new(),
            rate_limit: RateLimitPolicy::default(),
        }
    }
}

struct Entry {
    op: QueuedOperation,
    waiter: Option<Waiter>,
}

#[derive(Default)]
struct Pending {
    ready: BTreeMap<(u8, u64), Entry>,
    delayed: BTreeMap<(Instant, u64), Entry>,
    next_seq: u64,
}

impl Pending {
    fn seq(&mut self) -> u64 {
        self.next_seq = self.next_seq.wrapping_add(1);
        self.next_seq
    }

    fn push_ready(&mut self, entry: Entry) {
        let seq = self.seq();
        self.ready.insert((entry.op.priority, seq), entry);
    }

    fn push_delayed(&mut self, ready_at: Instant, entry: Entry) {
        let seq = self.seq();
        self.delayed.insert((ready_at, seq), entry);
    }

    fn promote_due(&mut self, now: Instant) {
        while let Some(((ready_at, _), _)) = self.delayed.first_key_value() {
            if *ready_at > now {
                break;
            }
            if let Some((_, entry)) = self.delayed.pop_first() {
                self.push_ready(entry);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.delayed.first_key_value().map(|((at, _), _)| *at)
    }
}

#[derive(Debug, Clone, Default)]
struct QueueState {
    attempted: u64,
    succeeded: u64,
    failed: u64,
    retried: u64,
    throttled: u64,
    blocked: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatusSnapshot {
    pub running: bool,
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub throttled: u64,
    pub blocked: u64,
    pub depth: usize,
    pub ready: usize,
    pub delayed: usize,
    pub rate_limiter: RateLimiterSnapshot,
}

struct QueueInner {
    api: Arc<dyn CrmApi>,
    settings: QueueSettings,
    limiter: Mutex<SlidingWindowLimiter>,
    pending: Mutex<Pending>,
    wakeup: Notify,
    state: RwLock<QueueState>,
    shutdown: CancellationToken,
}

pub struct OperationQueue {
    inner: Arc<QueueInner>,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl OperationQueue {
    pub fn new(api: Arc<dyn CrmApi>, settings: QueueSettings) -> Self {
        let limiter = SlidingWindowLimiter::new(settings.rate_limit.clone());
        Self {
            inner: Arc::new(QueueInner {
                api,
                settings,
                limiter: Mutex::new(limiter),
                pending: Mutex::new(Pending::default()),
                wakeup: Notify::new(),
                state: RwLock::new(QueueState::default()),
                shutdown: CancellationToken::new(),
            }),
            background_tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the consumer loop. Calling twice is a no-op.
    pub async fn start(&self) {
        let mut tasks = self.background_tasks.lock().await;
        if !tasks.is_empty() || self.inner.shutdown.is_cancelled() {
            return;
        }
        let inner = self.inner.clone();
        tasks.push(tokio::spawn(async move {
            run_consumer(inner).await;
        }));
        tracing::info!(
            budget_per_second = self.inner.settings.rate_limit.budget_per_second,
            max_attempts = self.inner.settings.max_attempts,
            "crm operation queue started"
        );
    }

    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handles = {
            let mut guard = self.background_tasks.lock().await;
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "crm queue consumer join failed");
                }
                Err(_) => {
                    tracing::warn!("timed out waiting for crm queue consumer shutdown");
                }
            }
        }
        let abandoned = {
            let mut pending = self.inner.pending.lock().await;
            let count = pending.ready.len() + pending.delayed.len();
            pending.ready.clear();
            pending.delayed.clear();
            count
        };
        if abandoned > 0 {
            tracing::warn!(abandoned, "crm queue stopped with pending operations");
        }
    }

    pub fn priority_for(&self, kind: OperationKind) -> u8 {
        self.inner
            .settings
            .priority_overrides
            .get(&kind)
            .copied()
            .unwrap_or_else(|| kind.default_priority())
    }

    /// Queues an operation at its kind's priority. With `wait_for_result`
    /// the call resolves once the operation succeeds or fails terminally.
    pub async fn enqueue(
        &self,
        operation: CrmOperation,
        wait_for_result: bool,
    ) -> Result<Option<Value>, QueueError> {
        let priority = self.priority_for(operation.kind());
        self.enqueue_with_priority(operation, priority, wait_for_result)
            .await
    }

    pub async fn enqueue_with_priority(
        &self,
        operation: CrmOperation,
        priority: u8,
        wait_for_result: bool,
    ) -> Result<Option<Value>, QueueError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(QueueError::Closed);
        }
        let op = QueuedOperation::new(operation, priority, self.inner.settings.max_attempts);
        let id = op.id.clone();
        let kind = op.kind();
        let (waiter, rx) = if wait_for_result {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        {
            let mut pending = self.inner.pending.lock().await;
            pending.push_ready(Entry { op, waiter });
        }
        self.inner.wakeup.notify_one();
        tracing::debug!(operation_id = %id, kind = %kind, priority, "crm operation enqueued");

        let Some(rx) = rx else {
            return Ok(None);
        };
        match tokio::time::timeout(self.inner.settings.result_timeout, rx).await {
            Ok(Ok(result)) => result.map(Some),
            Ok(Err(_)) => Err(QueueError::Closed),
            Err(_) => {
                tracing::warn!(operation_id = %id, kind = %kind, "timed out waiting for crm operation");
                Err(QueueError::Timeout(id.to_string()))
            }
        }
    }

    pub async fn create_lead(
        &self,
        name: &str,
        phone: &str,
        fields: Value,
    ) -> Result<Value, QueueError> {
        self.enqueue_waiting(CrmOperation::CreateLead {
            name: name.to_string(),
            phone: phone.to_string(),
            fields,
        })
        .await
    }

    pub async fn update_lead(&self, lead_id: LeadId, fields: Value) -> Result<Value, QueueError> {
        self.enqueue_waiting(CrmOperation::UpdateLead { lead_id, fields })
            .await
    }

    pub async fn update_stage(&self, lead_id: LeadId, stage: &str) -> Result<Value, QueueError> {
        self.enqueue_waiting(CrmOperation::UpdateStage {
            lead_id,
            stage: stage.to_string(),
        })
        .await
    }

    pub async fn fetch_by_phone(&self, phone: &str) -> Result<Value, QueueError> {
        self.enqueue_waiting(CrmOperation::FetchByPhone {
            phone: phone.to_string(),
        })
        .await
    }

    pub async fn fetch_by_id(&self, lead_id: LeadId) -> Result<Value, QueueError> {
        self.enqueue_waiting(CrmOperation::FetchById { lead_id })
            .await
    }

    pub async fn upsert(
        &self,
        phone: &str,
        name: Option<&str>,
        fields: Value,
    ) -> Result<Value, QueueError> {
        self.enqueue_waiting(CrmOperation::Upsert {
            phone: phone.to_string(),
            name: name.map(str::to_string),
            fields,
        })
        .await
    }

    /// Fire-and-forget; failures only show up in logs and counters.
    pub async fn add_note(&self, lead_id: LeadId, text: &str) -> Result<(), QueueError> {
        self.enqueue(
            CrmOperation::AddNote {
                lead_id,
                text: text.to_string(),
            },
            false,
        )
        .await
        .map(|_| ())
    }

    async fn enqueue_waiting(&self, operation: CrmOperation) -> Result<Value, QueueError> {
        self.enqueue(operation, true)
            .await
            .map(|v| v.unwrap_or(Value::Null))
    }

    pub async fn status_snapshot(&self) -> QueueStatusSnapshot {
        let state = self.inner.state.read().await.clone();
        let (ready, delayed) = {
            let pending = self.inner.pending.lock().await;
            (pending.ready.len(), pending.delayed.len())
        };
        let rate_limiter = self.inner.limiter.lock().await.snapshot(Instant::now());
        let running = !self.inner.shutdown.is_cancelled()
            && !self.background_tasks.lock().await.is_empty();
        QueueStatusSnapshot {
            running,
            attempted: state.attempted,
            succeeded: state.succeeded,
            failed: state.failed,
            retried: state.retried,
            throttled: state.throttled,
            blocked: state.blocked,
            depth: ready + delayed,
            ready,
            delayed,
            rate_limiter,
        }
    }
}

#[tracing::instrument(level = "info", skip_all)]
async fn run_consumer(inner: Arc<QueueInner>) {
    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }
        let (next, deadline) = {
            let mut pending = inner.pending.lock().await;
            pending.promote_due(Instant::now());
            let next = pending.ready.pop_first().map(|(_, entry)| entry);
            (next, pending.next_deadline())
        };
        if let Some(entry) = next {
            inner.execute(entry).await;
            continue;
        }
        match deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = inner.wakeup.notified() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = inner.wakeup.notified() => {}
                }
            }
        }
    }
    tracing::info!("crm queue consumer received shutdown signal");
}

impl QueueInner {
    /// Sleeps cooperatively until the limiter admits a call. Returns false on shutdown.
    async fn admit(&self) -> bool {
        loop {
            let wait = {
                let mut limiter = self.limiter.lock().await;
                let now = Instant::now();
                if limiter.can_proceed(now) {
                    limiter.record_call(now);
                    return true;
                }
                limiter.wait_time(now).max(Duration::from_millis(10))
            };
            tracing::debug!(wait_ms = wait.as_millis() as u64, "crm rate limit reached; waiting");
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn execute(&self, mut entry: Entry) {
        let id = entry.op.id.clone();
        let kind = entry.op.kind();

        if let Err(e) = entry.op.operation.validate() {
            self.finish_failed(entry, e).await;
            return;
        }
        if !self.admit().await {
            return;
        }

        entry.op.attempt = entry.op.attempt.saturating_add(1);
        {
            let mut state = self.state.write().await;
            state.attempted = state.attempted.saturating_add(1);
        }
        let result = dispatch(self.api.as_ref(), &entry.op.operation).await;

        match result {
            Ok(value) => {
                self.limiter.lock().await.record_success();
                {
                    let mut state = self.state.write().await;
                    state.succeeded = state.succeeded.saturating_add(1);
                }
                tracing::debug!(operation_id = %id, kind = %kind, attempt = entry.op.attempt, "crm operation succeeded");
                if let Some(waiter) = entry.waiter.take() {
                    let _ = waiter.send(Ok(value));
                }
            }
            Err(e) => {
                self.record_remote_signal(&e).await;
                if e.is_retryable() && entry.op.attempt < entry.op.max_attempts {
                    let delay = backoff_delay(entry.op.attempt, self.settings.backoff_ceiling);
                    tracing::warn!(
                        operation_id = %id,
                        kind = %kind,
                        attempt = entry.op.attempt,
                        max_attempts = entry.op.max_attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "crm operation failed; scheduling retry"
                    );
                    {
                        let mut state = self.state.write().await;
                        state.retried = state.retried.saturating_add(1);
                    }
                    let mut pending = self.pending.lock().await;
                    pending.push_delayed(Instant::now() + delay, entry);
                } else {
                    self.finish_failed(entry, e).await;
                }
            }
        }
    }

    async fn record_remote_signal(&self, error: &CrmError) {
        let now = Instant::now();
        match error {
            CrmError::Throttled(_) => {
                let cooldown = self.limiter.lock().await.record_throttled(now);
                let mut state = self.state.write().await;
                state.throttled = state.throttled.saturating_add(1);
                tracing::warn!(cooldown_ms = cooldown.as_millis() as u64, "crm api throttled");
            }
            CrmError::Blocked(_) => {
                let cooldown = self.limiter.lock().await.record_blocked(now);
                let mut state = self.state.write().await;
                state.blocked = state.blocked.saturating_add(1);
                tracing::error!(cooldown_ms = cooldown.as_millis() as u64, "crm api blocked requests");
            }
            _ => {}
        }
    }

    async fn finish_failed(&self, mut entry: Entry, error: CrmError) {
        {
            let mut state = self.state.write().await;
            state.failed = state.failed.saturating_add(1);
        }
        let id: OperationId = entry.op.id.clone();
        tracing::error!(
            operation_id = %id,
            kind = %entry.op.kind(),
            attempts = entry.op.attempt,
            error = %error,
            "crm operation failed permanently"
        );
        if let Some(waiter) = entry.waiter.take() {
            let _ = waiter.send(Err(QueueError::Failed {
                operation_id: id.to_string(),
                attempts: entry.op.attempt,
                source: error,
            }));
        }
    }
}

fn backoff_delay(attempt: u32, ceiling: Duration) -> Duration {
    let exp = attempt.min(16);
    Duration::from_secs(1_u64 << exp).min(ceiling)
}
