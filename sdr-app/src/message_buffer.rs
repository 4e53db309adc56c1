//! Per-conversation coalescing of rapid-fire inbound messages.
//!
//! The first fragment for a key opens a window of `idle_timeout`; everything
//! that arrives for the key inside the window joins the same batch, and the
//! batch is handed to the `BatchHandler` once when the window closes.
//!
//! One flush task owns a key from its first fragment until the key is idle
//! again. Fragments that arrive while the handler runs form a follow-on batch
//! that the same task flushes after the handler returns, so a key never has
//! two handlers running at once.

use crate::config::BufferConfig;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub content: String,
    pub message_id: Option<String>,
    pub sender_name: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl Fragment {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            message_id: None,
            sender_name: None,
            received_at: Utc::now(),
        }
    }
}

/// Fragments flushed together for one key, in arrival order.
#[derive(Debug, Clone)]
pub struct Batch {
    pub key: String,
    pub fragments: Vec<Fragment>,
}

impl Batch {
    pub fn joined(&self) -> String {
        self.fragments
            .iter()
            .map(|f| f.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn last_message_id(&self) -> Option<&str> {
        self.fragments
            .iter()
            .rev()
            .find_map(|f| f.message_id.as_deref())
    }

    pub fn sender_name(&self) -> Option<&str> {
        self.fragments
            .iter()
            .rev()
            .find_map(|f| f.sender_name.as_deref())
    }
}

#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle(&self, batch: Batch) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct BufferSettings {
    pub idle_timeout: Duration,
    pub max_fragments: usize,
}

impl BufferSettings {
    pub fn from_config(cfg: &BufferConfig) -> Self {
        let idle_timeout = if cfg.enabled {
            Duration::from_secs_f64(cfg.idle_timeout_seconds.max(0.0))
        } else {
            Duration::ZERO
        };
        Self {
            idle_timeout,
            max_fragments: cfg.max_fragments.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// First fragment of a batch; a flush is now scheduled.
    Started,
    Appended,
    /// Batch is full or the buffer is shutting down.
    Dropped,
}

#[derive(Debug, Clone, Default)]
struct BufferState {
    accepted: u64,
    flushed_batches: u64,
    dropped_fragments: u64,
    handler_failures: u64,
    in_flight: usize,
    last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BufferStatusSnapshot {
    pub idle_timeout_ms: u64,
    pub max_fragments: usize,
    pub active_keys: usize,
    pub pending_fragments: usize,
    pub accepted: u64,
    pub flushed_batches: u64,
    pub dropped_fragments: u64,
    pub handler_failures: u64,
    pub in_flight: usize,
    pub last_error: Option<String>,
}

/// Open batch for a key. Stays in the map while its flush task is alive.
struct PendingBatch {
    fragments: Vec<Fragment>,
    opened_at: Instant,
}

impl PendingBatch {
    fn new(fragment: Fragment) -> Self {
        Self {
            fragments: vec![fragment],
            opened_at: Instant::now(),
        }
    }
}

struct BufferInner {
    settings: BufferSettings,
    handler: Arc<dyn BatchHandler>,
    pending: DashMap<String, PendingBatch>,
    state: RwLock<BufferState>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct MessageBuffer {
    inner: Arc<BufferInner>,
}

impl MessageBuffer {
    pub fn new(settings: BufferSettings, handler: Arc<dyn BatchHandler>) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                settings,
                handler,
                pending: DashMap::new(),
                state: RwLock::new(BufferState::default()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub async fn add_fragment(&self, key: &str, fragment: Fragment) -> AddOutcome {
        if self.inner.shutdown.is_cancelled() {
            tracing::warn!(key = %key, "message buffer is shut down; dropping fragment");
            self.record_drop().await;
            return AddOutcome::Dropped;
        }

        // The entry guard is the per-key lock around check-then-create.
        let outcome = match self.inner.pending.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let batch = entry.get_mut();
                if batch.fragments.len() >= self.inner.settings.max_fragments {
                    AddOutcome::Dropped
                } else {
                    // Empty means the handler is running; this opens the follow-on batch.
                    if batch.fragments.is_empty() {
                        batch.opened_at = Instant::now();
                    }
                    batch.fragments.push(fragment);
                    AddOutcome::Appended
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(PendingBatch::new(fragment));
                AddOutcome::Started
            }
        };

        match outcome {
            AddOutcome::Dropped => {
                tracing::warn!(
                    key = %key,
                    max_fragments = self.inner.settings.max_fragments,
                    "message buffer full for key; dropping fragment"
                );
                self.record_drop().await;
            }
            AddOutcome::Started => {
                {
                    let mut state = self.inner.state.write().await;
                    state.accepted = state.accepted.saturating_add(1);
                    state.in_flight = state.in_flight.saturating_add(1);
                }
                let inner = self.inner.clone();
                let key = key.to_string();
                tokio::spawn(async move {
                    inner.own_key(key).await;
                });
            }
            AddOutcome::Appended => {
                let mut state = self.inner.state.write().await;
                state.accepted = state.accepted.saturating_add(1);
            }
        }
        outcome
    }

    async fn record_drop(&self) {
        let mut state = self.inner.state.write().await;
        state.dropped_fragments = state.dropped_fragments.saturating_add(1);
    }

    /// Flushes every open batch immediately and waits for the handlers.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let drained = tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, async {
            loop {
                if self.inner.state.read().await.in_flight == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!("timed out waiting for message buffer flushes");
        }
    }

    pub async fn status_snapshot(&self) -> BufferStatusSnapshot {
        let (active_keys, pending_fragments) = self
            .inner
            .pending
            .iter()
            .fold((0, 0), |(keys, fragments), entry| {
                (keys + 1, fragments + entry.value().fragments.len())
            });
        let state = self.inner.state.read().await.clone();
        BufferStatusSnapshot {
            idle_timeout_ms: u64::try_from(self.inner.settings.idle_timeout.as_millis())
                .unwrap_or(u64::MAX),
            max_fragments: self.inner.settings.max_fragments,
            active_keys,
            pending_fragments,
            accepted: state.accepted,
            flushed_batches: state.flushed_batches,
            dropped_fragments: state.dropped_fragments,
            handler_failures: state.handler_failures,
            in_flight: state.in_flight,
            last_error: state.last_error,
        }
    }
}

impl BufferInner {
    /// Flushes the key's batches one after another until the key goes idle.
    async fn own_key(&self, key: String) {
        loop {
            let Some(deadline) = self
                .pending
                .get(&key)
                .map(|batch| batch.opened_at + self.settings.idle_timeout)
            else {
                break;
            };
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = self.shutdown.cancelled() => {}
            }

            let fragments = self
                .pending
                .get_mut(&key)
                .map(|mut batch| std::mem::take(&mut batch.fragments))
                .unwrap_or_default();
            if !fragments.is_empty() {
                self.flush(&key, fragments).await;
            }

            // Release the key unless a follow-on batch arrived meanwhile.
            if self
                .pending
                .remove_if(&key, |_, batch| batch.fragments.is_empty())
                .is_some()
            {
                break;
            }
        }
        let mut state = self.state.write().await;
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    #[tracing::instrument(level = "debug", skip(self, fragments))]
    async fn flush(&self, key: &str, fragments: Vec<Fragment>) {
        let count = fragments.len();
        let result = self
            .handler
            .handle(Batch {
                key: key.to_string(),
                fragments,
            })
            .await;
        let mut state = self.state.write().await;
        state.flushed_batches = state.flushed_batches.saturating_add(1);
        match result {
            Ok(()) => {
                tracing::debug!(key = %key, fragments = count, "message batch flushed");
            }
            Err(e) => {
                tracing::warn!(error = %e, key = %key, fragments = count, "message batch handler failed");
                state.handler_failures = state.handler_failures.saturating_add(1);
                state.last_error = Some(e.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingHandler {
        batches: Mutex<Vec<(String, String)>>,
        fail_next: Mutex<bool>,
    }

    impl RecordingHandler {
        fn batches(&self) -> Vec<(String, String)> {
            self.batches.lock().expect("batches lock").clone()
        }
    }

    #[async_trait]
    impl BatchHandler for RecordingHandler {
        async fn handle(&self, batch: Batch) -> Result<()> {
            self.batches
                .lock()
                .expect("batches lock")
                .push((batch.key.clone(), batch.joined()));
            let mut fail = self.fail_next.lock().expect("fail lock");
            if *fail {
                *fail = false;
                return Err(anyhow!("downstream unavailable"));
            }
            Ok(())
        }
    }

    fn buffer(handler: Arc<RecordingHandler>, max_fragments: usize) -> MessageBuffer {
        MessageBuffer::new(
            BufferSettings {
                idle_timeout: Duration::from_secs(10),
                max_fragments,
            },
            handler,
        )
    }

    async fn advance(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn burst_is_flushed_once_in_arrival_order() {
        let handler = Arc::new(RecordingHandler::default());
        let buffer = buffer(handler.clone(), 10);

        assert_eq!(buffer.add_fragment("k", Fragment::text("oi")).await, AddOutcome::Started);
        advance(2).await;
        assert_eq!(
            buffer.add_fragment("k", Fragment::text("tudo bem?")).await,
            AddOutcome::Appended
        );
        advance(3).await;
        buffer.add_fragment("k", Fragment::text("quero saber do plano")).await;
        assert!(handler.batches().is_empty());

        let snapshot = buffer.status_snapshot().await;
        assert_eq!(snapshot.active_keys, 1);
        assert_eq!(snapshot.pending_fragments, 3);
        assert_eq!(snapshot.in_flight, 1);

        advance(6).await;
        assert_eq!(
            handler.batches(),
            vec![("k".to_string(), "oi\ntudo bem?\nquero saber do plano".to_string())]
        );
        let snapshot = buffer.status_snapshot().await;
        assert_eq!(snapshot.flushed_batches, 1);
        assert_eq!(snapshot.active_keys, 0);
        assert_eq!(snapshot.in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn window_is_measured_from_first_fragment() {
        let handler = Arc::new(RecordingHandler::default());
        let buffer = buffer(handler.clone(), 10);

        buffer.add_fragment("k", Fragment::text("a")).await;
        advance(9).await;
        buffer.add_fragment("k", Fragment::text("b")).await;
        advance(2).await;
        assert_eq!(handler.batches(), vec![("k".to_string(), "a\nb".to_string())]);

        assert_eq!(buffer.add_fragment("k", Fragment::text("c")).await, AddOutcome::Started);
        advance(11).await;
        assert_eq!(handler.batches().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fragments_beyond_bound_are_dropped() {
        let handler = Arc::new(RecordingHandler::default());
        let buffer = buffer(handler.clone(), 2);

        buffer.add_fragment("k", Fragment::text("1")).await;
        buffer.add_fragment("k", Fragment::text("2")).await;
        assert_eq!(buffer.add_fragment("k", Fragment::text("3")).await, AddOutcome::Dropped);
        advance(11).await;

        assert_eq!(handler.batches(), vec![("k".to_string(), "1\n2".to_string())]);
        let snapshot = buffer.status_snapshot().await;
        assert_eq!(snapshot.accepted, 2);
        assert_eq!(snapshot.dropped_fragments, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_failure_clears_state_for_next_cycle() {
        let handler = Arc::new(RecordingHandler::default());
        *handler.fail_next.lock().expect("fail lock") = true;
        let buffer = buffer(handler.clone(), 10);

        buffer.add_fragment("k", Fragment::text("first")).await;
        advance(11).await;
        assert_eq!(buffer.status_snapshot().await.handler_failures, 1);

        buffer.add_fragment("k", Fragment::text("second")).await;
        advance(11).await;
        assert_eq!(
            handler.batches(),
            vec![
                ("k".to_string(), "first".to_string()),
                ("k".to_string(), "second".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_buffered_independently() {
        let handler = Arc::new(RecordingHandler::default());
        let buffer = buffer(handler.clone(), 10);

        buffer.add_fragment("a", Fragment::text("a1")).await;
        advance(5).await;
        buffer.add_fragment("b", Fragment::text("b1")).await;
        buffer.add_fragment("a", Fragment::text("a2")).await;
        advance(6).await;
        assert_eq!(handler.batches(), vec![("a".to_string(), "a1\na2".to_string())]);

        advance(5).await;
        assert_eq!(handler.batches().len(), 2);
        assert_eq!(handler.batches()[1], ("b".to_string(), "b1".to_string()));
    }

    struct SlowHandler {
        batches: Mutex<Vec<String>>,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    #[async_trait]
    impl BatchHandler for SlowHandler {
        async fn handle(&self, batch: Batch) -> Result<()> {
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(running, Ordering::SeqCst);
            self.batches.lock().expect("batches lock").push(batch.joined());
            tokio::time::sleep(Duration::from_secs(30)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fragments_during_slow_handler_wait_for_it() {
        let handler = Arc::new(SlowHandler {
            batches: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        });
        let buffer = MessageBuffer::new(
            BufferSettings {
                idle_timeout: Duration::from_secs(10),
                max_fragments: 10,
            },
            handler.clone(),
        );

        buffer.add_fragment("k", Fragment::text("a")).await;
        advance(11).await;
        assert_eq!(handler.running.load(Ordering::SeqCst), 1);

        // Handler for "a" is still running; "b" joins the follow-on batch.
        assert_eq!(buffer.add_fragment("k", Fragment::text("b")).await, AddOutcome::Appended);
        advance(11).await;
        assert_eq!(*handler.batches.lock().expect("batches lock"), vec!["a".to_string()]);

        advance(60).await;
        assert_eq!(
            *handler.batches.lock().expect("batches lock"),
            vec!["a".to_string(), "b".to_string()]
        );
        assert_eq!(handler.max_running.load(Ordering::SeqCst), 1);
        let snapshot = buffer.status_snapshot().await;
        assert_eq!(snapshot.flushed_batches, 2);
        assert_eq!(snapshot.active_keys, 0);
        assert_eq!(snapshot.in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_open_batches() {
        let handler = Arc::new(RecordingHandler::default());
        let buffer = buffer(handler.clone(), 10);

        buffer.add_fragment("k", Fragment::text("pending")).await;
        buffer.shutdown().await;
        assert_eq!(handler.batches(), vec![("k".to_string(), "pending".to_string())]);
        assert_eq!(
            buffer.add_fragment("k", Fragment::text("late")).await,
            AddOutcome::Dropped
        );
    }

    #[test]
    fn batch_helpers_use_latest_metadata() {
        let mut first = Fragment::text("a");
        first.message_id = Some("m1".to_string());
        first.sender_name = Some("Ana".to_string());
        let mut second = Fragment::text("b");
        second.message_id = Some("m2".to_string());
        let batch = Batch {
            key: "k".to_string(),
            fragments: vec![first, second],
        };
        assert_eq!(batch.joined(), "a\nb");
        assert_eq!(batch.last_message_id(), Some("m2"));
        assert_eq!(batch.sender_name(), Some("Ana"));
    }
}
