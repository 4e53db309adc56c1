//! Short-TTL locks and a durable FIFO shared by every process pointed at the
//! same database.

use crate::db::{Database, to_millis};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rusqlite::{OptionalExtension, TransactionBehavior, params};
use std::time::Duration;
use tokio::sync::Notify;

#[async_trait]
pub trait Coordinator: Send + Sync {
    /// True when the lock was free (or expired) and is now held for `ttl`.
    async fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn release_lock(&self, key: &str) -> Result<()>;

    async fn push(&self, queue: &str, item: &str) -> Result<()>;

    /// Waits up to `timeout` for an item. `None` on timeout.
    async fn blocking_pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>>;
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS coord_locks (
  key TEXT PRIMARY KEY,
  expires_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS coord_queue (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  queue TEXT NOT NULL,
  payload TEXT NOT NULL,
  enqueued_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS coord_queue_idx ON coord_queue(queue, id);
"#;

// Pushes from other processes are only seen on this cadence.
const CROSS_PROCESS_POLL: Duration = Duration::from_millis(500);

pub struct SqliteCoordinator {
    db: Database,
    pushed: Notify,
}

impl SqliteCoordinator {
    pub async fn new(db: Database) -> Result<Self> {
        db.call(|conn| conn.execute_batch(SCHEMA)).await?;
        Ok(Self {
            db,
            pushed: Notify::new(),
        })
    }

    async fn try_pop(&self, queue: &str) -> Result<Option<String>> {
        let queue = queue.to_string();
        self.db
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let head: Option<(i64, String)> = tx
                    .query_row(
                        "SELECT id, payload FROM coord_queue WHERE queue = ?1 ORDER BY id ASC LIMIT 1",
                        params![queue],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                let Some((id, payload)) = head else {
                    return Ok(None);
                };
                tx.execute("DELETE FROM coord_queue WHERE id = ?1", params![id])?;
                tx.commit()?;
                Ok(Some(payload))
            })
            .await
    }

    pub async fn queue_len(&self, queue: &str) -> Result<u64> {
        let queue = queue.to_string();
        let count: i64 = self
            .db
            .call(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM coord_queue WHERE queue = ?1",
                    params![queue],
                    |row| row.get(0),
                )
            })
            .await?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl Coordinator for SqliteCoordinator {
    async fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<bool> {
        let key = key.to_string();
        let now = Utc::now();
        let ttl = ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::zero());
        let now_ms = to_millis(now);
        let expires_ms = to_millis(now + ttl);
        self.db
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                tx.execute(
                    "DELETE FROM coord_locks WHERE key = ?1 AND expires_at <= ?2",
                    params![key, now_ms],
                )?;
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO coord_locks (key, expires_at) VALUES (?1, ?2)",
                    params![key, expires_ms],
                )?;
                tx.commit()?;
                Ok(inserted == 1)
            })
            .await
    }

    async fn release_lock(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.db
            .call(move |conn| conn.execute("DELETE FROM coord_locks WHERE key = ?1", params![key]))
            .await?;
        Ok(())
    }

    async fn push(&self, queue: &str, item: &str) -> Result<()> {
        let queue = queue.to_string();
        let item = item.to_string();
        let now_ms = to_millis(Utc::now());
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO coord_queue (queue, payload, enqueued_at) VALUES (?1, ?2, ?3)",
                    params![queue, item, now_ms],
                )
            })
            .await?;
        self.pushed.notify_one();
        Ok(())
    }

    async fn blocking_pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(item) = self.try_pop(queue).await? {
                return Ok(Some(item));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = (deadline - now).min(CROSS_PROCESS_POLL);
            tokio::select! {
                _ = self.pushed.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}
