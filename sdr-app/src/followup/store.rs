//! Durable follow-up records and the conversation log read by reply gating.

use super::model::{FollowUpStatus, FollowUpTask, LastMessageTimes, MessageAuthor};
use crate::db::{Database, from_millis, to_millis};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{OptionalExtension, Row, TransactionBehavior, params};

#[derive(Debug, Clone, Default)]
pub struct TransitionDetails {
    pub error_reason: Option<String>,
    pub executed_at: Option<DateTime<Utc>>,
}

impl TransitionDetails {
    pub fn reason(reason: impl Into<String>) -> Self {
        Self {
            error_reason: Some(reason.into()),
            executed_at: None,
        }
    }

    pub fn executed(at: DateTime<Utc>) -> Self {
        Self {
            error_reason: None,
            executed_at: Some(at),
        }
    }
}

#[async_trait]
pub trait FollowUpStore: Send + Sync {
    /// Inserts `task` unless an active record for the same owner is scheduled
    /// within `tolerance` of it; in that case returns the existing record.
    async fn insert_unless_duplicate(
        &self,
        task: &FollowUpTask,
        tolerance: ChronoDuration,
    ) -> Result<Option<FollowUpTask>>;

    async fn get(&self, id: &str) -> Result<Option<FollowUpTask>>;

    async fn list_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<FollowUpTask>>;

    async fn list_active_for_target(&self, target_key: &str) -> Result<Vec<FollowUpTask>>;

    /// Compare-and-set on status. Applies only while the record is in `from`;
    /// returns whether the row changed.
    async fn transition(
        &self,
        id: &str,
        from: FollowUpStatus,
        to: FollowUpStatus,
        details: TransitionDetails,
    ) -> Result<bool>;

    /// Executed or failed records for `owner_key` last touched at or after `since`.
    async fn count_terminal_since(&self, owner_key: &str, since: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait ConversationLog: Send + Sync {
    async fn append(
        &self,
        target_key: &str,
        author: MessageAuthor,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn last_message_times(&self, target_key: &str) -> Result<LastMessageTimes>;
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS follow_ups (
  id TEXT PRIMARY KEY,
  target_key TEXT NOT NULL,
  owner_key TEXT NOT NULL,
  message TEXT NOT NULL,
  followup_type TEXT NOT NULL,
  scheduled_at INTEGER NOT NULL,
  status TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL,
  executed_at INTEGER,
  error_reason TEXT
);
CREATE INDEX IF NOT EXISTS follow_ups_due_idx ON follow_ups(status, scheduled_at);
CREATE INDEX IF NOT EXISTS follow_ups_owner_idx ON follow_ups(owner_key, status);
CREATE INDEX IF NOT EXISTS follow_ups_target_idx ON follow_ups(target_key, status);

CREATE TABLE IF NOT EXISTS conversation_messages (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  target_key TEXT NOT NULL,
  author TEXT NOT NULL,
  content TEXT NOT NULL,
  created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS conversation_messages_target_idx
  ON conversation_messages(target_key, created_at);
"#;

const COLUMNS: &str = "id, target_key, owner_key, message, followup_type, scheduled_at, status, created_at, updated_at, executed_at, error_reason";

#[derive(Clone)]
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    pub async fn new(db: Database) -> Result<Self> {
        db.call(|conn| conn.execute_batch(SCHEMA)).await?;
        Ok(Self { db })
    }
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<FollowUpTask> {
    let status_raw: String = row.get(6)?;
    let status = FollowUpStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            rusqlite::types::Type::Text,
            format!("unknown follow-up status {status_raw:?}").into(),
        )
    })?;
    Ok(FollowUpTask {
        id: row.get(0)?,
        target_key: row.get(1)?,
        owner_key: row.get(2)?,
        message: row.get(3)?,
        followup_type: row.get(4)?,
        scheduled_at: from_millis(row.get(5)?),
        status,
        created_at: from_millis(row.get(7)?),
        updated_at: from_millis(row.get(8)?),
        executed_at: row.get::<_, Option<i64>>(9)?.map(from_millis),
        error_reason: row.get(10)?,
    })
}

fn active_status_list() -> String {
    FollowUpStatus::ACTIVE
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl FollowUpStore for SqliteStore {
    async fn insert_unless_duplicate(
        &self,
        task: &FollowUpTask,
        tolerance: ChronoDuration,
    ) -> Result<Option<FollowUpTask>> {
        let task = task.clone();
        let scheduled = to_millis(task.scheduled_at);
        let tolerance_ms = tolerance.num_milliseconds().max(0);
        self.db
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let existing = tx
                    .query_row(
                        &format!(
                            "SELECT {COLUMNS} FROM follow_ups
                             WHERE owner_key = ?1 AND status IN ({})
                               AND scheduled_at BETWEEN ?2 AND ?3
                             ORDER BY scheduled_at ASC LIMIT 1",
                            active_status_list()
                        ),
                        params![
                            task.owner_key,
                            scheduled.saturating_sub(tolerance_ms),
                            scheduled.saturating_add(tolerance_ms)
                        ],
                        row_to_task,
                    )
                    .optional()?;
                if existing.is_some() {
                    return Ok(existing);
                }
                tx.execute(
                    &format!(
                        "INSERT INTO follow_ups ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                    ),
                    params![
                        task.id,
                        task.target_key,
                        task.owner_key,
                        task.message,
                        task.followup_type,
                        scheduled,
                        task.status.as_str(),
                        to_millis(task.created_at),
                        to_millis(task.updated_at),
                        task.executed_at.map(to_millis),
                        task.error_reason,
                    ],
                )?;
                tx.commit()?;
                Ok(None)
            })
            .await
    }

    async fn get(&self, id: &str) -> Result<Option<FollowUpTask>> {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    &format!("SELECT {COLUMNS} FROM follow_ups WHERE id = ?1"),
                    params![id],
                    row_to_task,
                )
                .optional()
            })
            .await
    }

    async fn list_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<FollowUpTask>> {
        let now_ms = to_millis(now);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {COLUMNS} FROM follow_ups
                     WHERE status = 'pending' AND scheduled_at <= ?1
                     ORDER BY scheduled_at ASC LIMIT ?2"
                ))?;
                let rows = stmt.query_map(params![now_ms, limit], row_to_task)?;
                rows.collect()
            })
            .await
    }

    async fn list_active_for_target(&self, target_key: &str) -> Result<Vec<FollowUpTask>> {
        let target_key = target_key.to_string();
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {COLUMNS} FROM follow_ups
                     WHERE target_key = ?1 AND status IN ({})
                     ORDER BY scheduled_at ASC",
                    active_status_list()
                ))?;
                let rows = stmt.query_map(params![target_key], row_to_task)?;
                rows.collect()
            })
            .await
    }

    async fn transition(
        &self,
        id: &str,
        from: FollowUpStatus,
        to: FollowUpStatus,
        details: TransitionDetails,
    ) -> Result<bool> {
        if !from.can_transition_to(to) {
            return Err(anyhow!("illegal follow-up transition {from} -> {to}"));
        }
        let id = id.to_string();
        let now_ms = to_millis(Utc::now());
        let changed = self
            .db
            .call(move |conn| {
                conn.execute(
                    "UPDATE follow_ups
                     SET status = ?1,
                         updated_at = ?2,
                         error_reason = COALESCE(?3, error_reason),
                         executed_at = COALESCE(?4, executed_at)
                     WHERE id = ?5 AND status = ?6",
                    params![
                        to.as_str(),
                        now_ms,
                        details.error_reason,
                        details.executed_at.map(to_millis),
                        id,
                        from.as_str(),
                    ],
                )
            })
            .await?;
        Ok(changed == 1)
    }

    async fn count_terminal_since(&self, owner_key: &str, since: DateTime<Utc>) -> Result<u64> {
        let owner_key = owner_key.to_string();
        let since_ms = to_millis(since);
        let count: i64 = self
            .db
            .call(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM follow_ups
                     WHERE owner_key = ?1 AND status IN ('executed', 'failed') AND updated_at >= ?2",
                    params![owner_key, since_ms],
                    |row| row.get(0),
                )
            })
            .await?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl ConversationLog for SqliteStore {
    async fn append(
        &self,
        target_key: &str,
        author: MessageAuthor,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let target_key = target_key.to_string();
        let content = content.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO conversation_messages (target_key, author, content, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![target_key, author.as_str(), content, to_millis(at)],
                )
            })
            .await?;
        Ok(())
    }

    async fn last_message_times(&self, target_key: &str) -> Result<LastMessageTimes> {
        let target_key = target_key.to_string();
        let (user, agent): (Option<i64>, Option<i64>) = self
            .db
            .call(move |conn| {
                conn.query_row(
                    "SELECT
                       MAX(CASE WHEN author = 'user' THEN created_at END),
                       MAX(CASE WHEN author = 'agent' THEN created_at END)
                     FROM conversation_messages WHERE target_key = ?1",
                    params![target_key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
            })
            .await?;
        Ok(LastMessageTimes {
            last_user_at: user.map(from_millis),
            last_agent_at: agent.map(from_millis),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, owner: &str, scheduled_at: DateTime<Utc>) -> FollowUpTask {
        let now = Utc::now();
        FollowUpTask {
            id: id.to_string(),
            target_key: "5581999998888".to_string(),
            owner_key: owner.to_string(),
            message: "Oi!".to_string(),
            followup_type: "reminder".to_string(),
            scheduled_at,
            status: FollowUpStatus::Pending,
            created_at: now,
            updated_at: now,
            executed_at: None,
            error_reason: None,
        }
    }

    async fn store() -> SqliteStore {
        SqliteStore::new(Database::open_in_memory().expect("open db"))
            .await
            .expect("create store")
    }

    #[tokio::test]
    async fn duplicate_within_tolerance_is_rejected() {
        let store = store().await;
        let at = Utc::now() + ChronoDuration::hours(4);
        let tolerance = ChronoDuration::minutes(30);

        let first = store
            .insert_unless_duplicate(&task("a", "lead-1", at), tolerance)
            .await
            .expect("insert first");
        assert!(first.is_none());

        let dup = store
            .insert_unless_duplicate(&task("b", "lead-1", at + ChronoDuration::minutes(10)), tolerance)
            .await
            .expect("insert second")
            .expect("duplicate detected");
        assert_eq!(dup.id, "a");

        let far = store
            .insert_unless_duplicate(&task("c", "lead-1", at + ChronoDuration::hours(20)), tolerance)
            .await
            .expect("insert far");
        assert!(far.is_none());
        assert!(store.get("b").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let store = store().await;
        let past = Utc::now() - ChronoDuration::minutes(1);
        store
            .insert_unless_duplicate(&task("a", "lead-1", past), ChronoDuration::zero())
            .await
            .expect("insert");

        assert_eq!(store.list_due(Utc::now(), 10).await.expect("due").len(), 1);
        assert!(
            store
                .transition("a", FollowUpStatus::Pending, FollowUpStatus::Queued, TransitionDetails::default())
                .await
                .expect("queue")
        );
        assert!(
            !store
                .transition("a", FollowUpStatus::Pending, FollowUpStatus::Queued, TransitionDetails::default())
                .await
                .expect("second queue attempt")
        );
        assert!(store.list_due(Utc::now(), 10).await.expect("due").is_empty());

        let executed_at = Utc::now();
        assert!(
            store
                .transition("a", FollowUpStatus::Queued, FollowUpStatus::Executed, TransitionDetails::executed(executed_at))
                .await
                .expect("execute")
        );
        assert!(
            !store
                .transition("a", FollowUpStatus::Queued, FollowUpStatus::Cancelled, TransitionDetails::reason("late"))
                .await
                .expect("cancel after execute")
        );
        let record = store.get("a").await.expect("get").expect("exists");
        assert_eq!(record.status, FollowUpStatus::Executed);
        assert_eq!(
            record.executed_at.map(|t| t.timestamp_millis()),
            Some(executed_at.timestamp_millis())
        );
        assert!(record.error_reason.is_none());

        assert!(
            store
                .transition("a", FollowUpStatus::Executed, FollowUpStatus::Pending, TransitionDetails::default())
                .await
                .is_err()
        );
        assert_eq!(
            store
                .count_terminal_since("lead-1", Utc::now() - ChronoDuration::hours(1))
                .await
                .expect("count"),
            1
        );
    }

    #[tokio::test]
    async fn conversation_log_reports_last_author_times() {
        let store = store().await;
        let t0 = Utc::now() - ChronoDuration::hours(1);
        store
            .append("5581", MessageAuthor::Agent, "olá", t0)
            .await
            .expect("append agent");
        store
            .append("5581", MessageAuthor::User, "oi", t0 + ChronoDuration::minutes(30))
            .await
            .expect("append user");
        let times = store.last_message_times("5581").await.expect("times");
        assert!(times.user_replied_last());
        let empty = store.last_message_times("other").await.expect("times");
        assert_eq!(empty, LastMessageTimes::default());
    }
}
