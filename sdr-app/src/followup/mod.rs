//! Durable, business-hours-aware follow-up reminders.
//!
//! The service writes `pending` records, the scheduler moves due ones onto the
//! shared work queue, and the worker sends them and records the outcome.

mod business_hours;
mod coordination;
mod model;
mod scheduler;
mod service;
mod store;
mod worker;

pub use business_hours::{BusinessHours, DelayCategory};
pub use coordination::{Coordinator, SqliteCoordinator};
pub use model::{FollowUpStatus, FollowUpTask, MessageAuthor};
pub use scheduler::{
    FollowUpScheduler, REASON_USER_REPLIED, SchedulerSettings, SchedulerStatusSnapshot,
};
pub use service::{FollowUpService, ScheduleOutcome, ScheduleRequest};
pub use store::{ConversationLog, FollowUpStore, SqliteStore};
pub use worker::{FollowUpWorker, SEQUENCE_FINAL, WorkerSettings, WorkerStatusSnapshot};

#[cfg(test)]
pub(crate) mod testing {
    use super::model::{FollowUpStatus, FollowUpTask};
    use super::store::{FollowUpStore, TransitionDetails};
    use super::{SqliteCoordinator, SqliteStore};
    use crate::db::Database;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use std::sync::Arc;

    pub const TARGET: &str = "5581999998888";

    pub fn pending_task(id: &str, owner: &str, scheduled_at: DateTime<Utc>) -> FollowUpTask {
        let now = Utc::now();
        FollowUpTask {
            id: id.to_string(),
            target_key: TARGET.to_string(),
            owner_key: owner.to_string(),
            message: format!("lembrete {id}"),
            followup_type: "reminder".to_string(),
            scheduled_at,
            status: FollowUpStatus::Pending,
            created_at: now,
            updated_at: now,
            executed_at: None,
            error_reason: None,
        }
    }

    pub struct Fixture {
        pub store: Arc<SqliteStore>,
        pub coordinator: Arc<SqliteCoordinator>,
    }

    impl Fixture {
        pub async fn new() -> Self {
            let db = Database::open_in_memory().expect("open in-memory db");
            let store = SqliteStore::new(db.clone()).await.expect("store");
            let coordinator = SqliteCoordinator::new(db).await.expect("coordinator");
            Self {
                store: Arc::new(store),
                coordinator: Arc::new(coordinator),
            }
        }

        pub async fn insert(&self, task: FollowUpTask) {
            let duplicate = self
                .store
                .insert_unless_duplicate(&task, ChronoDuration::zero())
                .await
                .expect("insert task");
            assert!(duplicate.is_none(), "unexpected duplicate for {}", task.id);
        }

        pub async fn get(&self, id: &str) -> FollowUpTask {
            self.store
                .get(id)
                .await
                .expect("get task")
                .expect("task exists")
        }

        /// Walks a record through `path` with compare-and-set transitions.
        pub async fn force(&self, id: &str, path: &[FollowUpStatus]) {
            let mut current = self.get(id).await.status;
            for next in path {
                let applied = self
                    .store
                    .transition(id, current, *next, TransitionDetails::default())
                    .await
                    .expect("transition");
                assert!(applied, "{id}: {current} -> {next} not applied");
                current = *next;
            }
        }
    }
}
