//! Creation and cancellation of follow-up records.

use super::business_hours::{BusinessHours, DelayCategory};
use super::model::{FollowUpStatus, FollowUpTask};
use super::store::{FollowUpStore, TransitionDetails};
use super::worker::SEQUENCE_FINAL;
use crate::config::SequenceStepConfig;
use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sdr_channels::{is_plausible_phone, normalize_phone};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const CANCEL_RETRIES: usize = 3;
const MAX_DELAY_MINUTES: u32 = 60 * 24 * 90;

fn default_followup_type() -> String {
    "custom".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleRequest {
    pub target_key: String,
    pub owner_key: String,
    pub message: String,
    pub delay_minutes: u32,
    #[serde(default = "default_followup_type")]
    pub followup_type: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScheduleOutcome {
    Scheduled { task: FollowUpTask },
    Duplicate { existing_id: String },
}

pub struct FollowUpService {
    store: Arc<dyn FollowUpStore>,
    business_hours: BusinessHours,
    country_prefix: String,
    dedup_tolerance: ChronoDuration,
    sequence: Vec<SequenceStepConfig>,
}

impl FollowUpService {
    pub fn new(
        store: Arc<dyn FollowUpStore>,
        business_hours: BusinessHours,
        country_prefix: impl Into<String>,
        dedup_tolerance: ChronoDuration,
        sequence: Vec<SequenceStepConfig>,
    ) -> Self {
        Self {
            store,
            business_hours,
            country_prefix: country_prefix.into(),
            dedup_tolerance,
            sequence,
        }
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn schedule(&self, request: ScheduleRequest, now: DateTime<Utc>) -> Result<ScheduleOutcome> {
        let target_key = normalize_phone(&request.target_key, &self.country_prefix)
            .filter(|phone| is_plausible_phone(phone))
            .ok_or_else(|| anyhow!("invalid target phone: {}", request.target_key))?;
        let owner_key = request.owner_key.trim();
        if owner_key.is_empty() {
            return Err(anyhow!("owner_key must not be empty"));
        }
        let message = request.message.trim();
        if message.is_empty() {
            return Err(anyhow!("message must not be empty"));
        }
        if request.delay_minutes > MAX_DELAY_MINUTES {
            return Err(anyhow!(
                "delay_minutes must be at most {MAX_DELAY_MINUTES}, got {}",
                request.delay_minutes
            ));
        }

        let delay = ChronoDuration::minutes(i64::from(request.delay_minutes));
        let scheduled_at = self
            .business_hours
            .adjust(now + delay, DelayCategory::from_delay(delay));
        let task = FollowUpTask {
            id: uuid::Uuid::new_v4().to_string(),
            target_key,
            owner_key: owner_key.to_string(),
            message: message.to_string(),
            followup_type: request.followup_type,
            scheduled_at,
            status: FollowUpStatus::Pending,
            created_at: now,
            updated_at: now,
            executed_at: None,
            error_reason: None,
        };

        if let Some(existing) = self
            .store
            .insert_unless_duplicate(&task, self.dedup_tolerance)
            .await?
        {
            tracing::info!(
                owner_key = %task.owner_key,
                existing_id = %existing.id,
                scheduled_at = %task.scheduled_at,
                "followup rejected as duplicate"
            );
            return Ok(ScheduleOutcome::Duplicate {
                existing_id: existing.id,
            });
        }
        tracing::info!(
            followup_id = %task.id,
            owner_key = %task.owner_key,
            followup_type = %task.followup_type,
            scheduled_at = %task.scheduled_at,
            "followup scheduled"
        );
        Ok(ScheduleOutcome::Scheduled { task })
    }

    /// Schedules every configured sequence step relative to `now`. The last
    /// step is typed as the final attempt.
    pub async fn schedule_sequence(
        &self,
        owner_key: &str,
        target_key: &str,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleOutcome>> {
        let mut outcomes = Vec::with_capacity(self.sequence.len());
        let last = self.sequence.len().saturating_sub(1);
        for (idx, step) in self.sequence.iter().enumerate() {
            let followup_type = if idx == last {
                SEQUENCE_FINAL.to_string()
            } else {
                format!("sequence_step_{}", idx + 1)
            };
            let delay_minutes = u32::try_from(step.delay_hours.saturating_mul(60))
                .unwrap_or(MAX_DELAY_MINUTES);
            let request = ScheduleRequest {
                target_key: target_key.to_string(),
                owner_key: owner_key.to_string(),
                message: render_template(&step.template, name),
                delay_minutes,
                followup_type,
            };
            outcomes.push(self.schedule(request, now).await?);
        }
        Ok(outcomes)
    }

    pub async fn get(&self, id: &str) -> Result<Option<FollowUpTask>> {
        self.store.get(id).await
    }

    /// Moves a non-terminal record to `cancelled`. Returns false when the
    /// record is missing or already terminal.
    pub async fn cancel(&self, id: &str, reason: &str) -> Result<bool> {
        for _ in 0..CANCEL_RETRIES {
            let Some(task) = self.store.get(id).await? else {
                return Ok(false);
            };
            if task.status.is_terminal() {
                return Ok(false);
            }
            if self
                .store
                .transition(
                    id,
                    task.status,
                    FollowUpStatus::Cancelled,
                    TransitionDetails::reason(reason),
                )
                .await?
            {
                tracing::info!(followup_id = %id, reason = %reason, "followup cancelled");
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn cancel_pending_for_target(&self, target_key: &str, reason: &str) -> Result<usize> {
        let target_key = normalize_phone(target_key, &self.country_prefix)
            .unwrap_or_else(|| target_key.to_string());
        let mut cancelled = 0;
        for task in self.store.list_active_for_target(&target_key).await? {
            if self.cancel(&task.id, reason).await? {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }
}

fn render_template(template: &str, name: &str) -> String {
    template.replace("{name}", name.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BusinessHoursConfig, FollowUpConfig};
    use crate::followup::testing::{Fixture, TARGET};
    use chrono::TimeZone;

    fn service(fx: &Fixture) -> FollowUpService {
        let business_hours =
            BusinessHours::from_config(&BusinessHoursConfig::default()).expect("business hours");
        FollowUpService::new(
            fx.store.clone(),
            business_hours,
            "55",
            ChronoDuration::minutes(30),
            FollowUpConfig::default().sequence,
        )
    }

    fn request(delay_minutes: u32) -> ScheduleRequest {
        ScheduleRequest {
            target_key: "(81) 99999-8888".to_string(),
            owner_key: "1234".to_string(),
            message: "Oi! Conseguiu ver a proposta?".to_string(),
            delay_minutes,
            followup_type: default_followup_type(),
        }
    }

    // Wednesday 14:00 in UTC-3.
    fn wednesday_afternoon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 14, 17, 0, 0).single().expect("valid time")
    }

    fn scheduled(outcome: ScheduleOutcome) -> FollowUpTask {
        match outcome {
            ScheduleOutcome::Scheduled { task } => task,
            ScheduleOutcome::Duplicate { existing_id } => {
                panic!("unexpected duplicate of {existing_id}")
            }
        }
    }

    #[tokio::test]
    async fn schedule_normalizes_target_and_stores_pending() {
        let fx = Fixture::new().await;
        let svc = service(&fx);
        let now = wednesday_afternoon();

        let task = scheduled(svc.schedule(request(60), now).await.expect("schedule"));
        assert_eq!(task.target_key, TARGET);
        assert_eq!(task.scheduled_at, now + ChronoDuration::minutes(60));
        let stored = fx.get(&task.id).await;
        assert_eq!(stored.status, FollowUpStatus::Pending);
    }

    #[tokio::test]
    async fn second_request_within_tolerance_is_a_duplicate() {
        let fx = Fixture::new().await;
        let svc = service(&fx);
        let now = wednesday_afternoon();

        let first = scheduled(svc.schedule(request(60), now).await.expect("first"));
        let second = svc.schedule(request(75), now).await.expect("second");
        match second {
            ScheduleOutcome::Duplicate { existing_id } => assert_eq!(existing_id, first.id),
            ScheduleOutcome::Scheduled { .. } => panic!("expected duplicate"),
        }
        let active = fx
            .store
            .list_active_for_target(TARGET)
            .await
            .expect("list");
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn after_hours_request_moves_to_next_opening() {
        let fx = Fixture::new().await;
        let svc = service(&fx);
        // 17:30 local; +2h lands at 19:30, after closing.
        let now = Utc.with_ymd_and_hms(2026, 10, 14, 20, 30, 0).single().expect("valid time");

        let task = scheduled(svc.schedule(request(120), now).await.expect("schedule"));
        let expected = Utc.with_ymd_and_hms(2026, 10, 15, 11, 0, 0).single().expect("valid time");
        assert_eq!(task.scheduled_at, expected);
    }

    #[tokio::test]
    async fn invalid_phone_is_rejected() {
        let fx = Fixture::new().await;
        let svc = service(&fx);
        let mut bad = request(60);
        bad.target_key = "1111111".to_string();
        assert!(svc.schedule(bad, wednesday_afternoon()).await.is_err());
    }

    #[tokio::test]
    async fn sequence_marks_last_step_final_and_renders_name() {
        let fx = Fixture::new().await;
        let svc = service(&fx);
        let outcomes = svc
            .schedule_sequence("1234", TARGET, "Maria", wednesday_afternoon())
            .await
            .expect("sequence");
        let tasks: Vec<_> = outcomes.into_iter().map(scheduled).collect();
        assert_eq!(tasks.len(), FollowUpConfig::default().sequence.len());
        assert_eq!(tasks[0].followup_type, "sequence_step_1");
        assert_eq!(tasks.last().map(|t| t.followup_type.as_str()), Some(SEQUENCE_FINAL));
        assert!(tasks.iter().all(|t| !t.message.contains("{name}")));
        assert!(tasks.iter().any(|t| t.message.contains("Maria")));
    }

    #[tokio::test]
    async fn cancel_only_applies_to_active_records() {
        let fx = Fixture::new().await;
        let svc = service(&fx);
        let task = scheduled(
            svc.schedule(request(60), wednesday_afternoon())
                .await
                .expect("schedule"),
        );

        assert!(svc.cancel(&task.id, "manual").await.expect("cancel"));
        let stored = fx.get(&task.id).await;
        assert_eq!(stored.status, FollowUpStatus::Cancelled);
        assert_eq!(stored.error_reason.as_deref(), Some("manual"));
        assert!(!svc.cancel(&task.id, "again").await.expect("cancel terminal"));
        assert!(!svc.cancel("missing", "manual").await.expect("cancel missing"));
    }

    #[tokio::test]
    async fn cancel_for_target_covers_pending_and_queued() {
        let fx = Fixture::new().await;
        let svc = service(&fx);
        let now = wednesday_afternoon();
        let first = scheduled(svc.schedule(request(60), now).await.expect("first"));
        let second = scheduled(svc.schedule(request(240), now).await.expect("second"));
        fx.force(&second.id, &[FollowUpStatus::Queued]).await;

        let cancelled = svc
            .cancel_pending_for_target(TARGET, "user_replied")
            .await
            .expect("cancel all");
        assert_eq!(cancelled, 2);
        assert_eq!(fx.get(&first.id).await.status, FollowUpStatus::Cancelled);
        assert_eq!(fx.get(&second.id).await.status, FollowUpStatus::Cancelled);
    }
}
