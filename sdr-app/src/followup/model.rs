use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpStatus {
    Pending,
    Queued,
    Executed,
    Failed,
    Cancelled,
}

impl FollowUpStatus {
    pub const ACTIVE: [FollowUpStatus; 2] = [FollowUpStatus::Pending, FollowUpStatus::Queued];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Executed => "executed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "queued" => Some(Self::Queued),
            "executed" => Some(Self::Executed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Executed | Self::Failed | Self::Cancelled)
    }

    /// pending -> queued -> executed|failed, and pending|queued -> cancelled.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Queued)
                | (Self::Queued, Self::Executed)
                | (Self::Queued, Self::Failed)
                | (Self::Pending, Self::Cancelled)
                | (Self::Queued, Self::Cancelled)
        )
    }
}

impl fmt::Display for FollowUpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUpTask {
    pub id: String,
    /// Phone number the reminder is sent to.
    pub target_key: String,
    /// Lead the reminder belongs to.
    pub owner_key: String,
    pub message: String,
    pub followup_type: String,
    pub scheduled_at: DateTime<Utc>,
    pub status: FollowUpStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub error_reason: Option<String>,
}

/// Descriptor published by the scheduler onto the shared work queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub task_type: String,
    pub followup_id: String,
    pub owner_key: String,
    pub target_key: String,
    pub followup_type: String,
    pub enqueued_at: DateTime<Utc>,
}

pub const EXECUTE_FOLLOWUP: &str = "execute_followup";

impl WorkItem {
    pub fn for_task(task: &FollowUpTask, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            task_type: EXECUTE_FOLLOWUP.to_string(),
            followup_id: task.id.clone(),
            owner_key: task.owner_key.clone(),
            target_key: task.target_key.clone(),
            followup_type: task.followup_type.clone(),
            enqueued_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageAuthor {
    User,
    Agent,
}

impl MessageAuthor {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LastMessageTimes {
    pub last_user_at: Option<DateTime<Utc>>,
    pub last_agent_at: Option<DateTime<Utc>>,
}

impl LastMessageTimes {
    /// The user spoke after the agent's last message. False until both have spoken.
    pub fn user_replied_last(&self) -> bool {
        match (self.last_user_at, self.last_agent_at) {
            (Some(user), Some(agent)) => user > agent,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_are_monotonic() {
        use FollowUpStatus::*;
        assert!(Pending.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Executed));
        assert!(Queued.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Queued.can_transition_to(Cancelled));

        assert!(!Queued.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Executed));
        for terminal in [Executed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Pending, Queued, Executed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn reply_detection_compares_last_timestamps() {
        let t0 = Utc::now();
        let later = t0 + chrono::Duration::minutes(5);
        assert!(
            LastMessageTimes {
                last_user_at: Some(later),
                last_agent_at: Some(t0),
            }
            .user_replied_last()
        );
        assert!(
            !LastMessageTimes {
                last_user_at: Some(t0),
                last_agent_at: Some(later),
            }
            .user_replied_last()
        );
        assert!(!LastMessageTimes::default().user_replied_last());
        assert!(
            !LastMessageTimes {
                last_user_at: Some(t0),
                last_agent_at: None,
            }
            .user_replied_last()
        );
    }
}
