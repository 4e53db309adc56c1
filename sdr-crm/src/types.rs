use crate::error::{CrmError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type LeadId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    CreateLead,
    UpdateLead,
    UpdateStage,
    FetchByPhone,
    FetchById,
    AddNote,
    Upsert,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateLead => "create_lead",
            Self::UpdateLead => "update_lead",
            Self::UpdateStage => "update_stage",
            Self::FetchByPhone => "fetch_by_phone",
            Self::FetchById => "fetch_by_id",
            Self::AddNote => "add_note",
            Self::Upsert => "upsert",
        }
    }

    /// Writes first, reads second, notes last.
    pub fn default_priority(self) -> u8 {
        match self {
            Self::CreateLead | Self::UpdateLead | Self::UpdateStage | Self::Upsert => 1,
            Self::FetchByPhone | Self::FetchById => 2,
            Self::AddNote => 3,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One remote CRM side effect, with its kind-specific payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CrmOperation {
    CreateLead {
        name: String,
        phone: String,
        #[serde(default)]
        fields: serde_json::Value,
    },
    UpdateLead {
        lead_id: LeadId,
        fields: serde_json::Value,
    },
    UpdateStage {
        lead_id: LeadId,
        stage: String,
    },
    FetchByPhone {
        phone: String,
    },
    FetchById {
        lead_id: LeadId,
    },
    AddNote {
        lead_id: LeadId,
        text: String,
    },
    Upsert {
        phone: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        fields: serde_json::Value,
    },
}

impl CrmOperation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::CreateLead { .. } => OperationKind::CreateLead,
            Self::UpdateLead { .. } => OperationKind::UpdateLead,
            Self::UpdateStage { .. } => OperationKind::UpdateStage,
            Self::FetchByPhone { .. } => OperationKind::FetchByPhone,
            Self::FetchById { .. } => OperationKind::FetchById,
            Self::AddNote { .. } => OperationKind::AddNote,
            Self::Upsert { .. } => OperationKind::Upsert,
        }
    }

    /// Rejects payloads the remote would never accept, so they fail without retry.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::CreateLead { name, phone, fields } => {
                require_non_empty("name", name)?;
                require_non_empty("phone", phone)?;
                require_object_or_null("fields", fields)
            }
            Self::UpdateLead { lead_id, fields } => {
                require_lead_id(*lead_id)?;
                if !fields.is_object() {
                    return Err(CrmError::Permanent(
                        "update_lead fields must be an object".to_string(),
                    ));
                }
                Ok(())
            }
            Self::UpdateStage { lead_id, stage } => {
                require_lead_id(*lead_id)?;
                require_non_empty("stage", stage)
            }
            Self::FetchByPhone { phone } => require_non_empty("phone", phone),
            Self::FetchById { lead_id } => require_lead_id(*lead_id),
            Self::AddNote { lead_id, text } => {
                require_lead_id(*lead_id)?;
                require_non_empty("text", text)
            }
            Self::Upsert { phone, fields, .. } => {
                require_non_empty("phone", phone)?;
                require_object_or_null("fields", fields)
            }
        }
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(CrmError::Permanent(format!("{field} must not be empty")));
    }
    Ok(())
}

fn require_lead_id(lead_id: LeadId) -> Result<()> {
    if lead_id == 0 {
        return Err(CrmError::Permanent("lead_id must be > 0".to_string()));
    }
    Ok(())
}

fn require_object_or_null(field: &str, value: &serde_json::Value) -> Result<()> {
    if value.is_null() || value.is_object() {
        return Ok(());
    }
    Err(CrmError::Permanent(format!("{field} must be an object")))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct QueuedOperation {
    pub id: OperationId,
    pub operation: CrmOperation,
    pub priority: u8,
    pub attempt: u32,
    pub max_attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedOperation {
    pub fn new(operation: CrmOperation, priority: u8, max_attempts: u32) -> Self {
        Self {
            id: OperationId::generate(),
            operation,
            priority,
            attempt: 0,
            max_attempts: max_attempts.max(1),
            enqueued_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.operation.kind()
    }
}
