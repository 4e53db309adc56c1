use thiserror::Error;

pub type Result<T> = std::result::Result<T, CrmError>;

/// Classified failure of a single remote CRM call.
#[derive(Debug, Clone, Error)]
pub enum CrmError {
    /// Network failure, timeout or 5xx. Retried with backoff.
    #[error("transient remote error: {0}")]
    Transient(String),

    /// 429 from the remote API. Cooldown, then retry.
    #[error("throttled by remote api: {0}")]
    Throttled(String),

    /// 403 from the remote API. Longer cooldown, then retry.
    #[error("blocked by remote api: {0}")]
    Blocked(String),

    /// Malformed input or a request the remote will never accept.
    #[error("permanent error: {0}")]
    Permanent(String),

    #[error("unexpected response format: {0}")]
    ResponseFormat(String),
}

impl CrmError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::Throttled(_) | Self::Blocked(_)
        )
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let detail = format!("status={status} body={body}");
        match status.as_u16() {
            429 => Self::Throttled(detail),
            403 => Self::Blocked(detail),
            408 => Self::Transient(detail),
            s if s >= 500 => Self::Transient(detail),
            _ => Self::Permanent(detail),
        }
    }
}

impl From<reqwest::Error> for CrmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return Self::ResponseFormat(e.to_string());
        }
        if e.is_builder() {
            return Self::Permanent(e.to_string());
        }
        Self::Transient(e.to_string())
    }
}

impl From<serde_json::Error> for CrmError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}

/// Failure surfaced to a caller waiting on a queued operation.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("operation {operation_id} failed after {attempts} attempt(s): {source}")]
    Failed {
        operation_id: String,
        attempts: u32,
        #[source]
        source: CrmError,
    },

    #[error("timed out waiting for operation {0}")]
    Timeout(String),

    #[error("operation queue is closed")]
    Closed,
}
