//! Governed access to the Kommo CRM.
//!
//! Every remote call is a typed `CrmOperation` that flows through one
//! `OperationQueue`, which applies sliding-window rate limiting, cooldowns on
//! throttle/block responses, and bounded exponential-backoff retries.

mod client;
mod error;
mod queue;
mod rate_limiter;
mod types;

pub use client::{CrmApi, KommoClient, KommoSettings, dispatch, normalize_stage_name};
pub use error::{CrmError, QueueError, Result};
pub use queue::{OperationQueue, QueueSettings, QueueStatusSnapshot};
pub use rate_limiter::{RateLimitPolicy, RateLimiterSnapshot, SlidingWindowLimiter};
pub use types::{CrmOperation, LeadId, OperationId, OperationKind, QueuedOperation};
