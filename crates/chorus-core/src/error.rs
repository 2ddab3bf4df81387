//! Error taxonomy shared by every core component.

use std::time::Duration;

use thiserror::Error;

use crate::cascade::Tier;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// The signature failed recently. Reject without resubmitting.
    #[error("request is blacked out for another {}ms", .retry_after.as_millis())]
    Blackout { retry_after: Duration },

    /// An identical request is already in flight; await its handle instead.
    #[error("identical request already in flight")]
    Duplicate,

    /// The job never produced a terminal result within the bound.
    #[error("job {job_id} timed out waiting for a result")]
    Timeout { job_id: String },

    /// The worker ran the job and reported an error.
    #[error("job {job_id} failed: {message}")]
    Failed { job_id: String, message: String },

    /// A config layer was malformed or contradicted another layer of the same tier.
    #[error("config conflict at {tier} tier: {reason}")]
    ConfigConflict { tier: Tier, reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("provider error: {0}")]
    Provider(String),

    /// A channel or queue was closed underneath the caller.
    #[error("closed: {0}")]
    Closed(String),
}

impl CoreError {
    /// Whether resubmitting the same request may succeed.
    ///
    /// A timeout means the worker never reported back, so a new job is worth
    /// trying. An explicit failure means it ran and said no.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Timeout { .. } | CoreError::Storage(_) | CoreError::Closed(_)
        )
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        CoreError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}
