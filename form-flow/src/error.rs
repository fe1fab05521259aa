use thiserror::Error;

use crate::event::OwnerId;

/// Errors produced by the dialog engine and its collaborators
#[derive(Error, Debug)]
pub enum FormError {
    /// User input rejected; the current prompt is re-issued and the session is left untouched
    #[error("{0}")]
    Validation(String),

    #[error("No active form session for owner {0}")]
    NoActiveSession(OwnerId),

    #[error("Owner {0} already has an active form session")]
    Conflict(OwnerId),

    /// Broken schema graph. Indicates a deployment bug, never a user mistake.
    #[error("Schema integrity violation: {0}")]
    SchemaIntegrity(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("Batch commit stopped after {written} of {total} records: {reason}")]
    PartialCommit {
        written: usize,
        total: usize,
        reason: String,
    },

    #[error("Session for owner {0} was modified concurrently")]
    StaleSession(OwnerId),

    #[error("Unknown form schema: {0}")]
    UnknownSchema(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl FormError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }

    pub fn schema(reason: impl Into<String>) -> Self {
        Self::SchemaIntegrity(reason.into())
    }

    /// Whether a retry has a chance of succeeding
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable(_))
    }
}

impl From<sqlx::Error> for FormError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                Self::UpstreamUnavailable(err.to_string())
            }
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<std::io::Error> for FormError {
    fn from(err: std::io::Error) -> Self {
        Self::UpstreamUnavailable(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FormError>;
