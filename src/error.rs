//! Error kinds surfaced by the harness.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SentryError {
    /// Bad catalog or configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("duplicate query id '{0}' in catalog")]
    DuplicateId(String),

    #[error("runs belong to '{baseline}' and '{current}', expected '{expected}'")]
    MismatchedRuns {
        expected: String,
        baseline: String,
        current: String,
    },

    #[error("query '{0}' not found in catalog")]
    QueryNotFound(String),

    #[error("no stored results for query '{0}'")]
    NoResults(String),

    /// The target database rejected or failed the query.
    #[error("query '{query_id}' failed: {message}")]
    Execution { query_id: String, message: String },

    #[error("query '{query_id}' exceeded its {deadline:?} deadline")]
    Timeout { query_id: String, deadline: Duration },

    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StoreError),
}

impl SentryError {
    /// Process exit code for this error on the command surface.
    pub fn exit_code(&self) -> u8 {
        match self {
            SentryError::Config(_)
            | SentryError::DuplicateId(_)
            | SentryError::MismatchedRuns { .. }
            | SentryError::QueryNotFound(_) => 2,
            SentryError::NoResults(_)
            | SentryError::Execution { .. }
            | SentryError::Timeout { .. }
            | SentryError::Storage(_) => 1,
        }
    }
}
