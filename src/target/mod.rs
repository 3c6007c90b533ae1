//! Target database collaborator -- the engine whose catalogs are queried.
//!
//! The harness never owns connection pooling for the target; implementations
//! lease a connection per call and release it on every exit path.

use std::collections::BTreeMap;
use thiserror::Error;

pub mod sqlite;

pub use self::sqlite::SqliteTarget;

/// One result row: column name to value.
pub type Row = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("connection unavailable: {0}")]
    Connection(String),
    #[error("{0}")]
    Query(String),
}

/// Trait for all target engines
#[async_trait::async_trait]
pub trait TargetDatabase: Send + Sync {
    /// Run one statement and collect its rows.
    /// Dropping the returned future must cancel the statement.
    async fn fetch(&self, sql: &str) -> Result<Vec<Row>, TargetError>;

    /// Human readable description for logs, e.g. a file path or server name.
    fn describe(&self) -> String;
}
