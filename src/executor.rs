//! Executes one diagnostic query against the target with a deadline.

use crate::catalog::DiagnosticQuery;
use crate::error::SentryError;
use crate::target::{Row, TargetDatabase};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Tabular result of one execution. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    run_id: Uuid,
    query_id: String,
    timestamp: DateTime<Utc>,
    duration_ms: u64,
    rows: Vec<Row>,
}

impl RunResult {
    pub fn new(
        query_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        duration: Duration,
        rows: Vec<Row>,
    ) -> Self {
        Self::with_id(Uuid::new_v4(), query_id, timestamp, duration.as_millis() as u64, rows)
    }

    pub(crate) fn with_id(
        run_id: Uuid,
        query_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        duration_ms: u64,
        rows: Vec<Row>,
    ) -> Self {
        Self {
            run_id,
            query_id: query_id.into(),
            timestamp: truncate_micros(timestamp),
            duration_ms,
            rows,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    /// When the run started (UTC, microsecond precision).
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }
}

fn truncate_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(ts.timestamp_micros()).unwrap_or(ts)
}

/// Sends queries to the target, at most `max_in_flight` at a time.
#[derive(Clone)]
pub struct Executor {
    target: Arc<dyn TargetDatabase>,
    slots: Arc<Semaphore>,
    max_in_flight: usize,
    last_timestamp_us: Arc<AtomicI64>,
}

impl Executor {
    pub fn new(target: Arc<dyn TargetDatabase>, max_in_flight: usize) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            target,
            slots: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            last_timestamp_us: Arc::new(AtomicI64::new(i64::MIN)),
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn target(&self) -> &dyn TargetDatabase {
        self.target.as_ref()
    }

    /// Wait for a free execution slot.
    pub async fn acquire(&self) -> Result<ExecutionSlot<'_>, SentryError> {
        let permit = self
            .slots
            .acquire()
            .await
            .map_err(|e| SentryError::Config(format!("executor shut down: {}", e)))?;
        Ok(ExecutionSlot {
            executor: self,
            _permit: permit,
        })
    }

    /// Acquire a slot and run the query in it.
    pub async fn execute(
        &self,
        query: &DiagnosticQuery,
        deadline: Duration,
    ) -> Result<RunResult, SentryError> {
        self.acquire().await?.run(query, deadline).await
    }

    /// Wall-clock start time, strictly increasing across all runs of this executor.
    fn next_timestamp(&self) -> DateTime<Utc> {
        let now_us = Utc::now().timestamp_micros();
        let prev = self
            .last_timestamp_us
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now_us.max(last.saturating_add(1)))
            })
            .unwrap_or(now_us);
        let issued = now_us.max(prev.saturating_add(1));
        DateTime::from_timestamp_micros(issued).unwrap_or_else(Utc::now)
    }
}

/// A held concurrency slot. Released on drop.
pub struct ExecutionSlot<'a> {
    executor: &'a Executor,
    _permit: SemaphorePermit<'a>,
}

impl ExecutionSlot<'_> {
    pub async fn run(
        &self,
        query: &DiagnosticQuery,
        deadline: Duration,
    ) -> Result<RunResult, SentryError> {
        let timestamp = self.executor.next_timestamp();
        let start = Instant::now();
        debug!(query=%query.id, target=%self.executor.target.describe(), ?deadline, "Executing query");

        let outcome = tokio::time::timeout(deadline, self.executor.target.fetch(&query.sql)).await;
        let elapsed = start.elapsed();

        match outcome {
            Err(_) => {
                warn!(query=%query.id, ?deadline, "Query timed out");
                Err(SentryError::Timeout {
                    query_id: query.id.clone(),
                    deadline,
                })
            }
            Ok(Err(e)) => {
                error!(query=%query.id, "Query failed: {}", e);
                Err(SentryError::Execution {
                    query_id: query.id.clone(),
                    message: e.to_string(),
                })
            }
            Ok(Ok(rows)) => {
                info!(query=%query.id, rows=rows.len(), elapsed_ms=elapsed.as_millis() as u64, "Query finished");
                Ok(RunResult::new(query.id.clone(), timestamp, elapsed, rows))
            }
        }
    }
}
