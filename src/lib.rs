//! dmvsentry -- scheduled SQL Server DMV diagnostics with result archival.
//!
//! This crate wraps a fixed catalog of read-only diagnostic queries, runs them
//! against a target database on demand or on a cadence, archives every result,
//! and compares runs to flag regressions.

pub mod catalog;
pub mod config;
pub mod error;
pub mod executor;
pub mod report;
pub mod scheduler;
pub mod storage;
pub mod target;

use crate::catalog::QueryCatalog;
use crate::config::{Config, TargetKind};
use crate::error::SentryError;
use crate::executor::{Executor, RunResult};
use crate::report::{Regression, ReportComparator};
use crate::scheduler::{SchedulePlan, Scheduler};
use crate::storage::ResultStore;
use crate::target::{SqliteTarget, TargetDatabase};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// The configured catalog: the file named in `[catalog]`, or the built-in one.
pub fn load_catalog(config: &Config) -> Result<QueryCatalog, SentryError> {
    match &config.catalog.path {
        Some(path) => QueryCatalog::load(path),
        None => QueryCatalog::builtin(),
    }
}

/// Connect the configured target database.
pub fn open_target(config: &Config) -> Result<Arc<dyn TargetDatabase>, SentryError> {
    match config.target.kind {
        TargetKind::Sqlite => {
            let path = config.target.path.as_ref().ok_or_else(|| {
                SentryError::Config("target.path is required to execute queries".into())
            })?;
            let target = SqliteTarget::open(path, config.target.max_connections)
                .map_err(|e| SentryError::Config(e.to_string()))?;
            Ok(Arc::new(target))
        }
    }
}

pub fn open_store(config: &Config) -> Result<ResultStore, SentryError> {
    info!(path=%config.storage.path.display(), "Opening result archive");
    Ok(ResultStore::open(&config.storage.path)?)
}

/// Ad hoc execution of one catalog query. The result is archived.
pub async fn run_once(
    config: &Config,
    query_id: &str,
    timeout: Option<Duration>,
) -> Result<RunResult, SentryError> {
    let catalog = load_catalog(config)?;
    let query = catalog.get(query_id)?;
    let executor = Executor::new(open_target(config)?, config.scheduler.max_in_flight);
    let store = open_store(config)?;

    let deadline = timeout.unwrap_or_else(|| config.scheduler.default_timeout());
    let result = executor.execute(query, deadline).await?;
    store.append_with_retry(&result)?;
    Ok(result)
}

/// Build a scheduler from configuration without starting it.
pub fn build_scheduler(config: &Config) -> Result<Scheduler, SentryError> {
    let catalog = Arc::new(load_catalog(config)?);
    let plan = SchedulePlan::from_config(&config.scheduler, &catalog)?;
    if plan.is_empty() {
        return Err(SentryError::Config("no queries configured under [[scheduler.query]]".into()));
    }
    let executor = Executor::new(open_target(config)?, config.scheduler.max_in_flight);
    let store = open_store(config)?;
    Ok(Scheduler::new(catalog, plan, executor, store, config.scheduler.tick()))
}

/// Run the scheduler in the foreground until Ctrl-C or `schedule stop`.
pub async fn start_scheduler(config: &Config) -> Result<(), SentryError> {
    let scheduler = build_scheduler(config)?;

    let on_signal = scheduler.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            on_signal.stop();
        }
    });

    scheduler.run().await
}

/// Ask a running scheduler (possibly in another process) to stop.
pub fn request_stop(config: &Config) -> Result<(), SentryError> {
    let store = open_store(config)?;
    scheduler::control::request_stop(store.pool())?;
    Ok(())
}

/// Outcome of comparing the latest run against an earlier one.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Report {
    pub query_id: String,
    pub current_at: DateTime<Utc>,
    /// `None` when only one run is stored.
    pub baseline_at: Option<DateTime<Utc>>,
    pub threshold: f64,
    pub regressions: Vec<Regression>,
}

impl Report {
    pub fn flagged(&self) -> impl Iterator<Item = &Regression> {
        self.regressions.iter().filter(|r| r.exceeds_threshold)
    }
}

/// Compare the latest run of `query_id` with the run `since` runs before it.
/// Falls back to the oldest stored run when fewer are available.
pub fn build_report(
    catalog: &QueryCatalog,
    store: &ResultStore,
    comparator: ReportComparator,
    query_id: &str,
    since: usize,
) -> Result<Report, SentryError> {
    let query = catalog.get(query_id)?;
    let runs = store.recent(query_id, since.max(1).saturating_add(1))?;

    let current = runs
        .first()
        .ok_or_else(|| SentryError::NoResults(query_id.to_string()))?;
    let (baseline_at, regressions) = match runs.last().filter(|_| runs.len() > 1) {
        Some(baseline) => (
            Some(baseline.timestamp()),
            comparator.compare(query, baseline, current)?.collect(),
        ),
        None => (None, Vec::new()),
    };

    Ok(Report {
        query_id: query_id.to_string(),
        current_at: current.timestamp(),
        baseline_at,
        threshold: comparator.threshold(),
        regressions,
    })
}
