//! Scheduling of catalog queries: cadences, the coordinating loop, history.

pub mod cadence;
pub mod control;
pub mod engine;
pub mod history;

// Re-export common types
pub use self::cadence::{Cadence, PlannedQuery, SchedulePlan};
pub use self::engine::Scheduler;
pub use self::history::{HistoryEntry, RunStatus};

/// Per-query scheduling state.
///
/// `Idle -> Waiting -> Running -> Idle`. A trigger arriving in any state
/// other than `Idle` is recorded as skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum QueryState {
    Idle,
    /// Triggered, waiting for an execution slot.
    Waiting,
    Running,
}

impl std::fmt::Display for QueryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryState::Idle => write!(f, "idle"),
            QueryState::Waiting => write!(f, "waiting"),
            QueryState::Running => write!(f, "running"),
        }
    }
}
