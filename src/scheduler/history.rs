//! Execution history tracking for scheduled runs.

use crate::storage::{Pool, StoreError};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::params;

/// Outcome of one trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum RunStatus {
    Succeeded,
    Failed,
    /// Trigger dropped because the previous run was still active.
    Skipped,
}

impl RunStatus {
    fn as_str(self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Skipped => "skipped",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "succeeded" => Some(RunStatus::Succeeded),
            "failed" => Some(RunStatus::Failed),
            "skipped" => Some(RunStatus::Skipped),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record of a scheduled trigger.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HistoryEntry {
    pub query_id: String,
    pub status: RunStatus,
    pub detail: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

pub fn record(pool: &Pool, entry: &HistoryEntry) -> Result<(), StoreError> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO schedule_history (query_id, status, detail, started_at, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            entry.query_id,
            entry.status.as_str(),
            entry.detail,
            entry.started_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            entry
                .finished_at
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Micros, true)),
        ],
    )?;
    Ok(())
}

/// Most recent history for a query, newest first.
pub fn recent(pool: &Pool, query_id: &str, limit: usize) -> Result<Vec<HistoryEntry>, StoreError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT query_id, status, detail, started_at, finished_at FROM schedule_history
         WHERE query_id = ?1 ORDER BY id DESC LIMIT ?2",
    )?;

    let rows = stmt.query_map(params![query_id, i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, Option<String>>(4)?,
        ))
    })?;

    let mut entries = Vec::new();
    for r in rows {
        let (query_id, status, detail, started_at, finished_at) = r?;
        let status = RunStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("history status '{}'", status)))?;
        entries.push(HistoryEntry {
            query_id,
            status,
            detail,
            started_at: parse_time(&started_at)?,
            finished_at: finished_at.as_deref().map(parse_time).transpose()?,
        });
    }
    Ok(entries)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("history time '{}': {}", s, e)))
}
