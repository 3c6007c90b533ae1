//! Append-only archive of run results.

use super::{open_pool, Pool, StoreError};
use crate::error::SentryError;
use crate::executor::RunResult;
use crate::target::Row;
use chrono::{DateTime, SecondsFormat};
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use tracing::{debug, warn};
use uuid::Uuid;

/// Persists each RunResult keyed by (query id, timestamp).
/// Exposes no update or delete.
#[derive(Clone)]
pub struct ResultStore {
    pool: Pool,
}

impl ResultStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::from_pool(open_pool(path)?))
    }

    pub fn from_pool(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Append a run. Its timestamp must be later than the last stored run
    /// for the same query id.
    pub fn append(&self, result: &RunResult) -> Result<(), StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        let ts_us = result.timestamp().timestamp_micros();
        let last: Option<i64> = tx
            .query_row(
                "SELECT MAX(timestamp_us) FROM run_results WHERE query_id = ?1",
                params![result.query_id()],
                |row| row.get(0),
            )
            .optional()?
            .flatten();

        if let Some(last) = last.filter(|&last| last >= ts_us) {
            return Err(StoreError::OutOfOrder {
                query_id: result.query_id().to_string(),
                last: format_micros(last),
                attempted: format_micros(ts_us),
            });
        }

        let rows_json = serde_json::to_string(result.rows())?;
        tx.execute(
            "INSERT INTO run_results (run_id, query_id, timestamp_us, timestamp, duration_ms, row_count, rows_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                result.run_id().to_string(),
                result.query_id(),
                ts_us,
                format_micros(ts_us),
                result.duration().as_millis() as i64,
                result.rows().len() as i64,
                rows_json,
            ],
        )?;
        tx.commit()?;

        debug!(query=%result.query_id(), run=%result.run_id(), "Stored run result");
        Ok(())
    }

    /// Append, retrying once before surfacing the error.
    /// An ordering conflict is returned at once; retrying cannot fix it.
    pub fn append_with_retry(&self, result: &RunResult) -> Result<(), StoreError> {
        retry_once(result.query_id(), || self.append(result))
    }

    /// The `limit` most recent runs for `query_id`, newest first.
    pub fn recent(&self, query_id: &str, limit: usize) -> Result<Vec<RunResult>, SentryError> {
        let conn = self.pool.get().map_err(StoreError::from)?;
        let mut stmt = conn
            .prepare(
                "SELECT run_id, query_id, timestamp_us, duration_ms, rows_json FROM run_results
                 WHERE query_id = ?1
                 ORDER BY timestamp_us DESC
                 LIMIT ?2",
            )
            .map_err(StoreError::from)?;

        let rows = stmt
            .query_map(params![query_id, i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(StoreError::from)?;

        let mut results = Vec::new();
        for r in rows {
            let (run_id, query_id, ts_us, duration_ms, rows_json) = r.map_err(StoreError::from)?;
            results.push(decode(run_id, query_id, ts_us, duration_ms, &rows_json)?);
        }

        if results.is_empty() && limit > 0 {
            return Err(SentryError::NoResults(query_id.to_string()));
        }
        Ok(results)
    }

    /// Number of stored runs for `query_id`.
    pub fn count(&self, query_id: &str) -> Result<u64, StoreError> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM run_results WHERE query_id = ?1",
            params![query_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

fn retry_once<T>(
    query_id: &str,
    mut attempt: impl FnMut() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    match attempt() {
        Err(first) if !first.is_out_of_order() => {
            warn!(query=%query_id, "Failed to store run result, retrying: {}", first);
            attempt()
        }
        outcome => outcome,
    }
}

fn decode(
    run_id: String,
    query_id: String,
    ts_us: i64,
    duration_ms: i64,
    rows_json: &str,
) -> Result<RunResult, StoreError> {
    let run_id = Uuid::parse_str(&run_id).map_err(|e| StoreError::Corrupt(format!("{}: {}", run_id, e)))?;
    let timestamp = DateTime::from_timestamp_micros(ts_us)
        .ok_or_else(|| StoreError::Corrupt(format!("{}: timestamp {} out of range", run_id, ts_us)))?;
    let rows: Vec<Row> = serde_json::from_str(rows_json)?;
    Ok(RunResult::with_id(run_id, query_id, timestamp, duration_ms.max(0) as u64, rows))
}

fn format_micros(ts_us: i64) -> String {
    DateTime::from_timestamp_micros(ts_us)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Micros, true))
        .unwrap_or_else(|| ts_us.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use std::time::Duration;

    fn store() -> (tempfile::TempDir, ResultStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::open(&dir.path().join("results.db")).unwrap();
        (dir, store)
    }

    fn run(query_id: &str, offset_secs: i64, avg_io: i64) -> RunResult {
        let ts = Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).unwrap() + ChronoDuration::seconds(offset_secs);
        let mut row = Row::new();
        row.insert("query_hash".into(), serde_json::json!("0x01"));
        row.insert("Avg IO".into(), serde_json::json!(avg_io));
        RunResult::new(query_id, ts, Duration::from_millis(250), vec![row])
    }

    #[test]
    fn test_append_and_read_back() {
        let (_dir, store) = store();
        let original = run("top-io", 0, 100);
        store.append(&original).unwrap();

        let loaded = store.recent("top-io", 5).unwrap();
        assert_eq!(loaded, vec![original]);
    }

    #[test]
    fn test_recent_is_newest_first_and_limited() {
        let (_dir, store) = store();
        for i in 0..5 {
            store.append(&run("top-io", i * 60, 100 + i)).unwrap();
        }
        store.append(&run("top-cpu", 30, 7)).unwrap();

        let recent = store.recent("top-io", 3).unwrap();
        assert_eq!(recent.len(), 3);
        assert!(recent.windows(2).all(|w| w[0].timestamp() >= w[1].timestamp()));
        assert_eq!(recent[0].rows()[0]["Avg IO"], serde_json::json!(104));
        assert_eq!(store.count("top-io").unwrap(), 5);
    }

    #[test]
    fn test_unknown_query_has_no_results() {
        let (_dir, store) = store();
        let err = store.recent("top-io", 1).unwrap_err();
        assert!(matches!(err, SentryError::NoResults(id) if id == "top-io"));
    }

    #[test]
    fn test_out_of_order_append_rejected() {
        let (_dir, store) = store();
        store.append(&run("top-io", 60, 1)).unwrap();
        let err = store.append(&run("top-io", 0, 2)).unwrap_err();
        assert!(matches!(err, StoreError::OutOfOrder { .. }));
        let same = store.append(&run("top-io", 60, 3)).unwrap_err();
        assert!(matches!(same, StoreError::OutOfOrder { .. }));
        // Other query ids keep their own ordering.
        store.append(&run("top-cpu", 0, 4)).unwrap();
        assert_eq!(store.count("top-io").unwrap(), 1);
    }

    #[test]
    fn test_retry_recovers_from_transient_failure() {
        let (_dir, store) = store();
        let result = run("top-io", 0, 5);
        let mut attempts = 0;

        retry_once("top-io", || -> Result<(), StoreError> {
            attempts += 1;
            if attempts == 1 {
                // A statement the archive rejects, standing in for a busy database.
                let conn = store.pool().get()?;
                conn.execute("INSERT INTO missing_table VALUES (1)", [])?;
            }
            store.append(&result)
        })
        .unwrap();

        assert_eq!(attempts, 2);
        assert_eq!(store.count("top-io").unwrap(), 1);
        assert_eq!(store.recent("top-io", 1).unwrap(), vec![result]);
    }

    #[test]
    fn test_retry_gives_up_after_second_failure() {
        let mut attempts = 0;
        let err = retry_once("top-io", || -> Result<(), StoreError> {
            attempts += 1;
            Err(StoreError::Corrupt("disk".into()))
        })
        .unwrap_err();
        assert_eq!(attempts, 2);
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[test]
    fn test_out_of_order_is_not_retried() {
        let (_dir, store) = store();
        store.append(&run("top-io", 60, 1)).unwrap();
        let stale = run("top-io", 0, 2);

        let mut attempts = 0;
        let err = retry_once("top-io", || {
            attempts += 1;
            store.append(&stale)
        })
        .unwrap_err();
        assert_eq!(attempts, 1);
        assert!(err.is_out_of_order());
        assert!(store.append_with_retry(&stale).unwrap_err().is_out_of_order());
        assert_eq!(store.count("top-io").unwrap(), 1);
    }

    #[test]
    fn test_results_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("results.db");
        ResultStore::open(&path).unwrap().append(&run("top-io", 0, 9)).unwrap();

        let reopened = ResultStore::open(&path).unwrap();
        assert_eq!(reopened.count("top-io").unwrap(), 1);
    }
}
