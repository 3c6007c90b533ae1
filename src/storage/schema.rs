//! Database schema and migrations.

use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS run_results (
            id INTEGER PRIMARY KEY,
            run_id TEXT NOT NULL UNIQUE,
            query_id TEXT NOT NULL,
            timestamp_us INTEGER NOT NULL,
            timestamp TEXT NOT NULL,
            duration_ms INTEGER NOT NULL,
            row_count INTEGER NOT NULL,
            rows_json TEXT NOT NULL,
            UNIQUE (query_id, timestamp_us)
        );

        CREATE TABLE IF NOT EXISTS schedule_history (
            id INTEGER PRIMARY KEY,
            query_id TEXT NOT NULL,
            status TEXT NOT NULL,
            detail TEXT,
            started_at TEXT NOT NULL,
            finished_at TEXT
        );

        CREATE TABLE IF NOT EXISTS scheduler_control (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            stop_requested INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_run_results_query_ts ON run_results(query_id, timestamp_us DESC);
        CREATE INDEX IF NOT EXISTS idx_schedule_history_query ON schedule_history(query_id);

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);
        INSERT OR IGNORE INTO scheduler_control (id, stop_requested) VALUES (1, 0);",
    )?;

    // Append-only archive: reject updates and deletes at the engine level too.
    conn.execute_batch(
        "CREATE TRIGGER IF NOT EXISTS run_results_no_update
            BEFORE UPDATE ON run_results
            BEGIN SELECT RAISE(ABORT, 'run_results is append-only'); END;
        CREATE TRIGGER IF NOT EXISTS run_results_no_delete
            BEFORE DELETE ON run_results
            BEGIN SELECT RAISE(ABORT, 'run_results is append-only'); END;",
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        // Verify tables exist by querying them
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM run_results", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);

        let stop: i64 = conn
            .query_row("SELECT stop_requested FROM scheduler_control WHERE id = 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(stop, 0);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error
    }

    #[test]
    fn test_run_results_reject_delete() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        conn.execute(
            "INSERT INTO run_results (run_id, query_id, timestamp_us, timestamp, duration_ms, row_count, rows_json)
             VALUES ('r1', 'top-io', 1, '1970-01-01T00:00:00.000001Z', 5, 0, '[]')",
            [],
        )
        .unwrap();
        assert!(conn.execute("DELETE FROM run_results", []).is_err());
        assert!(conn.execute("UPDATE run_results SET duration_ms = 0", []).is_err());
    }
}
