use super::{Row, TargetDatabase, TargetError};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, InterruptHandle, OpenFlags};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Read-only SQLite target.
/// Useful for statistics snapshots exported from another engine, and for tests.
pub struct SqliteTarget {
    path: PathBuf,
    pool: R2D2Pool<SqliteConnectionManager>,
}

impl SqliteTarget {
    pub fn open(path: &Path, max_connections: u32) -> Result<Self, TargetError> {
        let manager = SqliteConnectionManager::file(path)
            .with_flags(OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX)
            .with_init(|c| c.execute_batch("PRAGMA query_only = ON; PRAGMA busy_timeout = 5000;"));

        let pool = R2D2Pool::builder()
            .max_size(max_connections.max(1))
            .build(manager)
            .map_err(|e| TargetError::Connection(format!("{}: {}", path.display(), e)))?;

        Ok(Self {
            path: path.to_path_buf(),
            pool,
        })
    }
}

/// Interrupts the statement if the fetch future is dropped before completion.
struct InterruptOnDrop {
    handle: Option<InterruptHandle>,
}

impl InterruptOnDrop {
    fn disarm(mut self) {
        self.handle = None;
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!("Interrupting abandoned target statement");
            handle.interrupt();
        }
    }
}

#[async_trait::async_trait]
impl TargetDatabase for SqliteTarget {
    async fn fetch(&self, sql: &str) -> Result<Vec<Row>, TargetError> {
        let pool = self.pool.clone();
        // Lease the connection off the async threads; pool.get() may block.
        let conn = tokio::task::spawn_blocking(move || pool.get())
            .await
            .map_err(|e| TargetError::Connection(e.to_string()))?
            .map_err(|e| TargetError::Connection(e.to_string()))?;

        let guard = InterruptOnDrop {
            handle: Some(conn.get_interrupt_handle()),
        };
        let sql = sql.to_string();

        // The pooled connection moves into the blocking task and returns to
        // the pool when the task ends, whatever the outcome.
        let rows = tokio::task::spawn_blocking(move || fetch_rows(&conn, &sql))
            .await
            .map_err(|e| TargetError::Query(e.to_string()))?;

        guard.disarm();
        rows
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.path.display())
    }
}

fn fetch_rows(conn: &Connection, sql: &str) -> Result<Vec<Row>, TargetError> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| TargetError::Query(e.to_string()))?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let mut rows = stmt
        .query([])
        .map_err(|e| TargetError::Query(e.to_string()))?;

    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(|e| TargetError::Query(e.to_string()))? {
        let mut record = Row::new();
        for (i, name) in columns.iter().enumerate() {
            let value = row
                .get_ref(i)
                .map_err(|e| TargetError::Query(e.to_string()))?;
            record.insert(name.clone(), to_json(value));
        }
        out.push(record);
    }
    Ok(out)
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        // NaN and infinities have no JSON form
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => {
            let hex: String = b.iter().map(|byte| format!("{:02X}", byte)).collect();
            Value::String(format!("0x{}", hex))
        }
    }
}
