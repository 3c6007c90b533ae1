//! Persisted stop request, so `schedule stop` can reach a scheduler
//! running in another process.

use crate::storage::{Pool, StoreError};

pub fn request_stop(pool: &Pool) -> Result<(), StoreError> {
    set(pool, true)
}

pub fn clear_stop(pool: &Pool) -> Result<(), StoreError> {
    set(pool, false)
}

pub fn stop_requested(pool: &Pool) -> Result<bool, StoreError> {
    let conn = pool.get()?;
    let flag: i64 = conn.query_row(
        "SELECT stop_requested FROM scheduler_control WHERE id = 1",
        [],
        |row| row.get(0),
    )?;
    Ok(flag != 0)
}

fn set(pool: &Pool, stop: bool) -> Result<(), StoreError> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE scheduler_control SET stop_requested = ?1, updated_at = datetime('now') WHERE id = 1",
        [stop as i64],
    )?;
    Ok(())
}
