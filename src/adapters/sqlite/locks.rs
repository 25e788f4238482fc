use rusqlite::{params, TransactionBehavior};

use super::DbPool;
use crate::error::Result;

/// Set-if-absent with expiry. Returns true when `token` now holds `key`.
pub fn try_acquire(pool: &DbPool, key: &str, token: &str, now_ms: i64, ttl_ms: i64) -> Result<bool> {
    let mut conn = pool.get()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute(
        "DELETE FROM locks WHERE key = ?1 AND expires_at <= ?2",
        params![key, now_ms],
    )?;
    let inserted = tx.execute(
        "INSERT OR IGNORE INTO locks (key, token, expires_at) VALUES (?1, ?2, ?3)",
        params![key, token, now_ms + ttl_ms],
    )?;
    tx.commit()?;
    Ok(inserted == 1)
}

/// Remove the lock whatever its holder.
pub fn release(pool: &DbPool, key: &str) -> Result<bool> {
    let conn = pool.get()?;
    let removed = conn.execute("DELETE FROM locks WHERE key = ?1", params![key])?;
    Ok(removed > 0)
}

/// Remove the lock only if `token` still holds it.
pub fn release_owned(pool: &DbPool, key: &str, token: &str) -> Result<bool> {
    let conn = pool.get()?;
    let removed = conn.execute(
        "DELETE FROM locks WHERE key = ?1 AND token = ?2",
        params![key, token],
    )?;
    Ok(removed > 0)
}

pub fn is_held(pool: &DbPool, key: &str, now_ms: i64) -> Result<bool> {
    let conn = pool.get()?;
    let held: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM locks WHERE key = ?1 AND expires_at > ?2)",
        params![key, now_ms],
        |row| row.get(0),
    )?;
    Ok(held)
}
