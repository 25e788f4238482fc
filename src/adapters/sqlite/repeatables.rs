use rusqlite::{params, Row};

use super::DbPool;
use crate::error::Result;

const REPEATABLE_COLUMNS: &str = "key, queue, name, data, options, cron, timezone, start_at, \
     end_at, limit_count, run_count, next_run_at, created_at";

#[derive(Debug, Clone)]
pub struct RepeatableRecord {
    pub key: String,
    pub queue: String,
    pub name: String,
    pub data: String,
    pub options: String,
    pub cron: String,
    pub timezone: Option<String>,
    pub start_at: Option<i64>,
    pub end_at: Option<i64>,
    pub limit_count: Option<u32>,
    pub run_count: u32,
    pub next_run_at: Option<i64>,
    pub created_at: i64,
}

fn row_to_repeatable(row: &Row) -> rusqlite::Result<RepeatableRecord> {
    Ok(RepeatableRecord {
        key: row.get(0)?,
        queue: row.get(1)?,
        name: row.get(2)?,
        data: row.get(3)?,
        options: row.get(4)?,
        cron: row.get(5)?,
        timezone: row.get(6)?,
        start_at: row.get(7)?,
        end_at: row.get(8)?,
        limit_count: row.get(9)?,
        run_count: row.get(10)?,
        next_run_at: row.get(11)?,
        created_at: row.get(12)?,
    })
}

/// Replace any registration under the same key.
pub fn replace(pool: &DbPool, record: &RepeatableRecord) -> Result<()> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM repeatable_jobs WHERE key = ?1", params![record.key])?;
    tx.execute(
        "INSERT INTO repeatable_jobs
            (key, queue, name, data, options, cron, timezone, start_at, end_at,
             limit_count, run_count, next_run_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            record.key,
            record.queue,
            record.name,
            record.data,
            record.options,
            record.cron,
            record.timezone,
            record.start_at,
            record.end_at,
            record.limit_count,
            record.run_count,
            record.next_run_at,
            record.created_at
        ],
    )?;
    tx.commit()?;
    Ok(())
}

pub fn delete(pool: &DbPool, key: &str) -> Result<bool> {
    let conn = pool.get()?;
    let removed = conn.execute("DELETE FROM repeatable_jobs WHERE key = ?1", params![key])?;
    Ok(removed > 0)
}

pub fn list(pool: &DbPool) -> Result<Vec<RepeatableRecord>> {
    let conn = pool.get()?;
    let sql = format!("SELECT {REPEATABLE_COLUMNS} FROM repeatable_jobs ORDER BY key");
    let mut stmt = conn.prepare(&sql)?;
    let records = stmt
        .query_map([], row_to_repeatable)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(records)
}

pub fn due(pool: &DbPool, now_ms: i64) -> Result<Vec<RepeatableRecord>> {
    let conn = pool.get()?;
    let sql = format!(
        "SELECT {REPEATABLE_COLUMNS} FROM repeatable_jobs
         WHERE next_run_at IS NOT NULL AND next_run_at <= ?1
         ORDER BY next_run_at"
    );
    let mut stmt = conn.prepare(&sql)?;
    let records = stmt
        .query_map(params![now_ms], row_to_repeatable)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(records)
}

/// Advance a registration after it fired. Guarded on the previous
/// `next_run_at` so two schedulers ticking at once advance it only once.
pub fn advance(
    pool: &DbPool,
    key: &str,
    fired_at: i64,
    next_run_at: Option<i64>,
) -> Result<bool> {
    let conn = pool.get()?;
    let updated = conn.execute(
        "UPDATE repeatable_jobs
         SET run_count = run_count + 1, next_run_at = ?3
         WHERE key = ?1 AND next_run_at = ?2",
        params![key, fired_at, next_run_at],
    )?;
    Ok(updated == 1)
}
