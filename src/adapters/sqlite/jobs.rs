//! Job rows
//!
//! Status lifecycle: `waiting`/`delayed` -> `active` -> `completed` | `failed`,
//! with `active` -> `delayed` on retry and `active` -> `waiting` on stall.
//! Every transition out of `active` is guarded by the claiming worker's id,
//! so a worker that lost its lease cannot overwrite someone else's outcome.

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use super::DbPool;
use crate::error::Result;

const JOB_COLUMNS: &str = "id, queue, name, data, options, status, priority, attempts_made, \
     stalled_count, run_at, locked_until, worker_id, last_error, return_value, repeat_key, \
     created_at, processed_at, finished_at";

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: String,
    pub queue: String,
    pub name: String,
    pub data: String,
    pub options: String,
    pub status: String,
    pub priority: i64,
    pub attempts_made: u32,
    pub stalled_count: u32,
    pub run_at: i64,
    pub locked_until: Option<i64>,
    pub worker_id: Option<String>,
    pub last_error: Option<String>,
    pub return_value: Option<String>,
    pub repeat_key: Option<String>,
    pub created_at: i64,
    pub processed_at: Option<i64>,
    pub finished_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewJobRecord {
    pub id: String,
    pub queue: String,
    pub name: String,
    pub data: String,
    pub options: String,
    pub priority: i64,
    pub run_at: i64,
    pub repeat_key: Option<String>,
    pub created_at: i64,
}

fn row_to_job(row: &Row) -> rusqlite::Result<JobRecord> {
    Ok(JobRecord {
        id: row.get(0)?,
        queue: row.get(1)?,
        name: row.get(2)?,
        data: row.get(3)?,
        options: row.get(4)?,
        status: row.get(5)?,
        priority: row.get(6)?,
        attempts_made: row.get(7)?,
        stalled_count: row.get(8)?,
        run_at: row.get(9)?,
        locked_until: row.get(10)?,
        worker_id: row.get(11)?,
        last_error: row.get(12)?,
        return_value: row.get(13)?,
        repeat_key: row.get(14)?,
        created_at: row.get(15)?,
        processed_at: row.get(16)?,
        finished_at: row.get(17)?,
    })
}

/// Insert unless a job with the same id exists. Returns whether a row was added.
pub fn insert(conn: &Connection, job: &NewJobRecord) -> Result<bool> {
    let status = if job.run_at > job.created_at {
        "delayed"
    } else {
        "waiting"
    };
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO jobs
            (id, queue, name, data, options, status, priority, run_at, repeat_key, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            job.id,
            job.queue,
            job.name,
            job.data,
            job.options,
            status,
            job.priority,
            job.run_at,
            job.repeat_key,
            job.created_at
        ],
    )?;
    Ok(inserted == 1)
}

/// Insert a batch atomically.
pub fn insert_many(pool: &DbPool, jobs: &[NewJobRecord]) -> Result<Vec<bool>> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    let mut results = Vec::with_capacity(jobs.len());
    for job in jobs {
        results.push(insert(&tx, job)?);
    }
    tx.commit()?;
    Ok(results)
}

pub fn get(pool: &DbPool, id: &str) -> Result<Option<JobRecord>> {
    let conn = pool.get()?;
    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
    let job = conn.query_row(&sql, params![id], row_to_job).optional()?;
    Ok(job)
}

/// Lease the next runnable job of `queue`. Higher priority first, then
/// earliest `run_at`.
pub fn claim_next(
    pool: &DbPool,
    queue: &str,
    worker_id: &str,
    now_ms: i64,
    lease_ms: i64,
) -> Result<Option<JobRecord>> {
    let mut conn = pool.get()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let id: Option<String> = tx
        .query_row(
            "SELECT id FROM jobs
             WHERE queue = ?1 AND status IN ('waiting', 'delayed') AND run_at <= ?2
             ORDER BY priority DESC, run_at ASC, created_at ASC
             LIMIT 1",
            params![queue, now_ms],
            |row| row.get(0),
        )
        .optional()?;

    let Some(id) = id else {
        return Ok(None);
    };

    tx.execute(
        "UPDATE jobs
         SET status = 'active', locked_until = ?2, worker_id = ?3, processed_at = ?4
         WHERE id = ?1",
        params![id, now_ms + lease_ms, worker_id, now_ms],
    )?;

    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
    let job = tx.query_row(&sql, params![id], row_to_job)?;
    tx.commit()?;
    Ok(Some(job))
}

pub fn extend_lease(pool: &DbPool, id: &str, worker_id: &str, until_ms: i64) -> Result<bool> {
    let conn = pool.get()?;
    let updated = conn.execute(
        "UPDATE jobs SET locked_until = ?3
         WHERE id = ?1 AND worker_id = ?2 AND status = 'active'",
        params![id, worker_id, until_ms],
    )?;
    Ok(updated == 1)
}

pub fn complete(
    pool: &DbPool,
    id: &str,
    worker_id: &str,
    return_value: &str,
    now_ms: i64,
) -> Result<bool> {
    let conn = pool.get()?;
    let updated = conn.execute(
        "UPDATE jobs
         SET status = 'completed', return_value = ?3, finished_at = ?4,
             attempts_made = attempts_made + 1, locked_until = NULL
         WHERE id = ?1 AND worker_id = ?2 AND status = 'active'",
        params![id, worker_id, return_value, now_ms],
    )?;
    Ok(updated == 1)
}

/// Record a failed attempt and park the job until `run_at`.
pub fn retry(pool: &DbPool, id: &str, worker_id: &str, error: &str, run_at_ms: i64) -> Result<bool> {
    let conn = pool.get()?;
    let updated = conn.execute(
        "UPDATE jobs
         SET status = 'delayed', last_error = ?3, run_at = ?4,
             attempts_made = attempts_made + 1, locked_until = NULL, worker_id = NULL
         WHERE id = ?1 AND worker_id = ?2 AND status = 'active'",
        params![id, worker_id, error, run_at_ms],
    )?;
    Ok(updated == 1)
}

/// Record the final failed attempt.
pub fn fail(pool: &DbPool, id: &str, worker_id: &str, error: &str, now_ms: i64) -> Result<bool> {
    let conn = pool.get()?;
    let updated = conn.execute(
        "UPDATE jobs
         SET status = 'failed', last_error = ?3, finished_at = ?4,
             attempts_made = attempts_made + 1, locked_until = NULL
         WHERE id = ?1 AND worker_id = ?2 AND status = 'active'",
        params![id, worker_id, error, now_ms],
    )?;
    Ok(updated == 1)
}

pub fn delete(pool: &DbPool, id: &str) -> Result<bool> {
    let conn = pool.get()?;
    let removed = conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
    Ok(removed > 0)
}

/// Drop not-yet-started jobs spawned by a repeatable registration.
pub fn delete_pending_by_repeat_key(pool: &DbPool, repeat_key: &str) -> Result<usize> {
    let conn = pool.get()?;
    let removed = conn.execute(
        "DELETE FROM jobs WHERE repeat_key = ?1 AND status IN ('waiting', 'delayed')",
        params![repeat_key],
    )?;
    Ok(removed)
}

/// Keep only the `keep` most recently finished jobs in `status`.
pub fn trim_finished(pool: &DbPool, queue: &str, status: &str, keep: usize) -> Result<usize> {
    let conn = pool.get()?;
    let removed = conn.execute(
        "DELETE FROM jobs
         WHERE queue = ?1 AND status = ?2 AND id NOT IN (
             SELECT id FROM jobs WHERE queue = ?1 AND status = ?2
             ORDER BY finished_at DESC, id DESC
             LIMIT ?3
         )",
        params![queue, status, keep as i64],
    )?;
    Ok(removed)
}

pub fn count_by_status(pool: &DbPool, queue: &str) -> Result<Vec<(String, u64)>> {
    let conn = pool.get()?;
    let mut stmt =
        conn.prepare("SELECT status, COUNT(*) FROM jobs WHERE queue = ?1 GROUP BY status")?;
    let rows = stmt
        .query_map(params![queue], |row| Ok((row.get(0)?, row.get::<_, i64>(1)? as u64)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_by_status(
    pool: &DbPool,
    queue: &str,
    status: &str,
    limit: usize,
) -> Result<Vec<JobRecord>> {
    let conn = pool.get()?;
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM jobs WHERE queue = ?1 AND status = ?2
         ORDER BY priority DESC, run_at ASC, created_at ASC LIMIT ?3"
    );
    let mut stmt = conn.prepare(&sql)?;
    let jobs = stmt
        .query_map(params![queue, status, limit as i64], row_to_job)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(jobs)
}

/// Active jobs whose lease ran out.
pub fn expired_leases(pool: &DbPool, now_ms: i64) -> Result<Vec<JobRecord>> {
    let conn = pool.get()?;
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM jobs
         WHERE status = 'active' AND locked_until IS NOT NULL AND locked_until <= ?1"
    );
    let mut stmt = conn.prepare(&sql)?;
    let jobs = stmt
        .query_map(params![now_ms], row_to_job)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(jobs)
}

/// Put a stalled job back in line. No-op if its lease was renewed meanwhile.
pub fn requeue_stalled(pool: &DbPool, id: &str, now_ms: i64) -> Result<bool> {
    let conn = pool.get()?;
    let updated = conn.execute(
        "UPDATE jobs
         SET status = 'waiting', stalled_count = stalled_count + 1, run_at = ?2,
             locked_until = NULL, worker_id = NULL
         WHERE id = ?1 AND status = 'active' AND locked_until <= ?2",
        params![id, now_ms],
    )?;
    Ok(updated == 1)
}

pub fn fail_stalled(pool: &DbPool, id: &str, error: &str, now_ms: i64) -> Result<bool> {
    let conn = pool.get()?;
    let updated = conn.execute(
        "UPDATE jobs
         SET status = 'failed', stalled_count = stalled_count + 1, last_error = ?2,
             finished_at = ?3, locked_until = NULL, worker_id = NULL
         WHERE id = ?1 AND status = 'active' AND locked_until <= ?3",
        params![id, error, now_ms],
    )?;
    Ok(updated == 1)
}
