use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::DbPool;
use crate::error::{FlowError, Result};
use crate::types::{ScheduledEmail, ScheduledEmailStatus};

fn row_to_scheduled(row: &Row) -> rusqlite::Result<(String, String, String, i64, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode(row: (String, String, String, i64, String)) -> Result<ScheduledEmail> {
    let (id, connection_id, email, send_at, status) = row;
    Ok(ScheduledEmail {
        id,
        connection_id,
        email: serde_json::from_str(&email)?,
        send_at: Utc
            .timestamp_millis_opt(send_at)
            .single()
            .ok_or_else(|| FlowError::Parse(format!("bad send_at {}", send_at)))?,
        status: ScheduledEmailStatus::from_str(&status),
    })
}

pub fn save(pool: &DbPool, email: &ScheduledEmail) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO scheduled_emails (id, connection_id, email, send_at, status, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
             connection_id = excluded.connection_id,
             email = excluded.email,
             send_at = excluded.send_at,
             status = excluded.status,
             updated_at = excluded.updated_at",
        params![
            email.id,
            email.connection_id,
            serde_json::to_string(&email.email)?,
            email.send_at.timestamp_millis(),
            email.status.as_str(),
            Utc::now().timestamp_millis()
        ],
    )?;
    Ok(())
}

pub fn get(pool: &DbPool, id: &str) -> Result<Option<ScheduledEmail>> {
    let conn = pool.get()?;
    let row = conn
        .query_row(
            "SELECT id, connection_id, email, send_at, status FROM scheduled_emails WHERE id = ?1",
            params![id],
            row_to_scheduled,
        )
        .optional()?;
    row.map(decode).transpose()
}

/// Still-scheduled emails with `send_at <= until`, oldest first.
pub fn due(pool: &DbPool, until: DateTime<Utc>, limit: u32) -> Result<Vec<ScheduledEmail>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT id, connection_id, email, send_at, status FROM scheduled_emails
         WHERE status = 'scheduled' AND send_at <= ?1
         ORDER BY send_at ASC LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![until.timestamp_millis(), limit], row_to_scheduled)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.into_iter().map(decode).collect()
}

pub fn mark(pool: &DbPool, id: &str, status: ScheduledEmailStatus) -> Result<bool> {
    let conn = pool.get()?;
    let updated = conn.execute(
        "UPDATE scheduled_emails SET status = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, status.as_str(), Utc::now().timestamp_millis()],
    )?;
    Ok(updated == 1)
}
