use rusqlite::{params, OptionalExtension, Row};

use super::DbPool;
use crate::error::Result;
use crate::types::Connection;

fn row_to_connection(row: &Row) -> rusqlite::Result<Connection> {
    Ok(Connection {
        id: row.get(0)?,
        user_id: row.get(1)?,
        email: row.get(2)?,
        provider: row.get(3)?,
        is_active: row.get(4)?,
    })
}

pub fn save(pool: &DbPool, connection: &Connection) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO connections (id, user_id, email, provider, is_active)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
             user_id = excluded.user_id,
             email = excluded.email,
             provider = excluded.provider,
             is_active = excluded.is_active",
        params![
            connection.id,
            connection.user_id,
            connection.email,
            connection.provider,
            connection.is_active
        ],
    )?;
    Ok(())
}

pub fn get(pool: &DbPool, id: &str) -> Result<Option<Connection>> {
    let conn = pool.get()?;
    let connection = conn
        .query_row(
            "SELECT id, user_id, email, provider, is_active FROM connections WHERE id = ?1",
            params![id],
            row_to_connection,
        )
        .optional()?;
    Ok(connection)
}

/// Active connection for a mailbox address, compared case-insensitively.
pub fn find_by_email(pool: &DbPool, email: &str) -> Result<Option<Connection>> {
    let conn = pool.get()?;
    let connection = conn
        .query_row(
            "SELECT id, user_id, email, provider, is_active FROM connections
             WHERE email = ?1 COLLATE NOCASE AND is_active = 1
             ORDER BY id LIMIT 1",
            params![email.trim()],
            row_to_connection,
        )
        .optional()?;
    Ok(connection)
}

pub fn active(pool: &DbPool) -> Result<Vec<Connection>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT id, user_id, email, provider, is_active FROM connections
         WHERE is_active = 1 ORDER BY id",
    )?;
    let connections = stmt
        .query_map([], row_to_connection)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(connections)
}
