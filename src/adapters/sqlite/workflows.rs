use rusqlite::{params, OptionalExtension};
use tracing::warn;

use super::DbPool;
use crate::error::{FlowError, Result};
use crate::types::{Connection, Workflow};

fn decode(definition: &str) -> Result<Workflow> {
    let workflow: Workflow = serde_json::from_str(definition)
        .map_err(|e| FlowError::InvalidWorkflow(format!("Failed to decode workflow: {}", e)))?;
    workflow.validate()?;
    Ok(workflow)
}

/// Validate and upsert a workflow.
pub fn save(pool: &DbPool, workflow: &Workflow) -> Result<()> {
    workflow.validate()?;
    let definition = serde_json::to_string(workflow)?;
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO workflows (id, user_id, connection_id, name, definition, is_enabled, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
             user_id = excluded.user_id,
             connection_id = excluded.connection_id,
             name = excluded.name,
             definition = excluded.definition,
             is_enabled = excluded.is_enabled,
             updated_at = excluded.updated_at",
        params![
            workflow.id,
            workflow.user_id,
            workflow.connection_id,
            workflow.name,
            definition,
            workflow.is_enabled,
            chrono::Utc::now().timestamp_millis()
        ],
    )?;
    Ok(())
}

pub fn get(pool: &DbPool, id: &str) -> Result<Option<Workflow>> {
    let conn = pool.get()?;
    let definition: Option<String> = conn
        .query_row(
            "SELECT definition FROM workflows WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    definition.as_deref().map(decode).transpose()
}

/// Enabled workflows owned by the connection's user that apply to it:
/// bound to this connection or to none in particular. Rows that no longer
/// decode are skipped with a warning.
pub fn enabled_for_connection(pool: &DbPool, connection: &Connection) -> Result<Vec<Workflow>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT id, definition FROM workflows
         WHERE is_enabled = 1 AND user_id = ?1
           AND (connection_id IS NULL OR connection_id = ?2)
         ORDER BY id",
    )?;
    let rows = stmt
        .query_map(params![connection.user_id, connection.id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut workflows = Vec::with_capacity(rows.len());
    for (id, definition) in rows {
        match decode(&definition) {
            Ok(workflow) => workflows.push(workflow),
            Err(e) => warn!(workflow_id = %id, "Skipping unreadable workflow: {}", e),
        }
    }
    Ok(workflows)
}
