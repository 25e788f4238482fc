use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DbPool;
use crate::error::{FlowError, Result};
use crate::types::{ExecutionPatch, ExecutionStatus, NewExecution, WorkflowExecution};

const EXECUTION_COLUMNS: &str = "id, workflow_id, thread_id, connection_id, status, trigger_data, \
     node_results, error, started_at, completed_at";

struct ExecutionRow {
    id: String,
    workflow_id: String,
    thread_id: String,
    connection_id: String,
    status: String,
    trigger_data: String,
    node_results: String,
    error: Option<String>,
    started_at: i64,
    completed_at: Option<i64>,
}

fn read_row(row: &Row) -> rusqlite::Result<ExecutionRow> {
    Ok(ExecutionRow {
        id: row.get(0)?,
        workflow_id: row.get(1)?,
        thread_id: row.get(2)?,
        connection_id: row.get(3)?,
        status: row.get(4)?,
        trigger_data: row.get(5)?,
        node_results: row.get(6)?,
        error: row.get(7)?,
        started_at: row.get(8)?,
        completed_at: row.get(9)?,
    })
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

impl TryFrom<ExecutionRow> for WorkflowExecution {
    type Error = FlowError;

    fn try_from(row: ExecutionRow) -> Result<Self> {
        Ok(Self {
            status: ExecutionStatus::parse(&row.status)?,
            trigger_data: serde_json::from_str(&row.trigger_data)?,
            node_results: serde_json::from_str(&row.node_results)?,
            id: row.id,
            workflow_id: row.workflow_id,
            thread_id: row.thread_id,
            connection_id: row.connection_id,
            error: row.error,
            started_at: from_millis(row.started_at),
            completed_at: row.completed_at.map(from_millis),
        })
    }
}

fn load(conn: &Connection, id: &str) -> Result<Option<WorkflowExecution>> {
    let sql = format!("SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE id = ?1");
    let row = conn.query_row(&sql, params![id], read_row).optional()?;
    row.map(WorkflowExecution::try_from).transpose()
}

/// Create a pending execution. Returns `None` when one already exists for
/// the same workflow, thread and event.
pub fn create(pool: &DbPool, new: &NewExecution) -> Result<Option<WorkflowExecution>> {
    let execution = WorkflowExecution {
        id: uuid::Uuid::new_v4().to_string(),
        workflow_id: new.workflow_id.clone(),
        thread_id: new.thread_id.clone(),
        connection_id: new.connection_id.clone(),
        status: ExecutionStatus::Pending,
        trigger_data: new.trigger_data.clone(),
        node_results: Default::default(),
        error: None,
        started_at: Utc::now(),
        completed_at: None,
    };

    let conn = pool.get()?;
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO workflow_executions
            (id, workflow_id, thread_id, connection_id, status, trigger_data, node_results,
             dedupe_key, started_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, '{}', ?7, ?8)",
        params![
            execution.id,
            execution.workflow_id,
            execution.thread_id,
            execution.connection_id,
            execution.status.as_str(),
            serde_json::to_string(&execution.trigger_data)?,
            new.dedupe_key(),
            execution.started_at.timestamp_millis()
        ],
    )?;

    Ok((inserted == 1).then_some(execution))
}

pub fn find_by_dedupe_key(pool: &DbPool, key: &str) -> Result<Option<WorkflowExecution>> {
    let conn = pool.get()?;
    let sql = format!("SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE dedupe_key = ?1");
    let row = conn.query_row(&sql, params![key], read_row).optional()?;
    row.map(WorkflowExecution::try_from).transpose()
}

pub fn get(pool: &DbPool, id: &str) -> Result<Option<WorkflowExecution>> {
    let conn = pool.get()?;
    load(&conn, id)
}

/// Apply `patch` inside a transaction; invalid transitions leave the row untouched.
pub fn update(pool: &DbPool, id: &str, patch: ExecutionPatch) -> Result<WorkflowExecution> {
    let mut conn = pool.get()?;
    let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

    let mut execution =
        load(&tx, id)?.ok_or_else(|| FlowError::ExecutionNotFound(id.to_string()))?;
    execution.apply(patch)?;

    tx.execute(
        "UPDATE workflow_executions
         SET status = ?2, node_results = ?3, error = ?4, completed_at = ?5
         WHERE id = ?1",
        params![
            execution.id,
            execution.status.as_str(),
            serde_json::to_string(&execution.node_results)?,
            execution.error,
            execution.completed_at.map(|t| t.timestamp_millis())
        ],
    )?;
    tx.commit()?;
    Ok(execution)
}

/// Delete finished executions started before `before`. Pending and running
/// executions are kept whatever their age. Returns how many were removed.
pub fn delete_older_than(pool: &DbPool, before: DateTime<Utc>) -> Result<u64> {
    let conn = pool.get()?;
    let removed = conn.execute(
        "DELETE FROM workflow_executions
         WHERE started_at < ?1 AND status IN ('completed', 'failed')",
        params![before.timestamp_millis()],
    )?;
    Ok(removed as u64)
}
