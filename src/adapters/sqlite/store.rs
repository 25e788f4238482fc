use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{connections, executions, kv, scheduled_emails, workflows, DbPool};
use crate::error::Result;
use crate::store::{ConnectionStore, KeyValueStore, ScheduledEmailStore, WorkflowStore};
use crate::types::{
    Connection, ExecutionPatch, NewExecution, ScheduledEmail, ScheduledEmailStatus, Workflow,
    WorkflowExecution,
};

/// All storage contracts over one SQLite pool
#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        kv::get(&self.pool, key)
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        kv::put(&self.pool, key, value)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        kv::delete(&self.pool, key)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        kv::list(&self.pool, prefix)
    }
}

#[async_trait]
impl WorkflowStore for SqliteStore {
    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        workflows::get(&self.pool, id)
    }

    async fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        workflows::save(&self.pool, workflow)
    }

    async fn enabled_workflows_for_connection(
        &self,
        connection: &Connection,
    ) -> Result<Vec<Workflow>> {
        workflows::enabled_for_connection(&self.pool, connection)
    }

    async fn create_workflow_execution(
        &self,
        new: &NewExecution,
    ) -> Result<Option<WorkflowExecution>> {
        executions::create(&self.pool, new)
    }

    async fn get_workflow_execution(&self, id: &str) -> Result<Option<WorkflowExecution>> {
        executions::get(&self.pool, id)
    }

    async fn find_execution_by_dedupe_key(&self, key: &str) -> Result<Option<WorkflowExecution>> {
        executions::find_by_dedupe_key(&self.pool, key)
    }

    async fn update_workflow_execution(
        &self,
        id: &str,
        patch: ExecutionPatch,
    ) -> Result<WorkflowExecution> {
        executions::update(&self.pool, id, patch)
    }

    async fn delete_old_executions(&self, before: DateTime<Utc>) -> Result<u64> {
        executions::delete_older_than(&self.pool, before)
    }
}

#[async_trait]
impl ConnectionStore for SqliteStore {
    async fn get_connection(&self, id: &str) -> Result<Option<Connection>> {
        connections::get(&self.pool, id)
    }

    async fn find_connection_by_email(&self, email: &str) -> Result<Option<Connection>> {
        connections::find_by_email(&self.pool, email)
    }

    async fn active_connections(&self) -> Result<Vec<Connection>> {
        connections::active(&self.pool)
    }

    async fn save_connection(&self, connection: &Connection) -> Result<()> {
        connections::save(&self.pool, connection)
    }
}

#[async_trait]
impl ScheduledEmailStore for SqliteStore {
    async fn save_scheduled_email(&self, email: &ScheduledEmail) -> Result<()> {
        scheduled_emails::save(&self.pool, email)
    }

    async fn get_scheduled_email(&self, id: &str) -> Result<Option<ScheduledEmail>> {
        scheduled_emails::get(&self.pool, id)
    }

    async fn due_scheduled_emails(
        &self,
        until: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ScheduledEmail>> {
        scheduled_emails::due(&self.pool, until, limit)
    }

    async fn mark_scheduled_email(&self, id: &str, status: ScheduledEmailStatus) -> Result<bool> {
        scheduled_emails::mark(&self.pool, id, status)
    }
}
