//! Storage contracts used by the engine

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{
    Connection, ExecutionPatch, NewExecution, ScheduledEmail, ScheduledEmailStatus, Workflow,
    WorkflowExecution,
};

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn put(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<bool>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>>;

    /// Rejects workflows that fail `Workflow::validate`.
    async fn save_workflow(&self, workflow: &Workflow) -> Result<()>;

    async fn enabled_workflows_for_connection(&self, connection: &Connection)
        -> Result<Vec<Workflow>>;

    /// `None` when an execution for the same event already exists.
    async fn create_workflow_execution(
        &self,
        new: &NewExecution,
    ) -> Result<Option<WorkflowExecution>>;

    async fn get_workflow_execution(&self, id: &str) -> Result<Option<WorkflowExecution>>;

    async fn find_execution_by_dedupe_key(&self, key: &str) -> Result<Option<WorkflowExecution>>;

    /// Rejects backward transitions and any change to a terminal execution.
    async fn update_workflow_execution(
        &self,
        id: &str,
        patch: ExecutionPatch,
    ) -> Result<WorkflowExecution>;

    /// Remove finished executions started before `before`.
    async fn delete_old_executions(&self, before: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn get_connection(&self, id: &str) -> Result<Option<Connection>>;
    async fn find_connection_by_email(&self, email: &str) -> Result<Option<Connection>>;
    async fn active_connections(&self) -> Result<Vec<Connection>>;
    async fn save_connection(&self, connection: &Connection) -> Result<()>;
}

#[async_trait]
pub trait ScheduledEmailStore: Send + Sync {
    async fn save_scheduled_email(&self, email: &ScheduledEmail) -> Result<()>;
    async fn get_scheduled_email(&self, id: &str) -> Result<Option<ScheduledEmail>>;
    async fn due_scheduled_emails(
        &self,
        until: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ScheduledEmail>>;
    async fn mark_scheduled_email(&self, id: &str, status: ScheduledEmailStatus) -> Result<bool>;
}
