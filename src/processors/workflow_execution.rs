//! `execute-workflow` processor
//!
//! Loads the execution and its workflow, moves it to `running`, walks the
//! graph and records the outcome. Node failures are part of the outcome,
//! not job errors; only infrastructure errors make the job retry. An
//! execution already in a terminal state is left untouched, which makes a
//! redelivered job harmless.

use serde::Serialize;
use tracing::{info, warn};

use crate::engine::executor::run_workflow;
use crate::error::{FlowError, Result};
use crate::queue::job::ExecuteWorkflowJob;
use crate::state::JobContext;
use crate::sync::threads;
use crate::types::{ExecutionPatch, ExecutionStatus, Workflow, WorkflowExecution};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub executed_nodes: usize,
    pub error: Option<String>,
    /// The execution was already finished and nothing ran
    pub skipped: bool,
}

impl ExecutionReport {
    fn skipped(execution: &WorkflowExecution) -> Self {
        Self {
            execution_id: execution.id.clone(),
            status: execution.status,
            executed_nodes: 0,
            error: execution.error.clone(),
            skipped: true,
        }
    }
}

/// `last_attempt` tells whether the queue will retry this job on error; if
/// not, the execution is marked failed before the error is returned.
pub async fn run_execute_workflow(
    ctx: &JobContext,
    job: &ExecuteWorkflowJob,
    last_attempt: bool,
) -> Result<ExecutionReport> {
    let execution = ctx
        .workflows
        .get_workflow_execution(&job.execution_id)
        .await?
        .ok_or_else(|| FlowError::ExecutionNotFound(job.execution_id.clone()))?;
    if execution.status.is_terminal() {
        info!(execution_id = %execution.id, status = execution.status.as_str(), "Execution already finished");
        return Ok(ExecutionReport::skipped(&execution));
    }

    match execute(ctx, job, &execution).await {
        Ok(report) => Ok(report),
        Err(e) => {
            if last_attempt || e.is_fatal() {
                mark_failed(ctx, &execution.id, &e).await;
            }
            Err(e)
        }
    }
}

async fn mark_failed(ctx: &JobContext, execution_id: &str, error: &FlowError) {
    if let Err(e) = ctx
        .workflows
        .update_workflow_execution(execution_id, ExecutionPatch::failed(error.to_string()))
        .await
    {
        warn!(execution_id = %execution_id, "Failed to record execution failure: {}", e);
    }
}

async fn load_workflow(ctx: &JobContext, job: &ExecuteWorkflowJob) -> Result<Workflow> {
    let workflow = ctx
        .workflows
        .get_workflow(&job.workflow_id)
        .await?
        .ok_or_else(|| FlowError::WorkflowNotFound(job.workflow_id.clone()))?;
    workflow.validate()?;
    Ok(workflow)
}

async fn execute(
    ctx: &JobContext,
    job: &ExecuteWorkflowJob,
    execution: &WorkflowExecution,
) -> Result<ExecutionReport> {
    let workflow = load_workflow(ctx, job).await?;
    let connection = ctx.owned_connection(&workflow.user_id, &execution.connection_id).await?;

    ctx.workflows
        .update_workflow_execution(&execution.id, ExecutionPatch::running())
        .await?;

    let driver = ctx.driver(&connection).await?;
    let kv = ctx.kv.as_ref();
    let thread = match threads::stored_thread(kv, &connection.id, &execution.thread_id).await? {
        Some(thread) => thread,
        None => threads::sync_thread(kv, driver.as_ref(), &connection.id, &execution.thread_id).await?,
    };

    let outcome = run_workflow(ctx, driver.as_ref(), &workflow, &execution.trigger_data, &thread).await;
    let executed_nodes = outcome.executed();
    ctx.workflows
        .update_workflow_execution(
            &execution.id,
            ExecutionPatch::finished(outcome.status, outcome.node_results, outcome.error.clone()),
        )
        .await?;

    match outcome.status {
        ExecutionStatus::Failed => warn!(
            execution_id = %execution.id,
            workflow_id = %workflow.id,
            "Workflow execution failed: {}",
            outcome.error.as_deref().unwrap_or("unknown error")
        ),
        _ => info!(
            execution_id = %execution.id,
            workflow_id = %workflow.id,
            executed_nodes,
            "Workflow execution completed"
        ),
    }

    Ok(ExecutionReport {
        execution_id: execution.id.clone(),
        status: outcome.status,
        executed_nodes,
        error: outcome.error,
        skipped: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, FakeMailDriver, CONNECTION, USER};
    use crate::types::workflow::{EmailReceivedParams, LabelParams};
    use crate::types::{
        ActionNode, NewExecution, NodeKind, TriggerData, TriggerKind, TriggerNode,
        WorkflowConnections, WorkflowNode,
    };

    fn workflow() -> Workflow {
        let mut connections = WorkflowConnections::default();
        connections.connect("trigger", 0, "label");
        Workflow {
            id: "wf1".into(),
            user_id: USER.into(),
            connection_id: Some(CONNECTION.into()),
            name: "Label everything".into(),
            nodes: vec![
                WorkflowNode::new(
                    "trigger",
                    "New mail",
                    NodeKind::Trigger(TriggerNode::EmailReceived(EmailReceivedParams::default())),
                ),
                WorkflowNode::new(
                    "label",
                    "Label",
                    NodeKind::Action(ActionNode::AddLabel(LabelParams {
                        label: "Seen".into(),
                    })),
                ),
            ],
            connections,
            is_enabled: true,
        }
    }

    async fn pending_execution(ctx: &JobContext, driver: &FakeMailDriver) -> ExecuteWorkflowJob {
        let thread = testing::thread("t1", 3, "a@b.c", "Hi", &["INBOX"]);
        driver.seed(thread.clone());
        let new = NewExecution {
            workflow_id: "wf1".into(),
            thread_id: "t1".into(),
            connection_id: CONNECTION.into(),
            trigger_data: TriggerData::from_thread(TriggerKind::EmailReceived, CONNECTION, &thread),
        };
        let execution = ctx.workflows.create_workflow_execution(&new).await.unwrap().unwrap();
        ExecuteWorkflowJob {
            execution_id: execution.id,
            workflow_id: "wf1".into(),
            connection_id: CONNECTION.into(),
            thread_id: "t1".into(),
        }
    }

    #[tokio::test]
    async fn test_runs_and_records_completion_once() {
        let driver = FakeMailDriver::new();
        let ctx = testing::context(driver.clone());
        testing::seed_connection(&ctx).await;
        ctx.workflows.save_workflow(&workflow()).await.unwrap();
        let job = pending_execution(&ctx, &driver).await;

        let report = run_execute_workflow(&ctx, &job, false).await.unwrap();
        assert_eq!(report.status, ExecutionStatus::Completed);
        assert_eq!(report.executed_nodes, 2);
        assert!(!report.skipped);

        let stored = ctx.workflows.get_workflow_execution(&job.execution_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);
        assert!(stored.node_results["label"].passed);
        assert!(stored.completed_at.is_some());
        // Thread was fetched because it was not stored yet
        assert!(threads::stored_thread(ctx.kv.as_ref(), CONNECTION, "t1").await.unwrap().is_some());

        let again = run_execute_workflow(&ctx, &job, false).await.unwrap();
        assert!(again.skipped);
        assert_eq!(driver.with(|mb| mb.modifications.len()), 1);
    }

    #[tokio::test]
    async fn test_missing_workflow_fails_execution_fatally() {
        let driver = FakeMailDriver::new();
        let ctx = testing::context(driver.clone());
        testing::seed_connection(&ctx).await;
        let job = pending_execution(&ctx, &driver).await;

        let err = run_execute_workflow(&ctx, &job, false).await.unwrap_err();
        assert!(matches!(err, FlowError::WorkflowNotFound(_)));
        let stored = ctx.workflows.get_workflow_execution(&job.execution_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_transient_error_keeps_execution_open_until_last_attempt() {
        let driver = FakeMailDriver::new();
        let ctx = testing::context(driver.clone());
        testing::seed_connection(&ctx).await;
        ctx.workflows.save_workflow(&workflow()).await.unwrap();
        let job = pending_execution(&ctx, &driver).await;
        driver.with(|mb| mb.failing_threads.insert("t1".into()));

        assert!(run_execute_workflow(&ctx, &job, false).await.is_err());
        let stored = ctx.workflows.get_workflow_execution(&job.execution_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Running);

        assert!(run_execute_workflow(&ctx, &job, true).await.is_err());
        let stored = ctx.workflows.get_workflow_execution(&job.execution_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Failed);
    }
}
