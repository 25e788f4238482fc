//! `run-scheduled-workflow` processor
//!
//! One occurrence of a workflow's schedule trigger. The newest threads of
//! the trigger's folder, on every connection the workflow applies to, are
//! matched as `schedule` events. Events are keyed by the occurrence's job
//! id, so a retried occurrence never starts the same execution twice.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::engine::schedules::{schedule_name, schedule_params};
use crate::engine::{match_workflow, TriggerOutcome};
use crate::error::Result;
use crate::queue::job::ScheduledWorkflowJob;
use crate::state::JobContext;
use crate::sync::threads;
use crate::types::workflow::ScheduleParams;
use crate::types::{Connection, FailedItem, ListQuery, TriggerData, TriggerKind, Workflow};

/// Threads looked at per connection when the trigger sets no limit
const DEFAULT_MAX_THREADS: u32 = 10;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledRunResult {
    pub workflow_id: String,
    pub connections: usize,
    pub threads: usize,
    pub triggers: TriggerOutcome,
    /// The workflow lost its schedule and the registration was dropped
    pub unscheduled: bool,
}

pub async fn run_scheduled_workflow(
    ctx: &JobContext,
    job: &ScheduledWorkflowJob,
    occurrence: &str,
) -> Result<ScheduledRunResult> {
    let mut result = ScheduledRunResult {
        workflow_id: job.workflow_id.clone(),
        ..Default::default()
    };

    let workflow = ctx.workflows.get_workflow(&job.workflow_id).await?;
    let Some(workflow) = workflow.filter(|w| schedule_params(w).is_some()) else {
        info!(workflow_id = %job.workflow_id, "Workflow no longer scheduled, dropping its schedule");
        ctx.scheduler.remove(&schedule_name(&job.workflow_id))?;
        result.unscheduled = true;
        return Ok(result);
    };
    let Some(params) = schedule_params(&workflow) else {
        return Ok(result);
    };

    for connection in target_connections(ctx, &workflow).await? {
        result.connections += 1;
        match run_on_connection(ctx, &workflow, params, &connection, occurrence).await {
            Ok((threads, outcome)) => {
                result.threads += threads;
                result.triggers.merge(outcome);
            }
            Err(e) => {
                warn!(workflow_id = %workflow.id, connection_id = %connection.id, "Scheduled run failed: {}", e);
                result.triggers.failed.push(FailedItem {
                    item: connection.id.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    info!(
        workflow_id = %workflow.id,
        connections = result.connections,
        created = result.triggers.created.len(),
        "Scheduled workflow ran"
    );
    Ok(result)
}

/// Active connections the workflow applies to.
async fn target_connections(ctx: &JobContext, workflow: &Workflow) -> Result<Vec<Connection>> {
    let connections = match &workflow.connection_id {
        Some(id) => vec![ctx.owned_connection(&workflow.user_id, id).await?],
        None => ctx
            .connections
            .active_connections()
            .await?
            .into_iter()
            .filter(|c| c.user_id == workflow.user_id)
            .collect(),
    };
    Ok(connections.into_iter().filter(|c| c.is_active).collect())
}

async fn run_on_connection(
    ctx: &JobContext,
    workflow: &Workflow,
    params: &ScheduleParams,
    connection: &Connection,
    occurrence: &str,
) -> Result<(usize, TriggerOutcome)> {
    let driver = ctx.driver(connection).await?;
    let folder = params
        .folder
        .clone()
        .unwrap_or_else(|| ctx.config.sync.default_folder.clone());
    let query = ListQuery::folder(folder).max_results(params.max_threads.unwrap_or(DEFAULT_MAX_THREADS));
    let list = ctx.cache.list(driver.as_ref(), &connection.id, &query).await?;
    debug!(connection_id = %connection.id, threads = list.threads.len(), "Listed threads for scheduled run");

    let ids = list.threads.iter().map(|t| t.id.clone()).collect();
    let synced = threads::sync_many(
        ctx.kv.as_ref(),
        driver.as_ref(),
        &connection.id,
        ids,
        ctx.config.sync.thread_concurrency,
    )
    .await;

    let mut outcome = TriggerOutcome::default();
    outcome.failed.extend(synced.failed);
    for thread in &synced.succeeded {
        let data = TriggerData::from_thread(TriggerKind::Schedule, &connection.id, thread)
            .with_tick(occurrence);
        outcome.merge(match_workflow(ctx, workflow, thread, &data).await);
    }
    Ok((list.threads.len(), outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::save_workflow;
    use crate::queue::{JobStatus, WORKFLOW_EXECUTION_QUEUE};
    use crate::testing::{self, scheduled_workflow, FakeMailDriver};

    #[tokio::test]
    async fn test_occurrence_creates_executions_once() {
        let driver = FakeMailDriver::new();
        driver.seed(testing::thread("t1", 1, "a@b.c", "One", &["INBOX"]));
        driver.seed(testing::thread("t2", 2, "a@b.c", "Two", &["INBOX"]));
        driver.seed(testing::thread("t3", 3, "a@b.c", "Spam", &["SPAM"]));
        let ctx = testing::context(driver);
        testing::seed_connection(&ctx).await;
        save_workflow(&ctx, &scheduled_workflow("wf-sweep", "0 * * * *"))
            .await
            .unwrap();

        let job = ScheduledWorkflowJob {
            workflow_id: "wf-sweep".into(),
        };
        let first = run_scheduled_workflow(&ctx, &job, "repeat:a:1").await.unwrap();
        assert_eq!(first.connections, 1);
        assert_eq!(first.threads, 2);
        assert_eq!(first.triggers.created.len(), 2);
        // The listing is served from the thread list cache on later runs
        assert_eq!(ctx.cache.len().await, 1);

        let retried = run_scheduled_workflow(&ctx, &job, "repeat:a:1").await.unwrap();
        assert!(retried.triggers.created.is_empty());
        assert_eq!(retried.triggers.duplicates, 2);

        let next = run_scheduled_workflow(&ctx, &job, "repeat:a:2").await.unwrap();
        assert_eq!(next.triggers.created.len(), 2);

        let waiting = ctx
            .queue
            .jobs_in_state(WORKFLOW_EXECUTION_QUEUE, JobStatus::Waiting, 10)
            .unwrap();
        assert_eq!(waiting.len(), 4);
    }

    #[tokio::test]
    async fn test_disabled_workflow_drops_its_schedule() {
        let ctx = testing::context(FakeMailDriver::new());
        let mut workflow = scheduled_workflow("wf-off", "0 * * * *");
        save_workflow(&ctx, &workflow).await.unwrap();
        // Disabled behind the scheduler's back
        workflow.is_enabled = false;
        ctx.workflows.save_workflow(&workflow).await.unwrap();

        let job = ScheduledWorkflowJob {
            workflow_id: "wf-off".into(),
        };
        let result = run_scheduled_workflow(&ctx, &job, "repeat:x:1").await.unwrap();
        assert!(result.unscheduled);
        assert!(ctx.scheduler.list().unwrap().is_empty());
    }
}
