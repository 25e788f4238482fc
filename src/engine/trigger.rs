//! Trigger matching
//!
//! For one thread event, find the enabled workflows whose trigger accepts
//! it, create one execution per workflow and queue it. The result lists
//! what was created, what already existed and what failed, so the sync
//! pipeline can report it instead of swallowing it.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::queue::job::{ExecuteWorkflowJob, JobPayload};
use crate::queue::JobOverrides;
use crate::state::JobContext;
use crate::types::{
    Connection, FailedItem, NewExecution, ThreadDetail, TriggerData, TriggerNode, Workflow,
    WorkflowExecution,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerOutcome {
    /// Workflows whose trigger accepted the event
    pub matched: usize,
    /// Ids of executions created and queued
    pub created: Vec<String>,
    /// Matches whose event already had an execution
    pub duplicates: usize,
    /// Unfinished executions among the duplicates, queued again
    pub requeued: Vec<String>,
    pub failed: Vec<FailedItem>,
}

impl TriggerOutcome {
    pub fn merge(&mut self, other: TriggerOutcome) {
        self.matched += other.matched;
        self.created.extend(other.created);
        self.duplicates += other.duplicates;
        self.requeued.extend(other.requeued);
        self.failed.extend(other.failed);
    }
}

/// Whether `trigger` fires for this event.
pub fn trigger_matches(trigger: &TriggerNode, data: &TriggerData, thread: &ThreadDetail) -> bool {
    if trigger.kind() != data.kind {
        return false;
    }
    match trigger {
        TriggerNode::EmailReceived(params) => match params.folder.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(folder) => {
                thread.has_label(folder) || data.labels.iter().any(|l| l.eq_ignore_ascii_case(folder))
            }
        },
        TriggerNode::EmailLabeled(params) => {
            if data.added_labels.is_empty() {
                return false;
            }
            params.labels.is_empty()
                || params.labels.iter().any(|wanted| {
                    data.added_labels
                        .iter()
                        .any(|added| added.eq_ignore_ascii_case(wanted))
                })
        }
        TriggerNode::Schedule(_) => true,
    }
}

enum Started {
    Created(String),
    /// The event already had an unfinished execution; its job was queued again
    Requeued(String),
    Duplicate,
}

fn enqueue_execution(ctx: &JobContext, execution: &WorkflowExecution) -> Result<()> {
    let job = ExecuteWorkflowJob {
        execution_id: execution.id.clone(),
        workflow_id: execution.workflow_id.clone(),
        connection_id: execution.connection_id.clone(),
        thread_id: execution.thread_id.clone(),
    };
    ctx.queue.enqueue(
        JobPayload::ExecuteWorkflow(job),
        JobOverrides::default().job_id(execution_job_id(&execution.id)),
    )?;
    Ok(())
}

pub fn execution_job_id(execution_id: &str) -> String {
    format!("execution-{}", execution_id)
}

async fn start_execution(
    ctx: &JobContext,
    workflow: &Workflow,
    data: &TriggerData,
) -> Result<Started> {
    let new = NewExecution {
        workflow_id: workflow.id.clone(),
        thread_id: data.thread_id.clone(),
        connection_id: data.connection_id.clone(),
        trigger_data: data.clone(),
    };
    if let Some(execution) = ctx.workflows.create_workflow_execution(&new).await? {
        enqueue_execution(ctx, &execution)?;
        return Ok(Started::Created(execution.id));
    }

    // The row may exist without its job if an earlier attempt stopped
    // between the insert and the enqueue. The job id is fixed per
    // execution, so queueing again is a no-op when the job is there.
    match ctx.workflows.find_execution_by_dedupe_key(&new.dedupe_key()).await? {
        Some(existing) if !existing.status.is_terminal() => {
            enqueue_execution(ctx, &existing)?;
            Ok(Started::Requeued(existing.id))
        }
        _ => Ok(Started::Duplicate),
    }
}

/// Match `data` against one workflow and start an execution when its
/// trigger accepts it. Failures are recorded in `outcome`.
async fn fire_workflow(
    ctx: &JobContext,
    workflow: &Workflow,
    thread: &ThreadDetail,
    data: &TriggerData,
    outcome: &mut TriggerOutcome,
) {
    let Some(trigger) = workflow.trigger() else {
        return;
    };
    if !trigger_matches(trigger, data, thread) {
        return;
    }
    outcome.matched += 1;

    match start_execution(ctx, workflow, data).await {
        Ok(Started::Created(id)) => {
            info!(workflow_id = %workflow.id, execution_id = %id, thread_id = %data.thread_id, "Workflow triggered");
            outcome.created.push(id);
        }
        Ok(Started::Requeued(id)) => {
            debug!(workflow_id = %workflow.id, execution_id = %id, "Unfinished execution queued again");
            outcome.duplicates += 1;
            outcome.requeued.push(id);
        }
        Ok(Started::Duplicate) => {
            debug!(workflow_id = %workflow.id, thread_id = %data.thread_id, "Execution already exists for this event");
            outcome.duplicates += 1;
        }
        Err(e) => {
            warn!(workflow_id = %workflow.id, "Failed to start execution: {}", e);
            outcome.failed.push(FailedItem {
                item: workflow.id.clone(),
                error: e.to_string(),
            });
        }
    }
}

/// Match `data` against every enabled workflow of the connection. Only a
/// failure to load the workflows is returned as an error; per-workflow
/// failures are collected in the outcome.
pub async fn match_and_enqueue(
    ctx: &JobContext,
    connection: &Connection,
    thread: &ThreadDetail,
    data: &TriggerData,
) -> Result<TriggerOutcome> {
    let workflows = ctx.workflows.enabled_workflows_for_connection(connection).await?;
    let mut outcome = TriggerOutcome::default();
    for workflow in &workflows {
        fire_workflow(ctx, workflow, thread, data, &mut outcome).await;
    }
    Ok(outcome)
}

/// Same as [`match_and_enqueue`] for a single, already loaded workflow.
/// Schedule triggers use this: each registration belongs to one workflow.
pub async fn match_workflow(
    ctx: &JobContext,
    workflow: &Workflow,
    thread: &ThreadDetail,
    data: &TriggerData,
) -> TriggerOutcome {
    let mut outcome = TriggerOutcome::default();
    fire_workflow(ctx, workflow, thread, data, &mut outcome).await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::WORKFLOW_EXECUTION_QUEUE;
    use crate::testing::{self, FakeMailDriver};
    use crate::types::workflow::{
        ActionNode, EmailLabeledParams, EmailReceivedParams, NoParams, ScheduleParams,
    };
    use crate::types::{ExecutionPatch, NodeKind, TriggerKind, WorkflowConnections, WorkflowNode};

    fn workflow(id: &str, trigger: TriggerNode) -> Workflow {
        let mut connections = WorkflowConnections::default();
        connections.connect("trigger", 0, "archive");
        Workflow {
            id: id.into(),
            user_id: testing::USER.into(),
            connection_id: None,
            name: id.into(),
            nodes: vec![
                WorkflowNode::new("trigger", "Trigger", NodeKind::Trigger(trigger)),
                WorkflowNode::new(
                    "archive",
                    "Archive",
                    NodeKind::Action(ActionNode::Archive(NoParams {})),
                ),
            ],
            connections,
            is_enabled: true,
        }
    }

    fn received(folder: Option<&str>) -> TriggerNode {
        TriggerNode::EmailReceived(EmailReceivedParams {
            folder: folder.map(str::to_string),
        })
    }

    #[test]
    fn test_folder_filter() {
        let thread = testing::thread("t1", 1, "a@b.c", "Hi", &["INBOX"]);
        let data = TriggerData::from_thread(TriggerKind::EmailReceived, "c1", &thread);
        assert!(trigger_matches(&received(None), &data, &thread));
        assert!(trigger_matches(&received(Some("inbox")), &data, &thread));
        assert!(!trigger_matches(&received(Some("SPAM")), &data, &thread));
        assert!(!trigger_matches(
            &TriggerNode::Schedule(ScheduleParams::default()),
            &data,
            &thread
        ));
    }

    #[test]
    fn test_label_trigger_needs_matching_addition() {
        let thread = testing::thread("t1", 1, "a@b.c", "Hi", &["INBOX", "Work"]);
        let labeled = |labels: &[&str]| {
            TriggerNode::EmailLabeled(EmailLabeledParams {
                labels: labels.iter().map(|l| l.to_string()).collect(),
            })
        };
        let data = TriggerData::from_thread(TriggerKind::EmailLabeled, "c1", &thread)
            .with_label_changes(vec!["Work".into()], Vec::new());

        assert!(trigger_matches(&labeled(&[]), &data, &thread));
        assert!(trigger_matches(&labeled(&["work"]), &data, &thread));
        assert!(!trigger_matches(&labeled(&["Finance"]), &data, &thread));

        let removal_only = TriggerData::from_thread(TriggerKind::EmailLabeled, "c1", &thread)
            .with_label_changes(Vec::new(), vec!["INBOX".into()]);
        assert!(!trigger_matches(&labeled(&[]), &removal_only, &thread));
    }

    #[tokio::test]
    async fn test_one_event_many_workflows_once_each() {
        let ctx = testing::context(FakeMailDriver::new());
        let connection = testing::seed_connection(&ctx).await;
        for wf in [
            workflow("wf-any", received(None)),
            workflow("wf-inbox", received(Some("INBOX"))),
            workflow("wf-spam", received(Some("SPAM"))),
        ] {
            ctx.workflows.save_workflow(&wf).await.unwrap();
        }

        let thread = testing::thread("t1", 7, "a@b.c", "Hi", &["INBOX"]);
        let data = TriggerData::from_thread(TriggerKind::EmailReceived, &connection.id, &thread);

        let first = match_and_enqueue(&ctx, &connection, &thread, &data).await.unwrap();
        assert_eq!(first.matched, 2);
        assert_eq!(first.created.len(), 2);
        assert!(first.failed.is_empty());
        assert_eq!(ctx.queue.counts(WORKFLOW_EXECUTION_QUEUE).unwrap().waiting, 2);

        let again = match_and_enqueue(&ctx, &connection, &thread, &data).await.unwrap();
        assert_eq!(again.matched, 2);
        assert!(again.created.is_empty());
        assert_eq!(again.duplicates, 2);
        assert_eq!(again.requeued.len(), 2);
        assert_eq!(ctx.queue.counts(WORKFLOW_EXECUTION_QUEUE).unwrap().waiting, 2);
    }

    #[tokio::test]
    async fn test_execution_without_job_is_queued_on_redelivery() {
        let ctx = testing::context(FakeMailDriver::new());
        let connection = testing::seed_connection(&ctx).await;
        ctx.workflows
            .save_workflow(&workflow("wf-any", received(None)))
            .await
            .unwrap();

        let thread = testing::thread("t1", 7, "a@b.c", "Hi", &["INBOX"]);
        let data = TriggerData::from_thread(TriggerKind::EmailReceived, &connection.id, &thread);
        // Row written, job never queued
        let orphan = ctx
            .workflows
            .create_workflow_execution(&NewExecution {
                workflow_id: "wf-any".into(),
                thread_id: "t1".into(),
                connection_id: connection.id.clone(),
                trigger_data: data.clone(),
            })
            .await
            .unwrap()
            .unwrap();
        assert!(ctx.queue.get_job(&execution_job_id(&orphan.id)).unwrap().is_none());

        let outcome = match_and_enqueue(&ctx, &connection, &thread, &data).await.unwrap();
        assert!(outcome.created.is_empty());
        assert_eq!(outcome.duplicates, 1);
        assert_eq!(outcome.requeued, vec![orphan.id.clone()]);
        assert!(ctx.queue.get_job(&execution_job_id(&orphan.id)).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_finished_execution_is_not_queued_again() {
        let ctx = testing::context(FakeMailDriver::new());
        let connection = testing::seed_connection(&ctx).await;
        ctx.workflows
            .save_workflow(&workflow("wf-any", received(None)))
            .await
            .unwrap();

        let thread = testing::thread("t1", 7, "a@b.c", "Hi", &["INBOX"]);
        let data = TriggerData::from_thread(TriggerKind::EmailReceived, &connection.id, &thread);
        let first = match_and_enqueue(&ctx, &connection, &thread, &data).await.unwrap();
        let id = first.created[0].clone();
        ctx.workflows
            .update_workflow_execution(&id, ExecutionPatch::failed("boom"))
            .await
            .unwrap();
        ctx.queue.remove_job(&execution_job_id(&id)).unwrap();

        let again = match_and_enqueue(&ctx, &connection, &thread, &data).await.unwrap();
        assert_eq!(again.duplicates, 1);
        assert!(again.requeued.is_empty());
        assert!(ctx.queue.get_job(&execution_job_id(&id)).unwrap().is_none());
    }
}
