//! Schedule triggers
//!
//! A workflow whose trigger is `schedule` owns one repeatable registration
//! named after it. [`save_workflow`] keeps that registration in step with
//! the workflow: added while it is enabled, replaced when the pattern
//! changes and removed once it is disabled or triggered by mail instead.

use tracing::info;

use crate::error::Result;
use crate::queue::job::{JobPayload, ScheduledWorkflowJob};
use crate::queue::scheduler::check_schedule;
use crate::queue::{RepeatableInfo, ScheduledJobConfig, Scheduler};
use crate::state::JobContext;
use crate::types::workflow::ScheduleParams;
use crate::types::{TriggerNode, Workflow};

pub fn schedule_name(workflow_id: &str) -> String {
    format!("workflow-schedule-{}", workflow_id)
}

/// Schedule parameters of an enabled, schedule-triggered workflow.
pub fn schedule_params(workflow: &Workflow) -> Option<&ScheduleParams> {
    if !workflow.is_enabled {
        return None;
    }
    match workflow.trigger()? {
        TriggerNode::Schedule(params) if params.cron.as_deref().is_some_and(|c| !c.trim().is_empty()) => {
            Some(params)
        }
        _ => None,
    }
}

/// The registration `workflow` should have, if any.
pub fn schedule_for(workflow: &Workflow) -> Option<ScheduledJobConfig> {
    let params = schedule_params(workflow)?;
    let cron = params.cron.as_deref()?.trim();
    let mut config = ScheduledJobConfig::new(
        schedule_name(&workflow.id),
        cron,
        JobPayload::RunScheduledWorkflow(ScheduledWorkflowJob {
            workflow_id: workflow.id.clone(),
        }),
    );
    config.timezone = params.timezone.clone();
    Some(config)
}

/// Register or remove the workflow's schedule to match its current state.
pub fn sync_schedule(scheduler: &Scheduler, workflow: &Workflow) -> Result<Option<RepeatableInfo>> {
    match schedule_for(workflow) {
        Some(config) => scheduler.schedule(config).map(Some),
        None => {
            if scheduler.remove(&schedule_name(&workflow.id))? {
                info!(workflow_id = %workflow.id, "Workflow schedule removed");
            }
            Ok(None)
        }
    }
}

/// Store a workflow and bring its schedule registration in line with it.
/// A bad cron pattern or timezone is rejected before anything is stored.
pub async fn save_workflow(ctx: &JobContext, workflow: &Workflow) -> Result<Option<RepeatableInfo>> {
    if let Some(config) = schedule_for(workflow) {
        check_schedule(&config.cron_pattern, config.timezone.as_deref())?;
    }
    ctx.workflows.save_workflow(workflow).await?;
    sync_schedule(&ctx.scheduler, workflow)
}
