//! Job processors
//!
//! [`Dispatcher`] is the single [`JobHandler`] behind every worker. It
//! matches on the closed [`JobPayload`] enum, so each job kind has exactly
//! one processor and a new kind cannot be added without one.

pub mod maintenance;
pub mod scheduled_emails;
pub mod scheduled_workflow;
pub mod send_email;
pub mod subscription;
pub mod workflow_execution;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::error::Result;
use crate::queue::{Job, JobHandler, JobPayload};
use crate::state::JobContext;
use crate::sync::{coordinator, threads};

fn to_value<T: Serialize>(result: Result<T>) -> Result<Value> {
    Ok(serde_json::to_value(result?)?)
}

#[derive(Clone)]
pub struct Dispatcher {
    ctx: Arc<JobContext>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<JobContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &JobContext {
        &self.ctx
    }
}

#[async_trait]
impl JobHandler for Dispatcher {
    async fn handle(&self, job: &Job) -> Result<Value> {
        let ctx = self.ctx.as_ref();
        match &job.payload {
            JobPayload::SyncThreads(data) => to_value(threads::run_sync_threads(ctx, data).await),
            JobPayload::SyncCoordinator(data) => {
                to_value(coordinator::run_coordinator(ctx, data).await)
            }
            JobPayload::SendEmail(data) => to_value(send_email::run_send_email(ctx, data).await),
            JobPayload::SubscriptionRenewal(data) => {
                to_value(subscription::run_subscription_renewal(ctx, data).await)
            }
            JobPayload::ProcessScheduledEmails(data) => {
                to_value(scheduled_emails::run_process_scheduled_emails(ctx, data).await)
            }
            JobPayload::CleanupWorkflowExecutions(data) => {
                to_value(maintenance::run_cleanup(ctx, data).await)
            }
            JobPayload::PollNewEmails(_) => to_value(maintenance::run_poll_new_emails(ctx).await),
            JobPayload::ExecuteWorkflow(data) => {
                let last_attempt = job.attempts_made + 1 >= job.options.attempts;
                to_value(workflow_execution::run_execute_workflow(ctx, data, last_attempt).await)
            }
            // The job id names the occurrence and survives retries
            JobPayload::RunScheduledWorkflow(data) => {
                to_value(scheduled_workflow::run_scheduled_workflow(ctx, data, &job.id).await)
            }
        }
    }
}
