//! `send-email` processor

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{FlowError, Result};
use crate::queue::job::SendEmailJob;
use crate::state::JobContext;
use crate::types::ScheduledEmailStatus;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    pub message_id: String,
    pub scheduled: bool,
}

pub async fn run_send_email(ctx: &JobContext, job: &SendEmailJob) -> Result<SendResult> {
    if job.to.iter().all(|r| r.trim().is_empty()) {
        return Err(FlowError::InvalidInput(format!("email {} has no recipients", job.email_id)));
    }

    // A scheduled email cancelled or already sent since it was queued is left alone
    let scheduled = ctx.scheduled_emails.get_scheduled_email(&job.email_id).await?;
    if let Some(email) = &scheduled {
        if matches!(
            email.status,
            ScheduledEmailStatus::Sent | ScheduledEmailStatus::Cancelled
        ) {
            info!(email_id = %job.email_id, status = email.status.as_str(), "Scheduled email not sendable, skipping");
            return Ok(SendResult {
                message_id: String::new(),
                scheduled: true,
            });
        }
    }

    let connection = ctx.connection(&job.connection_id).await?;
    let driver = ctx.driver(&connection).await?;
    let sent = driver.send(&job.to_email()).await?;
    info!(email_id = %job.email_id, message_id = %sent.id, recipients = job.to.len(), "Email sent");

    if scheduled.is_some()
        && !ctx
            .scheduled_emails
            .mark_scheduled_email(&job.email_id, ScheduledEmailStatus::Sent)
            .await?
    {
        warn!(email_id = %job.email_id, "Scheduled email vanished before it could be marked sent");
    }

    Ok(SendResult {
        message_id: sent.id,
        scheduled: scheduled.is_some(),
    })
}
