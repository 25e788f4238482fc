//! `process-scheduled-emails` processor
//!
//! Moves scheduled emails due within the window onto the send queue, each
//! delayed until its send time. The send job id is derived from the email
//! id, so a rescan never queues the same email twice.

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::queue::job::{JobPayload, ProcessScheduledEmailsJob, SendEmailJob};
use crate::queue::JobOverrides;
use crate::state::JobContext;
use crate::types::{FailedItem, ScheduledEmail, ScheduledEmailStatus, Settled};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    pub queued: Vec<String>,
    pub failed: Vec<FailedItem>,
}

pub fn send_job_id(email_id: &str) -> String {
    format!("send-{}", email_id)
}

async fn queue_one(ctx: &JobContext, email: &ScheduledEmail) -> Result<String> {
    let delay = (email.send_at - Utc::now()).to_std().unwrap_or_default();
    let job = SendEmailJob::from_email(&email.id, &email.connection_id, &email.email);
    let id = ctx.queue.enqueue(
        JobPayload::SendEmail(job),
        JobOverrides::default().job_id(send_job_id(&email.id)).delay(delay),
    )?;
    ctx.scheduled_emails
        .mark_scheduled_email(&email.id, ScheduledEmailStatus::Queued)
        .await?;
    debug!(email_id = %email.id, job_id = %id, ?delay, "Scheduled email queued");
    Ok(id)
}

pub async fn run_process_scheduled_emails(
    ctx: &JobContext,
    job: &ProcessScheduledEmailsJob,
) -> Result<ScanResult> {
    let until = Utc::now() + chrono::Duration::hours(job.window_hours as i64);
    let due = ctx
        .scheduled_emails
        .due_scheduled_emails(until, job.batch_size.max(1))
        .await?;

    let mut settled: Settled<String> = Settled::new();
    for email in &due {
        let result = queue_one(ctx, email).await;
        if let Err(e) = &result {
            warn!(email_id = %email.id, "Failed to queue scheduled email: {}", e);
        }
        settled.record(email.id.clone(), result);
    }

    if !due.is_empty() {
        info!(
            queued = settled.succeeded.len(),
            failed = settled.failed.len(),
            "Scheduled emails processed"
        );
    }
    Ok(ScanResult {
        queued: settled.succeeded,
        failed: settled.failed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{JobStatus, SEND_EMAIL_QUEUE};
    use crate::testing::{self, FakeMailDriver, CONNECTION};
    use crate::types::OutgoingEmail;

    fn scheduled(id: &str, in_minutes: i64) -> ScheduledEmail {
        ScheduledEmail {
            id: id.into(),
            connection_id: CONNECTION.into(),
            email: OutgoingEmail {
                to: vec!["bob@example.com".into()],
                subject: format!("Scheduled {}", id),
                body: "Later".into(),
                ..Default::default()
            },
            send_at: Utc::now() + chrono::Duration::minutes(in_minutes),
            status: ScheduledEmailStatus::Scheduled,
        }
    }

    fn scan(batch_size: u32) -> ProcessScheduledEmailsJob {
        ProcessScheduledEmailsJob {
            batch_size,
            window_hours: 1,
        }
    }

    #[tokio::test]
    async fn test_due_emails_queued_once_and_marked() {
        let ctx = testing::context(FakeMailDriver::new());
        for email in [scheduled("soon", 10), scheduled("late", 600), scheduled("past", -5)] {
            ctx.scheduled_emails.save_scheduled_email(&email).await.unwrap();
        }

        let result = run_process_scheduled_emails(&ctx, &scan(10)).await.unwrap();
        assert_eq!(result.queued, vec!["send-past", "send-soon"]);
        assert!(result.failed.is_empty());

        let soon = ctx.queue.get_job("send-soon").unwrap().unwrap();
        assert_eq!(soon.status, JobStatus::Delayed);
        let past = ctx.queue.get_job("send-past").unwrap().unwrap();
        assert_eq!(past.status, JobStatus::Waiting);

        let stored = ctx.scheduled_emails.get_scheduled_email("soon").await.unwrap().unwrap();
        assert_eq!(stored.status, ScheduledEmailStatus::Queued);
        let late = ctx.scheduled_emails.get_scheduled_email("late").await.unwrap().unwrap();
        assert_eq!(late.status, ScheduledEmailStatus::Scheduled);

        let again = run_process_scheduled_emails(&ctx, &scan(10)).await.unwrap();
        assert!(again.queued.is_empty());
        let counts = ctx.queue.counts(SEND_EMAIL_QUEUE).unwrap();
        assert_eq!(counts.waiting + counts.delayed, 2);
    }

    #[tokio::test]
    async fn test_batch_size_limits_scan() {
        let ctx = testing::context(FakeMailDriver::new());
        for i in 0..3 {
            ctx.scheduled_emails
                .save_scheduled_email(&scheduled(&format!("e{}", i), i))
                .await
                .unwrap();
        }
        let result = run_process_scheduled_emails(&ctx, &scan(2)).await.unwrap();
        assert_eq!(result.queued.len(), 2);
    }
}
