//! Housekeeping jobs: execution cleanup and connection polling

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{FlowError, Result};
use crate::queue::job::{CleanupJob, JobPayload, SyncCoordinatorJob, SyncTrigger};
use crate::queue::JobOverrides;
use crate::state::JobContext;
use crate::types::{FailedItem, Settled};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResult {
    pub deleted: u64,
    pub cutoff: chrono::DateTime<Utc>,
}

pub async fn run_cleanup(ctx: &JobContext, job: &CleanupJob) -> Result<CleanupResult> {
    if job.retention_days == 0 {
        return Err(FlowError::InvalidInput("retention must be at least one day".into()));
    }
    let cutoff = Utc::now() - chrono::Duration::days(job.retention_days as i64);
    let deleted = ctx.workflows.delete_old_executions(cutoff).await?;
    info!(deleted, retention_days = job.retention_days, "Old workflow executions removed");
    Ok(CleanupResult { deleted, cutoff })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResult {
    pub queued: Vec<String>,
    pub failed: Vec<FailedItem>,
}

/// Queue a history sync for every active connection. One poll per minute
/// bucket and connection, so overlapping polls collapse.
pub async fn run_poll_new_emails(ctx: &JobContext) -> Result<PollResult> {
    let connections = ctx.connections.active_connections().await?;
    let bucket = Utc::now().timestamp() / 60;

    let mut settled: Settled<String> = Settled::new();
    for connection in &connections {
        let job = SyncCoordinatorJob {
            user_id: connection.user_id.clone(),
            connection_id: connection.id.clone(),
            trigger_type: SyncTrigger::HistorySync,
            history_id: None,
        };
        let result = ctx.queue.enqueue(
            JobPayload::SyncCoordinator(job),
            JobOverrides::default().job_id(format!("poll-{}-{}", connection.id, bucket)),
        );
        if let Err(e) = &result {
            warn!(connection_id = %connection.id, "Failed to queue poll: {}", e);
        }
        settled.record(connection.id.clone(), result);
    }

    debug!(connections = connections.len(), queued = settled.succeeded.len(), "Polled connections");
    Ok(PollResult {
        queued: settled.succeeded,
        failed: settled.failed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::SYNC_COORDINATOR_QUEUE;
    use crate::testing::{self, FakeMailDriver, USER};
    use crate::types::execution::TriggerData;
    use crate::types::{Connection, ExecutionPatch, ExecutionStatus, NewExecution, TriggerKind};

    #[tokio::test]
    async fn test_poll_queues_active_connections_only() {
        let ctx = testing::context(FakeMailDriver::new());
        testing::seed_connection(&ctx).await;
        let mut inactive = Connection::new("c2", USER, "other@example.com");
        inactive.is_active = false;
        ctx.connections.save_connection(&inactive).await.unwrap();

        let result = run_poll_new_emails(&ctx).await.unwrap();
        assert_eq!(result.queued.len(), 1);
        assert!(result.queued[0].starts_with("poll-c1-"));
        assert_eq!(ctx.queue.counts(SYNC_COORDINATOR_QUEUE).unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_recent_executions() {
        let ctx = testing::context(FakeMailDriver::new());
        let thread = testing::thread("t1", 1, "a@b.c", "Hi", &["INBOX"]);
        let new = NewExecution {
            workflow_id: "wf1".into(),
            thread_id: "t1".into(),
            connection_id: "c1".into(),
            trigger_data: TriggerData::from_thread(TriggerKind::EmailReceived, "c1", &thread),
        };
        let execution = ctx.workflows.create_workflow_execution(&new).await.unwrap().unwrap();
        ctx.workflows
            .update_workflow_execution(
                &execution.id,
                ExecutionPatch::finished(ExecutionStatus::Completed, Default::default(), None),
            )
            .await
            .unwrap();

        let result = run_cleanup(&ctx, &CleanupJob { retention_days: 30 }).await.unwrap();
        assert_eq!(result.deleted, 0);
        assert!(ctx.workflows.get_workflow_execution(&execution.id).await.unwrap().is_some());

        assert!(run_cleanup(&ctx, &CleanupJob { retention_days: 0 }).await.is_err());
    }
}
