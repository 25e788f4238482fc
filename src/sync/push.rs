//! Push notification intake

use tracing::{info, warn};

use crate::error::Result;
use crate::queue::job::{JobPayload, SyncCoordinatorJob, SyncTrigger};
use crate::queue::JobOverrides;
use crate::state::JobContext;
use crate::types::PushNotification;

/// Queue a coordinator run for the mailbox named in `notification`.
///
/// Returns the job id, or `None` when the address belongs to no active
/// connection. Repeated pushes for the same history id collapse into one job.
pub async fn handle_push(ctx: &JobContext, notification: &PushNotification) -> Result<Option<String>> {
    let email = notification.email_address.trim();
    let connection = match ctx.connections.find_connection_by_email(email).await? {
        Some(connection) if connection.is_active => connection,
        Some(_) => {
            warn!(email = %email, "Push for inactive connection ignored");
            return Ok(None);
        }
        None => {
            warn!(email = %email, "Push for unknown mailbox ignored");
            return Ok(None);
        }
    };

    let job = SyncCoordinatorJob {
        user_id: connection.user_id.clone(),
        connection_id: connection.id.clone(),
        trigger_type: SyncTrigger::Pubsub,
        history_id: Some(notification.history_id.clone()),
    };
    let id = ctx.queue.enqueue(
        JobPayload::SyncCoordinator(job),
        JobOverrides::default().job_id(format!("sync-{}-{}", connection.id, notification.history_id)),
    )?;
    info!(connection_id = %connection.id, history_id = %notification.history_id, "Push received, sync queued");
    Ok(Some(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::SYNC_COORDINATOR_QUEUE;
    use crate::testing::{self, FakeMailDriver, CONNECTION, EMAIL};
    use crate::types::Connection;

    fn push(email: &str, history_id: &str) -> PushNotification {
        PushNotification {
            email_address: email.into(),
            history_id: history_id.into(),
        }
    }

    #[tokio::test]
    async fn test_push_queues_one_coordinator_run_per_history_id() {
        let ctx = testing::context(FakeMailDriver::new());
        testing::seed_connection(&ctx).await;

        let id = handle_push(&ctx, &push(EMAIL, "42")).await.unwrap();
        assert_eq!(id.as_deref(), Some("sync-c1-42"));
        handle_push(&ctx, &push(EMAIL, "42")).await.unwrap();
        assert_eq!(ctx.queue.counts(SYNC_COORDINATOR_QUEUE).unwrap().waiting, 1);

        let job = ctx.queue.get_job("sync-c1-42").unwrap().unwrap();
        match job.payload {
            JobPayload::SyncCoordinator(job) => {
                assert_eq!(job.connection_id, CONNECTION);
                assert_eq!(job.trigger_type, SyncTrigger::Pubsub);
                assert_eq!(job.history_id.as_deref(), Some("42"));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_or_inactive_mailbox_is_ignored() {
        let ctx = testing::context(FakeMailDriver::new());
        assert_eq!(handle_push(&ctx, &push("nobody@example.com", "1")).await.unwrap(), None);

        let mut connection = Connection::new("c2", "u2", "off@example.com");
        connection.is_active = false;
        ctx.connections.save_connection(&connection).await.unwrap();
        assert_eq!(handle_push(&ctx, &push("off@example.com", "1")).await.unwrap(), None);
        assert_eq!(ctx.queue.counts(SYNC_COORDINATOR_QUEUE).unwrap().waiting, 0);
    }
}
