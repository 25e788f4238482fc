//! `subscription-renewal` processor
//!
//! Re-registers the provider push watch and books the next renewal ahead
//! of the new expiry. The renewal job id is fixed per connection, so a
//! connection never has more than one renewal pending. [`start_renewals`]
//! begins the chain for connections that have none pending.

use chrono::Utc;
use serde::Serialize;
use std::time::Duration;
use tracing::info;

use crate::error::{FlowError, Result};
use crate::queue::job::{JobStatus, SubscriptionRenewalJob};
use crate::queue::scheduler::renewal_job_id;
use crate::state::JobContext;
use crate::sync::threads;

/// Never renew sooner than this, even for a watch that is about to lapse
const MIN_RENEWAL_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewalResult {
    pub history_id: String,
    pub expiration: chrono::DateTime<Utc>,
    pub next_renewal_in_secs: u64,
    pub cursor_initialised: bool,
}

pub async fn run_subscription_renewal(
    ctx: &JobContext,
    job: &SubscriptionRenewalJob,
) -> Result<RenewalResult> {
    let connection = ctx.owned_connection(&job.user_id, &job.connection_id).await?;
    if !connection.email.eq_ignore_ascii_case(job.email.trim()) {
        return Err(FlowError::InvalidInput(format!(
            "renewal for {} does not match connection {}",
            job.email, connection.id
        )));
    }
    if !connection.is_active {
        // Not rescheduled, so the renewal chain ends here
        return Err(FlowError::InvalidInput(format!("connection {} is inactive", connection.id)));
    }

    let driver = ctx.driver(&connection).await?;
    let watch = driver.watch().await?;

    let kv = ctx.kv.as_ref();
    let cursor_initialised = threads::load_cursor(kv, &connection.id).await?.is_none();
    if cursor_initialised {
        threads::store_cursor(kv, &connection.id, &watch.history_id).await?;
    }

    let margin = chrono::Duration::seconds(ctx.config.schedules.renewal_margin_secs as i64);
    let delay = (watch.expiration - margin - Utc::now())
        .to_std()
        .unwrap_or(MIN_RENEWAL_DELAY)
        .max(MIN_RENEWAL_DELAY);
    ctx.scheduler
        .schedule_renewal(&connection.user_id, &connection.id, &connection.email, delay)?;

    info!(
        connection_id = %connection.id,
        expiration = %watch.expiration,
        next_in_secs = delay.as_secs(),
        "Push subscription renewed"
    );
    Ok(RenewalResult {
        history_id: watch.history_id,
        expiration: watch.expiration,
        next_renewal_in_secs: delay.as_secs(),
        cursor_initialised,
    })
}

/// Queue an immediate renewal for every active connection without a
/// pending one. Returns the connections a renewal was queued for.
pub async fn start_renewals(ctx: &JobContext) -> Result<Vec<String>> {
    let mut started = Vec::new();
    for connection in ctx.connections.active_connections().await? {
        let pending = ctx.queue.get_job(&renewal_job_id(&connection.id))?.is_some_and(|job| {
            matches!(job.status, JobStatus::Waiting | JobStatus::Delayed | JobStatus::Active)
        });
        if pending {
            continue;
        }
        ctx.scheduler.schedule_renewal(
            &connection.user_id,
            &connection.id,
            &connection.email,
            Duration::ZERO,
        )?;
        started.push(connection.id);
    }
    if !started.is_empty() {
        info!(connections = started.len(), "Started subscription renewals");
    }
    Ok(started)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::SUBSCRIPTION_RENEWAL_QUEUE;
    use crate::testing::{self, FakeMailDriver, CONNECTION, EMAIL, USER};
    use crate::types::Connection;

    fn job() -> SubscriptionRenewalJob {
        SubscriptionRenewalJob {
            user_id: USER.into(),
            connection_id: CONNECTION.into(),
            email: EMAIL.into(),
        }
    }

    #[tokio::test]
    async fn test_renewal_stores_cursor_and_reschedules_once() {
        let driver = FakeMailDriver::new();
        driver.with(|mb| mb.history_id = 77);
        let ctx = testing::context(driver.clone());
        testing::seed_connection(&ctx).await;

        let first = run_subscription_renewal(&ctx, &job()).await.unwrap();
        assert!(first.cursor_initialised);
        assert_eq!(
            threads::load_cursor(ctx.kv.as_ref(), CONNECTION).await.unwrap().as_deref(),
            Some("77")
        );
        // Seven day watch, one hour margin by default
        assert!(first.next_renewal_in_secs > 6 * 24 * 3600);

        let second = run_subscription_renewal(&ctx, &job()).await.unwrap();
        assert!(!second.cursor_initialised);
        assert_eq!(driver.with(|mb| mb.watch_calls), 2);

        let pending = ctx.queue.get_job(&renewal_job_id(CONNECTION)).unwrap().unwrap();
        assert_eq!(pending.status, JobStatus::Delayed);
        let counts = ctx.queue.counts(SUBSCRIPTION_RENEWAL_QUEUE).unwrap();
        assert_eq!(counts.waiting + counts.delayed, 1);
    }

    #[tokio::test]
    async fn test_foreign_user_is_rejected() {
        let ctx = testing::context(FakeMailDriver::new());
        testing::seed_connection(&ctx).await;
        let mut foreign = job();
        foreign.user_id = "someone-else".into();
        let err = run_subscription_renewal(&ctx, &foreign).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_start_renewals_once_per_active_connection() {
        let ctx = testing::context(FakeMailDriver::new());
        testing::seed_connection(&ctx).await;
        let mut inactive = Connection::new("c2", USER, "other@example.com");
        inactive.is_active = false;
        ctx.connections.save_connection(&inactive).await.unwrap();

        let started = start_renewals(&ctx).await.unwrap();
        assert_eq!(started, vec![CONNECTION.to_string()]);
        let pending = ctx.queue.get_job(&renewal_job_id(CONNECTION)).unwrap().unwrap();
        assert_eq!(pending.status, JobStatus::Waiting);

        // A restart leaves the pending renewal alone
        assert!(start_renewals(&ctx).await.unwrap().is_empty());
        assert_eq!(ctx.queue.counts(SUBSCRIPTION_RENEWAL_QUEUE).unwrap().waiting, 1);
    }
}
