//! Incremental sync driven by the provider's change log
//!
//! One run per signal (push, poll or explicit request):
//!
//! 1. no stored cursor: queue a full sync and stop
//! 2. take the lock `history_{connection}__{cursor}`; if someone holds it,
//!    they are already doing this work, so stop with nothing done
//! 3. read the change log from the cursor; an expired cursor resets the
//!    baseline and stops, which is not a failure
//! 4. sync new threads concurrently, then apply label deltas in order,
//!    collecting per-thread failures instead of aborting
//! 5. drop cached listings, fire triggers for what changed
//! 6. move the cursor forward (never backwards) and release the lock

use serde::Serialize;
use tracing::{debug, info, warn};

use super::history::{is_newer, partition_history};
use super::threads::{self, AppliedDelta};
use crate::backend::MailDriver;
use crate::engine::trigger::{self, TriggerOutcome};
use crate::error::Result;
use crate::queue::job::{JobPayload, SyncCoordinatorJob, SyncThreadsJob};
use crate::queue::JobOverrides;
use crate::state::JobContext;
use crate::types::{
    Connection, FailedItem, ListQuery, Settled, ThreadDetail, TriggerData, TriggerKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    /// No cursor yet; a full sync was queued
    FullSync,
    /// The change log was processed
    History,
    /// Another run holds the lock for this cursor
    AlreadyLocked,
    /// The pushed history id is not newer than the stored cursor
    UpToDate,
    /// The cursor had expired and was replaced by a fresh baseline
    BaselineReset,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub strategy: SyncStrategy,
    /// Cursor stored when the run finished
    pub cursor: Option<String>,
    pub new_threads: usize,
    pub synced_threads: usize,
    pub failed_threads: Vec<FailedItem>,
    pub label_updates: usize,
    pub failed_label_updates: Vec<FailedItem>,
    pub triggers: TriggerOutcome,
}

impl SyncSummary {
    fn nothing(strategy: SyncStrategy, cursor: Option<String>) -> Self {
        Self {
            strategy,
            cursor,
            new_threads: 0,
            synced_threads: 0,
            failed_threads: Vec::new(),
            label_updates: 0,
            failed_label_updates: Vec::new(),
            triggers: TriggerOutcome::default(),
        }
    }
}

pub fn lock_key(connection_id: &str, cursor: &str) -> String {
    format!("history_{}__{}", connection_id, cursor)
}

pub async fn run_coordinator(ctx: &JobContext, job: &SyncCoordinatorJob) -> Result<SyncSummary> {
    let connection = ctx.owned_connection(&job.user_id, &job.connection_id).await?;
    let kv = ctx.kv.as_ref();

    let Some(cursor) = threads::load_cursor(kv, &connection.id).await? else {
        let full = SyncThreadsJob {
            user_id: connection.user_id.clone(),
            connection_id: connection.id.clone(),
            history_id: None,
            page_token: None,
            full_sync: true,
            max_results: ctx.config.sync.page_size,
        };
        ctx.queue.enqueue(
            JobPayload::SyncThreads(full),
            JobOverrides::default().job_id(format!("full-sync-{}", connection.id)),
        )?;
        info!(connection_id = %connection.id, "No history cursor, queued full sync");
        return Ok(SyncSummary::nothing(SyncStrategy::FullSync, None));
    };

    if let Some(pushed) = &job.history_id {
        if !is_newer(pushed, &cursor) {
            debug!(connection_id = %connection.id, pushed = %pushed, cursor = %cursor, "Already up to date");
            return Ok(SyncSummary::nothing(SyncStrategy::UpToDate, Some(cursor)));
        }
    }

    let key = lock_key(&connection.id, &cursor);
    let Some(guard) = ctx.lock.try_lock(&key, ctx.lock_ttl())? else {
        info!(lock = %key, "History sync already in progress");
        return Ok(SyncSummary::nothing(SyncStrategy::AlreadyLocked, Some(cursor)));
    };

    // The guard releases on every exit path, errors included
    let result = sync_history(ctx, &connection, &cursor).await;
    if let Err(e) = guard.release() {
        warn!(lock = %key, "Failed to release lock: {}", e);
    }
    result
}

async fn sync_history(ctx: &JobContext, connection: &Connection, cursor: &str) -> Result<SyncSummary> {
    let driver = ctx.driver(connection).await?;
    let kv = ctx.kv.as_ref();

    let page = match driver.list_history(cursor).await {
        Ok(page) => page,
        Err(e) if e.is_history_expired() => {
            let baseline = reset_baseline(ctx, driver.as_ref(), connection).await?;
            warn!(connection_id = %connection.id, old = %cursor, new = %baseline, "History cursor expired, baseline reset");
            return Ok(SyncSummary::nothing(SyncStrategy::BaselineReset, Some(baseline)));
        }
        Err(e) => return Err(e),
    };

    let changes = partition_history(&page.history);
    debug!(
        connection_id = %connection.id,
        records = page.history.len(),
        new_threads = changes.new_threads.len(),
        label_deltas = changes.label_deltas.len(),
        "Partitioned history"
    );

    let new_ids = changes
        .new_threads
        .iter()
        .map(|t| t.thread_id.clone())
        .collect();
    let synced = threads::sync_many(
        kv,
        driver.as_ref(),
        &connection.id,
        new_ids,
        ctx.config.sync.thread_concurrency,
    )
    .await;
    for failure in &synced.failed {
        warn!(thread_id = %failure.item, "Thread sync failed: {}", failure.error);
    }

    let mut applied: Settled<AppliedDelta> = Settled::new();
    for delta in &changes.label_deltas {
        let result = threads::apply_label_delta(kv, driver.as_ref(), &connection.id, delta).await;
        if let Err(e) = &result {
            warn!(thread_id = %delta.thread_id, "Label update failed: {}", e);
        }
        applied.record(delta.thread_id.clone(), result);
    }

    if !changes.is_empty() {
        ctx.cache.invalidate(&connection.id).await;
    }

    let triggers = fire_triggers(ctx, connection, &synced.succeeded, &applied.succeeded, &page.history_id).await;

    let stored = advance_cursor(ctx, &connection.id, &page.history_id).await?;

    let summary = SyncSummary {
        strategy: SyncStrategy::History,
        cursor: Some(stored),
        new_threads: changes.new_threads.len(),
        synced_threads: synced.succeeded.len(),
        failed_threads: synced.failed,
        label_updates: applied.succeeded.iter().filter(|d| !d.is_empty()).count(),
        failed_label_updates: applied.failed,
        triggers,
    };
    info!(
        connection_id = %connection.id,
        synced = summary.synced_threads,
        failed = summary.failed_threads.len(),
        labels = summary.label_updates,
        executions = summary.triggers.created.len(),
        "History sync done"
    );
    Ok(summary)
}

async fn fire_triggers(
    ctx: &JobContext,
    connection: &Connection,
    new_threads: &[ThreadDetail],
    label_changes: &[AppliedDelta],
    history_id: &str,
) -> TriggerOutcome {
    let mut outcome = TriggerOutcome::default();

    let received = new_threads
        .iter()
        .map(|thread| (thread, TriggerData::from_thread(TriggerKind::EmailReceived, &connection.id, thread)));
    let labeled = label_changes
        .iter()
        .filter(|delta| !delta.added.is_empty())
        .map(|delta| {
            let mut data = TriggerData::from_thread(TriggerKind::EmailLabeled, &connection.id, &delta.thread)
                .with_label_changes(delta.added.clone(), delta.removed.clone());
            data.history_id = Some(history_id.to_string());
            (&delta.thread, data)
        });

    for (thread, data) in received.chain(labeled).collect::<Vec<_>>() {
        match trigger::match_and_enqueue(ctx, connection, thread, &data).await {
            Ok(result) => outcome.merge(result),
            Err(e) => {
                warn!(thread_id = %thread.id, "Trigger evaluation failed: {}", e);
                outcome.failed.push(FailedItem {
                    item: thread.id.clone(),
                    error: e.to_string(),
                });
            }
        }
    }
    outcome
}

/// Store `candidate` unless the stored cursor is already at or past it.
/// Returns the cursor stored afterwards.
async fn advance_cursor(ctx: &JobContext, connection_id: &str, candidate: &str) -> Result<String> {
    let kv = ctx.kv.as_ref();
    match threads::load_cursor(kv, connection_id).await? {
        Some(current) if !is_newer(candidate, &current) => Ok(current),
        _ => {
            threads::store_cursor(kv, connection_id, candidate).await?;
            debug!(connection_id = %connection_id, cursor = %candidate, "History cursor advanced");
            Ok(candidate.to_string())
        }
    }
}

/// Replace an expired cursor with one taken from the newest thread.
async fn reset_baseline(ctx: &JobContext, driver: &dyn MailDriver, connection: &Connection) -> Result<String> {
    let query = ListQuery::folder(&ctx.config.sync.default_folder).max_results(1);
    let list = driver.list(&query).await?;
    let baseline = threads::baseline_from(driver, &list).await?;
    threads::store_cursor(ctx.kv.as_ref(), &connection.id, &baseline).await?;
    Ok(baseline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::job::SyncTrigger;
    use crate::queue::{THREAD_SYNC_QUEUE, WORKFLOW_EXECUTION_QUEUE};
    use crate::testing::{self, FakeMailDriver, CONNECTION, USER};
    use crate::types::workflow::{
        ActionNode, EmailLabeledParams, EmailReceivedParams, NoParams,
    };
    use crate::types::{NodeKind, TriggerNode, Workflow, WorkflowConnections, WorkflowNode};

    fn job(history_id: Option<&str>) -> SyncCoordinatorJob {
        SyncCoordinatorJob {
            user_id: USER.into(),
            connection_id: CONNECTION.into(),
            trigger_type: SyncTrigger::HistorySync,
            history_id: history_id.map(str::to_string),
        }
    }

    fn workflow(id: &str, trigger: TriggerNode) -> Workflow {
        let mut connections = WorkflowConnections::default();
        connections.connect("trigger", 0, "read");
        Workflow {
            id: id.into(),
            user_id: USER.into(),
            connection_id: Some(CONNECTION.into()),
            name: id.into(),
            nodes: vec![
                WorkflowNode::new("trigger", "Trigger", NodeKind::Trigger(trigger)),
                WorkflowNode::new(
                    "read",
                    "Mark read",
                    NodeKind::Action(ActionNode::MarkRead(NoParams {})),
                ),
            ],
            connections,
            is_enabled: true,
        }
    }

    /// Context with one stored thread and a cursor at its history id.
    async fn synced_context(driver: &std::sync::Arc<FakeMailDriver>) -> JobContext {
        let thread = testing::thread("t0", 10, "old@example.com", "Old", &["INBOX"]);
        driver.seed(thread.clone());
        let ctx = testing::context(driver.clone());
        testing::seed_connection(&ctx).await;
        threads::store_thread(ctx.kv.as_ref(), CONNECTION, &thread).await.unwrap();
        threads::store_cursor(ctx.kv.as_ref(), CONNECTION, "10").await.unwrap();
        ctx
    }

    #[tokio::test]
    async fn test_missing_cursor_queues_full_sync() {
        let ctx = testing::context(FakeMailDriver::new());
        testing::seed_connection(&ctx).await;

        let summary = run_coordinator(&ctx, &job(None)).await.unwrap();
        assert_eq!(summary.strategy, SyncStrategy::FullSync);
        run_coordinator(&ctx, &job(None)).await.unwrap();
        assert_eq!(ctx.queue.counts(THREAD_SYNC_QUEUE).unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_new_threads_synced_triggered_and_cursor_advanced() {
        let driver = FakeMailDriver::new();
        let ctx = synced_context(&driver).await;
        ctx.workflows
            .save_workflow(&workflow(
                "wf-received",
                TriggerNode::EmailReceived(EmailReceivedParams::default()),
            ))
            .await
            .unwrap();

        driver.deliver(testing::thread("t1", 0, "a@example.com", "One", &["INBOX", "UNREAD"]));
        driver.deliver(testing::thread("t2", 0, "b@example.com", "Two", &["INBOX"]));

        let summary = run_coordinator(&ctx, &job(None)).await.unwrap();
        assert_eq!(summary.strategy, SyncStrategy::History);
        assert_eq!(summary.new_threads, 2);
        assert_eq!(summary.synced_threads, 2);
        assert_eq!(summary.triggers.created.len(), 2);
        assert_eq!(summary.cursor.as_deref(), Some("12"));
        assert_eq!(
            threads::load_cursor(ctx.kv.as_ref(), CONNECTION).await.unwrap().as_deref(),
            Some("12")
        );
        assert!(threads::stored_thread(ctx.kv.as_ref(), CONNECTION, "t2").await.unwrap().is_some());
        assert_eq!(ctx.queue.counts(WORKFLOW_EXECUTION_QUEUE).unwrap().waiting, 2);
        assert!(!ctx.lock.is_locked(&lock_key(CONNECTION, "10")).unwrap());
    }

    #[tokio::test]
    async fn test_rerun_with_unchanged_cursor_is_idempotent() {
        let driver = FakeMailDriver::new();
        let ctx = synced_context(&driver).await;
        driver.deliver(testing::thread("t1", 0, "a@example.com", "One", &["INBOX"]));
        driver.relabel("t0", &["Work"], &[]);

        let first = run_coordinator(&ctx, &job(None)).await.unwrap();
        assert_eq!(first.synced_threads, 1);
        assert_eq!(first.label_updates, 1);

        let second = run_coordinator(&ctx, &job(None)).await.unwrap();
        assert_eq!(second.strategy, SyncStrategy::History);
        assert_eq!(second.new_threads, 0);
        assert_eq!(second.synced_threads, 0);
        assert_eq!(second.label_updates, 0);
        assert_eq!(second.cursor, first.cursor);

        // Replaying the same change log applies nothing new either
        threads::store_cursor(ctx.kv.as_ref(), CONNECTION, "10").await.unwrap();
        let replay = run_coordinator(&ctx, &job(None)).await.unwrap();
        assert_eq!(replay.label_updates, 0);
        assert_eq!(replay.cursor, first.cursor);
    }

    #[tokio::test]
    async fn test_concurrent_runs_for_same_cursor_do_work_once() {
        let driver = FakeMailDriver::new();
        let ctx = synced_context(&driver).await;
        driver.deliver(testing::thread("t1", 0, "a@example.com", "One", &["INBOX"]));

        let (ja, jb) = (job(None), job(None));
        let (a, b) = tokio::join!(run_coordinator(&ctx, &ja), run_coordinator(&ctx, &jb));
        let (a, b) = (a.unwrap(), b.unwrap());

        let mut strategies = vec![a.strategy, b.strategy];
        strategies.sort_by_key(|s| *s == SyncStrategy::AlreadyLocked);
        assert_eq!(strategies, vec![SyncStrategy::History, SyncStrategy::AlreadyLocked]);
        let idle = if a.strategy == SyncStrategy::AlreadyLocked { &a } else { &b };
        assert_eq!(idle.new_threads + idle.synced_threads + idle.label_updates, 0);
        assert_eq!(driver.with(|mb| mb.history_calls), 1);
    }

    #[tokio::test]
    async fn test_expired_cursor_resets_baseline() {
        let driver = FakeMailDriver::new();
        let ctx = synced_context(&driver).await;
        driver.seed(testing::thread("t9", 500, "a@example.com", "Newest", &["INBOX"]));
        driver.with(|mb| mb.history_expired = true);

        let summary = run_coordinator(&ctx, &job(None)).await.unwrap();
        assert_eq!(summary.strategy, SyncStrategy::BaselineReset);
        assert_eq!(summary.new_threads, 0);
        assert_eq!(summary.cursor.as_deref(), Some("500"));
        assert_eq!(
            threads::load_cursor(ctx.kv.as_ref(), CONNECTION).await.unwrap().as_deref(),
            Some("500")
        );
        assert!(!ctx.lock.is_locked(&lock_key(CONNECTION, "10")).unwrap());
    }

    #[tokio::test]
    async fn test_one_failing_thread_does_not_fail_the_batch() {
        let driver = FakeMailDriver::new();
        let ctx = synced_context(&driver).await;
        driver.deliver(testing::thread("t1", 0, "a@example.com", "One", &["INBOX"]));
        driver.deliver(testing::thread("t2", 0, "b@example.com", "Two", &["INBOX"]));
        driver.with(|mb| mb.failing_threads.insert("t1".into()));

        let summary = run_coordinator(&ctx, &job(None)).await.unwrap();
        assert_eq!(summary.synced_threads, 1);
        assert_eq!(summary.failed_threads.len(), 1);
        assert_eq!(summary.failed_threads[0].item, "t1");
        assert_eq!(summary.cursor.as_deref(), Some("12"));
    }

    #[tokio::test]
    async fn test_label_addition_fires_labeled_trigger() {
        let driver = FakeMailDriver::new();
        let ctx = synced_context(&driver).await;
        ctx.workflows
            .save_workflow(&workflow(
                "wf-labeled",
                TriggerNode::EmailLabeled(EmailLabeledParams {
                    labels: vec!["Work".into()],
                }),
            ))
            .await
            .unwrap();
        driver.relabel("t0", &["Work"], &[]);

        let summary = run_coordinator(&ctx, &job(None)).await.unwrap();
        assert_eq!(summary.label_updates, 1);
        assert_eq!(summary.triggers.matched, 1);
        assert_eq!(summary.triggers.created.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_push_is_ignored() {
        let driver = FakeMailDriver::new();
        let ctx = synced_context(&driver).await;
        let summary = run_coordinator(&ctx, &job(Some("9"))).await.unwrap();
        assert_eq!(summary.strategy, SyncStrategy::UpToDate);
        assert_eq!(driver.with(|mb| mb.history_calls), 0);
    }
}
