//! Local thread state and the `sync-threads` job
//!
//! Synced threads live in the key-value store under `thread:{connection}:{thread}`
//! and the per-connection history cursor under `history_cursor:{connection}`.
//! Writing a thread is idempotent, so a re-delivered job only repeats work.

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backend::MailDriver;
use crate::error::Result;
use crate::queue::job::{JobPayload, SyncThreadsJob};
use crate::queue::JobOverrides;
use crate::state::JobContext;
use crate::store::KeyValueStore;
use crate::sync::history::LabelDelta;
use crate::types::{
    FailedItem, LabelModification, ListQuery, Settled, ThreadDetail, ThreadList,
};

pub fn thread_key(connection_id: &str, thread_id: &str) -> String {
    format!("thread:{}:{}", connection_id, thread_id)
}

pub fn cursor_key(connection_id: &str) -> String {
    format!("history_cursor:{}", connection_id)
}

pub async fn load_cursor(kv: &dyn KeyValueStore, connection_id: &str) -> Result<Option<String>> {
    kv.get(&cursor_key(connection_id)).await
}

pub async fn store_cursor(kv: &dyn KeyValueStore, connection_id: &str, cursor: &str) -> Result<()> {
    kv.put(&cursor_key(connection_id), cursor).await
}

pub async fn stored_thread(
    kv: &dyn KeyValueStore,
    connection_id: &str,
    thread_id: &str,
) -> Result<Option<ThreadDetail>> {
    match kv.get(&thread_key(connection_id, thread_id)).await? {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

pub async fn store_thread(kv: &dyn KeyValueStore, connection_id: &str, thread: &ThreadDetail) -> Result<()> {
    let json = serde_json::to_string(thread)?;
    kv.put(&thread_key(connection_id, &thread.id), &json).await
}

/// Fetch a thread from the provider and store it.
pub async fn sync_thread(
    kv: &dyn KeyValueStore,
    driver: &dyn MailDriver,
    connection_id: &str,
    thread_id: &str,
) -> Result<ThreadDetail> {
    let thread = driver.get(thread_id).await?;
    store_thread(kv, connection_id, &thread).await?;
    debug!(thread_id = %thread_id, messages = thread.messages.len(), "Synced thread");
    Ok(thread)
}

async fn sync_one(
    kv: &dyn KeyValueStore,
    driver: &dyn MailDriver,
    connection_id: &str,
    thread_id: String,
) -> (String, Result<ThreadDetail>) {
    let result = sync_thread(kv, driver, connection_id, &thread_id).await;
    (thread_id, result)
}

/// Fetch many threads with at most `concurrency` in flight. One failing
/// thread never aborts the others.
pub async fn sync_many(
    kv: &dyn KeyValueStore,
    driver: &dyn MailDriver,
    connection_id: &str,
    thread_ids: Vec<String>,
    concurrency: usize,
) -> Settled<ThreadDetail> {
    let fetches: Vec<_> = thread_ids
        .into_iter()
        .map(|thread_id| sync_one(kv, driver, connection_id, thread_id))
        .collect();
    stream::iter(fetches)
        .buffer_unordered(concurrency.max(1))
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect()
}

/// Label changes that actually altered the stored thread
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedDelta {
    pub thread: ThreadDetail,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl AppliedDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Apply a label delta to the stored copy of a thread. Labels already in the
/// requested state are left out of the result, so applying the same delta
/// twice reports nothing the second time. A thread not stored yet is
/// fetched; its provider state already reflects the delta.
pub async fn apply_label_delta(
    kv: &dyn KeyValueStore,
    driver: &dyn MailDriver,
    connection_id: &str,
    delta: &LabelDelta,
) -> Result<AppliedDelta> {
    let Some(mut thread) = stored_thread(kv, connection_id, &delta.thread_id).await? else {
        let thread = sync_thread(kv, driver, connection_id, &delta.thread_id).await?;
        return Ok(AppliedDelta {
            thread,
            added: delta.added.iter().cloned().collect(),
            removed: delta.removed.iter().cloned().collect(),
        });
    };

    let change = LabelModification {
        add_labels: delta.added.iter().cloned().collect(),
        remove_labels: delta.removed.iter().cloned().collect(),
    };
    let (added, removed) = apply_labels(&mut thread, &change);
    if !added.is_empty() || !removed.is_empty() {
        store_thread(kv, connection_id, &thread).await?;
    }
    Ok(AppliedDelta {
        thread,
        added,
        removed,
    })
}

/// Apply `change` to a thread in place. Returns the labels that were
/// really added and removed.
pub fn apply_labels(thread: &mut ThreadDetail, change: &LabelModification) -> (Vec<String>, Vec<String>) {
    let mut removed = Vec::new();
    for label in &change.remove_labels {
        if thread.has_label(label) {
            thread.labels.retain(|l| !l.eq_ignore_ascii_case(label));
            removed.push(label.clone());
        }
    }
    let mut added = Vec::new();
    for label in &change.add_labels {
        if !thread.has_label(label) {
            thread.labels.push(label.clone());
            added.push(label.clone());
        }
    }
    (added, removed)
}

/// Mirror a label change made by an action into the stored thread.
pub async fn record_labels(
    kv: &dyn KeyValueStore,
    connection_id: &str,
    thread_id: &str,
    change: &LabelModification,
) -> Result<()> {
    if let Some(mut thread) = stored_thread(kv, connection_id, thread_id).await? {
        let (added, removed) = apply_labels(&mut thread, change);
        if !added.is_empty() || !removed.is_empty() {
            store_thread(kv, connection_id, &thread).await?;
        }
    }
    Ok(())
}

/// Cursor marking "now" for a listing: the newest thread's history id, or
/// the mailbox's current one when the listing is empty.
pub async fn baseline_from(driver: &dyn MailDriver, list: &ThreadList) -> Result<String> {
    if let Some(first) = list.threads.first() {
        if let Some(id) = &first.history_id {
            return Ok(id.clone());
        }
        if let Some(id) = driver.get(&first.id).await?.history_id {
            return Ok(id);
        }
    }
    Ok(driver.watch().await?.history_id)
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSyncSummary {
    pub synced: usize,
    pub failed: Vec<FailedItem>,
    pub next_page_token: Option<String>,
    /// Cursor stored by this run, if it created the baseline
    pub baseline: Option<String>,
}

/// Process one `sync-threads` job: list a page of the default folder, store
/// every thread on it and, for a full sync, queue the next page. Full sync
/// never fires workflow triggers.
pub async fn run_sync_threads(ctx: &JobContext, job: &SyncThreadsJob) -> Result<ThreadSyncSummary> {
    let connection = ctx.owned_connection(&job.user_id, &job.connection_id).await?;
    let driver = ctx.driver(&connection).await?;
    let kv = ctx.kv.as_ref();

    let query = ListQuery::folder(&ctx.config.sync.default_folder)
        .max_results(job.max_results)
        .page_token(job.page_token.clone());
    let list = driver.list(&query).await?;

    let mut summary = ThreadSyncSummary::default();

    if job.page_token.is_none() && load_cursor(kv, &connection.id).await?.is_none() {
        let baseline = baseline_from(driver.as_ref(), &list).await?;
        store_cursor(kv, &connection.id, &baseline).await?;
        info!(connection_id = %connection.id, cursor = %baseline, "Stored baseline history cursor");
        summary.baseline = Some(baseline);
    }

    let ids: Vec<String> = list.threads.iter().map(|t| t.id.clone()).collect();
    let settled = sync_many(
        kv,
        driver.as_ref(),
        &connection.id,
        ids,
        ctx.config.sync.thread_concurrency,
    )
    .await;
    for failure in &settled.failed {
        warn!(thread_id = %failure.item, "Thread sync failed: {}", failure.error);
    }
    summary.synced = settled.succeeded.len();
    summary.failed = settled.failed;

    if job.full_sync {
        if let Some(token) = &list.next_page_token {
            let next = SyncThreadsJob {
                page_token: Some(token.clone()),
                ..job.clone()
            };
            ctx.queue.enqueue(
                JobPayload::SyncThreads(next),
                JobOverrides::default().job_id(format!("full-sync-{}-{}", connection.id, token)),
            )?;
            debug!(connection_id = %connection.id, page_token = %token, "Queued next full sync page");
        }
    }
    summary.next_page_token = list.next_page_token;

    info!(
        connection_id = %connection.id,
        synced = summary.synced,
        failed = summary.failed.len(),
        "Thread sync page done"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::THREAD_SYNC_QUEUE;
    use crate::testing::{self, FakeMailDriver, CONNECTION, USER};
    use std::collections::BTreeSet;

    fn full_sync(page_token: Option<String>) -> SyncThreadsJob {
        SyncThreadsJob {
            user_id: USER.into(),
            connection_id: CONNECTION.into(),
            history_id: None,
            page_token,
            full_sync: true,
            max_results: 2,
        }
    }

    #[tokio::test]
    async fn test_full_sync_pages_and_stores_baseline() {
        let driver = FakeMailDriver::new();
        for (i, id) in ["t1", "t2", "t3"].iter().enumerate() {
            driver.seed(testing::thread(id, 10 + i as u64, "a@b.c", "Hi", &["INBOX"]));
        }
        let ctx = testing::context(driver.clone());
        testing::seed_connection(&ctx).await;

        let summary = run_sync_threads(&ctx, &full_sync(None)).await.unwrap();
        assert_eq!(summary.synced, 2);
        assert_eq!(summary.next_page_token.as_deref(), Some("2"));
        // Newest thread first, so its history id is the baseline
        assert_eq!(summary.baseline.as_deref(), Some("12"));
        assert_eq!(
            load_cursor(ctx.kv.as_ref(), CONNECTION).await.unwrap().as_deref(),
            Some("12")
        );
        assert_eq!(ctx.queue.counts(THREAD_SYNC_QUEUE).unwrap().waiting, 1);

        let summary = run_sync_threads(&ctx, &full_sync(Some("2".into()))).await.unwrap();
        assert_eq!(summary.synced, 1);
        assert_eq!(summary.next_page_token, None);
        assert_eq!(summary.baseline, None);
        assert!(stored_thread(ctx.kv.as_ref(), CONNECTION, "t1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failing_thread_does_not_abort_page() {
        let driver = FakeMailDriver::new();
        driver.seed(testing::thread("t1", 1, "a@b.c", "One", &["INBOX"]));
        driver.seed(testing::thread("t2", 2, "a@b.c", "Two", &["INBOX"]));
        driver.with(|mb| mb.failing_threads.insert("t1".into()));
        let ctx = testing::context(driver.clone());
        testing::seed_connection(&ctx).await;

        let summary = run_sync_threads(&ctx, &full_sync(None)).await.unwrap();
        assert_eq!(summary.synced, 1);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].item, "t1");
    }

    #[tokio::test]
    async fn test_sync_for_foreign_user_is_rejected() {
        let ctx = testing::context(FakeMailDriver::new());
        testing::seed_connection(&ctx).await;
        let mut job = full_sync(None);
        job.user_id = "someone-else".into();
        let err = run_sync_threads(&ctx, &job).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_label_delta_applied_once() {
        let driver = FakeMailDriver::new();
        let ctx = testing::context(driver.clone());
        store_thread(
            ctx.kv.as_ref(),
            CONNECTION,
            &testing::thread("t1", 1, "a@b.c", "Hi", &["INBOX", "UNREAD"]),
        )
        .await
        .unwrap();

        let delta = LabelDelta {
            thread_id: "t1".into(),
            added: BTreeSet::from(["Work".to_string()]),
            removed: BTreeSet::from(["UNREAD".to_string(), "Missing".to_string()]),
        };
        let first = apply_label_delta(ctx.kv.as_ref(), driver.as_ref(), CONNECTION, &delta)
            .await
            .unwrap();
        assert_eq!(first.added, vec!["Work"]);
        assert_eq!(first.removed, vec!["UNREAD"]);

        let second = apply_label_delta(ctx.kv.as_ref(), driver.as_ref(), CONNECTION, &delta)
            .await
            .unwrap();
        assert!(second.is_empty());
        assert_eq!(second.thread.labels, vec!["INBOX", "Work"]);
    }
}
