//! Short-lived cache of thread listings
//!
//! Keyed by connection plus the full listing query. Entries expire after the
//! configured TTL and every entry of a connection is dropped when an action
//! mutates one of its threads.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::trace;

use crate::backend::MailDriver;
use crate::error::Result;
use crate::types::{ListQuery, ThreadList};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    connection_id: String,
    query: ListQuery,
}

struct CacheEntry {
    stored_at: Instant,
    list: ThreadList,
}

#[derive(Clone)]
pub struct ThreadListCache {
    ttl: Duration,
    entries: Arc<RwLock<HashMap<CacheKey, CacheEntry>>>,
}

impl ThreadListCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn get(&self, connection_id: &str, query: &ListQuery) -> Option<ThreadList> {
        let key = CacheKey {
            connection_id: connection_id.to_string(),
            query: query.clone(),
        };
        let entries = self.entries.read().await;
        entries
            .get(&key)
            .filter(|entry| entry.stored_at.elapsed() < self.ttl)
            .map(|entry| entry.list.clone())
    }

    pub async fn put(&self, connection_id: &str, query: &ListQuery, list: ThreadList) {
        let key = CacheKey {
            connection_id: connection_id.to_string(),
            query: query.clone(),
        };
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.stored_at.elapsed() < self.ttl);
        entries.insert(
            key,
            CacheEntry {
                stored_at: Instant::now(),
                list,
            },
        );
    }

    /// Read through the cache.
    pub async fn list(
        &self,
        driver: &dyn MailDriver,
        connection_id: &str,
        query: &ListQuery,
    ) -> Result<ThreadList> {
        if let Some(list) = self.get(connection_id, query).await {
            trace!(connection_id = %connection_id, "Thread list cache hit");
            return Ok(list);
        }
        let list = driver.list(query).await?;
        self.put(connection_id, query, list.clone()).await;
        Ok(list)
    }

    /// Drop every listing of a connection. Returns how many were dropped.
    pub async fn invalidate(&self, connection_id: &str) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| key.connection_id != connection_id);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
