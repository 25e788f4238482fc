//! Mailbox synchronisation
//!
//! `threads` keeps the local copy of threads and the history cursor,
//! `coordinator` consumes the provider's change log and `push` turns
//! provider notifications into coordinator jobs.

pub mod cache;
pub mod coordinator;
pub mod history;
pub mod push;
pub mod threads;

pub use cache::ThreadListCache;
pub use coordinator::{run_coordinator, SyncStrategy, SyncSummary};
pub use push::handle_push;
pub use threads::{run_sync_threads, ThreadSyncSummary};
