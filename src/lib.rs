//! mailflow - Email workflow automation engine
//!
//! Syncs mailboxes incrementally from the provider's change log, matches
//! new and relabelled threads against user workflows and runs them, all
//! driven by durable job queues.
//!
//! ## Module Organization
//!
//! - `queue/`: Job queue, workers, cron scheduler and distributed lock
//! - `sync/`: Thread sync, history coordinator and push intake
//! - `engine/`: Trigger matching and the workflow graph walk
//! - `processors/`: One processor per job kind
//! - `state/`: Shared job context and the runtime that owns the workers
//! - `store/`: Storage contracts
//! - `adapters/`: SQLite stores, Ollama classifier
//! - `backend/`: Mail driver and other collaborator contracts
//! - `types/`: Workflows, executions and mail data
//! - `config/`: Configuration management

pub mod adapters;
pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod processors;
pub mod queue;
pub mod state;
pub mod store;
pub mod sync;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{FlowError, Result};
pub use state::{JobContext, Runtime};
