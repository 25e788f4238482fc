pub mod connections;
pub mod executions;
pub mod jobs;
pub mod kv;
pub mod locks;
pub mod pool;
pub mod repeatables;
pub mod scheduled_emails;
pub mod schema;
pub mod store;
pub mod workflows;

// Re-export the pool type so callers can do `use crate::adapters::sqlite::DbPool`
pub use pool::DbPool;
pub use store::SqliteStore;
