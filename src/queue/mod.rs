//! Durable job queue, workers, repeatable schedules and locks, all on SQLite

pub mod job;
pub mod lock;
pub mod options;
#[allow(clippy::module_inception)]
pub mod queue;
pub mod scheduler;
pub mod worker;

pub const THREAD_SYNC_QUEUE: &str = "thread-sync";
pub const SYNC_COORDINATOR_QUEUE: &str = "sync-coordinator";
pub const SEND_EMAIL_QUEUE: &str = "send-email";
pub const SUBSCRIPTION_RENEWAL_QUEUE: &str = "subscription-renewal";
pub const SCHEDULED_EMAILS_QUEUE: &str = "scheduled-emails";
pub const MAINTENANCE_QUEUE: &str = "maintenance";
pub const WORKFLOW_EXECUTION_QUEUE: &str = "workflow-execution";

pub const ALL_QUEUES: [&str; 7] = [
    THREAD_SYNC_QUEUE,
    SYNC_COORDINATOR_QUEUE,
    SEND_EMAIL_QUEUE,
    SUBSCRIPTION_RENEWAL_QUEUE,
    SCHEDULED_EMAILS_QUEUE,
    MAINTENANCE_QUEUE,
    WORKFLOW_EXECUTION_QUEUE,
];

pub use job::{Job, JobKind, JobPayload, JobStatus};
pub use lock::{DistributedLock, LockGuard};
pub use options::{Backoff, JobOptions, JobOverrides, Retention};
pub use queue::{FailOutcome, JobCounts, JobQueue, StalledJob};
pub use scheduler::{RepeatableInfo, ScheduledJobConfig, Scheduler};
pub use worker::{JobHandler, Worker, WorkerEvent, WorkerHandle, WorkerOptions};
