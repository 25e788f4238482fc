//! Job kinds, payloads and the in-memory view of a queued job
//!
//! The set of jobs is closed: every payload is a variant of [`JobPayload`]
//! and the dispatcher matches on it exhaustively, so adding a kind without
//! a processor does not compile.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use super::options::{Backoff, JobOptions};
use super::{
    MAINTENANCE_QUEUE, SCHEDULED_EMAILS_QUEUE, SEND_EMAIL_QUEUE, SUBSCRIPTION_RENEWAL_QUEUE,
    SYNC_COORDINATOR_QUEUE, THREAD_SYNC_QUEUE, WORKFLOW_EXECUTION_QUEUE,
};
use crate::adapters::sqlite::jobs::JobRecord;
use crate::error::{FlowError, Result};
use crate::types::mail::{Attachment, OutgoingEmail};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    SyncThreads,
    SyncCoordinator,
    SendEmail,
    SubscriptionRenewal,
    ProcessScheduledEmails,
    CleanupWorkflowExecutions,
    PollNewEmails,
    ExecuteWorkflow,
    RunScheduledWorkflow,
}

impl JobKind {
    pub const ALL: [JobKind; 9] = [
        JobKind::SyncThreads,
        JobKind::SyncCoordinator,
        JobKind::SendEmail,
        JobKind::SubscriptionRenewal,
        JobKind::ProcessScheduledEmails,
        JobKind::CleanupWorkflowExecutions,
        JobKind::PollNewEmails,
        JobKind::ExecuteWorkflow,
        JobKind::RunScheduledWorkflow,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::SyncThreads => "sync-threads",
            Self::SyncCoordinator => "sync-coordinator",
            Self::SendEmail => "send-email",
            Self::SubscriptionRenewal => "subscription-renewal",
            Self::ProcessScheduledEmails => "process-scheduled-emails",
            Self::CleanupWorkflowExecutions => "cleanup-workflow-executions",
            Self::PollNewEmails => "poll-new-emails",
            Self::ExecuteWorkflow => "execute-workflow",
            Self::RunScheduledWorkflow => "run-scheduled-workflow",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == name)
            .ok_or_else(|| FlowError::UnknownJob(name.to_string()))
    }

    pub fn queue(&self) -> &'static str {
        match self {
            Self::SyncThreads => THREAD_SYNC_QUEUE,
            Self::SyncCoordinator => SYNC_COORDINATOR_QUEUE,
            Self::SendEmail => SEND_EMAIL_QUEUE,
            Self::SubscriptionRenewal => SUBSCRIPTION_RENEWAL_QUEUE,
            Self::ProcessScheduledEmails => SCHEDULED_EMAILS_QUEUE,
            Self::CleanupWorkflowExecutions | Self::PollNewEmails => MAINTENANCE_QUEUE,
            Self::ExecuteWorkflow | Self::RunScheduledWorkflow => WORKFLOW_EXECUTION_QUEUE,
        }
    }

    /// Queue-level defaults merged with per-job overrides at enqueue time.
    pub fn default_options(&self) -> JobOptions {
        let secs = Duration::from_secs;
        match self {
            Self::SyncThreads => JobOptions::new(3, Backoff::exponential(secs(5))).keep(100, 50),
            Self::SyncCoordinator => {
                JobOptions::new(3, Backoff::exponential(secs(10))).keep(50, 50)
            }
            Self::SendEmail => JobOptions::new(5, Backoff::exponential(secs(3))).keep(1000, 100),
            Self::SubscriptionRenewal => {
                JobOptions::new(3, Backoff::exponential(secs(60))).keep(50, 50)
            }
            Self::ProcessScheduledEmails => {
                JobOptions::new(2, Backoff::fixed(secs(30))).keep(10, 10)
            }
            Self::CleanupWorkflowExecutions => {
                JobOptions::new(1, Backoff::fixed(secs(60))).keep(10, 10)
            }
            Self::PollNewEmails => JobOptions::new(1, Backoff::fixed(secs(10))).keep(10, 10),
            Self::ExecuteWorkflow => {
                JobOptions::new(3, Backoff::exponential(secs(5))).keep(100, 100)
            }
            Self::RunScheduledWorkflow => {
                JobOptions::new(2, Backoff::fixed(secs(30))).keep(10, 20)
            }
        }
    }
}

fn default_max_results() -> u32 {
    100
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncThreadsJob {
    pub user_id: String,
    pub connection_id: String,
    #[serde(default)]
    pub history_id: Option<String>,
    #[serde(default)]
    pub page_token: Option<String>,
    #[serde(default)]
    pub full_sync: bool,
    #[serde(default = "default_max_results")]
    pub max_results: u32,
}

/// What prompted a coordination run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    FullSync,
    HistorySync,
    Pubsub,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCoordinatorJob {
    pub user_id: String,
    pub connection_id: String,
    pub trigger_type: SyncTrigger,
    #[serde(default)]
    pub history_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendEmailJob {
    pub email_id: String,
    pub connection_id: String,
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub thread_id: Option<String>,
}

impl SendEmailJob {
    pub fn from_email(email_id: &str, connection_id: &str, email: &OutgoingEmail) -> Self {
        Self {
            email_id: email_id.to_string(),
            connection_id: connection_id.to_string(),
            to: email.to.clone(),
            cc: email.cc.clone(),
            bcc: email.bcc.clone(),
            subject: email.subject.clone(),
            body: email.body.clone(),
            attachments: email.attachments.clone(),
            thread_id: email.thread_id.clone(),
        }
    }

    pub fn to_email(&self) -> OutgoingEmail {
        OutgoingEmail {
            to: self.to.clone(),
            cc: self.cc.clone(),
            bcc: self.bcc.clone(),
            subject: self.subject.clone(),
            body: self.body.clone(),
            attachments: self.attachments.clone(),
            thread_id: self.thread_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRenewalJob {
    pub user_id: String,
    pub connection_id: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessScheduledEmailsJob {
    pub batch_size: u32,
    pub window_hours: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupJob {
    pub retention_days: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PollNewEmailsJob {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteWorkflowJob {
    pub execution_id: String,
    pub workflow_id: String,
    pub connection_id: String,
    pub thread_id: String,
}

/// One firing of a workflow's `schedule` trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledWorkflowJob {
    pub workflow_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "kebab-case")]
pub enum JobPayload {
    SyncThreads(SyncThreadsJob),
    SyncCoordinator(SyncCoordinatorJob),
    SendEmail(SendEmailJob),
    SubscriptionRenewal(SubscriptionRenewalJob),
    ProcessScheduledEmails(ProcessScheduledEmailsJob),
    CleanupWorkflowExecutions(CleanupJob),
    PollNewEmails(PollNewEmailsJob),
    ExecuteWorkflow(ExecuteWorkflowJob),
    RunScheduledWorkflow(ScheduledWorkflowJob),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            Self::SyncThreads(_) => JobKind::SyncThreads,
            Self::SyncCoordinator(_) => JobKind::SyncCoordinator,
            Self::SendEmail(_) => JobKind::SendEmail,
            Self::SubscriptionRenewal(_) => JobKind::SubscriptionRenewal,
            Self::ProcessScheduledEmails(_) => JobKind::ProcessScheduledEmails,
            Self::CleanupWorkflowExecutions(_) => JobKind::CleanupWorkflowExecutions,
            Self::PollNewEmails(_) => JobKind::PollNewEmails,
            Self::ExecuteWorkflow(_) => JobKind::ExecuteWorkflow,
            Self::RunScheduledWorkflow(_) => JobKind::RunScheduledWorkflow,
        }
    }

    /// Split into the stored `(name, data)` pair.
    pub fn encode(&self) -> Result<(&'static str, String)> {
        let mut tagged = serde_json::to_value(self)?;
        let data = tagged
            .get_mut("data")
            .map(Value::take)
            .unwrap_or(Value::Object(Default::default()));
        Ok((self.kind().name(), serde_json::to_string(&data)?))
    }

    /// Rebuild from the stored `(name, data)` pair.
    pub fn decode(name: &str, data: &str) -> Result<Self> {
        JobKind::from_name(name)?;
        let data: Value = serde_json::from_str(data)?;
        let payload = serde_json::from_value(serde_json::json!({ "kind": name, "data": data }))
            .map_err(|e| FlowError::InvalidInput(format!("Bad {} payload: {}", name, e)))?;
        Ok(payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Delayed => "delayed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "delayed" => Ok(Self::Delayed),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(FlowError::Queue(format!("unknown job status '{}'", other))),
        }
    }
}

/// A job as read back from the queue
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub payload: JobPayload,
    pub options: JobOptions,
    pub status: JobStatus,
    pub attempts_made: u32,
    pub stalled_count: u32,
    pub run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub return_value: Option<Value>,
    pub repeat_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

impl Job {
    pub fn name(&self) -> &'static str {
        self.payload.kind().name()
    }
}

impl TryFrom<JobRecord> for Job {
    type Error = FlowError;

    fn try_from(record: JobRecord) -> Result<Self> {
        Ok(Self {
            payload: JobPayload::decode(&record.name, &record.data)?,
            options: serde_json::from_str(&record.options)?,
            status: JobStatus::parse(&record.status)?,
            return_value: record
                .return_value
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            id: record.id,
            queue: record.queue,
            attempts_made: record.attempts_made,
            stalled_count: record.stalled_count,
            run_at: from_millis(record.run_at),
            last_error: record.last_error,
            repeat_key: record.repeat_key,
            created_at: from_millis(record.created_at),
            finished_at: record.finished_at.map(from_millis),
        })
    }
}
