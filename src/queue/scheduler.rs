//! Repeatable (cron) jobs and per-connection renewal scheduling
//!
//! A registration is keyed by its name; scheduling the same name again
//! replaces the old registration and drops the jobs it had queued but not
//! started. `tick` turns due registrations into ordinary jobs whose ids
//! embed the fire time, so two schedulers ticking concurrently cannot
//! enqueue the same occurrence twice.

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::job::{
    CleanupJob, JobPayload, PollNewEmailsJob, ProcessScheduledEmailsJob,
    SubscriptionRenewalJob,
};
use super::options::{JobOptions, JobOverrides};
use super::queue::JobQueue;
use super::worker::{StopSignal, WorkerHandle};
use crate::adapters::sqlite::repeatables::{self, RepeatableRecord};
use crate::adapters::sqlite::DbPool;
use crate::config::ScheduleConfig;
use crate::error::{FlowError, Result};

pub const POLL_SCHEDULE: &str = "poll-new-emails";
pub const CLEANUP_SCHEDULE: &str = "cleanup-workflow-executions";
pub const SCHEDULED_EMAILS_SCHEDULE: &str = "process-scheduled-emails";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledJobConfig {
    pub name: String,
    /// 5-field (minute first) or 6/7-field (seconds first) cron expression
    pub cron_pattern: String,
    pub payload: JobPayload,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<u32>,
}

impl ScheduledJobConfig {
    pub fn new(name: impl Into<String>, cron_pattern: impl Into<String>, payload: JobPayload) -> Self {
        Self {
            name: name.into(),
            cron_pattern: cron_pattern.into(),
            payload,
            timezone: None,
            start_date: None,
            end_date: None,
            limit: None,
        }
    }
}

/// An active repeatable registration
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeatableInfo {
    pub name: String,
    pub queue: String,
    pub cron_pattern: String,
    pub timezone: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub run_count: u32,
    pub limit: Option<u32>,
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

fn parse_cron(pattern: &str) -> Result<Schedule> {
    let fields = pattern.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {}", pattern.trim())
    } else {
        pattern.trim().to_string()
    };
    Schedule::from_str(&normalized)
        .map_err(|e| FlowError::Schedule(format!("Invalid cron pattern '{}': {}", pattern, e)))
}

fn parse_timezone(timezone: Option<&str>) -> Result<Tz> {
    match timezone {
        Some(name) => name
            .parse::<Tz>()
            .map_err(|_| FlowError::Schedule(format!("Unknown timezone '{}'", name))),
        None => Ok(Tz::UTC),
    }
}

/// First fire time strictly after `after` that respects the start and end bounds.
fn next_fire(
    schedule: &Schedule,
    tz: Tz,
    after: DateTime<Utc>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    let base = match start {
        Some(start) if start > after => start - chrono::Duration::milliseconds(1),
        _ => after,
    };
    let next = schedule.after(&base.with_timezone(&tz)).next()?;
    let next = next.with_timezone(&Utc);
    match end {
        Some(end) if next > end => None,
        _ => Some(next),
    }
}

/// Check a cron pattern and optional timezone without registering anything.
pub fn check_schedule(pattern: &str, timezone: Option<&str>) -> Result<()> {
    parse_cron(pattern)?;
    parse_timezone(timezone)?;
    Ok(())
}

/// The decoded parts of a stored registration
struct DueRepeat {
    payload: JobPayload,
    options: JobOptions,
    schedule: Schedule,
    tz: Tz,
}

impl DueRepeat {
    fn prepare(record: &RepeatableRecord) -> Result<Self> {
        Ok(Self {
            payload: JobPayload::decode(&record.name, &record.data)?,
            options: serde_json::from_str(&record.options)?,
            schedule: parse_cron(&record.cron)?,
            tz: parse_timezone(record.timezone.as_deref())?,
        })
    }
}

fn record_to_info(record: RepeatableRecord) -> RepeatableInfo {
    RepeatableInfo {
        name: record.key,
        queue: record.queue,
        cron_pattern: record.cron,
        timezone: record.timezone,
        next_run_at: record.next_run_at.and_then(from_millis),
        run_count: record.run_count,
        limit: record.limit_count,
    }
}

#[derive(Clone)]
pub struct Scheduler {
    pool: DbPool,
    queue: JobQueue,
}

impl Scheduler {
    pub fn new(pool: DbPool, queue: JobQueue) -> Self {
        Self { pool, queue }
    }

    /// Register `config`, replacing any registration with the same name.
    pub fn schedule(&self, config: ScheduledJobConfig) -> Result<RepeatableInfo> {
        let schedule = parse_cron(&config.cron_pattern)?;
        let tz = parse_timezone(config.timezone.as_deref())?;
        let now = Utc::now();
        let next = next_fire(&schedule, tz, now, config.start_date, config.end_date)
            .ok_or_else(|| {
                FlowError::Schedule(format!("Schedule '{}' never fires", config.name))
            })?;

        let kind = config.payload.kind();
        let (name, data) = config.payload.encode()?;

        self.remove(&config.name)?;

        let record = RepeatableRecord {
            key: config.name.clone(),
            queue: kind.queue().to_string(),
            name: name.to_string(),
            data,
            options: serde_json::to_string(&kind.default_options())?,
            cron: config.cron_pattern.clone(),
            timezone: config.timezone.clone(),
            start_at: config.start_date.map(|d| d.timestamp_millis()),
            end_at: config.end_date.map(|d| d.timestamp_millis()),
            limit_count: config.limit,
            run_count: 0,
            next_run_at: Some(next.timestamp_millis()),
            created_at: now.timestamp_millis(),
        };
        repeatables::replace(&self.pool, &record)?;

        info!(schedule = %config.name, cron = %config.cron_pattern, next = %next, "Scheduled repeatable job");
        Ok(record_to_info(record))
    }

    /// Drop the registration and its not-yet-started jobs.
    pub fn remove(&self, name: &str) -> Result<bool> {
        let removed = repeatables::delete(&self.pool, name)?;
        let dropped = self.queue.remove_pending_repeats(name)?;
        if removed || dropped > 0 {
            debug!(schedule = %name, dropped, "Removed repeatable job");
        }
        Ok(removed)
    }

    pub fn list(&self) -> Result<Vec<RepeatableInfo>> {
        Ok(repeatables::list(&self.pool)?
            .into_iter()
            .map(record_to_info)
            .collect())
    }

    /// Enqueue every occurrence due at `now`. Missed occurrences collapse
    /// into one. Returns the ids of the jobs enqueued.
    ///
    /// A registration that can no longer be decoded is dropped; any other
    /// failure leaves it due for the next tick. Neither stops the others.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut enqueued = Vec::new();

        for record in repeatables::due(&self.pool, now.timestamp_millis())? {
            let fired = match DueRepeat::prepare(&record) {
                Ok(due) => self.fire(&record, due, now),
                Err(e) => {
                    error!(schedule = %record.key, "Dropping unreadable repeatable job: {}", e);
                    repeatables::delete(&self.pool, &record.key).map(|_| None)
                }
            };
            match fired {
                Ok(Some(job_id)) => enqueued.push(job_id),
                Ok(None) => {}
                Err(e) => warn!(schedule = %record.key, "Repeatable job not fired: {}", e),
            }
        }

        Ok(enqueued)
    }

    fn fire(
        &self,
        record: &RepeatableRecord,
        due: DueRepeat,
        now: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let Some(fired_at) = record.next_run_at else {
            return Ok(None);
        };
        let job_id = format!("repeat:{}:{}", record.key, fired_at);

        let run_count = record.run_count + 1;
        let exhausted = record.limit_count.is_some_and(|limit| run_count >= limit);
        let next = if exhausted {
            None
        } else {
            next_fire(
                &due.schedule,
                due.tz,
                now,
                record.start_at.and_then(from_millis),
                record.end_at.and_then(from_millis),
            )
        };

        if !repeatables::advance(
            &self.pool,
            &record.key,
            fired_at,
            next.map(|n| n.timestamp_millis()),
        )? {
            return Ok(None);
        }

        let fired = self
            .queue
            .enqueue_at(&due.payload, &due.options, job_id.clone(), Some(&record.key), now)?;
        if fired {
            debug!(schedule = %record.key, job_id = %job_id, "Repeatable job fired");
        }

        if next.is_none() {
            repeatables::delete(&self.pool, &record.key)?;
            info!(schedule = %record.key, "Repeatable job finished its run");
        }
        Ok(fired.then_some(job_id))
    }

    /// Schedule (or reschedule) the watch renewal of one connection.
    pub fn schedule_renewal(
        &self,
        user_id: &str,
        connection_id: &str,
        email: &str,
        delay: Duration,
    ) -> Result<String> {
        let job_id = renewal_job_id(connection_id);
        self.queue.remove_job(&job_id)?;
        let payload = JobPayload::SubscriptionRenewal(SubscriptionRenewalJob {
            user_id: user_id.to_string(),
            connection_id: connection_id.to_string(),
            email: email.to_string(),
        });
        self.queue
            .enqueue(payload, JobOverrides::default().job_id(job_id.clone()).delay(delay))?;
        info!(connection_id = %connection_id, ?delay, "Scheduled subscription renewal");
        Ok(job_id)
    }

    /// Returns whether a renewal was pending. Absence is not an error.
    pub fn cancel_renewal(&self, connection_id: &str) -> Result<bool> {
        self.queue.remove_job(&renewal_job_id(connection_id))
    }

    /// Register the maintenance schedules from config.
    pub fn schedule_defaults(&self, config: &ScheduleConfig) -> Result<()> {
        let with_tz = |mut job: ScheduledJobConfig| {
            job.timezone = config.timezone.clone();
            job
        };

        self.schedule(with_tz(ScheduledJobConfig::new(
            POLL_SCHEDULE,
            &config.poll_cron,
            JobPayload::PollNewEmails(PollNewEmailsJob {}),
        )))?;
        self.schedule(with_tz(ScheduledJobConfig::new(
            CLEANUP_SCHEDULE,
            &config.cleanup_cron,
            JobPayload::CleanupWorkflowExecutions(CleanupJob {
                retention_days: config.retention_days,
            }),
        )))?;
        self.schedule(with_tz(ScheduledJobConfig::new(
            SCHEDULED_EMAILS_SCHEDULE,
            &config.scheduled_emails_cron,
            JobPayload::ProcessScheduledEmails(ProcessScheduledEmailsJob {
                batch_size: config.batch_size,
                window_hours: config.window_hours,
            }),
        )))?;
        Ok(())
    }

    /// Spawn a loop calling `tick` every `interval`.
    pub fn start(self, interval: Duration) -> WorkerHandle {
        let signal = StopSignal::default();
        let loop_signal = signal.clone();
        let join = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(interval);
                while loop_signal.tick(&mut ticker).await {
                    if let Err(e) = self.tick(Utc::now()) {
                        error!("Scheduler tick failed: {}", e);
                    }
                }
            }
            .instrument(info_span!("worker", worker.name = "scheduler")),
        );
        WorkerHandle::new("scheduler".to_string(), signal, join)
    }
}

pub fn renewal_job_id(connection_id: &str) -> String {
    format!("renewal-{}", connection_id)
}
