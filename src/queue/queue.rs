//! Named queues over the `jobs` table
//!
//! Enqueue merges the kind's default options with per-job overrides. Retry
//! bookkeeping happens here: a failed attempt is either parked with a
//! backoff delay or, once attempts are exhausted (or the error is fatal),
//! marked failed and subjected to the failure retention policy.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::job::{Job, JobPayload, JobStatus};
use super::options::{JobOptions, JobOverrides, Retention};
use crate::adapters::sqlite::jobs::{self, NewJobRecord};
use crate::adapters::sqlite::DbPool;
use crate::error::{FlowError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Parked until the backoff delay elapses
    Retrying { attempt: u32, delay: Duration },
    /// No attempts left, or the error was fatal
    Failed { attempts: u32 },
    /// The job is no longer leased to this worker
    Lost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalledJob {
    pub id: String,
    pub queue: String,
    /// false when the job exceeded its stall allowance and was failed
    pub requeued: bool,
}

#[derive(Clone)]
pub struct JobQueue {
    pool: DbPool,
    lock_duration: Duration,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl JobQueue {
    pub fn new(pool: DbPool, lock_duration: Duration) -> Self {
        Self {
            pool,
            lock_duration,
        }
    }

    pub fn lock_duration(&self) -> Duration {
        self.lock_duration
    }

    fn record(
        payload: &JobPayload,
        options: &JobOptions,
        job_id: Option<String>,
        repeat_key: Option<&str>,
        run_at: DateTime<Utc>,
    ) -> Result<NewJobRecord> {
        let (name, data) = payload.encode()?;
        Ok(NewJobRecord {
            id: job_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            queue: payload.kind().queue().to_string(),
            name: name.to_string(),
            data,
            options: serde_json::to_string(options)?,
            priority: options.priority as i64,
            run_at: run_at.timestamp_millis(),
            repeat_key: repeat_key.map(str::to_string),
            created_at: now_ms(),
        })
    }

    fn prepare(payload: &JobPayload, overrides: &JobOverrides) -> Result<NewJobRecord> {
        let options = payload.kind().default_options().merged(overrides);
        let run_at = Utc::now()
            + chrono::Duration::milliseconds(options.delay_ms.min(i64::MAX as u64) as i64);
        Self::record(payload, &options, overrides.job_id.clone(), None, run_at)
    }

    /// Add a job and return its id. An existing id is left untouched.
    pub fn enqueue(&self, payload: JobPayload, overrides: JobOverrides) -> Result<String> {
        let record = Self::prepare(&payload, &overrides)?;
        let conn = self.pool.get()?;
        if jobs::insert(&conn, &record)? {
            debug!(job_id = %record.id, queue = %record.queue, "Enqueued {}", record.name);
        } else {
            debug!(job_id = %record.id, "Job already exists, not enqueued again");
        }
        Ok(record.id)
    }

    pub fn enqueue_bulk(&self, items: Vec<(JobPayload, JobOverrides)>) -> Result<Vec<String>> {
        let records = items
            .iter()
            .map(|(payload, overrides)| Self::prepare(payload, overrides))
            .collect::<Result<Vec<_>>>()?;
        jobs::insert_many(&self.pool, &records)?;
        debug!("Enqueued {} jobs in bulk", records.len());
        Ok(records.into_iter().map(|r| r.id).collect())
    }

    /// Enqueue with fully resolved options at an absolute time.
    pub(crate) fn enqueue_at(
        &self,
        payload: &JobPayload,
        options: &JobOptions,
        job_id: String,
        repeat_key: Option<&str>,
        run_at: DateTime<Utc>,
    ) -> Result<bool> {
        let record = Self::record(payload, options, Some(job_id), repeat_key, run_at)?;
        let conn = self.pool.get()?;
        jobs::insert(&conn, &record)
    }

    pub fn get_job(&self, id: &str) -> Result<Option<Job>> {
        jobs::get(&self.pool, id)?.map(Job::try_from).transpose()
    }

    /// Remove a job whatever its state. A worker still running it will
    /// find its lease gone and its outcome discarded.
    pub fn remove_job(&self, id: &str) -> Result<bool> {
        jobs::delete(&self.pool, id)
    }

    pub(crate) fn remove_pending_repeats(&self, repeat_key: &str) -> Result<usize> {
        jobs::delete_pending_by_repeat_key(&self.pool, repeat_key)
    }

    pub fn counts(&self, queue: &str) -> Result<JobCounts> {
        let mut counts = JobCounts::default();
        for (status, count) in jobs::count_by_status(&self.pool, queue)? {
            match JobStatus::parse(&status)? {
                JobStatus::Waiting => counts.waiting = count,
                JobStatus::Delayed => counts.delayed = count,
                JobStatus::Active => counts.active = count,
                JobStatus::Completed => counts.completed = count,
                JobStatus::Failed => counts.failed = count,
            }
        }
        Ok(counts)
    }

    pub fn jobs_in_state(&self, queue: &str, status: JobStatus, limit: usize) -> Result<Vec<Job>> {
        jobs::list_by_status(&self.pool, queue, status.as_str(), limit)?
            .into_iter()
            .map(Job::try_from)
            .collect()
    }

    /// Lease the next runnable job. Rows that no longer decode (unknown
    /// kind, malformed payload) are failed on the spot and skipped.
    pub fn claim(&self, queue: &str, worker_id: &str) -> Result<Option<Job>> {
        let lease_ms = self.lock_duration.as_millis() as i64;
        loop {
            let now = now_ms();
            let Some(record) = jobs::claim_next(&self.pool, queue, worker_id, now, lease_ms)? else {
                return Ok(None);
            };
            let id = record.id.clone();
            match Job::try_from(record) {
                Ok(job) => return Ok(Some(job)),
                Err(e) => {
                    error!(job_id = %id, queue = %queue, "Undecodable job: {}", e);
                    jobs::fail(&self.pool, &id, worker_id, &e.to_string(), now)?;
                }
            }
        }
    }

    pub fn extend_lease(&self, job_id: &str, worker_id: &str) -> Result<bool> {
        let until = now_ms() + self.lock_duration.as_millis() as i64;
        jobs::extend_lease(&self.pool, job_id, worker_id, until)
    }

    pub fn complete(&self, job: &Job, worker_id: &str, return_value: &serde_json::Value) -> Result<bool> {
        let value = serde_json::to_string(return_value)?;
        if !jobs::complete(&self.pool, &job.id, worker_id, &value, now_ms())? {
            warn!(job_id = %job.id, "Completed job was no longer leased to this worker");
            return Ok(false);
        }
        self.apply_retention(job, JobStatus::Completed, job.options.remove_on_complete)?;
        Ok(true)
    }

    pub fn fail(&self, job: &Job, worker_id: &str, err: &FlowError) -> Result<FailOutcome> {
        let attempt = job.attempts_made + 1;
        let message = err.to_string();

        if !err.is_fatal() && attempt < job.options.attempts {
            let delay = job.options.backoff.delay_for(attempt);
            let run_at = now_ms() + delay.as_millis() as i64;
            if !jobs::retry(&self.pool, &job.id, worker_id, &message, run_at)? {
                return Ok(FailOutcome::Lost);
            }
            return Ok(FailOutcome::Retrying { attempt, delay });
        }

        if !jobs::fail(&self.pool, &job.id, worker_id, &message, now_ms())? {
            return Ok(FailOutcome::Lost);
        }
        self.apply_retention(job, JobStatus::Failed, job.options.remove_on_fail)?;
        Ok(FailOutcome::Failed { attempts: attempt })
    }

    fn apply_retention(&self, job: &Job, status: JobStatus, retention: Retention) -> Result<()> {
        match retention {
            Retention::Keep => {}
            Retention::Remove => {
                jobs::delete(&self.pool, &job.id)?;
            }
            Retention::KeepLast(keep) => {
                jobs::trim_finished(&self.pool, &job.queue, status.as_str(), keep)?;
            }
        }
        Ok(())
    }

    /// Requeue active jobs whose lease expired; jobs that already stalled
    /// `max_stalled` times are failed instead.
    pub fn recover_stalled(&self, max_stalled: u32) -> Result<Vec<StalledJob>> {
        let now = now_ms();
        let mut recovered = Vec::new();
        for record in jobs::expired_leases(&self.pool, now)? {
            let requeued = record.stalled_count < max_stalled;
            let changed = if requeued {
                jobs::requeue_stalled(&self.pool, &record.id, now)?
            } else {
                jobs::fail_stalled(
                    &self.pool,
                    &record.id,
                    "job stalled more than allowable limit",
                    now,
                )?
            };
            if !changed {
                continue;
            }
            warn!(job_id = %record.id, queue = %record.queue, requeued, "Recovered stalled job");
            recovered.push(StalledJob {
                id: record.id,
                queue: record.queue,
                requeued,
            });
        }
        Ok(recovered)
    }
}
