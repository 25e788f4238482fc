//! Workers pull jobs from one or more queues and hand them to a handler
//!
//! Each worker polls with jitter, runs at most `concurrency` jobs at once,
//! renews the lease of every running job at half the lock duration and
//! reports outcomes on an optional flume channel.

use async_trait::async_trait;
use futures_util::FutureExt;
use rand::Rng;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Interval};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use super::job::Job;
use super::queue::{FailOutcome, JobQueue};
use crate::config::QueueConfig;
use crate::error::{FlowError, Result};
use crate::logging::fmt_ms;

/// Processes one job. Returning `Err` (or panicking) counts as a failed attempt.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<Value>;
}

/// Job outcomes, for introspection and tests
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Completed {
        job_id: String,
        queue: String,
        name: &'static str,
        return_value: Value,
    },
    Failed {
        job_id: String,
        queue: String,
        name: &'static str,
        error: String,
        will_retry: bool,
    },
    Stalled {
        job_id: String,
        queue: String,
        requeued: bool,
    },
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub jitter: Duration,
}

impl WorkerOptions {
    pub fn from_config(concurrency: usize, config: &QueueConfig) -> Self {
        Self {
            concurrency: concurrency.max(1),
            poll_interval: config.poll_interval(),
            jitter: Duration::from_millis(config.poll_jitter_ms),
        }
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from_config(1, &QueueConfig::default())
    }
}

#[derive(Clone)]
pub struct Worker {
    id: String,
    queues: Vec<String>,
    queue: JobQueue,
    handler: Arc<dyn JobHandler>,
    options: WorkerOptions,
    events: Option<flume::Sender<WorkerEvent>>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl Worker {
    pub fn new(
        name: &str,
        queues: &[&str],
        queue: JobQueue,
        handler: Arc<dyn JobHandler>,
        options: WorkerOptions,
    ) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: format!("{}-{}", name, &suffix[..8]),
            queues: queues.iter().map(|q| q.to_string()).collect(),
            queue,
            handler,
            options,
            events: None,
        }
    }

    pub fn with_events(mut self, events: flume::Sender<WorkerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn emit(&self, event: WorkerEvent) {
        if let Some(tx) = &self.events {
            // Nobody listening is fine
            let _ = tx.send(event);
        }
    }

    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.options.jitter.is_zero() {
            return self.options.poll_interval;
        }
        let jitter_millis = u64::try_from(self.options.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.options.poll_interval + Duration::from_millis(random_jitter)
    }

    fn claim_next(&self) -> Result<Option<Job>> {
        for queue in &self.queues {
            if let Some(job) = self.queue.claim(queue, &self.id)? {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    /// Claim and run a single job inline. Returns the job id if one ran.
    pub async fn run_once(&self) -> Result<Option<String>> {
        match self.claim_next()? {
            Some(job) => {
                let id = job.id.clone();
                self.process(job).await;
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    /// Run jobs inline until none is ready. Returns how many ran.
    pub async fn drain(&self) -> Result<usize> {
        let mut ran = 0;
        while self.run_once().await?.is_some() {
            ran += 1;
        }
        Ok(ran)
    }

    /// Renew the lease until it is lost. Only returns on loss.
    async fn keep_lease(&self, job: &Job) -> FlowError {
        let period = (self.queue.lock_duration() / 2).max(Duration::from_millis(50));
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match self.queue.extend_lease(&job.id, &self.id) {
                Ok(true) => trace!("Lease renewed"),
                Ok(false) => return FlowError::Queue(format!("Lost lease on job {}", job.id)),
                Err(e) => warn!("Failed to renew lease: {}", e),
            }
        }
    }

    async fn process(&self, job: Job) {
        let span = info_span!(
            "job",
            job.id = %job.id,
            job.name = job.name(),
            queue = %job.queue,
            attempt = job.attempts_made + 1
        );
        self.process_inner(job).instrument(span).await
    }

    async fn process_inner(&self, job: Job) {
        let started = Instant::now();
        debug!("Running job…");

        let run = AssertUnwindSafe(self.handler.handle(&job)).catch_unwind();
        let result = tokio::select! {
            outcome = run => match outcome {
                Ok(result) => result,
                Err(panic) => Err(FlowError::Other(format!(
                    "Processor panicked: {}",
                    panic_message(&*panic)
                ))),
            },
            lost = self.keep_lease(&job) => Err(lost),
        };

        match result {
            Ok(value) => match self.queue.complete(&job, &self.id, &value) {
                Ok(true) => {
                    info!(elapsed = %fmt_ms(started.elapsed()), "Job completed");
                    self.emit(WorkerEvent::Completed {
                        job_id: job.id.clone(),
                        queue: job.queue.clone(),
                        name: job.name(),
                        return_value: value,
                    });
                }
                Ok(false) => debug!("Job outcome discarded, lease no longer held"),
                Err(e) => error!("Failed to record job completion: {}", e),
            },
            Err(err) => match self.queue.fail(&job, &self.id, &err) {
                Ok(FailOutcome::Retrying { attempt, delay }) => {
                    warn!(
                        "Job failed on attempt {}/{}, retrying in {:?}: {}",
                        attempt, job.options.attempts, delay, err
                    );
                    self.emit(WorkerEvent::Failed {
                        job_id: job.id.clone(),
                        queue: job.queue.clone(),
                        name: job.name(),
                        error: err.to_string(),
                        will_retry: true,
                    });
                }
                Ok(FailOutcome::Failed { attempts }) => {
                    error!(
                        elapsed = %fmt_ms(started.elapsed()),
                        "Job failed after {} attempt(s): {}", attempts, err
                    );
                    self.emit(WorkerEvent::Failed {
                        job_id: job.id.clone(),
                        queue: job.queue.clone(),
                        name: job.name(),
                        error: err.to_string(),
                        will_retry: false,
                    });
                }
                Ok(FailOutcome::Lost) => debug!("Job failure discarded, lease no longer held: {}", err),
                Err(e) => error!("Failed to record job failure: {}", e),
            },
        }
    }

    async fn run(self, signal: StopSignal) {
        let concurrency = self.options.concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        info!(concurrency, queues = ?self.queues, "Worker started");

        while signal.is_running() {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            match self.claim_next() {
                Ok(Some(job)) => {
                    let worker = self.clone();
                    tokio::spawn(
                        async move {
                            worker.process(job).await;
                            drop(permit);
                        }
                        .in_current_span(),
                    );
                }
                Ok(None) => {
                    drop(permit);
                    signal.sleep(self.sleep_duration_with_jitter()).await;
                }
                Err(e) => {
                    drop(permit);
                    error!("Failed to claim job: {}", e);
                    signal.sleep(self.sleep_duration_with_jitter()).await;
                }
            }
        }

        // Let in-flight jobs finish
        let _ = semaphore.acquire_many(concurrency as u32).await;
        info!("Worker stopped");
    }

    /// Spawn the polling loop.
    pub fn start(self) -> WorkerHandle {
        let signal = StopSignal::default();
        let id = self.id.clone();
        let span = info_span!("worker", worker.name = %id);
        let join = tokio::spawn(self.run(signal.clone()).instrument(span));
        WorkerHandle::new(id, signal, join)
    }
}

/// Periodically requeue jobs whose lease expired.
pub fn start_stall_monitor(
    queue: JobQueue,
    interval: Duration,
    max_stalled: u32,
    events: Option<flume::Sender<WorkerEvent>>,
) -> WorkerHandle {
    let signal = StopSignal::default();
    let loop_signal = signal.clone();
    let id = "stall-monitor".to_string();

    let join = tokio::spawn(
        async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
            while loop_signal.tick(&mut ticker).await {
                match queue.recover_stalled(max_stalled) {
                    Ok(stalled) => {
                        for job in stalled {
                            if let Some(tx) = &events {
                                let _ = tx.send(WorkerEvent::Stalled {
                                    job_id: job.id,
                                    queue: job.queue,
                                    requeued: job.requeued,
                                });
                            }
                        }
                    }
                    Err(e) => error!("Stall check failed: {}", e),
                }
            }
        }
        .instrument(info_span!("worker", worker.name = "stall-monitor")),
    );

    WorkerHandle::new(id, signal, join)
}

/// Stop flag shared between a background loop and its handle. Stopping
/// also cuts short any sleep the loop is in.
#[derive(Clone, Default)]
pub(crate) struct StopSignal {
    stopped: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopSignal {
    pub(crate) fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Sleep for `duration` or until stopped.
    pub(crate) async fn sleep(&self, duration: Duration) {
        let stopped = self.notify.notified();
        if !self.is_running() {
            return;
        }
        tokio::select! {
            _ = sleep(duration) => {}
            _ = stopped => {}
        }
    }

    /// Wait for the next tick. Returns `false` once stopped.
    pub(crate) async fn tick(&self, ticker: &mut Interval) -> bool {
        let stopped = self.notify.notified();
        if !self.is_running() {
            return false;
        }
        tokio::select! {
            _ = ticker.tick() => self.is_running(),
            _ = stopped => false,
        }
    }
}

pub struct WorkerHandle {
    id: String,
    signal: StopSignal,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub(crate) fn new(id: String, signal: StopSignal, join: JoinHandle<()>) -> Self {
        Self { id, signal, join }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stop(&self) {
        self.signal.stop();
    }

    /// Stop polling and wait for running jobs to finish.
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.join.await {
            error!(worker = %self.id, "Worker task ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::pool;
    use crate::queue::job::{CleanupJob, JobPayload, JobStatus};
    use crate::queue::options::{Backoff, JobOverrides};
    use crate::queue::MAINTENANCE_QUEUE;
    use std::sync::atomic::AtomicUsize;

    enum Mode {
        Succeed,
        Fail,
        Panic,
    }

    struct TestHandler {
        calls: AtomicUsize,
        mode: Mode,
    }

    #[async_trait]
    impl JobHandler for TestHandler {
        async fn handle(&self, job: &Job) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.mode {
                Mode::Succeed => Ok(serde_json::json!({ "job": job.id })),
                Mode::Fail => Err(FlowError::Provider("mailbox unavailable".into())),
                Mode::Panic => panic!("handler exploded"),
            }
        }
    }

    fn setup(mode: Mode) -> (JobQueue, Arc<TestHandler>, Worker, flume::Receiver<WorkerEvent>) {
        let queue = JobQueue::new(pool::in_memory().expect("pool"), Duration::from_secs(30));
        let handler = Arc::new(TestHandler {
            calls: AtomicUsize::new(0),
            mode,
        });
        let (tx, rx) = flume::unbounded();
        let options = WorkerOptions {
            concurrency: 2,
            poll_interval: Duration::from_millis(10),
            jitter: Duration::ZERO,
        };
        let worker = Worker::new(
            "test",
            &[MAINTENANCE_QUEUE],
            queue.clone(),
            handler.clone(),
            options,
        )
        .with_events(tx);
        (queue, handler, worker, rx)
    }

    fn cleanup_job() -> JobPayload {
        JobPayload::CleanupWorkflowExecutions(CleanupJob { retention_days: 30 })
    }

    #[tokio::test]
    async fn test_always_failing_job_attempted_exactly_three_times() {
        let (queue, handler, worker, rx) = setup(Mode::Fail);
        let id = queue
            .enqueue(
                cleanup_job(),
                JobOverrides::default()
                    .attempts(3)
                    .backoff(Backoff::fixed(Duration::ZERO)),
            )
            .unwrap();

        assert_eq!(worker.drain().await.unwrap(), 3);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

        let job = queue.get_job(&id).unwrap().expect("job retained");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts_made, 3);

        let retries: Vec<bool> = rx
            .drain()
            .filter_map(|event| match event {
                WorkerEvent::Failed { will_retry, .. } => Some(will_retry),
                _ => None,
            })
            .collect();
        assert_eq!(retries, vec![true, true, false]);
    }

    #[tokio::test]
    async fn test_panic_counts_as_failure() {
        let (queue, _handler, worker, rx) = setup(Mode::Panic);
        let id = queue
            .enqueue(cleanup_job(), JobOverrides::default().attempts(1))
            .unwrap();

        worker.drain().await.unwrap();

        let job = queue.get_job(&id).unwrap().expect("job retained");
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.last_error.unwrap().contains("handler exploded"));
        assert!(matches!(
            rx.try_recv(),
            Ok(WorkerEvent::Failed { will_retry: false, .. })
        ));
    }

    #[tokio::test]
    async fn test_started_worker_processes_and_shuts_down() {
        let (queue, handler, worker, rx) = setup(Mode::Succeed);
        for _ in 0..3 {
            queue.enqueue(cleanup_job(), JobOverrides::default()).unwrap();
        }

        let handle = worker.start();
        for _ in 0..3 {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv_async())
                .await
                .expect("event in time")
                .expect("channel open");
            assert!(matches!(event, WorkerEvent::Completed { .. }));
        }
        handle.shutdown().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(queue.counts(MAINTENANCE_QUEUE).unwrap().completed, 3);
    }
}
