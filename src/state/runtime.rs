//! The running engine: one worker per queue, the stall monitor and the
//! repeatable-job scheduler, all sharing one [`JobContext`]

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::JobContext;
use crate::error::Result;
use crate::processors::Dispatcher;
use crate::queue::worker::start_stall_monitor;
use crate::queue::{
    JobHandler, Worker, WorkerEvent, WorkerHandle, WorkerOptions, MAINTENANCE_QUEUE,
    SCHEDULED_EMAILS_QUEUE, SEND_EMAIL_QUEUE, SUBSCRIPTION_RENEWAL_QUEUE, SYNC_COORDINATOR_QUEUE,
    THREAD_SYNC_QUEUE, WORKFLOW_EXECUTION_QUEUE,
};

/// How often the scheduler looks for due repeatable jobs
const SCHEDULER_TICK: Duration = Duration::from_secs(1);

pub struct Runtime {
    ctx: Arc<JobContext>,
    handler: Arc<dyn JobHandler>,
    events_tx: flume::Sender<WorkerEvent>,
    events_rx: flume::Receiver<WorkerEvent>,
    handles: Vec<WorkerHandle>,
}

impl Runtime {
    pub fn new(ctx: JobContext) -> Self {
        let ctx = Arc::new(ctx);
        let (events_tx, events_rx) = flume::unbounded();
        Self {
            handler: Arc::new(Dispatcher::new(ctx.clone())),
            ctx,
            events_tx,
            events_rx,
            handles: Vec::new(),
        }
    }

    pub fn context(&self) -> &Arc<JobContext> {
        &self.ctx
    }

    /// Outcomes of every job run by this runtime's workers.
    pub fn events(&self) -> flume::Receiver<WorkerEvent> {
        self.events_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.handles.is_empty()
    }

    fn queue_concurrency(&self) -> [(&'static str, usize); 7] {
        let workers = &self.ctx.config.workers;
        [
            (THREAD_SYNC_QUEUE, workers.thread_sync),
            (SYNC_COORDINATOR_QUEUE, workers.sync_coordinator),
            (SEND_EMAIL_QUEUE, workers.send_email),
            (SUBSCRIPTION_RENEWAL_QUEUE, workers.subscription_renewal),
            (SCHEDULED_EMAILS_QUEUE, workers.scheduled_emails),
            (MAINTENANCE_QUEUE, workers.maintenance),
            (WORKFLOW_EXECUTION_QUEUE, workers.workflow_execution),
        ]
    }

    /// Register the default schedules and spawn every loop. Calling it on
    /// a running runtime does nothing.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            warn!("Runtime already started");
            return Ok(());
        }
        let config = &self.ctx.config;
        self.ctx.scheduler.schedule_defaults(&config.schedules)?;

        for (queue, concurrency) in self.queue_concurrency() {
            if concurrency == 0 {
                info!(queue, "Queue disabled (0 workers)");
                continue;
            }
            let options = WorkerOptions::from_config(concurrency, &config.queue);
            let worker = Worker::new(
                queue,
                &[queue],
                self.ctx.queue.clone(),
                self.handler.clone(),
                options,
            )
            .with_events(self.events_tx.clone());
            self.handles.push(worker.start());
        }

        self.handles.push(start_stall_monitor(
            self.ctx.queue.clone(),
            config.queue.stalled_interval(),
            config.queue.max_stalled_count,
            Some(self.events_tx.clone()),
        ));
        self.handles.push(self.ctx.scheduler.clone().start(SCHEDULER_TICK));

        info!(loops = self.handles.len(), "Runtime started");
        Ok(())
    }

    /// Stop every loop and wait for in-flight jobs.
    pub async fn shutdown(&mut self) {
        let handles = std::mem::take(&mut self.handles);
        for handle in &handles {
            handle.stop();
        }
        for handle in handles {
            handle.shutdown().await;
        }
        info!("Runtime stopped");
    }
}
