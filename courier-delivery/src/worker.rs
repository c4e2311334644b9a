//! Bounded pool of delivery workers.
//!
//! Each worker loops on [`JobQueue::dequeue`] until the queue closes and
//! handles one job at a time:
//!
//! 1. Render the job's template into the HTML body (once; retries reuse it)
//!    and check the result is a deliverable message
//! 2. Deliver through the [`ProtectedTransport`] under the per-job timeout
//! 3. On success, acknowledge the job
//! 4. On failure, reschedule per the [`RetryPolicy`] while attempts remain,
//!    otherwise hand the message to the failure store
//!
//! An unrenderable or invalid job is terminal. A job diverted by the open breaker has
//! already been stored by the fallback and is simply dropped.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use courier_common::internal;
use courier_spool::{FailureOrigin, FailureSpool};
use serde::Serialize;
use tokio::task::JoinSet;

use crate::{
    DeliveryError,
    circuit_breaker::ProtectedTransport,
    events::{EventBus, JobEvent},
    policy::RetryPolicy,
    queue::{Job, JobQueue},
    template::TemplateRenderer,
};

/// Everything a worker needs, shared by the whole pool
#[derive(Debug)]
pub struct WorkerContext {
    pub queue: Arc<JobQueue>,
    pub transport: ProtectedTransport,
    pub renderer: Arc<TemplateRenderer>,
    pub spool: FailureSpool,
    pub retry: RetryPolicy,
    pub job_timeout: Duration,
    pub events: EventBus,
    busy: AtomicUsize,
}

impl WorkerContext {
    pub const fn new(
        queue: Arc<JobQueue>,
        transport: ProtectedTransport,
        renderer: Arc<TemplateRenderer>,
        spool: FailureSpool,
        retry: RetryPolicy,
        job_timeout: Duration,
        events: EventBus,
    ) -> Self {
        Self {
            queue,
            transport,
            renderer,
            spool,
            retry,
            job_timeout,
            events,
            busy: AtomicUsize::new(0),
        }
    }

    /// Workers currently handling a job
    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::Relaxed)
    }

    /// Render the job's template into its body, consuming the reference
    async fn render(&self, job: &mut Job) -> Result<(), DeliveryError> {
        if let Some(template) = job.template.take() {
            let html = self.renderer.render(&template.name, &template.data).await?;
            job.message.html = Some(html);
        }
        Ok(())
    }

    async fn store_failed(&self, job: &Job, error: &str, origin: FailureOrigin) {
        let record = self
            .spool
            .persist(&job.message, error, origin, job.attempts)
            .await;
        self.queue.fail(&job.id);

        internal!(
            level = WARN,
            job_id = %job.id,
            attempts = job.attempts,
            %origin,
            "Job failed permanently: {error}"
        );
        self.events.emit(JobEvent::Failed {
            job_id: job.id,
            record,
            attempts: job.attempts,
            error: error.to_string(),
        });
    }

    #[tracing::instrument(level = "debug", skip_all, fields(job_id = %job.id, attempt = job.attempts + 1))]
    pub async fn process(&self, mut job: Job) {
        job.attempts += 1;

        let prepared = match self.render(&mut job).await {
            Ok(()) => job.message.validate().map_err(DeliveryError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = prepared {
            self.store_failed(&job, &e.to_string(), FailureOrigin::Rendering)
                .await;
            return;
        }

        // A diverted job never reached the transport, so that attempt does
        // not count against it
        let result = self
            .transport
            .deliver(&job.message, job.attempts - 1, self.job_timeout)
            .await;

        match result {
            Ok(receipt) => {
                self.queue.complete(&job.id);
                internal!(
                    level = INFO,
                    job_id = %job.id,
                    message_id = %receipt.message_id,
                    attempts = job.attempts,
                    "Delivered job"
                );
                self.events.emit(JobEvent::Completed {
                    job_id: job.id,
                    message_id: receipt.message_id,
                    attempts: job.attempts,
                });
            }
            Err(DeliveryError::CircuitOpen { record }) => {
                self.queue.fail(&job.id);
                self.events.emit(JobEvent::Diverted {
                    job_id: job.id,
                    record,
                });
            }
            Err(e) if job.attempts_remaining() && e.is_retryable() => {
                let delay = self.retry.delay(job.attempts);
                internal!(
                    level = DEBUG,
                    job_id = %job.id,
                    attempt = job.attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Delivery attempt failed, rescheduling"
                );
                self.events.emit(JobEvent::Retrying {
                    job_id: job.id,
                    attempt: job.attempts,
                    delay,
                    error: e.to_string(),
                });
                self.queue.reschedule(job, delay);
            }
            Err(e) => {
                if e.requires_alert() {
                    internal!(level = ERROR, job_id = %job.id, "Operator attention required: {e}");
                }
                self.store_failed(&job, &e.to_string(), FailureOrigin::RetriesExhausted)
                    .await;
            }
        }
    }

    async fn run(self: Arc<Self>, worker: usize) {
        internal!(level = DEBUG, worker, "Worker started");

        while let Some(job) = self.queue.dequeue().await {
            self.busy.fetch_add(1, Ordering::Relaxed);
            self.process(job).await;
            self.busy.fetch_sub(1, Ordering::Relaxed);
        }

        internal!(level = DEBUG, worker, "Worker stopped");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub total: usize,
    pub busy: usize,
}

#[derive(Debug)]
pub struct WorkerPool {
    context: Arc<WorkerContext>,
    workers: JoinSet<()>,
    size: usize,
}

impl WorkerPool {
    /// Spawn `size` workers onto the current runtime
    pub fn spawn(context: Arc<WorkerContext>, size: usize) -> Self {
        let size = size.max(1);
        let mut workers = JoinSet::new();
        for worker in 0..size {
            workers.spawn(context.clone().run(worker));
        }

        internal!(level = INFO, "Started {size} delivery workers");
        Self {
            context,
            workers,
            size,
        }
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            total: self.size,
            busy: self.context.busy(),
        }
    }

    /// Wait for every worker to exit after the queue has been closed
    ///
    /// Workers still busy after `timeout` are aborted; returns `false` if
    /// that happened.
    pub async fn join(mut self, timeout: Duration) -> bool {
        let drained = tokio::time::timeout(timeout, async {
            while let Some(result) = self.workers.join_next().await {
                if let Err(e) = result {
                    internal!(level = ERROR, "Worker exited abnormally: {e}");
                }
            }
        })
        .await
        .is_ok();

        if !drained {
            internal!(
                level = WARN,
                busy = self.context.busy.load(Ordering::Relaxed),
                "Shutdown timeout exceeded, aborting in-flight deliveries"
            );
            self.workers.abort_all();
            while self.workers.join_next().await.is_some() {}
        }

        drained
    }
}
