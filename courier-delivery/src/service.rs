//! The mail service: the public face of the delivery pipeline.
//!
//! [`MailService`] is assembled from injected parts (a transport, a failure
//! spool, a template renderer and a [`DeliveryConfig`]) and owns the queue,
//! breaker, rate limiter, worker pool and health monitor built on top of
//! them.
//!
//! ## Lifecycle
//!
//! [`MailService::start`] spawns the workers, the health monitor and, when
//! configured, the automatic replay task. [`MailService::shutdown`]:
//! 1. Stops admitting jobs and wakes idle workers
//! 2. Waits for in-flight deliveries (up to `shutdown_timeout_secs`)
//! 3. Writes every job still waiting or delayed to the failure store so it
//!    can be replayed after a restart

use std::{sync::Arc, time::Duration};

use courier_common::{Message, Signal, internal};
use courier_spool::{FailureOrigin, FailureSpool, RecordId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{sync::broadcast, task::JoinSet, time::Instant};

use crate::{
    DeliveryError,
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, ProtectedTransport},
    events::{self, EventBus, JobEvent},
    monitor::{HealthMonitor, HealthSnapshot, MonitorConfig},
    policy::RetryPolicy,
    queue::{JobId, JobQueue, NewJob, Priority, QueueConfig, QueueSnapshot},
    rate_limiter::{RateLimitConfig, RateLimiter},
    template::TemplateRenderer,
    transport::Transport,
    worker::{WorkerContext, WorkerPool},
};

const fn default_workers() -> usize {
    4
}

const fn default_job_timeout_secs() -> u64 {
    30
}

const fn default_shutdown_timeout_secs() -> u64 {
    30
}

const fn default_replay_batch() -> usize {
    50
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Number of concurrent delivery workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Upper bound on a single delivery attempt (in seconds)
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// How long shutdown waits for in-flight deliveries (in seconds)
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Replay stored failures on this interval while the circuit is closed
    ///
    /// Default: None (replay only on request)
    #[serde(default)]
    pub replay_interval_secs: Option<u64>,

    /// Records replayed per automatic replay tick
    #[serde(default = "default_replay_batch")]
    pub replay_batch: usize,

    /// Buffered events per subscriber before the slowest starts skipping
    #[serde(default = "events::default_capacity")]
    pub event_capacity: usize,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            job_timeout_secs: default_job_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            replay_interval_secs: None,
            replay_batch: default_replay_batch(),
            event_capacity: events::default_capacity(),
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            queue: QueueConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    pub priority: Priority,
    pub delay: Duration,
    /// Deliver now instead of queueing; a transport failure still falls back
    /// to the queue
    pub skip_queue: bool,
    /// Overrides the retry policy's attempt limit
    pub max_attempts: Option<u32>,
}

impl SendOptions {
    #[must_use]
    pub const fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub const fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    #[must_use]
    pub const fn skip_queue(mut self) -> Self {
        self.skip_queue = true;
        self
    }

    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SendOutcome {
    Delivered { message_id: String },
    Queued { job_id: JobId },
    /// Set aside in the failure store for a later replay
    Stored { record_id: RecordId },
}

impl SendOutcome {
    /// Whether the caller's part is done: delivered, queued, or stored for a
    /// later replay
    pub const fn success(&self) -> bool {
        matches!(
            self,
            Self::Delivered { .. } | Self::Queued { .. } | Self::Stored { .. }
        )
    }

    pub const fn delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }

    pub const fn queued(&self) -> bool {
        matches!(self, Self::Queued { .. })
    }

    pub fn message_id(&self) -> Option<&str> {
        match self {
            Self::Delivered { message_id } => Some(message_id),
            Self::Queued { .. } | Self::Stored { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    pub batch_size: usize,
    /// Time between the starts of consecutive batches
    pub batch_delay: Duration,
    pub priority: Priority,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_delay: Duration::from_secs(1),
            priority: Priority::Low,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkError {
    pub recipient: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkReport {
    pub total: usize,
    pub queued: usize,
    pub failed: usize,
    pub errors: Vec<BulkError>,
    pub batches: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryReport {
    /// Records moved back onto the queue
    pub retried: usize,
    /// Records that could not be requeued and stay in the store
    pub failed: usize,
    /// Records left in the store because their message is not deliverable
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Every in-flight delivery finished within the timeout
    pub drained: bool,
    /// Jobs written to the failure store
    pub spilled: usize,
}

#[derive(Debug)]
struct Running {
    workers: WorkerPool,
    background: JoinSet<()>,
}

#[derive(Debug)]
pub struct MailService {
    config: DeliveryConfig,
    context: Arc<WorkerContext>,
    limiter: RateLimiter,
    monitor: Arc<HealthMonitor>,
    shutdown: broadcast::Sender<Signal>,
    running: Mutex<Option<Running>>,
}

impl MailService {
    pub fn new(
        config: DeliveryConfig,
        transport: Arc<dyn Transport>,
        spool: FailureSpool,
        renderer: Arc<TemplateRenderer>,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone()));
        let protected = ProtectedTransport::new(transport, breaker, Arc::new(spool.clone()));
        let context = Arc::new(WorkerContext::new(
            Arc::new(JobQueue::new(config.queue)),
            protected,
            renderer,
            spool,
            config.retry.clone(),
            Duration::from_secs(config.job_timeout_secs),
            EventBus::new(config.event_capacity),
        ));
        let monitor = Arc::new(HealthMonitor::new(
            config.monitor.clone(),
            context.clone(),
            config.workers.max(1),
        ));
        let (shutdown, _) = broadcast::channel(4);

        Self {
            limiter: RateLimiter::new(config.rate_limit.clone()),
            config,
            context,
            monitor,
            shutdown,
            running: Mutex::new(None),
        }
    }

    pub const fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    pub fn renderer(&self) -> &TemplateRenderer {
        &self.context.renderer
    }

    pub fn spool(&self) -> &FailureSpool {
        &self.context.spool
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.context.transport.breaker().state()
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Spawn the workers and background tasks; a no-op if already running
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }

        let workers = WorkerPool::spawn(self.context.clone(), self.config.workers);
        let mut background = JoinSet::new();

        background.spawn(
            self.monitor
                .clone()
                .run(self.context.events.subscribe(), self.shutdown.subscribe()),
        );

        if let Some(interval) = self.config.replay_interval_secs {
            background.spawn(replay_loop(
                self.context.clone(),
                Duration::from_secs(interval.max(1)),
                self.config.replay_batch,
                self.shutdown.subscribe(),
            ));
        }

        internal!(
            level = INFO,
            workers = self.config.workers,
            transport = self.context.transport.transport().name(),
            "Mail service started"
        );
        *running = Some(Running {
            workers,
            background,
        });
    }

    /// Stop the service, draining in-flight work and spilling the rest
    pub async fn shutdown(&self) -> ShutdownReport {
        internal!(level = INFO, "Mail service shutting down");
        self.context.queue.close();
        let _ = self.shutdown.send(Signal::Shutdown);

        let running = self.running.lock().take();
        let drained = match running {
            Some(Running {
                workers,
                mut background,
            }) => {
                let drained = workers
                    .join(Duration::from_secs(self.config.shutdown_timeout_secs))
                    .await;
                while background.join_next().await.is_some() {}
                drained
            }
            None => true,
        };

        let spilled = self.spill().await;
        if spilled > 0 {
            internal!(
                level = WARN,
                spilled,
                "Stored undelivered jobs for replay after restart"
            );
        }

        let _ = self.shutdown.send(Signal::Finalised);
        internal!(level = INFO, "Mail service shutdown complete");

        ShutdownReport { drained, spilled }
    }

    async fn spill(&self) -> usize {
        let mut spilled = 0;

        for mut job in self.context.queue.drain_pending() {
            if let Some(template) = job.template.take() {
                match self.context.renderer.render(&template.name, &template.data).await {
                    Ok(html) => job.message.html = Some(html),
                    Err(e) => {
                        internal!(level = WARN, job_id = %job.id, "Spilling unrendered job: {e}");
                    }
                }
            }

            if self
                .context
                .spool
                .persist(
                    &job.message,
                    "service shut down before delivery",
                    FailureOrigin::Shutdown,
                    job.attempts,
                )
                .await
                .is_some()
            {
                spilled += 1;
            }
        }

        spilled
    }

    fn admit(&self) -> Result<Duration, DeliveryError> {
        if self.context.queue.is_closed() {
            return Err(DeliveryError::ShuttingDown);
        }
        self.limiter
            .admit()
            .map_err(|retry_after| DeliveryError::RateLimited { retry_after })
    }

    fn enqueue(&self, job: NewJob) -> Result<JobId, DeliveryError> {
        let priority = job.priority;
        let job_id = self
            .context
            .queue
            .enqueue(job, self.context.retry.max_attempts)?;
        self.context
            .events
            .emit(JobEvent::Queued { job_id, priority });
        Ok(job_id)
    }

    /// Send one message
    ///
    /// # Errors
    /// Validation and admission failures ([`DeliveryError::Validation`],
    /// [`DeliveryError::RateLimited`], [`DeliveryError::QueueFull`],
    /// [`DeliveryError::ShuttingDown`]), or [`DeliveryError::CircuitOpen`]
    /// when a synchronous send was diverted and could not be stored
    #[tracing::instrument(level = "debug", skip_all, fields(skip_queue = options.skip_queue))]
    pub async fn send(
        &self,
        message: Message,
        options: SendOptions,
    ) -> Result<SendOutcome, DeliveryError> {
        message.validate()?;
        let throttle = self.admit()?;

        let job = NewJob::new(message)
            .priority(options.priority)
            .max_attempts(options.max_attempts);

        if !options.skip_queue || !throttle.is_zero() || !options.delay.is_zero() {
            let job_id = self.enqueue(job.delay(options.delay + throttle))?;
            return Ok(SendOutcome::Queued { job_id });
        }

        self.send_now(job).await
    }

    /// Deliver without queueing
    ///
    /// Terminal outcomes are published like a worker's, under an id of their
    /// own, so observers of the event stream see synchronous sends too.
    async fn send_now(&self, job: NewJob) -> Result<SendOutcome, DeliveryError> {
        let job_id = JobId::generate();
        let result = self
            .context
            .transport
            .deliver(&job.message, 0, self.context.job_timeout)
            .await;

        match result {
            Ok(receipt) => {
                self.context.events.emit(JobEvent::Completed {
                    job_id,
                    message_id: receipt.message_id.clone(),
                    attempts: 1,
                });
                Ok(SendOutcome::Delivered {
                    message_id: receipt.message_id,
                })
            }
            Err(DeliveryError::CircuitOpen { record }) => {
                self.context
                    .events
                    .emit(JobEvent::Diverted { job_id, record });
                record
                    .map(|record_id| SendOutcome::Stored { record_id })
                    .ok_or(DeliveryError::CircuitOpen { record })
            }
            Err(DeliveryError::Transport(e)) => {
                let max_attempts = job
                    .max_attempts
                    .unwrap_or(self.context.retry.max_attempts);

                if max_attempts <= 1 {
                    let record = self
                        .context
                        .spool
                        .persist(
                            &job.message,
                            &e.to_string(),
                            FailureOrigin::RetriesExhausted,
                            1,
                        )
                        .await;
                    self.context.events.emit(JobEvent::Failed {
                        job_id,
                        record,
                        attempts: 1,
                        error: e.to_string(),
                    });
                    return record.map_or(Err(DeliveryError::Transport(e)), |record_id| {
                        Ok(SendOutcome::Stored { record_id })
                    });
                }

                internal!(
                    level = DEBUG,
                    error = %e,
                    "Synchronous send failed, queueing for retry"
                );
                let delay = self.context.retry.delay(1);
                let job_id = self.enqueue(job.attempts(1).delay(delay))?;
                Ok(SendOutcome::Queued { job_id })
            }
            Err(e) => Err(e),
        }
    }

    /// Send `template_name` rendered with `data` to one recipient
    ///
    /// The template is compiled up front so an unknown or broken template is
    /// rejected here rather than by a worker.
    ///
    /// # Errors
    /// As for [`MailService::send`], plus [`DeliveryError::TemplateNotFound`]
    /// and [`DeliveryError::Template`]
    pub async fn send_templated(
        &self,
        recipient: &str,
        template_name: &str,
        subject: &str,
        data: serde_json::Value,
        options: SendOptions,
    ) -> Result<SendOutcome, DeliveryError> {
        let mut message = Message::new().to(recipient).subject(subject);
        self.context.renderer.precompile(template_name).await?;
        message.validate_envelope()?;

        if options.skip_queue {
            message.html = Some(self.context.renderer.render(template_name, &data).await?);
            return self.send(message, options).await;
        }

        let throttle = self.admit()?;
        let job = NewJob::new(message)
            .priority(options.priority)
            .delay(options.delay + throttle)
            .max_attempts(options.max_attempts)
            .template(template_name, data);

        let job_id = self.enqueue(job)?;
        Ok(SendOutcome::Queued { job_id })
    }

    /// Queue one templated message per recipient, `batch_size` at a time
    ///
    /// Batch `n` starts `n * batch_delay` after the first. Per-recipient
    /// failures are collected in the report rather than aborting the run.
    ///
    /// # Errors
    /// [`DeliveryError::TemplateNotFound`] or [`DeliveryError::Template`]
    /// before anything is queued
    #[tracing::instrument(level = "debug", skip_all, fields(recipients = recipients.len(), template = template_name))]
    pub async fn send_bulk(
        &self,
        recipients: &[String],
        subject: &str,
        template_name: &str,
        data: serde_json::Value,
        batch: BatchOptions,
    ) -> Result<BulkReport, DeliveryError> {
        self.context.renderer.precompile(template_name).await?;

        let mut report = BulkReport {
            total: recipients.len(),
            ..BulkReport::default()
        };
        let options = SendOptions::default().priority(batch.priority);
        let started = Instant::now();

        for (index, chunk) in recipients.chunks(batch.batch_size.max(1)).enumerate() {
            if index > 0 {
                let offset = batch
                    .batch_delay
                    .saturating_mul(u32::try_from(index).unwrap_or(u32::MAX));
                tokio::time::sleep_until(started + offset).await;
            }

            for recipient in chunk {
                match self
                    .send_templated(recipient, template_name, subject, data.clone(), options)
                    .await
                {
                    Ok(_) => report.queued += 1,
                    Err(e) => {
                        report.failed += 1;
                        report.errors.push(BulkError {
                            recipient: recipient.clone(),
                            error: e.to_string(),
                        });
                    }
                }
            }

            report.batches += 1;
            internal!(
                level = DEBUG,
                batch = index + 1,
                size = chunk.len(),
                "Queued bulk batch"
            );
        }

        internal!(
            level = INFO,
            total = report.total,
            queued = report.queued,
            failed = report.failed,
            batches = report.batches,
            "Bulk send finished"
        );
        Ok(report)
    }

    pub fn queue_stats(&self) -> QueueSnapshot {
        self.context.queue.snapshot()
    }

    /// Latest health sample, or a fresh probe before the first sample
    pub async fn health(&self) -> HealthSnapshot {
        match self.monitor.snapshot() {
            Some(snapshot) => snapshot,
            None => self.monitor.probe().await,
        }
    }

    /// Move up to `limit` stored failures back onto the queue
    ///
    /// # Errors
    /// If the failure store cannot be listed
    pub async fn retry_failed(&self, limit: usize) -> Result<RetryReport, DeliveryError> {
        replay(&self.context, limit).await
    }

    /// Remove a job that is not yet due
    pub fn cancel(&self, job_id: &JobId) -> bool {
        let cancelled = self.context.queue.cancel(job_id);
        if cancelled {
            self.context
                .events
                .emit(JobEvent::Cancelled { job_id: *job_id });
        }
        cancelled
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.context.events.subscribe()
    }
}

async fn replay(context: &WorkerContext, limit: usize) -> Result<RetryReport, DeliveryError> {
    let mut report = RetryReport::default();

    for record in context.spool.list_limited(limit).await? {
        if let Err(e) = record.message.validate() {
            internal!(
                level = WARN,
                record_id = %record.id,
                origin = %record.origin,
                "Stored record is not deliverable, leaving it in place: {e}"
            );
            report.skipped += 1;
            continue;
        }

        let job = NewJob::new(record.message).priority(Priority::Low);
        let job_id = match context.queue.enqueue(job, context.retry.max_attempts) {
            Ok(job_id) => job_id,
            Err(e) => {
                internal!(level = WARN, record_id = %record.id, "Replay stopped: {e}");
                report.failed += 1;
                break;
            }
        };
        context.events.emit(JobEvent::Queued {
            job_id,
            priority: Priority::Low,
        });

        if let Err(e) = context.spool.remove(&record.id).await {
            internal!(
                level = ERROR,
                record_id = %record.id,
                %job_id,
                "Replayed record could not be removed and may be replayed again: {e}"
            );
        }
        report.retried += 1;
    }

    if report.retried > 0 {
        internal!(level = INFO, retried = report.retried, "Replayed stored failures");
    }
    Ok(report)
}

async fn replay_loop(
    context: Arc<WorkerContext>,
    interval: Duration,
    batch: usize,
    mut shutdown: broadcast::Receiver<Signal>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if context.transport.breaker().state() != CircuitState::Closed {
                    continue;
                }
                if let Err(e) = replay(&context, batch).await {
                    internal!(level = ERROR, "Automatic replay failed: {e}");
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}
