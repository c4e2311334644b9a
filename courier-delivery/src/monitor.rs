//! Stats and health monitor
//!
//! A background task samples the pipeline on a fixed interval and keeps the
//! latest [`HealthSnapshot`]. Completion and failure counts come from the
//! worker event stream. The monitor only observes: crossing a threshold
//! logs a warning and nothing else.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use courier_common::{Signal, internal};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::{sync::broadcast, time::Instant};

use crate::{
    circuit_breaker::CircuitState,
    events::JobEvent,
    queue::QueueSnapshot,
    worker::{WorkerContext, WorkerStats},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Upper bound on the transport reachability probe
    #[serde(default = "default_verify_timeout_ms")]
    pub verify_timeout_ms: u64,

    /// Warn when at least this many jobs fail within one interval
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u64,

    /// Warn when at least this many jobs are waiting or delayed
    #[serde(default = "default_backlog_threshold")]
    pub backlog_threshold: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            verify_timeout_ms: default_verify_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            backlog_threshold: default_backlog_threshold(),
        }
    }
}

const fn default_interval_secs() -> u64 {
    10
}

const fn default_verify_timeout_ms() -> u64 {
    2000
}

const fn default_failure_threshold() -> u64 {
    10
}

const fn default_backlog_threshold() -> usize {
    1000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportHealth {
    Reachable,
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub queue: QueueSnapshot,
    pub transport: TransportHealth,
    pub circuit: CircuitState,
    /// Completions per second over the last interval
    pub throughput: f64,
    /// Completed over finished jobs since start; 1.0 before anything finished
    pub success_rate: f64,
    pub workers: WorkerStats,
    pub sampled_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    interval_completed: AtomicU64,
    interval_failed: AtomicU64,
}

impl Counters {
    fn observe(&self, event: &JobEvent) {
        match event {
            JobEvent::Completed { .. } => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                self.interval_completed.fetch_add(1, Ordering::Relaxed);
            }
            JobEvent::Failed { .. } | JobEvent::Diverted { .. } => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.interval_failed.fetch_add(1, Ordering::Relaxed);
            }
            JobEvent::Queued { .. } | JobEvent::Retrying { .. } | JobEvent::Cancelled { .. } => {}
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn success_rate(&self) -> f64 {
        let completed = self.completed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        if completed + failed == 0 {
            1.0
        } else {
            completed as f64 / (completed + failed) as f64
        }
    }
}

#[derive(Debug)]
pub struct HealthMonitor {
    config: MonitorConfig,
    context: Arc<WorkerContext>,
    workers: usize,
    counters: Counters,
    latest: RwLock<Option<HealthSnapshot>>,
    last_sample: parking_lot::Mutex<Instant>,
}

impl HealthMonitor {
    pub fn new(config: MonitorConfig, context: Arc<WorkerContext>, workers: usize) -> Self {
        Self {
            config,
            context,
            workers,
            counters: Counters::default(),
            latest: RwLock::new(None),
            last_sample: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Latest sample, `None` until the first interval ran
    pub fn snapshot(&self) -> Option<HealthSnapshot> {
        self.latest.read().clone()
    }

    const fn interval(&self) -> Duration {
        Duration::from_secs(self.config.interval_secs)
    }

    async fn transport_health(&self) -> TransportHealth {
        let probe = self.context.transport.transport().verify();
        match tokio::time::timeout(Duration::from_millis(self.config.verify_timeout_ms), probe).await
        {
            Ok(true) => TransportHealth::Reachable,
            Ok(false) | Err(_) => TransportHealth::Unreachable,
        }
    }

    fn workers(&self) -> WorkerStats {
        WorkerStats {
            total: self.workers,
            busy: self.context.busy(),
        }
    }

    /// Build a snapshot without touching the interval counters
    pub async fn probe(&self) -> HealthSnapshot {
        let throughput = self.snapshot().map_or(0.0, |latest| latest.throughput);
        HealthSnapshot {
            queue: self.context.queue.snapshot(),
            transport: self.transport_health().await,
            circuit: self.context.transport.breaker().state(),
            throughput,
            success_rate: self.counters.success_rate(),
            workers: self.workers(),
            sampled_at: Utc::now(),
        }
    }

    /// Take a sample, close the current interval and store the result
    #[allow(clippy::cast_precision_loss)]
    pub async fn sample(&self) -> HealthSnapshot {
        let transport = self.transport_health().await;

        let elapsed = {
            let mut last = self.last_sample.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };
        let completed = self.counters.interval_completed.swap(0, Ordering::Relaxed);
        let failed = self.counters.interval_failed.swap(0, Ordering::Relaxed);

        let throughput = if elapsed.is_zero() {
            0.0
        } else {
            completed as f64 / elapsed.as_secs_f64()
        };

        let snapshot = HealthSnapshot {
            queue: self.context.queue.snapshot(),
            transport,
            circuit: self.context.transport.breaker().state(),
            throughput,
            success_rate: self.counters.success_rate(),
            workers: self.workers(),
            sampled_at: Utc::now(),
        };

        if failed >= self.config.failure_threshold && failed > 0 {
            internal!(
                level = WARN,
                failed,
                threshold = self.config.failure_threshold,
                "Failure count crossed the warning threshold"
            );
        }
        let backlog = snapshot.queue.backlog();
        if backlog >= self.config.backlog_threshold && backlog > 0 {
            internal!(
                level = WARN,
                backlog,
                threshold = self.config.backlog_threshold,
                "Queue backlog crossed the warning threshold"
            );
        }
        if transport == TransportHealth::Unreachable {
            internal!(level = WARN, "Transport is unreachable");
        }

        *self.latest.write() = Some(snapshot.clone());
        snapshot
    }

    /// Count events and sample until shutdown
    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<JobEvent>,
        mut shutdown: broadcast::Receiver<Signal>,
    ) {
        let mut ticker = tokio::time::interval(self.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;
        *self.last_sample.lock() = Instant::now();

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => self.counters.observe(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        internal!(level = WARN, skipped, "Monitor fell behind the event stream");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = ticker.tick() => {
                    let snapshot = self.sample().await;
                    internal!(
                        level = DEBUG,
                        waiting = snapshot.queue.waiting,
                        active = snapshot.queue.active,
                        delayed = snapshot.queue.delayed,
                        throughput = snapshot.throughput,
                        success_rate = snapshot.success_rate,
                        circuit = %snapshot.circuit,
                        "Health sample"
                    );
                }
                _ = shutdown.recv() => break,
            }
        }

        internal!(level = DEBUG, "Health monitor stopped");
    }
}
