//! Priority- and delay-aware job queue
//!
//! Jobs are ordered by priority first, then by their not-before instant,
//! then by creation sequence. Jobs with a not-before instant in the future
//! sit in a time-ordered index and are promoted to the ready heap once due.
//! There is no starvation prevention: a steady stream of `High` jobs keeps
//! `Low` jobs waiting.

pub mod job;

use std::{
    cmp::Reverse,
    collections::{BTreeMap, BinaryHeap},
    sync::atomic::{AtomicU64, Ordering},
    time::SystemTime,
};

use ahash::AHashMap;
use courier_common::internal;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::Notify,
    time::{Duration, Instant},
};

pub use self::job::{Job, JobId, NewJob, Priority, TemplateRef};
use crate::DeliveryError;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Reject admissions once this many jobs are waiting, delayed or active
    #[serde(default)]
    pub max_depth: Option<usize>,
}

/// Point-in-time job counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Due and ready to be dequeued
    pub waiting: usize,
    /// Held by a worker
    pub active: usize,
    /// Delivered since start
    pub completed: u64,
    /// Left the queue undelivered since start
    pub failed: u64,
    /// Not yet due
    pub delayed: usize,
}

impl QueueSnapshot {
    pub const fn backlog(&self) -> usize {
        self.waiting + self.delayed
    }
}

type ReadyKey = Reverse<(Priority, Instant, u64, JobId)>;

#[derive(Debug, Default)]
struct QueueState {
    /// Waiting and delayed jobs
    jobs: AHashMap<JobId, Job>,
    ready: BinaryHeap<ReadyKey>,
    delayed: BTreeMap<(Instant, u64), JobId>,
    active: AHashMap<JobId, Job>,
    completed: u64,
    failed: u64,
    closed: bool,
}

impl QueueState {
    fn depth(&self) -> usize {
        self.jobs.len() + self.active.len()
    }

    fn insert(&mut self, job: Job, now: Instant) {
        if job.not_before > now {
            self.delayed.insert((job.not_before, job.sequence), job.id);
        } else {
            self.ready
                .push(Reverse((job.priority, job.not_before, job.sequence, job.id)));
        }
        self.jobs.insert(job.id, job);
    }

    fn promote(&mut self, now: Instant) {
        while let Some(entry) = self.delayed.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let id = entry.remove();
            if let Some(job) = self.jobs.get(&id) {
                self.ready
                    .push(Reverse((job.priority, job.not_before, job.sequence, job.id)));
            }
        }
    }

    fn pop_ready(&mut self) -> Option<Job> {
        while let Some(Reverse((_, _, _, id))) = self.ready.pop() {
            if let Some(job) = self.jobs.remove(&id) {
                self.active.insert(id, job.clone());
                return Some(job);
            }
        }
        None
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.keys().next().map(|(at, _)| *at)
    }
}

#[derive(Debug, Default)]
pub struct JobQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
    notify: Notify,
    sequence: AtomicU64,
}

impl JobQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Add a job, returning its id
    ///
    /// `default_max_attempts` applies when the job does not set its own.
    ///
    /// # Errors
    /// [`DeliveryError::ShuttingDown`] once the queue is closed, or
    /// [`DeliveryError::QueueFull`] when `max_depth` is reached
    pub fn enqueue(&self, new: NewJob, default_max_attempts: u32) -> Result<JobId, DeliveryError> {
        let now = Instant::now();
        let job = Job {
            id: JobId::generate(),
            message: new.message,
            template: new.template,
            priority: new.priority,
            attempts: new.attempts,
            max_attempts: new.max_attempts.unwrap_or(default_max_attempts).max(1),
            not_before: now + new.delay,
            created_at: SystemTime::now(),
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        };
        let id = job.id;

        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(DeliveryError::ShuttingDown);
            }
            if let Some(max_depth) = self.config.max_depth
                && state.depth() >= max_depth
            {
                return Err(DeliveryError::QueueFull {
                    depth: state.depth(),
                });
            }
            state.insert(job, now);
        }

        internal!(
            level = DEBUG,
            job_id = %id,
            priority = ?new.priority,
            delay_ms = u64::try_from(new.delay.as_millis()).unwrap_or(u64::MAX),
            "Enqueued job"
        );
        self.notify.notify_one();

        Ok(id)
    }

    /// Wait for the next due job
    ///
    /// Returns `None` once the queue is closed. The job stays accounted as
    /// active until it is completed, failed, rescheduled or removed.
    pub async fn dequeue(&self) -> Option<Job> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_due = {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                state.promote(Instant::now());
                if let Some(job) = state.pop_ready() {
                    return Some(job);
                }
                state.next_due()
            };

            match next_due {
                Some(at) => {
                    tokio::select! {
                        () = &mut notified => {}
                        () = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Put an active job back with a new not-before instant
    pub fn reschedule(&self, mut job: Job, delay: Duration) {
        let now = Instant::now();
        job.not_before = now + delay;

        {
            let mut state = self.state.lock();
            state.active.remove(&job.id);
            state.insert(job, now);
        }
        self.notify.notify_one();
    }

    /// Acknowledge a delivered job
    pub fn complete(&self, id: &JobId) {
        let mut state = self.state.lock();
        if state.active.remove(id).is_some() {
            state.completed += 1;
        }
    }

    /// Drop an active job that left the queue undelivered
    pub fn fail(&self, id: &JobId) {
        let mut state = self.state.lock();
        if state.active.remove(id).is_some() {
            state.failed += 1;
        }
    }

    /// Remove a job that is not yet due
    ///
    /// Returns `false` if the job is unknown, due, or already held by a
    /// worker.
    pub fn cancel(&self, id: &JobId) -> bool {
        let mut state = self.state.lock();
        state.promote(Instant::now());

        let Some(job) = state.jobs.get(id) else {
            return false;
        };
        let key = (job.not_before, job.sequence);
        if state.delayed.remove(&key).is_none() {
            return false;
        }
        state.jobs.remove(id);
        drop(state);

        internal!(level = DEBUG, job_id = %id, "Cancelled delayed job");
        true
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let mut state = self.state.lock();
        state.promote(Instant::now());

        QueueSnapshot {
            waiting: state.jobs.len() - state.delayed.len(),
            active: state.active.len(),
            completed: state.completed,
            failed: state.failed,
            delayed: state.delayed.len(),
        }
    }

    /// Stop admitting jobs and wake every waiting worker
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Take every job still held: waiting and delayed ones, plus active ones
    /// whose worker never finished. Ordered by priority then creation.
    pub fn drain_pending(&self) -> Vec<Job> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.ready.clear();
        state.delayed.clear();

        let mut jobs: Vec<Job> = state
            .jobs
            .drain()
            .chain(state.active.drain())
            .map(|(_, job)| job)
            .collect();
        drop(guard);

        jobs.sort_by_key(|job| (job.priority, job.sequence));
        jobs
    }
}
