//! Job lifecycle events
//!
//! Workers publish a [`JobEvent`] for every state change on a broadcast
//! channel. Observers (the health monitor, the CLI, tests) subscribe and
//! see every event sent after they subscribed; a receiver that falls more
//! than `capacity` events behind skips the oldest ones.

use std::time::Duration;

use courier_spool::RecordId;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::queue::{JobId, Priority};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum JobEvent {
    Queued {
        job_id: JobId,
        priority: Priority,
    },
    Completed {
        job_id: JobId,
        message_id: String,
        attempts: u32,
    },
    /// The attempt failed and the job was put back
    Retrying {
        job_id: JobId,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    /// The job left the queue undelivered and went to the failure store
    Failed {
        job_id: JobId,
        record: Option<RecordId>,
        attempts: u32,
        error: String,
    },
    /// The circuit was open and the job was handed to the fallback
    Diverted {
        job_id: JobId,
        record: Option<RecordId>,
    },
    Cancelled {
        job_id: JobId,
    },
}

impl JobEvent {
    pub const fn job_id(&self) -> JobId {
        match self {
            Self::Queued { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Retrying { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Diverted { job_id, .. }
            | Self::Cancelled { job_id } => *job_id,
        }
    }

    /// Whether the job is finished with as a result of this event
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Diverted { .. } | Self::Cancelled { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(default_capacity())
    }
}

pub(crate) const fn default_capacity() -> usize {
    1024
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to current subscribers; events with no subscriber are dropped
    pub fn emit(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}
