use std::{fmt, str::FromStr, time::SystemTime};

use courier_common::Message;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::time::{Duration, Instant};

/// Unique job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(ulid::Ulid);

impl JobId {
    pub fn generate() -> Self {
        Self(ulid::Ulid::new())
    }

    pub const fn ulid(&self) -> ulid::Ulid {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ulid::Ulid::from_string(s).map(Self)
    }
}

impl Serialize for JobId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Dequeue preference; `High` sorts first
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

/// A template the worker renders into the message's HTML body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateRef {
    pub name: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub message: Message,
    pub template: Option<TemplateRef>,
    pub priority: Priority,
    /// Processing attempts made so far
    pub attempts: u32,
    pub max_attempts: u32,
    /// The job is not dequeued before this instant
    pub not_before: Instant,
    pub created_at: SystemTime,
    pub(crate) sequence: u64,
}

impl Job {
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    pub const fn attempts_remaining(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Everything needed to enqueue a job
#[derive(Debug, Clone)]
pub struct NewJob {
    pub message: Message,
    pub template: Option<TemplateRef>,
    pub priority: Priority,
    pub delay: Duration,
    /// Attempts already spent elsewhere, e.g. a failed synchronous send
    pub attempts: u32,
    /// Falls back to the retry policy's limit when unset
    pub max_attempts: Option<u32>,
}

impl NewJob {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            template: None,
            priority: Priority::default(),
            delay: Duration::ZERO,
            attempts: 0,
            max_attempts: None,
        }
    }

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
    pub const fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn template(mut self, name: impl Into<String>, data: serde_json::Value) -> Self {
        self.template = Some(TemplateRef {
            name: name.into(),
            data,
        });
        self
    }
}
