//! Typed error handling for the delivery pipeline.
//!
//! Errors fall into two groups:
//! - Admission errors (validation, unknown templates, rate limits) that are
//!   returned to the caller straight away and never retried
//! - Transport errors that the workers retry with backoff and only report as
//!   terminal failure events once attempts run out

use std::time::Duration;

use courier_common::ValidationError;
use courier_spool::{RecordId, SpoolError};
use thiserror::Error;

/// Top-level delivery error type.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The message is malformed and can never be sent as written.
    #[error("Invalid message: {0}")]
    Validation(#[from] ValidationError),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    /// The template exists but could not be compiled or rendered.
    #[error(transparent)]
    Template(TemplateError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The breaker short-circuited the call; the message went to the
    /// failure store instead (`record` is `None` if that write failed too).
    #[error("Circuit open, message diverted to failure store")]
    CircuitOpen { record: Option<RecordId> },

    #[error("Rate limit reached, retry after {}ms", .retry_after.as_millis())]
    RateLimited { retry_after: Duration },

    #[error("Queue is full ({depth} jobs)")]
    QueueFull { depth: usize },

    #[error("Service is shutting down")]
    ShuttingDown,

    #[error("Failure store error: {0}")]
    Spool(#[from] SpoolError),
}

/// Classified failure reported by a mail carrier.
///
/// Every variant is retried per the retry policy. `Auth` is flagged for
/// operator attention because credentials rarely fix themselves.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Connection refused, reset, TLS failure or timeout
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// The carrier rejected the sender, a recipient or the message itself
    #[error("Envelope error: {0}")]
    Envelope(String),

    #[error("Transport error: {0}")]
    Unknown(String),
}

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Template not found: {0}")]
    NotFound(String),

    #[error("Failed to load template {name}: {source}")]
    Load {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to compile template {name}: {source}")]
    Compile {
        name: String,
        #[source]
        source: minijinja::Error,
    },

    #[error("Failed to render template {name}: {source}")]
    Render {
        name: String,
        #[source]
        source: minijinja::Error,
    },
}

impl DeliveryError {
    /// Returns `true` if a worker should try this delivery again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Returns `true` for errors the caller caused and must fix.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::TemplateNotFound(_) | Self::Template(_)
        )
    }

    /// Returns `true` if an operator should be told about this error.
    #[must_use]
    pub const fn requires_alert(&self) -> bool {
        matches!(self, Self::Transport(e) if e.requires_alert())
    }
}

impl TransportError {
    #[must_use]
    pub const fn requires_alert(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Short stable name for logs and events
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::Connectivity(_) => "connectivity",
            Self::Envelope(_) => "envelope",
            Self::Unknown(_) => "unknown",
        }
    }

    pub(crate) fn timed_out(after: Duration) -> Self {
        Self::Connectivity(format!(
            "delivery timed out after {}ms",
            after.as_millis()
        ))
    }
}

impl From<TemplateError> for DeliveryError {
    fn from(error: TemplateError) -> Self {
        match error {
            TemplateError::NotFound(name) => Self::TemplateNotFound(name),
            other => Self::Template(other),
        }
    }
}

impl From<lettre::error::Error> for TransportError {
    fn from(error: lettre::error::Error) -> Self {
        Self::Envelope(error.to_string())
    }
}

impl From<lettre::address::AddressError> for TransportError {
    fn from(error: lettre::address::AddressError) -> Self {
        Self::Envelope(format!("invalid address: {error}"))
    }
}
