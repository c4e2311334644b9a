//! Asynchronous, fault-tolerant outbound mail delivery
//!
//! This crate provides:
//! - A transport adapter with pooled carrier connections (SMTP or logging)
//! - A template renderer with a bounded compile cache
//! - A circuit breaker that diverts to the failure store while open
//! - A priority- and delay-aware job queue drained by a bounded worker pool
//! - Exponential-backoff retries and rolling-window admission limits
//! - A health monitor fed by the job event stream
//!
//! [`MailService`] assembles all of it.

pub mod circuit_breaker;
mod error;
pub mod events;
pub mod monitor;
pub mod policy;
pub mod queue;
pub mod rate_limiter;
pub mod service;
pub mod template;
pub mod transport;
pub mod worker;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, ProtectedTransport};
pub use error::{DeliveryError, TemplateError, TransportError};
pub use events::{EventBus, JobEvent};
pub use monitor::{HealthMonitor, HealthSnapshot, MonitorConfig, TransportHealth};
pub use policy::RetryPolicy;
pub use queue::{Job, JobId, JobQueue, NewJob, Priority, QueueConfig, QueueSnapshot};
pub use rate_limiter::{LimitPolicy, RateLimitConfig, RateLimiter};
pub use service::{
    BatchOptions, BulkError, BulkReport, DeliveryConfig, MailService, RetryReport, SendOptions,
    SendOutcome, ShutdownReport,
};
pub use template::{TemplateConfig, TemplateRenderer, TemplateSource};
pub use transport::{
    DeliveryReceipt, LogConfig, LogTransport, MessageDefaults, PooledTransport, SmtpCarrier,
    SmtpConfig, TlsMode, Transport, TransportConfig,
};
