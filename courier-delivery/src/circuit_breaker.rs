//! Circuit breaker guarding the transport
//!
//! Protects the worker pool from hammering a carrier that is known to be
//! down. While the circuit is open every delivery is handed to a
//! [`Fallback`] (the failure store) instead of the transport.
//!
//! # State Transitions
//!
//! ```text
//! ┌─────────┐  Failure threshold reached   ┌──────┐
//! │ Closed  │ ──────────────────────────>  │ Open │ <─┐
//! └─────────┘    within the failure window └──────┘   │
//!     ^                                        │      │
//!     │                                        │ Cooldown elapsed
//!     │                                        v      │
//!     │  Trial succeeds       ┌───────────────┐       │
//!     └───────────────────────│  Half-Open    │───────┘
//!                             └───────────────┘ Trial fails
//! ```
//!
//! Half-open admits exactly one trial call; everything else arriving while
//! the trial is in flight is rejected as if the circuit were open.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use courier_common::{Message, internal};
use courier_spool::{FailureOrigin, FailureSpool, RecordId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{
    DeliveryError, TransportError,
    transport::{DeliveryReceipt, Transport},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of failures required to open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time window for counting failures (seconds)
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,

    /// How long the circuit stays open before a trial call (seconds)
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window_secs: default_failure_window_secs(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

const fn default_failure_threshold() -> u32 {
    5
}

const fn default_failure_window_secs() -> u64 {
    60
}

const fn default_cooldown_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Tripped; every call goes to the fallback
    Open,
    /// Cooldown elapsed; one trial call decides the next state
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        })
    }
}

#[derive(Debug)]
struct BreakerData {
    state: CircuitState,
    failure_count: u32,
    first_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl BreakerData {
    const fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            first_failure_at: None,
            opened_at: None,
            trial_in_flight: false,
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.trial_in_flight = false;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.first_failure_at = None;
        self.opened_at = None;
        self.trial_in_flight = false;
    }
}

/// Outcome of asking the breaker whether a call may proceed
#[derive(Debug)]
pub enum Admission<'a> {
    Allowed,
    /// The single half-open trial; dropping it without recording an outcome
    /// lets the next caller take the trial instead
    Trial(TrialGuard<'a>),
    Rejected,
}

impl Admission<'_> {
    pub const fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected)
    }
}

#[derive(Debug)]
pub struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
}

impl TrialGuard<'_> {
    /// The trial reached the carrier; returns `true` if the circuit closed
    pub fn succeeded(self) -> bool {
        let mut data = self.breaker.data.lock();
        if data.state != CircuitState::HalfOpen {
            return false;
        }

        data.close();
        internal!(
            level = INFO,
            "Circuit breaker CLOSED - normal operation resumed"
        );
        true
    }

    /// The trial failed; returns `true` if the circuit reopened
    pub fn failed(self) -> bool {
        let mut data = self.breaker.data.lock();
        if data.state != CircuitState::HalfOpen {
            return false;
        }

        data.open();
        internal!(
            level = WARN,
            "Circuit breaker trial failed - reopening circuit"
        );
        true
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        let mut data = self.breaker.data.lock();
        if data.state == CircuitState::HalfOpen {
            data.trial_in_flight = false;
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    data: Mutex<BreakerData>,
}

impl CircuitBreaker {
    #[must_use]
    pub const fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            data: Mutex::new(BreakerData::new()),
        }
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.config.failure_window_secs)
    }

    fn cooldown(&self) -> Duration {
        Duration::from_secs(self.config.cooldown_secs)
    }

    /// Decide whether a call may reach the transport
    pub fn admit(&self) -> Admission<'_> {
        let mut data = self.data.lock();

        match data.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let cooled = data
                    .opened_at
                    .is_some_and(|opened| opened.elapsed() >= self.cooldown());
                if !cooled {
                    return Admission::Rejected;
                }

                data.state = CircuitState::HalfOpen;
                data.trial_in_flight = true;
                internal!(
                    level = INFO,
                    "Circuit breaker entering HALF-OPEN state - testing recovery"
                );
                Admission::Trial(TrialGuard { breaker: self })
            }
            CircuitState::HalfOpen if data.trial_in_flight => Admission::Rejected,
            CircuitState::HalfOpen => {
                data.trial_in_flight = true;
                Admission::Trial(TrialGuard { breaker: self })
            }
        }
    }

    /// Record a success for a call admitted while closed
    ///
    /// Outcomes of calls that were admitted before the circuit opened are
    /// ignored once it is open or half-open; only the [`TrialGuard`] decides
    /// the half-open transition.
    pub fn record_success(&self) {
        let mut data = self.data.lock();
        if data.state == CircuitState::Closed {
            data.failure_count = 0;
            data.first_failure_at = None;
        }
    }

    /// Record a failure for a call admitted while closed
    ///
    /// Returns `true` if the circuit opened as a result.
    pub fn record_failure(&self) -> bool {
        let mut data = self.data.lock();
        if data.state != CircuitState::Closed {
            return false;
        }

        let now = Instant::now();
        let expired = data
            .first_failure_at
            .is_none_or(|first| now.duration_since(first) > self.window());
        if expired {
            data.failure_count = 0;
            data.first_failure_at = Some(now);
        }

        data.failure_count += 1;
        if data.failure_count < self.config.failure_threshold {
            return false;
        }

        data.open();
        internal!(
            level = WARN,
            failure_count = data.failure_count,
            threshold = self.config.failure_threshold,
            cooldown_secs = self.config.cooldown_secs,
            "Circuit breaker OPENED - diverting deliveries to the failure store"
        );
        true
    }

    pub fn state(&self) -> CircuitState {
        self.data.lock().state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let data = self.data.lock();
        CircuitBreakerStats {
            state: data.state,
            failure_count: data.failure_count,
            trial_in_flight: data.trial_in_flight,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    /// Failures counted in the current window
    pub failure_count: u32,
    pub trial_in_flight: bool,
}

/// Where a message goes when the breaker will not let it through
#[async_trait]
pub trait Fallback: Send + Sync + std::fmt::Debug {
    /// Keep the message for later; `None` if that failed as well
    async fn divert(&self, message: &Message, reason: &str, attempts: u32) -> Option<RecordId>;
}

#[async_trait]
impl Fallback for FailureSpool {
    async fn divert(&self, message: &Message, reason: &str, attempts: u32) -> Option<RecordId> {
        self.persist(message, reason, FailureOrigin::CircuitOpen, attempts)
            .await
    }
}

/// The transport behind a circuit breaker with its fallback
#[derive(Debug, Clone)]
pub struct ProtectedTransport {
    transport: Arc<dyn Transport>,
    breaker: Arc<CircuitBreaker>,
    fallback: Arc<dyn Fallback>,
}

impl ProtectedTransport {
    pub fn new(
        transport: Arc<dyn Transport>,
        breaker: Arc<CircuitBreaker>,
        fallback: Arc<dyn Fallback>,
    ) -> Self {
        Self {
            transport,
            breaker,
            fallback,
        }
    }

    pub const fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub const fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Deliver through the breaker, bounded by `timeout`
    ///
    /// # Errors
    /// [`DeliveryError::CircuitOpen`] when the call was diverted, otherwise
    /// the classified transport failure (a timeout is a connectivity error)
    #[tracing::instrument(level = "debug", skip_all, fields(transport = self.transport.name()))]
    pub async fn deliver(
        &self,
        message: &Message,
        attempts: u32,
        timeout: Duration,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let admission = self.breaker.admit();
        if admission.is_rejected() {
            let record = self
                .fallback
                .divert(message, "circuit open", attempts)
                .await;
            return Err(DeliveryError::CircuitOpen { record });
        }

        let result = tokio::time::timeout(timeout, self.transport.deliver(message))
            .await
            .unwrap_or_else(|_| Err(TransportError::timed_out(timeout)));

        match (admission, result.is_ok()) {
            (Admission::Trial(trial), true) => {
                trial.succeeded();
            }
            (Admission::Trial(trial), false) => {
                trial.failed();
            }
            (_, true) => self.breaker.record_success(),
            (_, false) => {
                self.breaker.record_failure();
            }
        }

        result.map_err(DeliveryError::from)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn breaker(threshold: u32, window: u64, cooldown: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            failure_window_secs: window,
            cooldown_secs: cooldown,
        })
    }

    #[test]
    fn test_circuit_breaker_closed_to_open() {
        let breaker = breaker(3, 60, 5);

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(matches!(breaker.admit(), Admission::Allowed));

        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert_eq!(breaker.state(), CircuitState::Closed);

        assert!(breaker.record_failure());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.admit().is_rejected());
    }

    #[test]
    fn test_circuit_breaker_half_open_success() {
        let breaker = breaker(2, 60, 0);

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        let Admission::Trial(trial) = breaker.admit() else {
            panic!("expected the half-open trial");
        };
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert!(trial.succeeded());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().failure_count, 0);
    }

    #[test]
    fn test_circuit_breaker_half_open_failure() {
        let breaker = breaker(2, 60, 0);

        breaker.record_failure();
        breaker.record_failure();

        let Admission::Trial(trial) = breaker.admit() else {
            panic!("expected the half-open trial");
        };
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert!(trial.failed());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.admit().is_rejected());
    }

    #[test]
    fn test_late_outcomes_do_not_decide_half_open() {
        let breaker = breaker(1, 60, 0);

        // Admitted while closed, still in flight when the circuit trips
        let early = breaker.admit();
        assert!(matches!(early, Admission::Allowed));
        assert!(breaker.record_failure());

        let Admission::Trial(trial) = breaker.admit() else {
            panic!("expected the half-open trial");
        };

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(!breaker.record_failure());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.stats().trial_in_flight);
        drop(early);

        assert!(trial.succeeded());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_admits_single_trial() {
        let breaker = breaker(1, 60, 0);
        breaker.record_failure();

        let trial = breaker.admit();
        assert!(matches!(trial, Admission::Trial(_)));
        assert!(breaker.admit().is_rejected());
        assert!(breaker.admit().is_rejected());
        assert!(breaker.stats().trial_in_flight);

        // An abandoned trial frees the slot for the next caller
        drop(trial);
        assert!(matches!(breaker.admit(), Admission::Trial(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_failure_window_expiry() {
        let breaker = breaker(3, 1, 5);

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        tokio::time::advance(Duration::from_secs(2)).await;

        // Next failure starts a new window
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_respected() {
        let breaker = breaker(1, 60, 30);
        breaker.record_failure();

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(breaker.admit().is_rejected());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(matches!(breaker.admit(), Admission::Trial(_)));
    }

    #[test]
    fn test_circuit_breaker_success_resets_failures() {
        let breaker = breaker(3, 60, 5);

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().failure_count, 2);
    }
}
