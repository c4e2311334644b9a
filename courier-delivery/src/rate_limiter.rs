//! Admission rate limiting over a rolling window
//!
//! The limiter keeps the admission time of every job accepted in the last
//! `window_secs` and admits a new one only while fewer than `max_jobs` fall
//! inside the window. What happens to the excess depends on [`LimitPolicy`]:
//!
//! ```text
//! max_jobs: 3, window: 60s
//!
//! t=0s   admit, admit, admit      (3 in window)
//! t=10s  Reject → retry after 50s
//!        Delay  → admitted with not-before t=60s
//! ```

use std::{collections::VecDeque, time::Duration};

use courier_common::internal;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LimitPolicy {
    /// Refuse the admission with the time until the window has room
    #[default]
    Reject,
    /// Accept the job but hold it until the window has room
    Delay,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Jobs accepted per window; `0` disables the limiter
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,

    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    #[serde(default)]
    pub on_limit: LimitPolicy,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_jobs: default_max_jobs(),
            window_secs: default_window_secs(),
            on_limit: LimitPolicy::default(),
        }
    }
}

const fn default_max_jobs() -> usize {
    1000
}

const fn default_window_secs() -> u64 {
    60
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    /// Admission slots, oldest first; slots may lie in the future under
    /// [`LimitPolicy::Delay`]
    slots: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            slots: Mutex::new(VecDeque::new()),
        }
    }

    const fn window(&self) -> Duration {
        Duration::from_secs(self.config.window_secs)
    }

    /// Admit one job
    ///
    /// Returns `Ok(delay)` with the extra delay the job must wait before it
    /// may run (always zero under [`LimitPolicy::Reject`]), or `Err(wait)`
    /// with the time until the window has room.
    pub fn admit(&self) -> Result<Duration, Duration> {
        if self.config.max_jobs == 0 {
            return Ok(Duration::ZERO);
        }

        let now = Instant::now();
        let window = self.window();
        let mut slots = self.slots.lock();

        while slots.front().is_some_and(|slot| *slot + window <= now) {
            slots.pop_front();
        }

        let slot = if slots.len() < self.config.max_jobs {
            now
        } else {
            let earliest = slots[slots.len() - self.config.max_jobs] + window;

            if self.config.on_limit == LimitPolicy::Reject {
                let wait = earliest.saturating_duration_since(now);
                drop(slots);
                internal!(
                    level = DEBUG,
                    wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                    "Rate limit exceeded, rejecting admission"
                );
                return Err(wait);
            }

            earliest.max(now)
        };

        let position = slots.partition_point(|existing| *existing <= slot);
        slots.insert(position, slot);

        Ok(slot.saturating_duration_since(now))
    }

    /// Slots currently held in the window, including future reservations
    pub fn in_window(&self) -> usize {
        let now = Instant::now();
        let window = self.window();
        self.slots
            .lock()
            .iter()
            .filter(|slot| **slot + window > now)
            .count()
    }
}
