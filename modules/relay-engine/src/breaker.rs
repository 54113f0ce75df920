// Per-target circuit breaker.

use std::time::Duration;

use chrono::{DateTime, Utc};
use relay_common::to_chrono;
use serde::Serialize;
use tracing::{info, warn};

/// Failure-count gate that halts polling of one target after sustained
/// failure.
///
/// While open, [`before_attempt`](Self::before_attempt) refuses until
/// `reset_timeout` has passed since the last failure, at which point the
/// breaker closes itself with a zeroed counter.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failures: u32,
    failure_threshold: u32,
    last_failure_at: Option<DateTime<Utc>>,
    reset_timeout: chrono::Duration,
    is_open: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerHealth {
    pub is_open: bool,
    pub failures: u32,
    pub failure_threshold: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// When an open breaker will allow attempts again.
    pub closes_at: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failures: 0,
            failure_threshold: failure_threshold.max(1),
            last_failure_at: None,
            reset_timeout: to_chrono(reset_timeout),
            is_open: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    fn window_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.last_failure_at
            .is_some_and(|last| now - last > self.reset_timeout)
    }

    /// Whether an attempt may be dispatched now. Closes an open breaker
    /// whose reset timeout has elapsed.
    pub fn before_attempt(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_open {
            return true;
        }
        if self.window_elapsed(now) {
            self.reset();
            info!("Circuit breaker closed after reset timeout");
            return true;
        }
        false
    }

    /// Count one failed polling attempt (a give-up, not a single retry).
    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        if self.window_elapsed(now) {
            self.failures = 0;
        }
        self.failures += 1;
        self.last_failure_at = Some(now);

        if !self.is_open && self.failures >= self.failure_threshold {
            self.is_open = true;
            warn!(
                failures = self.failures,
                reset_timeout_secs = self.reset_timeout.num_seconds(),
                "Circuit breaker opened"
            );
        }
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
    }

    /// Close the breaker and clear its counter (operator reset).
    pub fn reset(&mut self) {
        self.is_open = false;
        self.failures = 0;
    }

    /// The moment an open breaker will let attempts through again.
    pub fn closes_at(&self) -> Option<DateTime<Utc>> {
        if !self.is_open {
            return None;
        }
        self.last_failure_at.map(|last| {
            last.checked_add_signed(self.reset_timeout)
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        })
    }

    pub fn snapshot(&self) -> BreakerHealth {
        BreakerHealth {
            is_open: self.is_open,
            failures: self.failures,
            failure_threshold: self.failure_threshold,
            last_failure_at: self.last_failure_at,
            closes_at: self.closes_at(),
        }
    }
}
