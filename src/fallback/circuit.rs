//! Per-backend circuit breaker.
//!
//! ```text
//!            failures >= threshold
//!   Closed ─────────────────────────▶ Open
//!     ▲                                │
//!     │ probe ok        reset timeout  │
//!     │                  elapsed       ▼
//!     └──────────────────────────── HalfOpen
//!                probe failed ──▶ Open (timer restarts)
//! ```
//!
//! The breaker is a plain state machine: every method takes `now`, so
//! callers decide which clock to use and tests can drive it directly.

use crate::constants::{DEFAULT_CIRCUIT_RESET_TIMEOUT, DEFAULT_FAILURE_THRESHOLD};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// All requests pass.
    Closed,
    /// All requests are rejected.
    Open,
    /// A single probe request is allowed.
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

/// Breaker tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time after the last failure before a probe is allowed.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout: DEFAULT_CIRCUIT_RESET_TIMEOUT,
        }
    }
}

/// Three-state circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    /// Set while the half-open probe is outstanding.
    probe_started_at: Option<Instant>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            probe_started_at: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    #[must_use]
    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    fn reset_elapsed(&self, since: Option<Instant>, now: Instant) -> bool {
        since.map_or(true, |t| now.saturating_duration_since(t) >= self.config.reset_timeout)
    }

    /// Whether a request would be admitted, without taking the probe permit.
    #[must_use]
    pub fn allows(&self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => self.reset_elapsed(self.last_failure_at, now),
            CircuitState::HalfOpen => self.reset_elapsed(self.probe_started_at, now),
        }
    }

    /// Admits a request, taking the half-open probe permit if needed.
    ///
    /// An outstanding probe that never reported back is abandoned after
    /// `reset_timeout`, so a lost probe cannot wedge the breaker half-open.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.reset_elapsed(self.last_failure_at, now) {
                    self.state = CircuitState::HalfOpen;
                    self.probe_started_at = Some(now);
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if self.reset_elapsed(self.probe_started_at, now) {
                    self.probe_started_at = Some(now);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Records a successful request; closes the circuit.
    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.probe_started_at = None;
    }

    /// Records a failed request.
    ///
    /// Returns true if this failure moved the breaker into `Open`.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_at = Some(now);
        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.probe_started_at = None;
                true
            }
            CircuitState::Closed if self.consecutive_failures >= self.config.failure_threshold => {
                self.state = CircuitState::Open;
                true
            }
            CircuitState::Closed | CircuitState::Open => false,
        }
    }

    /// Forces the circuit open, as if the threshold had just been reached.
    pub fn trip(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.last_failure_at = Some(now);
        self.probe_started_at = None;
        self.consecutive_failures = self.consecutive_failures.max(self.config.failure_threshold);
    }

    /// Returns the breaker to a fresh closed state.
    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.last_failure_at = None;
        self.probe_started_at = None;
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
