//! Per-backend health record.
//!
//! Providers only report facts (an attempt succeeded, failed, took N ms).
//! The orchestrator owns the record and the interpretation.

use crate::constants::SPEED_SCORE_CEILING_MS;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Rolling health of one backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderHealth {
    pub healthy: bool,
    pub circuit_open: bool,
    pub consecutive_failures: u32,
    pub average_spawn_time_ms: f64,
    pub spawn_attempts: u64,
    pub spawn_successes: u64,
    pub last_error: Option<String>,
    pub last_checked: Option<DateTime<Utc>>,
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self {
            healthy: true,
            circuit_open: false,
            consecutive_failures: 0,
            average_spawn_time_ms: 0.0,
            spawn_attempts: 0,
            spawn_successes: 0,
            last_error: None,
            last_checked: None,
        }
    }
}

impl ProviderHealth {
    /// Records a successful spawn and folds its latency into the average.
    pub fn record_spawn_success(&mut self, latency_ms: f64) {
        self.spawn_attempts += 1;
        self.spawn_successes += 1;
        #[allow(clippy::cast_precision_loss)]
        let n = self.spawn_successes as f64;
        self.average_spawn_time_ms += (latency_ms - self.average_spawn_time_ms) / n;
        self.mark_success();
    }

    /// Records a failed spawn.
    pub fn record_spawn_failure(&mut self, error: impl Into<String>) {
        self.spawn_attempts += 1;
        self.mark_failure(error);
    }

    /// Clears failure state after any successful interaction.
    pub fn mark_success(&mut self) {
        self.healthy = true;
        self.consecutive_failures = 0;
        self.last_checked = Some(Utc::now());
    }

    /// Counts a failed interaction.
    pub fn mark_failure(&mut self, error: impl Into<String>) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error = Some(error.into());
        self.last_checked = Some(Utc::now());
    }

    /// Fraction of spawn attempts that succeeded; 1.0 before any attempt.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.spawn_attempts == 0 {
            return 1.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = self.spawn_successes as f64 / self.spawn_attempts as f64;
        rate
    }

    /// 1.0 for instant spawns, falling to 0.0 at the latency ceiling.
    #[must_use]
    pub fn speed_score(&self) -> f64 {
        if self.spawn_successes == 0 {
            return 1.0;
        }
        (1.0 - self.average_spawn_time_ms / SPEED_SCORE_CEILING_MS).clamp(0.0, 1.0)
    }

    /// Composite selection score in `[0, 1]`.
    ///
    /// Averages binary health, success rate and speed, plus the cost weight
    /// when one is configured for the backend.
    #[must_use]
    pub fn score(&self, cost_weight: Option<f64>) -> f64 {
        let health = if self.healthy { 1.0 } else { 0.0 };
        let mut parts = vec![health, self.success_rate(), self.speed_score()];
        if let Some(weight) = cost_weight {
            parts.push(weight.clamp(0.0, 1.0));
        }
        #[allow(clippy::cast_precision_loss)]
        let n = parts.len() as f64;
        parts.iter().sum::<f64>() / n
    }
}
