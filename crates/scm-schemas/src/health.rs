//! Windowed health aggregates fed into the circuit breaker.

use serde::{Deserialize, Serialize};

/// Aggregate rates for one breaker scope over the configured window.
///
/// `failed_rate` and `rate_limit_rate` are already normalized to `[0, 1]`;
/// `total_runs`/`total_requests` carry the denominators so the breaker can
/// refuse to trip on degenerate samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthStats {
    pub total_runs: u64,
    pub failed_rate: f64,
    pub rate_limit_rate: f64,
    pub total_requests: u64,
    pub total_timeout_count: u64,
}

impl HealthStats {
    /// Timeout rate over HTTP requests; zero when no requests were made
    /// (a zero denominator must never read as unhealthy).
    pub fn timeout_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            (self.total_timeout_count as f64 / self.total_requests as f64).min(1.0)
        }
    }
}
