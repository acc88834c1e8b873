//! Per-scope circuit breaker.
//!
//! # Design
//!
//! One controller per scope key (`<project>:global`, `<project>:instance:…`,
//! …), hydrated from `logbook.kv` at the start of every scheduler scan and
//! persisted back afterwards. State transitions:
//!
//! ```text
//!             rate ≥ threshold (≥ min_samples runs)
//!   CLOSED ─────────────────────────────────────────► OPEN
//!     ▲                                                │
//!     │ recovery_success_count                         │ open_duration_seconds
//!     │ consecutive successes                          ▼ elapsed
//!   HALF_OPEN ◄────────────────────────────────────────┘
//!     │
//!     └── any probe failure ───────────────────────► OPEN (re-armed)
//! ```
//!
//! Time is always passed in (`now` in epoch seconds); the controller never
//! reads the wall clock, which keeps the transition tests deterministic.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use scm_config::CircuitBreakerConfig;
use scm_schemas::HealthStats;

// ---------------------------------------------------------------------------
// CircuitState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "closed" => Some(CircuitState::Closed),
            "open" => Some(CircuitState::Open),
            "half_open" => Some(CircuitState::HalfOpen),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// CircuitBreakerDecision
// ---------------------------------------------------------------------------

/// What the scheduler is allowed to do under one scope's breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerDecision {
    pub allow_sync: bool,
    pub is_backfill_only: bool,
    pub is_probe_mode: bool,
    /// Probe admissions allowed across the scope this scan.
    pub probe_budget: u32,
    pub probe_job_types_allowlist: Vec<String>,
    pub suggested_batch_size: Option<u32>,
    pub suggested_diff_mode: Option<String>,
    pub suggested_forward_window_seconds: Option<u64>,
    pub wait_seconds: f64,
    pub current_state: String,
    pub trigger_reason: Option<String>,
}

impl Default for CircuitBreakerDecision {
    fn default() -> Self {
        CircuitBreakerDecision {
            allow_sync: true,
            is_backfill_only: false,
            is_probe_mode: false,
            probe_budget: 0,
            probe_job_types_allowlist: Vec::new(),
            suggested_batch_size: None,
            suggested_diff_mode: None,
            suggested_forward_window_seconds: None,
            wait_seconds: 0.0,
            current_state: CircuitState::Closed.as_str().to_string(),
            trigger_reason: None,
        }
    }
}

/// Fold several applicable scope decisions into the binding one: the most
/// restrictive wins on every axis (`allow_sync` AND-ed, degradation OR-ed,
/// batch sizes min-ed).
pub fn combine_decisions(decisions: &[&CircuitBreakerDecision]) -> CircuitBreakerDecision {
    let mut combined = CircuitBreakerDecision::default();
    for d in decisions {
        combined.allow_sync &= d.allow_sync;
        combined.is_backfill_only |= d.is_backfill_only;
        if d.is_probe_mode {
            combined.is_probe_mode = true;
            combined.probe_budget = if combined.probe_budget == 0 {
                d.probe_budget
            } else {
                combined.probe_budget.min(d.probe_budget)
            };
            if combined.probe_job_types_allowlist.is_empty() {
                combined.probe_job_types_allowlist = d.probe_job_types_allowlist.clone();
            } else {
                combined
                    .probe_job_types_allowlist
                    .retain(|jt| d.probe_job_types_allowlist.contains(jt));
            }
        }
        combined.suggested_batch_size = match (combined.suggested_batch_size, d.suggested_batch_size)
        {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        if d.suggested_diff_mode.as_deref() == Some("none") {
            combined.suggested_diff_mode = Some("none".to_string());
        } else if combined.suggested_diff_mode.is_none() {
            combined.suggested_diff_mode = d.suggested_diff_mode.clone();
        }
        combined.suggested_forward_window_seconds = match (
            combined.suggested_forward_window_seconds,
            d.suggested_forward_window_seconds,
        ) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        combined.wait_seconds = combined.wait_seconds.max(d.wait_seconds);
        if severity(&d.current_state) > severity(&combined.current_state) {
            combined.current_state = d.current_state.clone();
        }
        if combined.trigger_reason.is_none() {
            combined.trigger_reason = d.trigger_reason.clone();
        }
    }
    combined
}

fn severity(state: &str) -> u8 {
    match state {
        "open" => 2,
        "half_open" => 1,
        _ => 0,
    }
}

// ---------------------------------------------------------------------------
// CircuitBreakerController
// ---------------------------------------------------------------------------

/// State machine for one scope key. Never shared between scopes.
#[derive(Debug, Clone)]
pub struct CircuitBreakerController {
    key: String,
    config: CircuitBreakerConfig,
    state: CircuitState,
    opened_at: Option<f64>,
    half_open_attempts: u32,
    half_open_successes: u32,
    last_failure_reason: Option<String>,
    smoothed_failure_rate: f64,
    smoothed_rate_limit_rate: f64,
    smoothed_timeout_rate: f64,
}

impl CircuitBreakerController {
    pub fn new(key: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        CircuitBreakerController {
            key: key.into(),
            config,
            state: CircuitState::Closed,
            opened_at: None,
            half_open_attempts: 0,
            half_open_successes: 0,
            last_failure_reason: None,
            smoothed_failure_rate: 0.0,
            smoothed_rate_limit_rate: 0.0,
            smoothed_timeout_rate: 0.0,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == CircuitState::Closed
    }

    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }

    pub fn is_half_open(&self) -> bool {
        self.state == CircuitState::HalfOpen
    }

    pub fn last_failure_reason(&self) -> Option<&str> {
        self.last_failure_reason.as_deref()
    }

    // -- check --------------------------------------------------------------

    /// Evaluate the scope's health and return the binding decision.
    /// May transition CLOSED→OPEN (rates over threshold) or OPEN→HALF_OPEN
    /// (open duration elapsed).
    pub fn check(&mut self, health: Option<&HealthStats>, now: f64) -> CircuitBreakerDecision {
        if self.state == CircuitState::Open {
            let elapsed = self.opened_at.map(|t| now - t).unwrap_or(0.0);
            if elapsed >= self.config.open_duration_seconds {
                self.state = CircuitState::HalfOpen;
                self.half_open_attempts = 0;
                self.half_open_successes = 0;
            }
        }

        match self.state {
            CircuitState::Closed => self.check_closed(health, now),
            CircuitState::Open => self.open_decision(now),
            CircuitState::HalfOpen => self.half_open_decision(),
        }
    }

    fn check_closed(&mut self, health: Option<&HealthStats>, now: f64) -> CircuitBreakerDecision {
        let stats = health.copied().unwrap_or_default();

        let (failure, rate_limit, timeout) = if self.config.enable_smoothing {
            if stats.total_runs > 0 {
                let alpha = self.config.smoothing_alpha;
                self.smoothed_failure_rate =
                    alpha * stats.failed_rate + (1.0 - alpha) * self.smoothed_failure_rate;
                self.smoothed_rate_limit_rate =
                    alpha * stats.rate_limit_rate + (1.0 - alpha) * self.smoothed_rate_limit_rate;
                self.smoothed_timeout_rate =
                    alpha * stats.timeout_rate() + (1.0 - alpha) * self.smoothed_timeout_rate;
            }
            (
                self.smoothed_failure_rate,
                self.smoothed_rate_limit_rate,
                self.smoothed_timeout_rate,
            )
        } else {
            (stats.failed_rate, stats.rate_limit_rate, stats.timeout_rate())
        };

        if stats.total_runs < self.config.min_samples as u64 {
            return CircuitBreakerDecision::default();
        }

        let trigger = if failure >= self.config.failure_rate_threshold {
            Some(format!("failure_rate={:.0}%", failure * 100.0))
        } else if rate_limit >= self.config.rate_limit_threshold {
            Some(format!("rate_limit_rate={:.0}%", rate_limit * 100.0))
        } else if stats.total_requests > 0 && timeout >= self.config.timeout_rate_threshold {
            Some(format!("timeout_rate={:.0}%", timeout * 100.0))
        } else {
            None
        };

        match trigger {
            Some(reason) => {
                self.trip(reason, now);
                self.open_decision(now)
            }
            None => CircuitBreakerDecision::default(),
        }
    }

    fn trip(&mut self, reason: String, now: f64) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.last_failure_reason = Some(reason);
    }

    fn open_decision(&self, now: f64) -> CircuitBreakerDecision {
        let elapsed = self.opened_at.map(|t| now - t).unwrap_or(0.0);
        CircuitBreakerDecision {
            allow_sync: self.config.backfill_only_mode,
            is_backfill_only: true,
            is_probe_mode: false,
            probe_budget: 0,
            probe_job_types_allowlist: Vec::new(),
            suggested_batch_size: Some(self.config.degraded_batch_size),
            suggested_diff_mode: Some("none".to_string()),
            suggested_forward_window_seconds: Some(self.config.degraded_forward_window_seconds),
            wait_seconds: (self.config.open_duration_seconds - elapsed).max(0.0),
            current_state: CircuitState::Open.as_str().to_string(),
            trigger_reason: self.last_failure_reason.clone(),
        }
    }

    fn half_open_decision(&self) -> CircuitBreakerDecision {
        // Batch size grows geometrically with each recorded probe success,
        // starting from the degraded floor.
        let doublings = self.half_open_successes.min(6);
        let batch = self
            .config
            .degraded_batch_size
            .saturating_mul(1u32 << doublings);
        let diff_mode = if self.half_open_successes == 0 {
            "none"
        } else {
            "best_effort"
        };

        CircuitBreakerDecision {
            allow_sync: true,
            is_backfill_only: true,
            is_probe_mode: true,
            probe_budget: self.config.probe_budget_per_interval,
            probe_job_types_allowlist: self.config.probe_job_types_allowlist.clone(),
            suggested_batch_size: Some(batch),
            suggested_diff_mode: Some(diff_mode.to_string()),
            suggested_forward_window_seconds: Some(self.config.degraded_forward_window_seconds),
            wait_seconds: 0.0,
            current_state: CircuitState::HalfOpen.as_str().to_string(),
            trigger_reason: self.last_failure_reason.clone(),
        }
    }

    // -- record_result ------------------------------------------------------

    /// Feed one probe/run outcome. Only meaningful in HALF_OPEN: enough
    /// consecutive successes close the breaker, any failure re-opens it.
    pub fn record_result(&mut self, success: bool, error_category: Option<&str>, now: f64) {
        if self.state != CircuitState::HalfOpen {
            return;
        }
        self.half_open_attempts += 1;
        if success {
            self.half_open_successes += 1;
            if self.half_open_successes >= self.config.recovery_success_count {
                self.close();
            }
        } else {
            let reason = error_category.unwrap_or("half_open_failure").to_string();
            self.trip(reason, now);
            self.half_open_attempts = 0;
            self.half_open_successes = 0;
        }
    }

    // -- manual controls ----------------------------------------------------

    pub fn force_open(&mut self, reason: impl Into<String>, now: f64) {
        self.trip(reason.into(), now);
    }

    pub fn force_close(&mut self) {
        self.close();
    }

    pub fn reset(&mut self) {
        self.close();
        self.half_open_attempts = 0;
        self.half_open_successes = 0;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.last_failure_reason = None;
        self.smoothed_failure_rate = 0.0;
        self.smoothed_rate_limit_rate = 0.0;
        self.smoothed_timeout_rate = 0.0;
    }

    // -- persistence --------------------------------------------------------

    /// Full state for `logbook.kv`, including smoothing and probe counters.
    pub fn get_state_dict(&self) -> Value {
        json!({
            "key": self.key,
            "state": self.state.as_str(),
            "opened_at": self.opened_at,
            "half_open_attempts": self.half_open_attempts,
            "half_open_successes": self.half_open_successes,
            "last_failure_reason": self.last_failure_reason,
            "smoothed_failure_rate": self.smoothed_failure_rate,
            "smoothed_rate_limit_rate": self.smoothed_rate_limit_rate,
            "smoothed_timeout_rate": self.smoothed_timeout_rate,
        })
    }

    /// Restore state from a KV blob. An unrecognized state string falls back
    /// to CLOSED; the controller keeps its own `key` regardless of what the
    /// blob carries.
    pub fn load_state_dict(&mut self, data: &Value) {
        self.state = data
            .get("state")
            .and_then(Value::as_str)
            .and_then(CircuitState::parse)
            .unwrap_or(CircuitState::Closed);
        self.opened_at = data.get("opened_at").and_then(Value::as_f64);
        self.half_open_attempts = data
            .get("half_open_attempts")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        self.half_open_successes = data
            .get("half_open_successes")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        self.last_failure_reason = data
            .get("last_failure_reason")
            .and_then(Value::as_str)
            .map(str::to_string);
        self.smoothed_failure_rate = data
            .get("smoothed_failure_rate")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        self.smoothed_rate_limit_rate = data
            .get("smoothed_rate_limit_rate")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        self.smoothed_timeout_rate = data
            .get("smoothed_timeout_rate")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_smoothing(overrides: impl FnOnce(&mut CircuitBreakerConfig)) -> CircuitBreakerConfig {
        let mut cfg = CircuitBreakerConfig {
            enable_smoothing: false,
            ..Default::default()
        };
        overrides(&mut cfg);
        cfg
    }

    fn stats(total_runs: u64, failed_rate: f64, rate_limit_rate: f64) -> HealthStats {
        HealthStats {
            total_runs,
            failed_rate,
            rate_limit_rate,
            total_requests: 100,
            total_timeout_count: 0,
        }
    }

    #[test]
    fn initial_state_is_closed() {
        let controller = CircuitBreakerController::new("k", CircuitBreakerConfig::default());
        assert!(controller.is_closed());
        assert!(!controller.is_open());
        assert!(!controller.is_half_open());
    }

    #[test]
    fn healthy_stats_allow_sync() {
        let mut controller = CircuitBreakerController::new("k", CircuitBreakerConfig::default());
        let decision = controller.check(Some(&stats(10, 0.1, 0.05)), 1000.0);
        assert!(decision.allow_sync);
        assert!(!decision.is_backfill_only);
        assert_eq!(decision.current_state, "closed");
    }

    #[test]
    fn trips_on_high_failure_rate() {
        let mut controller = CircuitBreakerController::new("k", no_smoothing(|_| {}));
        let decision = controller.check(Some(&stats(10, 0.4, 0.0)), 1000.0);
        assert!(controller.is_open());
        assert_eq!(decision.current_state, "open");
        assert!(decision.trigger_reason.unwrap().contains("failure_rate"));
    }

    #[test]
    fn trips_on_high_rate_limit_rate() {
        let mut controller = CircuitBreakerController::new("k", no_smoothing(|_| {}));
        let decision = controller.check(Some(&stats(10, 0.0, 0.25)), 1000.0);
        assert!(controller.is_open());
        assert!(decision.trigger_reason.unwrap().contains("rate_limit_rate"));
    }

    #[test]
    fn trips_on_high_timeout_rate() {
        let mut controller = CircuitBreakerController::new("k", no_smoothing(|_| {}));
        let health = HealthStats {
            total_runs: 10,
            failed_rate: 0.0,
            rate_limit_rate: 0.0,
            total_requests: 100,
            total_timeout_count: 25,
        };
        let decision = controller.check(Some(&health), 1000.0);
        assert!(controller.is_open());
        assert!(decision.trigger_reason.unwrap().contains("timeout_rate"));
    }

    #[test]
    fn exactly_at_threshold_trips() {
        let mut controller = CircuitBreakerController::new("k", no_smoothing(|_| {}));
        controller.check(Some(&stats(10, 0.3, 0.0)), 1000.0);
        assert!(controller.is_open());
    }

    #[test]
    fn insufficient_samples_never_trip() {
        let mut controller = CircuitBreakerController::new("k", no_smoothing(|_| {}));
        let decision = controller.check(Some(&stats(4, 1.0, 0.0)), 1000.0);
        assert!(controller.is_closed());
        assert!(decision.allow_sync);
    }

    #[test]
    fn zero_requests_suppress_timeout_trip() {
        let mut controller = CircuitBreakerController::new("k", no_smoothing(|_| {}));
        let health = HealthStats {
            total_runs: 10,
            failed_rate: 0.1,
            rate_limit_rate: 0.0,
            total_requests: 0,
            total_timeout_count: 10,
        };
        controller.check(Some(&health), 1000.0);
        assert!(controller.is_closed());
    }

    #[test]
    fn smoothing_damps_a_single_bad_window() {
        // alpha 0.5, prior 0: one 0.5-failure window smooths to 0.25 < 0.3.
        let mut controller = CircuitBreakerController::new("k", CircuitBreakerConfig::default());
        controller.check(Some(&stats(10, 0.5, 0.0)), 1000.0);
        assert!(controller.is_closed());
        // A second consecutive bad window pushes the EWMA over the line.
        controller.check(Some(&stats(10, 0.5, 0.0)), 1060.0);
        assert!(controller.is_open());
    }

    #[test]
    fn open_state_returns_degraded_params() {
        let config = no_smoothing(|c| {
            c.degraded_batch_size = 10;
            c.degraded_forward_window_seconds = 300;
            c.backfill_only_mode = true;
        });
        let mut controller = CircuitBreakerController::new("k", config);
        controller.check(Some(&stats(10, 0.5, 0.0)), 1000.0);
        let decision = controller.check(Some(&stats(10, 0.5, 0.0)), 1001.0);

        assert!(decision.is_backfill_only);
        assert!(decision.allow_sync);
        assert_eq!(decision.suggested_batch_size, Some(10));
        assert_eq!(decision.suggested_forward_window_seconds, Some(300));
        assert_eq!(decision.suggested_diff_mode.as_deref(), Some("none"));
    }

    #[test]
    fn open_without_backfill_mode_blocks_sync() {
        let config = no_smoothing(|c| c.backfill_only_mode = false);
        let mut controller = CircuitBreakerController::new("k", config);
        controller.check(Some(&stats(10, 0.5, 0.0)), 1000.0);
        let decision = controller.check(None, 1001.0);
        assert!(!decision.allow_sync);
        assert!(decision.wait_seconds > 0.0);
    }

    #[test]
    fn transitions_to_half_open_after_duration() {
        let config = no_smoothing(|c| c.open_duration_seconds = 100.0);
        let mut controller = CircuitBreakerController::new("k", config);
        controller.force_open("test", 1000.0);

        // Not yet.
        controller.check(None, 1050.0);
        assert!(controller.is_open());

        let decision = controller.check(None, 1100.0);
        assert!(controller.is_half_open());
        assert_eq!(decision.current_state, "half_open");
        assert!(decision.is_probe_mode);
        assert!(decision.is_backfill_only);
        assert!(decision.allow_sync);
    }

    #[test]
    fn half_open_recovers_after_consecutive_successes() {
        let config = no_smoothing(|c| {
            c.open_duration_seconds = 100.0;
            c.recovery_success_count = 2;
        });
        let mut controller = CircuitBreakerController::new("k", config);
        controller.force_open("test", 0.0);
        controller.check(None, 200.0);
        assert!(controller.is_half_open());

        controller.record_result(true, None, 201.0);
        assert!(controller.is_half_open());
        controller.record_result(true, None, 202.0);
        assert!(controller.is_closed());
        assert!(controller.last_failure_reason().is_none());
    }

    #[test]
    fn half_open_failure_reopens_with_category_reason() {
        let config = no_smoothing(|c| c.open_duration_seconds = 100.0);
        let mut controller = CircuitBreakerController::new("k", config);
        controller.force_open("test", 0.0);
        controller.check(None, 200.0);
        controller.record_result(true, None, 201.0);
        controller.record_result(false, Some("timeout"), 202.0);

        assert!(controller.is_open());
        assert_eq!(controller.last_failure_reason(), Some("timeout"));
        // The open window restarts from the failed probe.
        controller.check(None, 250.0);
        assert!(controller.is_open());
        controller.check(None, 302.0);
        assert!(controller.is_half_open());
    }

    #[test]
    fn full_state_cycle() {
        let config = no_smoothing(|c| {
            c.open_duration_seconds = 10.0;
            c.recovery_success_count = 2;
        });
        let mut controller = CircuitBreakerController::new("k", config);

        assert!(controller.is_closed());
        controller.check(Some(&stats(10, 0.5, 0.0)), 1000.0);
        assert!(controller.is_open());
        controller.check(None, 1010.0);
        assert!(controller.is_half_open());
        controller.record_result(true, None, 1011.0);
        controller.record_result(true, None, 1012.0);
        assert!(controller.is_closed());
    }

    #[test]
    fn gradual_batch_size_recovery() {
        let config = no_smoothing(|c| {
            c.degraded_batch_size = 10;
            c.recovery_success_count = 3;
            c.open_duration_seconds = 10.0;
        });
        let mut controller = CircuitBreakerController::new("k", config);
        controller.force_open("test", 0.0);
        let first = controller.check(None, 20.0);
        assert!(controller.is_half_open());
        assert!(first.suggested_batch_size.unwrap() >= 10);
        assert_eq!(first.suggested_diff_mode.as_deref(), Some("none"));

        controller.record_result(true, None, 21.0);
        let second = controller.check(None, 22.0);
        assert!(second.suggested_batch_size.unwrap() > first.suggested_batch_size.unwrap());
        assert_eq!(second.suggested_diff_mode.as_deref(), Some("best_effort"));
    }

    #[test]
    fn force_open_close_and_reset() {
        let mut controller = CircuitBreakerController::new("k", CircuitBreakerConfig::default());

        controller.force_open("manual_test", 1000.0);
        assert!(controller.is_open());
        assert_eq!(controller.last_failure_reason(), Some("manual_test"));

        controller.force_close();
        assert!(controller.is_closed());
        assert!(controller.last_failure_reason().is_none());

        controller.force_open("again", 1000.0);
        controller.reset();
        assert!(controller.is_closed());
        let dict = controller.get_state_dict();
        assert_eq!(dict["half_open_attempts"], 0);
        assert!(dict["opened_at"].is_null());
    }

    #[test]
    fn state_dict_round_trip() {
        let mut a = CircuitBreakerController::new("scope-a", CircuitBreakerConfig::default());
        a.force_open("test_reason", 1234.5);

        let dict = a.get_state_dict();
        assert_eq!(dict["state"], "open");
        assert_eq!(dict["key"], "scope-a");
        assert_eq!(dict["last_failure_reason"], "test_reason");
        assert_eq!(dict["opened_at"], 1234.5);

        // Loading keeps the controller's own key.
        let mut b = CircuitBreakerController::new("scope-b", CircuitBreakerConfig::default());
        b.load_state_dict(&dict);
        assert!(b.is_open());
        assert_eq!(b.key(), "scope-b");
        assert_eq!(b.last_failure_reason(), Some("test_reason"));
    }

    #[test]
    fn load_invalid_state_falls_back_to_closed() {
        let mut controller = CircuitBreakerController::new("k", CircuitBreakerConfig::default());
        controller.load_state_dict(&json!({"state": "invalid_state"}));
        assert!(controller.is_closed());
    }

    #[test]
    fn empty_and_absent_health_stats_are_harmless() {
        let mut controller = CircuitBreakerController::new("k", CircuitBreakerConfig::default());
        assert!(controller.check(None, 0.0).allow_sync);
        assert!(controller.check(Some(&HealthStats::default()), 1.0).allow_sync);
        assert!(controller.is_closed());
    }

    #[test]
    fn combine_uses_stricter_limits() {
        let global = CircuitBreakerDecision {
            is_backfill_only: true,
            suggested_batch_size: Some(50),
            current_state: "half_open".into(),
            ..Default::default()
        };
        let instance = CircuitBreakerDecision {
            is_backfill_only: true,
            suggested_batch_size: Some(10),
            current_state: "open".into(),
            ..Default::default()
        };
        let combined = combine_decisions(&[&global, &instance]);
        assert_eq!(combined.suggested_batch_size, Some(10));
        assert!(combined.is_backfill_only);
        assert_eq!(combined.current_state, "open");
        assert!(combined.allow_sync);

        let blocking = CircuitBreakerDecision {
            allow_sync: false,
            ..Default::default()
        };
        assert!(!combine_decisions(&[&global, &blocking]).allow_sync);
    }
}
