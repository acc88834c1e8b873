//! Typed configuration for every control-plane process.
//!
//! Each struct has three constructors: `default()`, `from_value` (a JSON
//! object, e.g. the `[scm.scheduler]` section of a deployment config), and
//! `from_env` which layers `SCM_SCHEDULER_…` / `SCM_CB_…` / `SCM_REAPER_…` /
//! `SCM_WORKER_…` environment overrides on top. Env always wins over the
//! value map. All recognized env names are listed as constants here; nothing
//! is discovered at runtime.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

mod env_util;
mod reaper;
mod worker;

pub use env_util::{env_bool, env_f64, env_list, env_u32, env_u64};
pub use reaper::{JobReapPolicy, ReaperConfig};
pub use worker::{WorkerConfig, ENV_WORKER_POOL};

/// Mandatory connection string for every process.
pub const ENV_POSTGRES_DSN: &str = "POSTGRES_DSN";

/// Optional override for the cursor KV namespace (default `scm.sync`).
pub const ENV_LOGBOOK_NAMESPACE: &str = "LOGBOOK_NAMESPACE";

// ---------------------------------------------------------------------------
// SchedulerConfig
// ---------------------------------------------------------------------------

pub const ENV_SCHEDULER_PREFIX: &str = "SCM_SCHEDULER_";

/// Scheduler policy knobs. `max_queue_depth` doubles as the legacy
/// `global_concurrency`; the two were always kept in sync, so only the
/// depth is stored and `global_concurrency()` reads it back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub max_running: u32,
    pub max_queue_depth: u32,
    pub per_instance_concurrency: u32,
    pub per_tenant_concurrency: u32,
    pub cursor_age_threshold_seconds: f64,
    pub error_budget_threshold: f64,
    /// Minimum recent runs before the failure-rate gate applies.
    pub min_samples: u32,
    pub rate_limit_hit_threshold: f64,
    pub max_enqueue_per_scan: u32,
    pub scan_interval_seconds: u64,
    pub pause_duration_seconds: f64,
    pub backfill_repair_window_hours: u32,
    pub max_backfill_window_hours: u32,
    /// Base priority per job type; smaller runs first.
    pub job_type_priority: BTreeMap<String, i64>,
    pub enable_tenant_fairness: bool,
    pub tenant_fairness_max_per_round: u32,
    pub skip_on_bucket_pause: bool,
    pub mvp_mode_enabled: bool,
    pub mvp_job_type_allowlist: Vec<String>,
    pub max_attempts: u32,
    pub retry_delay_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let mut job_type_priority = BTreeMap::new();
        job_type_priority.insert("commits".to_string(), 1);
        job_type_priority.insert("mrs".to_string(), 2);
        job_type_priority.insert("reviews".to_string(), 3);
        job_type_priority.insert("svn".to_string(), 1);

        SchedulerConfig {
            max_running: 5,
            max_queue_depth: 10,
            per_instance_concurrency: 3,
            per_tenant_concurrency: 5,
            cursor_age_threshold_seconds: 3600.0,
            error_budget_threshold: 0.3,
            min_samples: 5,
            rate_limit_hit_threshold: 0.1,
            max_enqueue_per_scan: 100,
            scan_interval_seconds: 60,
            pause_duration_seconds: 300.0,
            backfill_repair_window_hours: 24,
            max_backfill_window_hours: 168,
            job_type_priority,
            enable_tenant_fairness: true,
            tenant_fairness_max_per_round: 1,
            skip_on_bucket_pause: false,
            mvp_mode_enabled: false,
            mvp_job_type_allowlist: Vec::new(),
            max_attempts: 3,
            retry_delay_seconds: 60,
        }
    }
}

impl SchedulerConfig {
    /// Legacy alias for `max_queue_depth`.
    pub fn global_concurrency(&self) -> u32 {
        self.max_queue_depth
    }

    /// Load from a JSON object (missing keys keep defaults). The legacy
    /// `global_concurrency` key is honored when `max_queue_depth` is absent.
    pub fn from_value(value: &Value) -> Self {
        let mut cfg = SchedulerConfig::default();
        let Some(map) = value.as_object() else {
            return cfg;
        };

        let get_u32 = |k: &str| map.get(k).and_then(Value::as_u64).map(|v| v as u32);
        let get_f64 = |k: &str| map.get(k).and_then(Value::as_f64);
        let get_bool = |k: &str| map.get(k).and_then(Value::as_bool);

        if let Some(v) = get_u32("max_running") {
            cfg.max_running = v;
        }
        match (get_u32("max_queue_depth"), get_u32("global_concurrency")) {
            (Some(depth), _) => cfg.max_queue_depth = depth,
            (None, Some(legacy)) => cfg.max_queue_depth = legacy,
            (None, None) => {}
        }
        if let Some(v) = get_u32("per_instance_concurrency") {
            cfg.per_instance_concurrency = v;
        }
        if let Some(v) = get_u32("per_tenant_concurrency") {
            cfg.per_tenant_concurrency = v;
        }
        if let Some(v) = get_f64("cursor_age_threshold_seconds") {
            cfg.cursor_age_threshold_seconds = v;
        }
        if let Some(v) = get_f64("error_budget_threshold") {
            cfg.error_budget_threshold = v;
        }
        if let Some(v) = get_u32("min_samples") {
            cfg.min_samples = v;
        }
        if let Some(v) = get_f64("rate_limit_hit_threshold") {
            cfg.rate_limit_hit_threshold = v;
        }
        if let Some(v) = get_u32("max_enqueue_per_scan") {
            cfg.max_enqueue_per_scan = v;
        }
        if let Some(v) = map.get("scan_interval_seconds").and_then(Value::as_u64) {
            cfg.scan_interval_seconds = v;
        }
        if let Some(v) = get_f64("pause_duration_seconds") {
            cfg.pause_duration_seconds = v;
        }
        if let Some(v) = get_u32("backfill_repair_window_hours") {
            cfg.backfill_repair_window_hours = v;
        }
        if let Some(v) = get_u32("max_backfill_window_hours") {
            cfg.max_backfill_window_hours = v;
        }
        if let Some(map) = map.get("job_type_priority").and_then(Value::as_object) {
            for (job_type, priority) in map {
                if let Some(p) = priority.as_i64() {
                    cfg.job_type_priority.insert(job_type.clone(), p);
                }
            }
        }
        if let Some(v) = get_bool("enable_tenant_fairness") {
            cfg.enable_tenant_fairness = v;
        }
        if let Some(v) = get_u32("tenant_fairness_max_per_round") {
            cfg.tenant_fairness_max_per_round = v;
        }
        if let Some(v) = get_bool("skip_on_bucket_pause") {
            cfg.skip_on_bucket_pause = v;
        }
        if let Some(v) = get_bool("mvp_mode_enabled") {
            cfg.mvp_mode_enabled = v;
        }
        if let Some(list) = map.get("mvp_job_type_allowlist").and_then(Value::as_array) {
            cfg.mvp_job_type_allowlist = list
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = get_u32("max_attempts") {
            cfg.max_attempts = v;
        }
        if let Some(v) = map.get("retry_delay_seconds").and_then(Value::as_u64) {
            cfg.retry_delay_seconds = v;
        }

        cfg
    }

    /// `from_value` plus `SCM_SCHEDULER_…` env overrides.
    pub fn from_env(base: Option<&Value>) -> Self {
        let mut cfg = base
            .map(SchedulerConfig::from_value)
            .unwrap_or_default();
        let p = ENV_SCHEDULER_PREFIX;

        if let Some(v) = env_u32(&format!("{p}MAX_RUNNING")) {
            cfg.max_running = v;
        }
        if let Some(v) = env_u32(&format!("{p}MAX_QUEUE_DEPTH")) {
            cfg.max_queue_depth = v;
        } else if let Some(v) = env_u32(&format!("{p}GLOBAL_CONCURRENCY")) {
            cfg.max_queue_depth = v;
        }
        if let Some(v) = env_u32(&format!("{p}PER_INSTANCE_CONCURRENCY")) {
            cfg.per_instance_concurrency = v;
        }
        if let Some(v) = env_u32(&format!("{p}PER_TENANT_CONCURRENCY")) {
            cfg.per_tenant_concurrency = v;
        }
        if let Some(v) = env_f64(&format!("{p}CURSOR_AGE_THRESHOLD_SECONDS")) {
            cfg.cursor_age_threshold_seconds = v;
        }
        if let Some(v) = env_f64(&format!("{p}ERROR_BUDGET_THRESHOLD")) {
            cfg.error_budget_threshold = v;
        }
        if let Some(v) = env_u32(&format!("{p}MIN_SAMPLES")) {
            cfg.min_samples = v;
        }
        if let Some(v) = env_f64(&format!("{p}RATE_LIMIT_HIT_THRESHOLD")) {
            cfg.rate_limit_hit_threshold = v;
        }
        if let Some(v) = env_u32(&format!("{p}MAX_ENQUEUE_PER_SCAN")) {
            cfg.max_enqueue_per_scan = v;
        }
        if let Some(v) = env_u64(&format!("{p}SCAN_INTERVAL_SECONDS")) {
            cfg.scan_interval_seconds = v;
        }
        if let Some(v) = env_f64(&format!("{p}PAUSE_DURATION_SECONDS")) {
            cfg.pause_duration_seconds = v;
        }
        if let Some(v) = env_bool(&format!("{p}ENABLE_TENANT_FAIRNESS")) {
            cfg.enable_tenant_fairness = v;
        }
        if let Some(v) = env_u32(&format!("{p}TENANT_FAIRNESS_MAX_PER_ROUND")) {
            cfg.tenant_fairness_max_per_round = v;
        }
        if let Some(v) = env_bool(&format!("{p}SKIP_ON_BUCKET_PAUSE")) {
            cfg.skip_on_bucket_pause = v;
        }
        if let Some(v) = env_bool(&format!("{p}MVP_MODE_ENABLED")) {
            cfg.mvp_mode_enabled = v;
        }
        if let Some(v) = env_list(&format!("{p}MVP_JOB_TYPE_ALLOWLIST")) {
            cfg.mvp_job_type_allowlist = v;
        }
        if let Some(v) = env_u32(&format!("{p}MAX_ATTEMPTS")) {
            cfg.max_attempts = v;
        }
        if let Some(v) = env_u64(&format!("{p}RETRY_DELAY_SECONDS")) {
            cfg.retry_delay_seconds = v;
        }

        cfg
    }
}

// ---------------------------------------------------------------------------
// CircuitBreakerConfig
// ---------------------------------------------------------------------------

pub const ENV_CB_PREFIX: &str = "SCM_CB_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_rate_threshold: f64,
    pub rate_limit_threshold: f64,
    pub timeout_rate_threshold: f64,
    /// Runs per health window.
    pub window_count: u32,
    /// Health window width.
    pub window_minutes: u32,
    pub open_duration_seconds: f64,
    pub half_open_max_requests: u32,
    pub recovery_success_count: u32,
    /// Minimum runs in the window before any rate can trip the breaker.
    pub min_samples: u32,
    pub enable_smoothing: bool,
    pub smoothing_alpha: f64,
    /// When OPEN: `true` keeps syncing in degraded backfill-only mode,
    /// `false` blocks the scope entirely.
    pub backfill_only_mode: bool,
    pub degraded_batch_size: u32,
    pub degraded_forward_window_seconds: u64,
    pub probe_budget_per_interval: u32,
    pub probe_job_types_allowlist: Vec<String>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_rate_threshold: 0.3,
            rate_limit_threshold: 0.2,
            timeout_rate_threshold: 0.2,
            window_count: 20,
            window_minutes: 30,
            open_duration_seconds: 300.0,
            half_open_max_requests: 3,
            recovery_success_count: 2,
            min_samples: 5,
            enable_smoothing: true,
            smoothing_alpha: 0.5,
            backfill_only_mode: true,
            degraded_batch_size: 10,
            degraded_forward_window_seconds: 3600,
            probe_budget_per_interval: 3,
            probe_job_types_allowlist: vec!["commits".to_string()],
        }
    }
}

impl CircuitBreakerConfig {
    pub fn from_value(value: &Value) -> Self {
        let mut cfg = CircuitBreakerConfig::default();
        let Some(map) = value.as_object() else {
            return cfg;
        };

        let get_f64 = |k: &str| map.get(k).and_then(Value::as_f64);
        let get_u32 = |k: &str| map.get(k).and_then(Value::as_u64).map(|v| v as u32);
        let get_bool = |k: &str| map.get(k).and_then(Value::as_bool);

        if let Some(v) = get_f64("failure_rate_threshold") {
            cfg.failure_rate_threshold = v;
        }
        if let Some(v) = get_f64("rate_limit_threshold") {
            cfg.rate_limit_threshold = v;
        }
        if let Some(v) = get_f64("timeout_rate_threshold") {
            cfg.timeout_rate_threshold = v;
        }
        if let Some(v) = get_u32("window_count") {
            cfg.window_count = v;
        }
        if let Some(v) = get_u32("window_minutes") {
            cfg.window_minutes = v;
        }
        if let Some(v) = get_f64("open_duration_seconds") {
            cfg.open_duration_seconds = v;
        }
        if let Some(v) = get_u32("half_open_max_requests") {
            cfg.half_open_max_requests = v;
        }
        if let Some(v) = get_u32("recovery_success_count") {
            cfg.recovery_success_count = v;
        }
        if let Some(v) = get_u32("min_samples") {
            cfg.min_samples = v;
        }
        if let Some(v) = get_bool("enable_smoothing") {
            cfg.enable_smoothing = v;
        }
        if let Some(v) = get_f64("smoothing_alpha") {
            cfg.smoothing_alpha = v;
        }
        if let Some(v) = get_bool("backfill_only_mode") {
            cfg.backfill_only_mode = v;
        }
        if let Some(v) = get_u32("degraded_batch_size") {
            cfg.degraded_batch_size = v;
        }
        if let Some(v) = map.get("degraded_forward_window_seconds").and_then(Value::as_u64) {
            cfg.degraded_forward_window_seconds = v;
        }
        if let Some(v) = get_u32("probe_budget_per_interval") {
            cfg.probe_budget_per_interval = v;
        }
        if let Some(list) = map.get("probe_job_types_allowlist").and_then(Value::as_array) {
            cfg.probe_job_types_allowlist = list
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
        }

        cfg
    }

    /// `from_value` plus `SCM_CB_…` env overrides (env wins).
    pub fn from_env(base: Option<&Value>) -> Self {
        let mut cfg = base
            .map(CircuitBreakerConfig::from_value)
            .unwrap_or_default();
        let p = ENV_CB_PREFIX;

        if let Some(v) = env_f64(&format!("{p}FAILURE_RATE_THRESHOLD")) {
            cfg.failure_rate_threshold = v;
        }
        if let Some(v) = env_f64(&format!("{p}RATE_LIMIT_THRESHOLD")) {
            cfg.rate_limit_threshold = v;
        }
        if let Some(v) = env_f64(&format!("{p}TIMEOUT_RATE_THRESHOLD")) {
            cfg.timeout_rate_threshold = v;
        }
        if let Some(v) = env_u32(&format!("{p}WINDOW_COUNT")) {
            cfg.window_count = v;
        }
        if let Some(v) = env_u32(&format!("{p}WINDOW_MINUTES")) {
            cfg.window_minutes = v;
        }
        if let Some(v) = env_f64(&format!("{p}OPEN_DURATION_SECONDS")) {
            cfg.open_duration_seconds = v;
        }
        if let Some(v) = env_u32(&format!("{p}HALF_OPEN_MAX_REQUESTS")) {
            cfg.half_open_max_requests = v;
        }
        if let Some(v) = env_u32(&format!("{p}RECOVERY_SUCCESS_COUNT")) {
            cfg.recovery_success_count = v;
        }
        if let Some(v) = env_u32(&format!("{p}MIN_SAMPLES")) {
            cfg.min_samples = v;
        }
        if let Some(v) = env_bool(&format!("{p}ENABLE_SMOOTHING")) {
            cfg.enable_smoothing = v;
        }
        if let Some(v) = env_f64(&format!("{p}SMOOTHING_ALPHA")) {
            cfg.smoothing_alpha = v;
        }
        if let Some(v) = env_bool(&format!("{p}BACKFILL_ONLY_MODE")) {
            cfg.backfill_only_mode = v;
        }
        if let Some(v) = env_u32(&format!("{p}DEGRADED_BATCH_SIZE")) {
            cfg.degraded_batch_size = v;
        }
        if let Some(v) = env_u64(&format!("{p}DEGRADED_FORWARD_WINDOW_SECONDS")) {
            cfg.degraded_forward_window_seconds = v;
        }
        if let Some(v) = env_u32(&format!("{p}PROBE_BUDGET_PER_INTERVAL")) {
            cfg.probe_budget_per_interval = v;
        }
        if let Some(v) = env_list(&format!("{p}PROBE_JOB_TYPES_ALLOWLIST")) {
            cfg.probe_job_types_allowlist = v;
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scheduler_defaults() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.max_running, 5);
        assert_eq!(cfg.max_queue_depth, 10);
        assert_eq!(cfg.global_concurrency(), 10);
        assert_eq!(cfg.per_instance_concurrency, 3);
        assert_eq!(cfg.per_tenant_concurrency, 5);
        assert_eq!(cfg.error_budget_threshold, 0.3);
        assert_eq!(cfg.cursor_age_threshold_seconds, 3600.0);
        assert_eq!(cfg.job_type_priority["commits"], 1);
        assert_eq!(cfg.job_type_priority["mrs"], 2);
        assert_eq!(cfg.job_type_priority["reviews"], 3);
    }

    #[test]
    fn scheduler_from_value_reads_new_params() {
        let cfg = SchedulerConfig::from_value(&json!({
            "max_running": 8,
            "max_queue_depth": 16,
        }));
        assert_eq!(cfg.max_running, 8);
        assert_eq!(cfg.max_queue_depth, 16);
        assert_eq!(cfg.global_concurrency(), 16);
    }

    #[test]
    fn scheduler_legacy_global_concurrency_sets_depth() {
        let cfg = SchedulerConfig::from_value(&json!({"global_concurrency": 20}));
        assert_eq!(cfg.max_queue_depth, 20);
        assert_eq!(cfg.global_concurrency(), 20);
    }

    #[test]
    fn scheduler_from_value_tolerates_non_object() {
        let cfg = SchedulerConfig::from_value(&json!(null));
        assert_eq!(cfg.max_queue_depth, 10);
    }

    #[test]
    fn cb_defaults() {
        let cfg = CircuitBreakerConfig::default();
        assert_eq!(cfg.failure_rate_threshold, 0.3);
        assert_eq!(cfg.rate_limit_threshold, 0.2);
        assert_eq!(cfg.timeout_rate_threshold, 0.2);
        assert_eq!(cfg.window_count, 20);
        assert_eq!(cfg.window_minutes, 30);
        assert_eq!(cfg.open_duration_seconds, 300.0);
        assert_eq!(cfg.half_open_max_requests, 3);
        assert_eq!(cfg.recovery_success_count, 2);
        assert_eq!(cfg.min_samples, 5);
        assert!(cfg.enable_smoothing);
        assert_eq!(cfg.smoothing_alpha, 0.5);
    }

    #[test]
    fn cb_env_overrides_win_over_value() {
        // Serialized env access: this test owns the SCM_CB_FAILURE_RATE_THRESHOLD var.
        std::env::set_var("SCM_CB_FAILURE_RATE_THRESHOLD", "0.5");
        std::env::set_var("SCM_CB_BACKFILL_ONLY_MODE", "false");
        let base = json!({"failure_rate_threshold": 0.1});
        let cfg = CircuitBreakerConfig::from_env(Some(&base));
        std::env::remove_var("SCM_CB_FAILURE_RATE_THRESHOLD");
        std::env::remove_var("SCM_CB_BACKFILL_ONLY_MODE");

        assert_eq!(cfg.failure_rate_threshold, 0.5);
        assert!(!cfg.backfill_only_mode);
    }

    #[test]
    fn cb_falls_back_to_value_without_env() {
        let base = json!({"failure_rate_threshold": 0.45, "rate_limit_threshold": 0.25});
        let cfg = CircuitBreakerConfig::from_value(&base);
        assert_eq!(cfg.failure_rate_threshold, 0.45);
        assert_eq!(cfg.rate_limit_threshold, 0.25);
    }

    #[test]
    fn scheduler_env_list_parses_commas() {
        std::env::set_var("SCM_SCHEDULER_MVP_JOB_TYPE_ALLOWLIST", "commits, mrs");
        let cfg = SchedulerConfig::from_env(None);
        std::env::remove_var("SCM_SCHEDULER_MVP_JOB_TYPE_ALLOWLIST");
        assert_eq!(cfg.mvp_job_type_allowlist, vec!["commits", "mrs"]);
    }
}
