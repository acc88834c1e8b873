//! Reaper tuning knobs.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::env_util::{env_str, env_u32, env_u64};

pub const ENV_REAPER_PREFIX: &str = "SCM_REAPER_";

/// What to do with an unclassifiable expired job that still has attempts
/// left: `ToFailed` delays it by `retry_delay_seconds`, `ToPending` requeues
/// it immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobReapPolicy {
    ToFailed,
    ToPending,
}

impl JobReapPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobReapPolicy::ToFailed => "to_failed",
            JobReapPolicy::ToPending => "to_pending",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "to_failed" => Ok(JobReapPolicy::ToFailed),
            "to_pending" => Ok(JobReapPolicy::ToPending),
            other => Err(anyhow!("invalid job reap policy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaperConfig {
    /// Grace added to `lease_seconds` before a running job counts as expired.
    pub job_grace_seconds: u32,
    /// Wall-clock ceiling for a `running` sync_runs row.
    pub run_max_duration_seconds: u32,
    /// Grace added to lock leases before force-release.
    pub lock_grace_seconds: u32,
    pub interval_seconds: u64,
    pub job_policy: JobReapPolicy,
    /// Delay applied by `ToFailed` for unclassifiable errors.
    pub retry_delay_seconds: u64,
    /// Clamp on computed exponential backoff.
    pub max_backoff_seconds: u64,
    /// Rows per sweep.
    pub batch_limit: u32,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        ReaperConfig {
            job_grace_seconds: 60,
            run_max_duration_seconds: 1800,
            lock_grace_seconds: 0,
            interval_seconds: 60,
            job_policy: JobReapPolicy::ToFailed,
            retry_delay_seconds: 60,
            max_backoff_seconds: 1800,
            batch_limit: 100,
        }
    }
}

impl ReaperConfig {
    pub fn from_value(value: &Value) -> Self {
        let mut cfg = ReaperConfig::default();
        let Some(map) = value.as_object() else {
            return cfg;
        };
        let get_u32 = |k: &str| map.get(k).and_then(Value::as_u64).map(|v| v as u32);
        if let Some(v) = get_u32("job_grace_seconds") {
            cfg.job_grace_seconds = v;
        }
        if let Some(v) = get_u32("run_max_duration_seconds") {
            cfg.run_max_duration_seconds = v;
        }
        if let Some(v) = get_u32("lock_grace_seconds") {
            cfg.lock_grace_seconds = v;
        }
        if let Some(v) = map.get("interval_seconds").and_then(Value::as_u64) {
            cfg.interval_seconds = v;
        }
        if let Some(policy) = map.get("job_policy").and_then(Value::as_str) {
            if let Ok(p) = JobReapPolicy::parse(policy) {
                cfg.job_policy = p;
            }
        }
        if let Some(v) = map.get("retry_delay_seconds").and_then(Value::as_u64) {
            cfg.retry_delay_seconds = v;
        }
        if let Some(v) = map.get("max_backoff_seconds").and_then(Value::as_u64) {
            cfg.max_backoff_seconds = v;
        }
        if let Some(v) = get_u32("batch_limit") {
            cfg.batch_limit = v;
        }
        cfg
    }

    pub fn from_env(base: Option<&Value>) -> Self {
        let mut cfg = base.map(ReaperConfig::from_value).unwrap_or_default();
        let p = ENV_REAPER_PREFIX;

        if let Some(v) = env_u32(&format!("{p}JOB_GRACE_SECONDS")) {
            cfg.job_grace_seconds = v;
        }
        if let Some(v) = env_u32(&format!("{p}RUN_MAX_DURATION_SECONDS")) {
            cfg.run_max_duration_seconds = v;
        }
        if let Some(v) = env_u32(&format!("{p}LOCK_GRACE_SECONDS")) {
            cfg.lock_grace_seconds = v;
        }
        if let Some(v) = env_u64(&format!("{p}INTERVAL_SECONDS")) {
            cfg.interval_seconds = v;
        }
        if let Some(v) = env_str(&format!("{p}JOB_POLICY")) {
            if let Ok(policy) = JobReapPolicy::parse(v.trim()) {
                cfg.job_policy = policy;
            }
        }
        if let Some(v) = env_u64(&format!("{p}RETRY_DELAY_SECONDS")) {
            cfg.retry_delay_seconds = v;
        }
        if let Some(v) = env_u64(&format!("{p}MAX_BACKOFF_SECONDS")) {
            cfg.max_backoff_seconds = v;
        }
        if let Some(v) = env_u32(&format!("{p}BATCH_LIMIT")) {
            cfg.batch_limit = v;
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults() {
        let cfg = ReaperConfig::default();
        assert_eq!(cfg.job_grace_seconds, 60);
        assert_eq!(cfg.run_max_duration_seconds, 1800);
        assert_eq!(cfg.interval_seconds, 60);
        assert_eq!(cfg.job_policy, JobReapPolicy::ToFailed);
        assert_eq!(cfg.max_backoff_seconds, 1800);
    }

    #[test]
    fn policy_round_trip() {
        assert_eq!(JobReapPolicy::parse("to_pending").unwrap(), JobReapPolicy::ToPending);
        assert_eq!(JobReapPolicy::ToFailed.as_str(), "to_failed");
        assert!(JobReapPolicy::parse("to_zombie").is_err());
    }

    #[test]
    fn from_value_reads_policy() {
        let cfg = ReaperConfig::from_value(&json!({"job_policy": "to_pending", "batch_limit": 7}));
        assert_eq!(cfg.job_policy, JobReapPolicy::ToPending);
        assert_eq!(cfg.batch_limit, 7);
    }
}
