//! Worker-harness tuning knobs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::env_util::{env_list, env_str, env_u32, env_u64};

pub const ENV_WORKER_PREFIX: &str = "SCM_WORKER_";

/// Name of this worker's pool; also a circuit-breaker scope.
pub const ENV_WORKER_POOL: &str = "SCM_WORKER_POOL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Concurrent claim loops in this process.
    pub worker_count: u32,
    /// Sleep when a claim attempt finds nothing.
    pub poll_interval_seconds: u64,
    /// Lease granted on claim; heartbeats run at a third of this.
    pub lease_seconds: u32,
    /// Statement timeout applied to every session.
    pub statement_timeout_seconds: u32,
    /// Optional pool name; claims are restricted to the pool's repo
    /// allowlist when set.
    pub pool: Option<String>,
    /// Repo ids this pool is allowed to claim; empty means unrestricted.
    pub pool_repo_allowlist: Vec<i64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            worker_count: 4,
            poll_interval_seconds: 5,
            lease_seconds: 300,
            statement_timeout_seconds: 30,
            pool: None,
            pool_repo_allowlist: Vec::new(),
        }
    }
}

impl WorkerConfig {
    pub fn heartbeat_interval_seconds(&self) -> u64 {
        (self.lease_seconds as u64 / 3).max(1)
    }

    pub fn from_value(value: &Value) -> Self {
        let mut cfg = WorkerConfig::default();
        let Some(map) = value.as_object() else {
            return cfg;
        };
        let get_u32 = |k: &str| map.get(k).and_then(Value::as_u64).map(|v| v as u32);
        if let Some(v) = get_u32("worker_count") {
            cfg.worker_count = v;
        }
        if let Some(v) = map.get("poll_interval_seconds").and_then(Value::as_u64) {
            cfg.poll_interval_seconds = v;
        }
        if let Some(v) = get_u32("lease_seconds") {
            cfg.lease_seconds = v;
        }
        if let Some(v) = get_u32("statement_timeout_seconds") {
            cfg.statement_timeout_seconds = v;
        }
        if let Some(v) = map.get("pool").and_then(Value::as_str) {
            cfg.pool = Some(v.to_string());
        }
        if let Some(list) = map.get("pool_repo_allowlist").and_then(Value::as_array) {
            cfg.pool_repo_allowlist = list.iter().filter_map(Value::as_i64).collect();
        }
        cfg
    }

    pub fn from_env(base: Option<&Value>) -> Self {
        let mut cfg = base.map(WorkerConfig::from_value).unwrap_or_default();
        let p = ENV_WORKER_PREFIX;

        if let Some(v) = env_u32(&format!("{p}COUNT")) {
            cfg.worker_count = v;
        }
        if let Some(v) = env_u64(&format!("{p}POLL_INTERVAL_SECONDS")) {
            cfg.poll_interval_seconds = v;
        }
        if let Some(v) = env_u32(&format!("{p}LEASE_SECONDS")) {
            cfg.lease_seconds = v;
        }
        if let Some(v) = env_u32(&format!("{p}STATEMENT_TIMEOUT_SECONDS")) {
            cfg.statement_timeout_seconds = v;
        }
        if let Some(v) = env_str(ENV_WORKER_POOL) {
            cfg.pool = Some(v);
        }
        if let Some(list) = env_list(&format!("{p}POOL_REPO_ALLOWLIST")) {
            cfg.pool_repo_allowlist = list.iter().filter_map(|s| s.parse().ok()).collect();
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_is_a_third_of_the_lease() {
        let cfg = WorkerConfig::default();
        assert_eq!(cfg.lease_seconds, 300);
        assert_eq!(cfg.heartbeat_interval_seconds(), 100);

        let tiny = WorkerConfig {
            lease_seconds: 2,
            ..Default::default()
        };
        assert_eq!(tiny.heartbeat_interval_seconds(), 1);
    }

    #[test]
    fn from_value_reads_pool_allowlist() {
        let cfg = WorkerConfig::from_value(&serde_json::json!({
            "pool": "fast",
            "pool_repo_allowlist": [1, 2, 3],
        }));
        assert_eq!(cfg.pool.as_deref(), Some("fast"));
        assert_eq!(cfg.pool_repo_allowlist, vec![1, 2, 3]);
    }
}
