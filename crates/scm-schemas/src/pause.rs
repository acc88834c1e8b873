//! Per-`(repo, job_type)` pause records stored in `logbook.kv`.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Why a pair was paused. Stored as a string in the record so new codes can
/// be introduced without breaking old readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReasonCode {
    ErrorBudget,
    RateLimitBucket,
    CircuitOpen,
    Manual,
}

impl PauseReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PauseReasonCode::ErrorBudget => "error_budget",
            PauseReasonCode::RateLimitBucket => "rate_limit_bucket",
            PauseReasonCode::CircuitOpen => "circuit_open",
            PauseReasonCode::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "error_budget" => Ok(PauseReasonCode::ErrorBudget),
            "rate_limit_bucket" => Ok(PauseReasonCode::RateLimitBucket),
            "circuit_open" => Ok(PauseReasonCode::CircuitOpen),
            "manual" => Ok(PauseReasonCode::Manual),
            other => Err(anyhow!("invalid pause reason code: {}", other)),
        }
    }
}

/// One pause record. Epoch-second floats match the wire format of the KV
/// value; callers compare against a caller-supplied `now`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoPauseRecord {
    pub repo_id: i64,
    pub job_type: String,
    pub paused_until: f64,
    pub reason: String,
    pub paused_at: f64,
    #[serde(default)]
    pub failure_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
}

impl RepoPauseRecord {
    pub fn is_expired(&self, now: f64) -> bool {
        now >= self.paused_until
    }

    pub fn remaining_seconds(&self, now: f64) -> f64 {
        (self.paused_until - now).max(0.0)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Decode a KV value; `repo_id`/`job_type` come from the key when the
    /// stored blob predates carrying them inline.
    pub fn from_value(repo_id: i64, job_type: &str, data: &Value) -> Self {
        let get_f64 = |field: &str| data.get(field).and_then(Value::as_f64).unwrap_or(0.0);
        RepoPauseRecord {
            repo_id,
            job_type: job_type.to_string(),
            paused_until: get_f64("paused_until"),
            reason: data
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            paused_at: get_f64("paused_at"),
            failure_rate: get_f64("failure_rate"),
            reason_code: data
                .get("reason_code")
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RepoPauseRecord {
        RepoPauseRecord {
            repo_id: 7,
            job_type: "mrs".into(),
            paused_until: 2000.0,
            reason: "failure rate 0.50 over 10 runs".into(),
            paused_at: 1700.0,
            failure_rate: 0.5,
            reason_code: Some(PauseReasonCode::ErrorBudget.as_str().into()),
        }
    }

    #[test]
    fn value_round_trip() {
        let record = sample();
        let decoded = RepoPauseRecord::from_value(7, "mrs", &record.to_value());
        assert_eq!(decoded, record);
    }

    #[test]
    fn expiry_and_remaining() {
        let record = sample();
        assert!(!record.is_expired(1999.0));
        assert!(record.is_expired(2000.0));
        assert_eq!(record.remaining_seconds(1700.0), 300.0);
        assert_eq!(record.remaining_seconds(2500.0), 0.0);
    }

    #[test]
    fn missing_fields_default() {
        let decoded = RepoPauseRecord::from_value(3, "svn", &serde_json::json!({}));
        assert_eq!(decoded.repo_id, 3);
        assert_eq!(decoded.job_type, "svn");
        assert_eq!(decoded.paused_until, 0.0);
        assert_eq!(decoded.failure_rate, 0.0);
        assert!(decoded.reason_code.is_none());
    }
}
