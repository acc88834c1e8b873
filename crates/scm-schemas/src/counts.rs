//! The `sync_runs.counts` contract.
//!
//! `synced_count` is required; a closed set of optional and limiter fields is
//! known to the schema validator; everything else is preserved verbatim on
//! round-trip so adapters can attach their own counters without a schema
//! change here.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Fields every counts blob must carry.
pub const COUNTS_REQUIRED_FIELDS: &[&str] = &["synced_count"];

/// Known optional per-run counters.
pub const COUNTS_OPTIONAL_FIELDS: &[&str] = &[
    "diff_count",
    "bulk_count",
    "degraded_count",
    "scanned_count",
    "inserted_count",
    "skipped_count",
    "synced_mr_count",
    "synced_event_count",
    "patch_success",
    "patch_failed",
];

/// Known limiter/telemetry counters attached by the HTTP layer.
pub const COUNTS_LIMITER_FIELDS: &[&str] = &[
    "total_requests",
    "total_429_hits",
    "timeout_count",
    "avg_wait_time_ms",
];

// ---------------------------------------------------------------------------
// RunCounts
// ---------------------------------------------------------------------------

/// A counts blob. Backed by a JSON object so unknown fields survive the
/// write → read round-trip unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunCounts(pub Map<String, Value>);

impl RunCounts {
    /// An empty run: `{"synced_count": 0}`.
    pub fn zero() -> Self {
        let mut map = Map::new();
        map.insert("synced_count".into(), Value::from(0));
        RunCounts(map)
    }

    pub fn with_synced(synced_count: u64) -> Self {
        let mut map = Map::new();
        map.insert("synced_count".into(), Value::from(synced_count));
        RunCounts(map)
    }

    pub fn synced_count(&self) -> i64 {
        self.get_int("synced_count").unwrap_or(0)
    }

    pub fn get_int(&self, field: &str) -> Option<i64> {
        self.0.get(field).and_then(Value::as_i64)
    }

    /// Set a counter, replacing any previous value.
    pub fn set(&mut self, field: &str, value: u64) -> &mut Self {
        self.0.insert(field.to_string(), Value::from(value));
        self
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        value.as_object().map(|m| RunCounts(m.clone()))
    }
}

impl Default for RunCounts {
    fn default() -> Self {
        RunCounts::zero()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a counts blob against the contract.
///
/// Returns `(ok, missing_required, type_errors)`. A field produces a type
/// error when it is a known field and not a non-negative integer. Unknown
/// fields are accepted without inspection.
pub fn validate_counts_schema(counts: &Value) -> (bool, Vec<String>, Vec<String>) {
    let mut missing = Vec::new();
    let mut type_errors = Vec::new();

    let Some(map) = counts.as_object() else {
        return (false, vec!["synced_count".into()], vec!["counts is not an object".into()]);
    };

    for field in COUNTS_REQUIRED_FIELDS {
        match map.get(*field) {
            None => missing.push((*field).to_string()),
            Some(v) if !is_non_negative_int(v) => {
                type_errors.push(format!("{field}: expected non-negative integer, got {v}"))
            }
            Some(_) => {}
        }
    }

    for field in COUNTS_OPTIONAL_FIELDS.iter().chain(COUNTS_LIMITER_FIELDS) {
        if let Some(v) = map.get(*field) {
            if !is_non_negative_int(v) {
                type_errors.push(format!("{field}: expected non-negative integer, got {v}"));
            }
        }
    }

    let ok = missing.is_empty() && type_errors.is_empty();
    (ok, missing, type_errors)
}

fn is_non_negative_int(v: &Value) -> bool {
    v.as_i64().map(|n| n >= 0).unwrap_or(false)
}

/// Merge helper: start from `synced_count` and layer extra counters on top.
pub fn build_counts(synced_count: u64, extra: &[(&str, u64)]) -> RunCounts {
    let mut counts = RunCounts::with_synced(synced_count);
    for (field, value) in extra {
        counts.set(field, *value);
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_counts_pass() {
        let counts = json!({"synced_count": 100, "diff_count": 95, "total_429_hits": 3});
        let (ok, missing, type_errors) = validate_counts_schema(&counts);
        assert!(ok);
        assert!(missing.is_empty());
        assert!(type_errors.is_empty());
    }

    #[test]
    fn missing_synced_count_fails() {
        let counts = json!({"diff_count": 5});
        let (ok, missing, _) = validate_counts_schema(&counts);
        assert!(!ok);
        assert_eq!(missing, vec!["synced_count"]);
    }

    #[test]
    fn negative_known_field_is_type_error() {
        let counts = json!({"synced_count": 10, "timeout_count": -1});
        let (ok, missing, type_errors) = validate_counts_schema(&counts);
        assert!(!ok);
        assert!(missing.is_empty());
        assert_eq!(type_errors.len(), 1);
        assert!(type_errors[0].starts_with("timeout_count"));
    }

    #[test]
    fn unknown_fields_preserved_and_ignored_by_validator() {
        let counts = json!({"synced_count": 1, "adapter_custom_metric": "free-form"});
        let (ok, _, _) = validate_counts_schema(&counts);
        assert!(ok);

        let rc = RunCounts::from_value(&counts).unwrap();
        assert_eq!(rc.as_value(), counts);
    }

    #[test]
    fn build_counts_layers_extras() {
        let counts = build_counts(100, &[("diff_count", 95), ("total_429_hits", 3)]);
        assert_eq!(counts.synced_count(), 100);
        assert_eq!(counts.get_int("diff_count"), Some(95));
        assert_eq!(counts.get_int("total_429_hits"), Some(3));
    }

    #[test]
    fn non_object_counts_rejected() {
        let (ok, missing, type_errors) = validate_counts_schema(&json!(42));
        assert!(!ok);
        assert!(!missing.is_empty());
        assert!(!type_errors.is_empty());
    }
}
