//! Versioned sync cursors and the monotonic-advancement rules.
//!
//! # Design
//!
//! A cursor is a `{ version, watermark, stats }` triple stored per
//! `(repo, job_type)` in `logbook.kv`. The watermark is the only part the
//! scheduler reads; the advancement predicates here are the only way the
//! worker may move it. Together with `INSERT … ON CONFLICT` in the domain
//! tables, the predicates make overlap re-scans idempotent: re-reading an
//! already-synced window can never regress the watermark or duplicate rows.
//!
//! Version-1 cursors (flat key/value blobs) are upgraded on read; the v1
//! form is never written back.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Current cursor schema version.
pub const CURSOR_VERSION: u32 = 2;

// ---------------------------------------------------------------------------
// CursorType
// ---------------------------------------------------------------------------

/// Watermark shape selector, derived from the job type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CursorType {
    /// Git commits: `(last_commit_ts, last_commit_sha)`.
    Commits,
    /// Merge requests: `(last_mr_updated_at, last_mr_iid)`.
    MergeRequests,
    /// Review events: MR watermark plus optional `last_event_ts`.
    Reviews,
    /// SVN revisions: `last_rev`.
    Svn,
}

/// Map a queue job type onto its cursor shape.
pub fn cursor_type_for_job(job_type: &str) -> Result<CursorType> {
    match job_type {
        "commits" => Ok(CursorType::Commits),
        "mrs" => Ok(CursorType::MergeRequests),
        "reviews" => Ok(CursorType::Reviews),
        "svn" => Ok(CursorType::Svn),
        other => Err(anyhow!("unknown job type: {}", other)),
    }
}

impl CursorType {
    /// v1 keys that belong in the watermark for this shape.
    fn watermark_fields(&self) -> &'static [&'static str] {
        match self {
            CursorType::Commits => &["last_commit_sha", "last_commit_ts"],
            CursorType::MergeRequests => &["last_mr_updated_at", "last_mr_iid"],
            CursorType::Reviews => &["last_mr_updated_at", "last_mr_iid", "last_event_ts"],
            CursorType::Svn => &["last_rev"],
        }
    }
}

/// v1 keys that belong in stats regardless of shape.
const STATS_FIELDS: &[&str] = &["last_sync_at", "last_sync_count"];

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

/// A v2 cursor value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub version: u32,
    #[serde(default)]
    pub watermark: Map<String, Value>,
    #[serde(default)]
    pub stats: Map<String, Value>,
}

impl Cursor {
    pub fn empty() -> Self {
        Cursor {
            version: CURSOR_VERSION,
            watermark: Map::new(),
            stats: Map::new(),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    // Watermark accessors. Absent fields read as None (or 0 for last_rev,
    // matching the pre-first-sync SVN convention).

    pub fn last_rev(&self) -> i64 {
        self.watermark.get("last_rev").and_then(Value::as_i64).unwrap_or(0)
    }

    pub fn last_commit_sha(&self) -> Option<&str> {
        self.watermark.get("last_commit_sha").and_then(Value::as_str)
    }

    pub fn last_commit_ts(&self) -> Option<&str> {
        self.watermark.get("last_commit_ts").and_then(Value::as_str)
    }

    pub fn last_mr_updated_at(&self) -> Option<&str> {
        self.watermark.get("last_mr_updated_at").and_then(Value::as_str)
    }

    pub fn last_mr_iid(&self) -> Option<i64> {
        self.watermark.get("last_mr_iid").and_then(Value::as_i64)
    }

    pub fn last_event_ts(&self) -> Option<&str> {
        self.watermark.get("last_event_ts").and_then(Value::as_str)
    }

    pub fn last_sync_at(&self) -> Option<&str> {
        self.stats.get("last_sync_at").and_then(Value::as_str)
    }

    pub fn last_sync_count(&self) -> i64 {
        self.stats.get("last_sync_count").and_then(Value::as_i64).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Version detection & upgrade
// ---------------------------------------------------------------------------

/// v1 blobs have no `version` field.
pub fn detect_cursor_version(data: &Value) -> u32 {
    data.get("version")
        .and_then(Value::as_u64)
        .map(|v| v as u32)
        .unwrap_or(1)
}

/// Upgrade any stored cursor value to the current shape.
///
/// v2 values pass through unchanged. For v1, the shape-specific watermark
/// fields move under `watermark`, `last_sync_at`/`last_sync_count` move under
/// `stats`, and any remaining keys are kept in the watermark so no stored
/// value is lost.
pub fn upgrade_cursor(data: &Value, cursor_type: CursorType) -> Result<Cursor> {
    if detect_cursor_version(data) >= 2 {
        return serde_json::from_value(data.clone()).context("malformed v2 cursor");
    }

    let flat = data
        .as_object()
        .ok_or_else(|| anyhow!("v1 cursor is not an object"))?;

    let mut watermark = Map::new();
    let mut stats = Map::new();
    for (key, value) in flat {
        if cursor_type.watermark_fields().contains(&key.as_str()) {
            watermark.insert(key.clone(), value.clone());
        } else if STATS_FIELDS.contains(&key.as_str()) {
            stats.insert(key.clone(), value.clone());
        } else {
            watermark.insert(key.clone(), value.clone());
        }
    }

    Ok(Cursor {
        version: CURSOR_VERSION,
        watermark,
        stats,
    })
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Parse an ISO-8601 instant into UTC. `Z` and `+00:00` compare equal after
/// this, which the tie-break rules depend on.
pub fn parse_iso_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("invalid ISO-8601 timestamp: {s}"))
}

// ---------------------------------------------------------------------------
// Advancement predicates
// ---------------------------------------------------------------------------

/// MR / review-event watermark ordering: `(updated_at, iid)` composite.
///
/// First sync always advances. On equal timestamps a missing stored IID
/// advances (legacy cursors predate the IID component); otherwise the new
/// IID must be strictly greater.
pub fn should_advance_mr_cursor(
    new_updated_at: &str,
    new_iid: i64,
    last_updated_at: Option<&str>,
    last_iid: Option<i64>,
) -> Result<bool> {
    let Some(last_ts_raw) = last_updated_at else {
        return Ok(true);
    };
    let new_ts = parse_iso_ts(new_updated_at)?;
    let last_ts = parse_iso_ts(last_ts_raw)?;

    if new_ts > last_ts {
        return Ok(true);
    }
    if new_ts < last_ts {
        return Ok(false);
    }
    Ok(match last_iid {
        None => true,
        Some(last) => new_iid > last,
    })
}

/// Commit watermark ordering: `(committed_ts, sha)` composite, sha compared
/// lexicographically on timestamp ties.
pub fn should_advance_commit_cursor(
    new_ts: &str,
    new_sha: &str,
    last_ts: Option<&str>,
    last_sha: Option<&str>,
) -> Result<bool> {
    let Some(last_ts_raw) = last_ts else {
        return Ok(true);
    };
    let new_parsed = parse_iso_ts(new_ts)?;
    let last_parsed = parse_iso_ts(last_ts_raw)?;

    if new_parsed > last_parsed {
        return Ok(true);
    }
    if new_parsed < last_parsed {
        return Ok(false);
    }
    Ok(match last_sha {
        None => true,
        Some(last) => new_sha > last,
    })
}

/// SVN watermark ordering: strictly increasing revision numbers.
pub fn should_advance_svn_cursor(new_rev: i64, last_rev: Option<i64>) -> bool {
    match last_rev {
        None => true,
        Some(last) => new_rev > last,
    }
}

// ---------------------------------------------------------------------------
// Overlap
// ---------------------------------------------------------------------------

/// Start bound for a time-watermark re-scan: the stored timestamp minus the
/// configured overlap. Safe because ingest is upsert-based and the
/// advancement predicates reject regression.
pub fn overlap_start_ts(cursor_ts: DateTime<Utc>, overlap_seconds: i64) -> DateTime<Utc> {
    cursor_ts - chrono::Duration::seconds(overlap_seconds.max(0))
}

/// Start revision for an SVN scan. First sync starts at r1; otherwise the
/// next revision after the watermark, pulled back by the overlap, floored
/// at r1.
pub fn svn_start_rev(last_synced_rev: i64, overlap_revisions: i64) -> i64 {
    (last_synced_rev + 1 - overlap_revisions.max(0)).max(1)
}

/// End revision for one SVN batch: `start + batch_size − 1`, clamped to head.
pub fn svn_batch_end_rev(start_rev: i64, batch_size: i64, head_rev: i64) -> i64 {
    head_rev.min(start_rev + batch_size.max(1) - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // -- upgrade ------------------------------------------------------------

    #[test]
    fn detects_v1_without_version_field() {
        let v1 = json!({"last_rev": 100, "last_sync_at": "2024-01-15T10:00:00Z"});
        assert_eq!(detect_cursor_version(&v1), 1);
    }

    #[test]
    fn detects_v2_with_version_field() {
        let v2 = json!({"version": 2, "watermark": {}, "stats": {}});
        assert_eq!(detect_cursor_version(&v2), 2);
    }

    #[test]
    fn upgrades_svn_v1() {
        let v1 = json!({
            "last_rev": 500,
            "last_sync_at": "2024-01-15T10:30:00Z",
            "last_sync_count": 50,
        });
        let cursor = upgrade_cursor(&v1, CursorType::Svn).unwrap();
        assert_eq!(cursor.version, CURSOR_VERSION);
        assert_eq!(cursor.watermark, json!({"last_rev": 500}).as_object().unwrap().clone());
        assert_eq!(
            cursor.stats,
            json!({"last_sync_at": "2024-01-15T10:30:00Z", "last_sync_count": 50})
                .as_object()
                .unwrap()
                .clone()
        );
        assert_eq!(cursor.last_rev(), 500);
        assert_eq!(cursor.last_sync_count(), 50);
    }

    #[test]
    fn upgrades_commit_v1() {
        let v1 = json!({
            "last_commit_sha": "abc123def456",
            "last_commit_ts": "2024-01-15T12:00:00Z",
            "last_sync_at": "2024-01-15T12:05:00Z",
            "last_sync_count": 100,
        });
        let cursor = upgrade_cursor(&v1, CursorType::Commits).unwrap();
        assert_eq!(cursor.last_commit_sha(), Some("abc123def456"));
        assert_eq!(cursor.last_commit_ts(), Some("2024-01-15T12:00:00Z"));
        assert_eq!(cursor.last_sync_at(), Some("2024-01-15T12:05:00Z"));
        assert!(!cursor.watermark.contains_key("last_sync_at"));
    }

    #[test]
    fn upgrades_mr_v1_with_partial_fields() {
        let v1 = json!({"last_mr_updated_at": "2024-01-15T12:00:00Z"});
        let cursor = upgrade_cursor(&v1, CursorType::MergeRequests).unwrap();
        assert_eq!(cursor.last_mr_updated_at(), Some("2024-01-15T12:00:00Z"));
        assert_eq!(cursor.last_mr_iid(), None);
        assert!(cursor.stats.is_empty());
    }

    #[test]
    fn upgrades_reviews_v1_with_event_ts() {
        let v1 = json!({
            "last_mr_updated_at": "2024-01-15T12:00:00Z",
            "last_mr_iid": 7,
            "last_event_ts": "2024-01-15T12:30:00Z",
        });
        let cursor = upgrade_cursor(&v1, CursorType::Reviews).unwrap();
        assert_eq!(cursor.last_event_ts(), Some("2024-01-15T12:30:00Z"));
        assert_eq!(cursor.last_mr_iid(), Some(7));
    }

    #[test]
    fn upgrade_preserves_every_v1_value() {
        let v1 = json!({"last_rev": 10, "last_sync_count": 3, "adapter_extra": true});
        let cursor = upgrade_cursor(&v1, CursorType::Svn).unwrap();
        let out = cursor.to_value();
        assert_eq!(out["watermark"]["last_rev"], 10);
        assert_eq!(out["stats"]["last_sync_count"], 3);
        assert_eq!(out["watermark"]["adapter_extra"], true);
    }

    #[test]
    fn v2_passes_through_unchanged() {
        let v2 = json!({
            "version": 2,
            "watermark": {"last_rev": 999},
            "stats": {"last_sync_at": "2024-01-20T08:00:00Z", "last_sync_count": 10},
        });
        let cursor = upgrade_cursor(&v2, CursorType::Svn).unwrap();
        assert_eq!(cursor.to_value(), v2);
    }

    #[test]
    fn empty_v1_upgrades_to_empty_v2() {
        let cursor = upgrade_cursor(&json!({}), CursorType::Commits).unwrap();
        assert!(cursor.watermark.is_empty());
        assert!(cursor.stats.is_empty());
        assert_eq!(cursor.last_rev(), 0);
        assert_eq!(cursor.last_commit_sha(), None);
    }

    // -- timestamps ----------------------------------------------------------

    #[test]
    fn z_and_offset_forms_compare_equal() {
        let a = parse_iso_ts("2024-01-15T12:00:00Z").unwrap();
        let b = parse_iso_ts("2024-01-15T12:00:00+00:00").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn non_utc_offset_normalized() {
        let a = parse_iso_ts("2024-01-15T14:00:00+02:00").unwrap();
        let b = parse_iso_ts("2024-01-15T12:00:00Z").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn garbage_timestamp_rejected() {
        assert!(parse_iso_ts("yesterday").is_err());
    }

    // -- MR advancement ------------------------------------------------------

    #[test]
    fn mr_first_sync_always_advances() {
        assert!(should_advance_mr_cursor("2024-01-15T12:00:00Z", 100, None, None).unwrap());
    }

    #[test]
    fn mr_newer_updated_at_advances() {
        assert!(should_advance_mr_cursor(
            "2024-01-15T13:00:00Z",
            100,
            Some("2024-01-15T12:00:00Z"),
            Some(100),
        )
        .unwrap());
    }

    #[test]
    fn mr_older_updated_at_does_not_advance() {
        assert!(!should_advance_mr_cursor(
            "2024-01-15T11:00:00Z",
            100,
            Some("2024-01-15T12:00:00Z"),
            Some(100),
        )
        .unwrap());
    }

    #[test]
    fn mr_tie_breaks_on_iid() {
        let ts = "2024-01-15T12:00:00Z";
        assert!(should_advance_mr_cursor(ts, 101, Some(ts), Some(100)).unwrap());
        assert!(!should_advance_mr_cursor(ts, 99, Some(ts), Some(100)).unwrap());
        assert!(!should_advance_mr_cursor(ts, 100, Some(ts), Some(100)).unwrap());
    }

    #[test]
    fn mr_missing_last_iid_advances_on_equal_ts() {
        let ts = "2024-01-15T12:00:00Z";
        assert!(should_advance_mr_cursor(ts, 100, Some(ts), None).unwrap());
    }

    #[test]
    fn mr_equal_instant_across_offset_forms_is_tie() {
        assert!(!should_advance_mr_cursor(
            "2024-01-15T12:00:00+00:00",
            100,
            Some("2024-01-15T12:00:00Z"),
            Some(100),
        )
        .unwrap());
    }

    // -- commit advancement --------------------------------------------------

    #[test]
    fn commit_ts_ordering_wins() {
        assert!(should_advance_commit_cursor(
            "2024-01-15T13:00:00Z",
            "aaa",
            Some("2024-01-15T12:00:00Z"),
            Some("zzz"),
        )
        .unwrap());
    }

    #[test]
    fn commit_tie_breaks_lexicographically_on_sha() {
        let ts = "2024-01-15T12:00:00Z";
        assert!(should_advance_commit_cursor(ts, "bbb", Some(ts), Some("aaa")).unwrap());
        assert!(!should_advance_commit_cursor(ts, "aaa", Some(ts), Some("bbb")).unwrap());
        assert!(!should_advance_commit_cursor(ts, "aaa", Some(ts), Some("aaa")).unwrap());
    }

    // -- SVN advancement -----------------------------------------------------

    #[test]
    fn svn_strictly_increasing() {
        assert!(should_advance_svn_cursor(101, Some(100)));
        assert!(!should_advance_svn_cursor(100, Some(100)));
        assert!(!should_advance_svn_cursor(99, Some(100)));
        assert!(should_advance_svn_cursor(1, None));
    }

    // -- overlap -------------------------------------------------------------

    #[test]
    fn svn_overlap_rewinds_start() {
        assert_eq!(svn_start_rev(100, 5), 96);
        assert_eq!(svn_start_rev(100, 0), 101);
        assert_eq!(svn_start_rev(0, 10), 1);
    }

    #[test]
    fn svn_batch_end_clamped_to_head() {
        let start = svn_start_rev(200, 10);
        assert_eq!(start, 191);
        assert_eq!(svn_batch_end_rev(start, 50, 500), 240);
        assert_eq!(svn_batch_end_rev(start, 50, 210), 210);
    }

    #[test]
    fn time_overlap_subtracts_seconds() {
        let ts = parse_iso_ts("2024-01-15T12:00:00Z").unwrap();
        let start = overlap_start_ts(ts, 300);
        assert_eq!(start, parse_iso_ts("2024-01-15T11:55:00Z").unwrap());
        assert_eq!(overlap_start_ts(ts, -5), ts);
    }
}
