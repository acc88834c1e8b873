//! The single write path from a [`RunResult`] to durable state: run finish,
//! job close (with retry backoff), monotonic cursor advance, and bucket
//! pause on 429s.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use scm_cursor::{
    cursor_type_for_job, should_advance_commit_cursor, should_advance_mr_cursor,
    should_advance_svn_cursor, Cursor, CursorType, CURSOR_VERSION,
};
use scm_db::FinishOutcome;
use scm_policy::calculate_backoff_seconds;
use scm_schemas::{
    build_payload_for_exception, build_payload_for_no_data, build_payload_for_success,
    ErrorCategory, RunResult, RunStatus,
};
use sqlx::PgPool;
use uuid::Uuid;

/// Fallback bucket pause when a 429 arrives without a usable Retry-After.
const DEFAULT_RETRY_AFTER_SECONDS: f64 = 60.0;

/// Translate the adapter's result into the finish transaction, then apply
/// the side effects (cursor advance on success, bucket pause on 429).
///
/// Idempotent per `run_id`: the finish transaction refuses to re-apply, and
/// a replayed cursor advance fails the monotonicity predicate.
pub async fn finalize_run(
    pool: &PgPool,
    job: &scm_db::JobRow,
    instance_key: Option<&str>,
    run_id: Uuid,
    result: &RunResult,
    retry_delay_seconds: f64,
    max_backoff_seconds: f64,
) -> Result<FinishOutcome> {
    let payload = match result.status {
        RunStatus::Completed => build_payload_for_success(
            run_id,
            result.counts.clone(),
            result.cursor_after.clone(),
            result.degradation.clone(),
        ),
        RunStatus::NoData => {
            let mut payload = build_payload_for_no_data(run_id, result.cursor_after.clone());
            // Keep limiter telemetry the adapter attached, as long as the
            // blob still reads as an empty run.
            if result.counts.get_int("synced_count") == Some(0) {
                payload.counts = result.counts.clone();
            }
            payload
        }
        RunStatus::Failed | RunStatus::Running => {
            let (category, message, http_status) = match &result.error {
                Some(err) => (err.category, err.message.as_str(), err.http_status),
                None => (ErrorCategory::Unknown, "adapter reported failure", None),
            };
            build_payload_for_exception(run_id, category, message, http_status)
        }
    };

    let category = result.error.as_ref().map(|e| e.category);
    let backoff = match category {
        Some(category) => {
            let base = scm_policy::backoff_base_seconds(category, retry_delay_seconds);
            let jitter = rand::random::<f64>() * base;
            calculate_backoff_seconds(
                (job.attempts + 1) as u32,
                category,
                retry_delay_seconds,
                max_backoff_seconds,
                jitter,
            )
        }
        None => retry_delay_seconds,
    };

    let outcome = scm_db::finish_job(pool, job.job_id, &payload, category, backoff).await?;
    if !outcome.applied {
        return Ok(outcome);
    }

    if payload.status != RunStatus::Failed {
        if let Some(watermark) = &result.cursor_after {
            advance_cursor(pool, job.repo_id, &job.job_type, watermark, result).await?;
        }
    }

    if category == Some(ErrorCategory::RateLimited) {
        if let Some(instance_key) = instance_key {
            scm_db::record_rate_limit_hit(pool, instance_key, DEFAULT_RETRY_AFTER_SECONDS)
                .await
                .context("bucket pause after 429 failed")?;
        }
    }

    Ok(outcome)
}

/// Advance the cursor through the per-type monotonicity predicate. On
/// regression the watermark write is skipped (and logged); the run itself
/// stays recorded.
pub async fn advance_cursor(
    pool: &PgPool,
    repo_id: i64,
    job_type: &str,
    new_watermark: &Value,
    result: &RunResult,
) -> Result<bool> {
    let cursor_type = cursor_type_for_job(job_type)?;
    let current = scm_db::load_cursor(pool, repo_id, job_type)
        .await?
        .map(|e| e.cursor);

    let advances = watermark_advances(cursor_type, new_watermark, current.as_ref())?;
    if !advances {
        warn!(
            event = "cursor.regression_skipped",
            repo_id,
            job_type,
            "watermark does not advance; keeping stored cursor"
        );
        return Ok(false);
    }

    let Some(watermark_map) = new_watermark.as_object() else {
        warn!(event = "cursor.malformed_watermark", repo_id, job_type);
        return Ok(false);
    };

    let mut stats = current.map(|c| c.stats).unwrap_or_default();
    stats.insert(
        "last_sync_at".into(),
        Value::String(Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
    );
    stats.insert(
        "last_sync_count".into(),
        Value::from(result.counts.synced_count()),
    );

    let cursor = Cursor {
        version: CURSOR_VERSION,
        watermark: watermark_map.clone(),
        stats,
    };
    scm_db::save_cursor(pool, repo_id, job_type, &cursor).await?;
    info!(event = "cursor.advanced", repo_id, job_type);
    Ok(true)
}

/// Pure predicate dispatch: does `new_watermark` move the stored cursor
/// forward for this cursor type?
fn watermark_advances(
    cursor_type: CursorType,
    new_watermark: &Value,
    current: Option<&Cursor>,
) -> Result<bool> {
    let Some(current) = current else {
        return Ok(true);
    };

    match cursor_type {
        CursorType::Svn => {
            let Some(new_rev) = new_watermark.get("last_rev").and_then(Value::as_i64) else {
                return Ok(false);
            };
            let last = current.watermark.get("last_rev").and_then(Value::as_i64);
            Ok(should_advance_svn_cursor(new_rev, last))
        }
        CursorType::Commits => {
            let (Some(new_ts), Some(new_sha)) = (
                new_watermark.get("last_commit_ts").and_then(Value::as_str),
                new_watermark.get("last_commit_sha").and_then(Value::as_str),
            ) else {
                return Ok(false);
            };
            should_advance_commit_cursor(
                new_ts,
                new_sha,
                current.last_commit_ts(),
                current.last_commit_sha(),
            )
        }
        CursorType::MergeRequests | CursorType::Reviews => {
            let (Some(new_ts), Some(new_iid)) = (
                new_watermark
                    .get("last_mr_updated_at")
                    .and_then(Value::as_str),
                new_watermark.get("last_mr_iid").and_then(Value::as_i64),
            ) else {
                return Ok(false);
            };
            should_advance_mr_cursor(
                new_ts,
                new_iid,
                current.last_mr_updated_at(),
                current.last_mr_iid(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cursor_with(watermark: Value) -> Cursor {
        Cursor {
            version: CURSOR_VERSION,
            watermark: watermark.as_object().unwrap().clone(),
            stats: Default::default(),
        }
    }

    #[test]
    fn first_sync_always_advances() {
        let new = json!({"last_rev": 5});
        assert!(watermark_advances(CursorType::Svn, &new, None).unwrap());
    }

    #[test]
    fn svn_regression_rejected() {
        let current = cursor_with(json!({"last_rev": 100}));
        assert!(watermark_advances(CursorType::Svn, &json!({"last_rev": 101}), Some(&current)).unwrap());
        assert!(!watermark_advances(CursorType::Svn, &json!({"last_rev": 100}), Some(&current)).unwrap());
        assert!(!watermark_advances(CursorType::Svn, &json!({"last_rev": 99}), Some(&current)).unwrap());
    }

    #[test]
    fn mr_tie_break_advances_on_higher_iid_only() {
        let current = cursor_with(json!({
            "last_mr_updated_at": "2024-01-15T12:00:00Z",
            "last_mr_iid": 100,
        }));
        let same_ts_next_iid = json!({
            "last_mr_updated_at": "2024-01-15T12:00:00Z",
            "last_mr_iid": 102,
        });
        let same_pair = json!({
            "last_mr_updated_at": "2024-01-15T12:00:00Z",
            "last_mr_iid": 100,
        });
        assert!(
            watermark_advances(CursorType::MergeRequests, &same_ts_next_iid, Some(&current)).unwrap()
        );
        assert!(!watermark_advances(CursorType::MergeRequests, &same_pair, Some(&current)).unwrap());
    }

    #[test]
    fn commit_watermark_requires_both_fields() {
        let current = cursor_with(json!({
            "last_commit_ts": "2024-01-15T12:00:00Z",
            "last_commit_sha": "abc",
        }));
        let missing_sha = json!({"last_commit_ts": "2024-01-16T12:00:00Z"});
        assert!(!watermark_advances(CursorType::Commits, &missing_sha, Some(&current)).unwrap());

        let full = json!({"last_commit_ts": "2024-01-16T12:00:00Z", "last_commit_sha": "def"});
        assert!(watermark_advances(CursorType::Commits, &full, Some(&current)).unwrap());
    }
}
