//! Queries and mark operations used by the reaper sweeps.
//!
//! Every mark operation clears the lease, bumps `attempts`, and stores a
//! redacted `"Reaped: …"` message so operators can tell recovery actions
//! from worker-reported failures.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::queue::JobRow;
use crate::runs::RunRow;

pub async fn list_expired_running_jobs(
    pool: &PgPool,
    grace_seconds: u32,
    limit: i64,
) -> Result<Vec<JobRow>> {
    let rows = sqlx::query(
        r#"
        select job_id, repo_id, job_type, mode, priority, status,
               attempts, max_attempts, not_before,
               locked_by, locked_at, lease_seconds,
               last_error, last_run_id, payload_json,
               created_at, updated_at
        from scm.sync_jobs
        where status = 'running'
          and locked_at is not null
          and locked_at + (lease_seconds + $1) * interval '1 second' < now()
        order by locked_at asc
        limit $2
        "#,
    )
    .bind(grace_seconds as i32)
    .bind(if limit > 0 { limit } else { 100 })
    .fetch_all(pool)
    .await
    .context("list_expired_running_jobs failed")?;
    rows.iter().map(job_from_row).collect()
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<JobRow> {
    use scm_schemas::{JobStatus, SyncMode};
    Ok(JobRow {
        job_id: row.try_get("job_id")?,
        repo_id: row.try_get("repo_id")?,
        job_type: row.try_get("job_type")?,
        mode: SyncMode::parse(&row.try_get::<String, _>("mode")?)?,
        priority: row.try_get("priority")?,
        status: JobStatus::parse(&row.try_get::<String, _>("status")?)?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        not_before: row.try_get("not_before")?,
        locked_by: row.try_get("locked_by")?,
        locked_at: row.try_get("locked_at")?,
        lease_seconds: row.try_get("lease_seconds")?,
        last_error: row.try_get("last_error")?,
        last_run_id: row.try_get("last_run_id")?,
        payload_json: row.try_get("payload_json")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn list_expired_running_runs(
    pool: &PgPool,
    max_duration_seconds: u32,
    limit: i64,
) -> Result<Vec<RunRow>> {
    crate::runs::list_expired_running(pool, max_duration_seconds, limit).await
}

/// Expired job with attempts left: back to `failed` (claimable again after
/// the delay).
pub async fn mark_job_as_failed_by_reaper(
    pool: &PgPool,
    job_id: Uuid,
    message: &str,
    retry_delay_seconds: f64,
) -> Result<bool> {
    mark_job(pool, job_id, "failed", message, Some(retry_delay_seconds)).await
}

/// Expired job under the `to_pending` policy: immediately claimable.
pub async fn mark_job_as_pending_by_reaper(
    pool: &PgPool,
    job_id: Uuid,
    message: &str,
    retry_delay_seconds: f64,
) -> Result<bool> {
    mark_job(pool, job_id, "pending", message, Some(retry_delay_seconds)).await
}

/// Permanent error or attempts exhausted: terminal.
pub async fn mark_job_as_dead_by_reaper(pool: &PgPool, job_id: Uuid, message: &str) -> Result<bool> {
    mark_job(pool, job_id, "dead", message, None).await
}

async fn mark_job(
    pool: &PgPool,
    job_id: Uuid,
    status: &str,
    message: &str,
    retry_delay_seconds: Option<f64>,
) -> Result<bool> {
    let redacted = scm_redact::redact(message);
    let result = sqlx::query(
        r#"
        update scm.sync_jobs
        set status = $2,
            attempts = attempts + 1,
            last_error = $3,
            locked_by = null,
            locked_at = null,
            not_before = case
                when $4::double precision is null then not_before
                else now() + $4 * interval '1 second'
            end,
            updated_at = now()
        where job_id = $1 and status = 'running'
        "#,
    )
    .bind(job_id)
    .bind(status)
    .bind(redacted)
    .bind(retry_delay_seconds)
    .execute(pool)
    .await
    .with_context(|| format!("reaper mark job {job_id} -> {status} failed"))?;
    Ok(result.rows_affected() == 1)
}

/// Stuck run past its wall-clock ceiling: mark failed with a structured,
/// redacted summary.
pub async fn mark_run_as_failed_by_reaper(
    pool: &PgPool,
    run_id: Uuid,
    error_summary: &Value,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        update scm.sync_runs
        set status = 'failed',
            finished_at = now(),
            error_summary_json = $2
        where run_id = $1 and status = 'running'
        "#,
    )
    .bind(run_id)
    .bind(scm_redact::redact_json(error_summary))
    .execute(pool)
    .await
    .context("mark_run_as_failed_by_reaper failed")?;
    Ok(result.rows_affected() == 1)
}
