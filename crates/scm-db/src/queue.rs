//! The work queue and lease protocol on `scm.sync_jobs`.
//!
//! Claim, heartbeat, and finish are each one short transaction. The
//! per-`(repo, job_type)` running-singleton invariant is enforced twice:
//! by the partial unique index at enqueue time and by the `NOT EXISTS`
//! guard inside the claim update.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use scm_schemas::{ErrorCategory, JobStatus, RunFinishPayload, RunStatus, SyncMode};

use crate::runs;

// ---------------------------------------------------------------------------
// JobRow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct JobRow {
    pub job_id: Uuid,
    pub repo_id: i64,
    pub job_type: String,
    pub mode: SyncMode,
    pub priority: i64,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub not_before: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub lease_seconds: i32,
    pub last_error: Option<String>,
    pub last_run_id: Option<Uuid>,
    pub payload_json: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const JOB_COLUMNS: &str = r#"
    job_id, repo_id, job_type, mode, priority, status,
    attempts, max_attempts, not_before,
    locked_by, locked_at, lease_seconds,
    last_error, last_run_id, payload_json,
    created_at, updated_at
"#;

impl JobRow {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self> {
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
}

// ---------------------------------------------------------------------------
// Enqueue
// ---------------------------------------------------------------------------

/// Insert one pending job. Racing schedulers are harmless: the partial
/// unique index turns the second insert into a no-op and `None` comes back.
pub async fn enqueue_sync_job(
    pool: &PgPool,
    repo_id: i64,
    job_type: &str,
    mode: SyncMode,
    priority: i64,
    max_attempts: u32,
    payload_json: Option<Value>,
) -> Result<Option<Uuid>> {
    let row = sqlx::query(
        r#"
        insert into scm.sync_jobs (repo_id, job_type, mode, priority, max_attempts, payload_json)
        values ($1, $2, $3, $4, $5, coalesce($6, '{}'::jsonb))
        on conflict (repo_id, job_type) where status in ('pending', 'running')
        do nothing
        returning job_id
        "#,
    )
    .bind(repo_id)
    .bind(job_type)
    .bind(mode.as_str())
    .bind(priority)
    .bind(max_attempts as i32)
    .bind(payload_json)
    .fetch_optional(pool)
    .await
    .context("enqueue_sync_job failed")?;
    Ok(row.map(|r| r.try_get("job_id")).transpose()?)
}

/// All `(repo_id, job_type)` pairs currently pending or running.
pub async fn queued_pairs(pool: &PgPool) -> Result<Vec<(i64, String)>> {
    let rows = sqlx::query(
        r#"
        select repo_id, job_type
        from scm.sync_jobs
        where status in ('pending', 'running')
        "#,
    )
    .fetch_all(pool)
    .await
    .context("queued_pairs failed")?;
    rows.iter()
        .map(|r| Ok((r.try_get("repo_id")?, r.try_get("job_type")?)))
        .collect()
}

// ---------------------------------------------------------------------------
// Claim
// ---------------------------------------------------------------------------

/// Claim the next eligible pending job for `worker_id`.
///
/// Picks by `(priority, created_at)` under `FOR UPDATE SKIP LOCKED`, then
/// flips it to running, unless another job for the same `(repo, job_type)`
/// is already running, in which case the claim is released and `None` is
/// returned (the caller just polls again).
pub async fn claim_next_job(
    pool: &PgPool,
    worker_id: &str,
    lease_seconds: u32,
    pool_repo_allowlist: Option<&[i64]>,
) -> Result<Option<JobRow>> {
    let mut tx = pool.begin().await.context("claim: begin failed")?;

    let picked = sqlx::query(
        r#"
        select job_id, repo_id, job_type
        from scm.sync_jobs
        where status = 'pending'
          and not_before <= now()
          and ($1::bigint[] is null or repo_id = any($1))
        order by priority asc, created_at asc
        limit 1
        for update skip locked
        "#,
    )
    .bind(pool_repo_allowlist)
    .fetch_optional(&mut *tx)
    .await
    .context("claim: select failed")?;

    let Some(picked) = picked else {
        tx.commit().await.context("claim: commit failed")?;
        return Ok(None);
    };
    let job_id: Uuid = picked.try_get("job_id")?;
    let repo_id: i64 = picked.try_get("repo_id")?;
    let job_type: String = picked.try_get("job_type")?;

    let claimed = sqlx::query(&format!(
        r#"
        update scm.sync_jobs
        set status = 'running',
            locked_by = $2,
            locked_at = now(),
            lease_seconds = $3,
            updated_at = now()
        where job_id = $1
          and not exists (
              select 1 from scm.sync_jobs
              where repo_id = $4
                and job_type = $5
                and status = 'running'
                and job_id <> $1
          )
        returning {JOB_COLUMNS}
        "#
    ))
    .bind(job_id)
    .bind(worker_id)
    .bind(lease_seconds as i32)
    .bind(repo_id)
    .bind(&job_type)
    .fetch_optional(&mut *tx)
    .await
    .context("claim: update failed")?;

    tx.commit().await.context("claim: commit failed")?;
    claimed.as_ref().map(JobRow::from_row).transpose()
}

/// Extend the lease. Returns `false` when the lease is no longer ours
/// (reaped, or finished elsewhere); the worker must stop the run.
pub async fn heartbeat_job(pool: &PgPool, job_id: Uuid, worker_id: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"
        update scm.sync_jobs
        set locked_at = now(), updated_at = now()
        where job_id = $1 and locked_by = $2 and status = 'running'
        "#,
    )
    .bind(job_id)
    .bind(worker_id)
    .execute(pool)
    .await
    .context("heartbeat_job failed")?;
    Ok(result.rows_affected() == 1)
}

// ---------------------------------------------------------------------------
// Finish
// ---------------------------------------------------------------------------

/// Terminal state the finish transaction left the job in.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishOutcome {
    pub job_status: JobStatus,
    pub not_before: Option<DateTime<Utc>>,
    /// `false` when the run row was already finished (idempotent replay).
    pub applied: bool,
}

/// Close a job with the run-finish payload, in one transaction.
///
/// Failed runs consume an attempt; permanent error categories and exhausted
/// attempts go to `dead`, everything else returns to `pending` with
/// `not_before = now() + backoff_seconds`. Re-invoking for an already
/// finished `run_id` is a no-op.
pub async fn finish_job(
    pool: &PgPool,
    job_id: Uuid,
    payload: &RunFinishPayload,
    error_category: Option<ErrorCategory>,
    backoff_seconds: f64,
) -> Result<FinishOutcome> {
    let mut tx = pool.begin().await.context("finish: begin failed")?;

    let run_updated = runs::insert_sync_run_finish_in_tx(&mut tx, payload).await?;
    if !run_updated {
        // Already finalized by a previous invocation; leave the job alone.
        let status: String =
            sqlx::query(r#"select status from scm.sync_jobs where job_id = $1"#)
                .bind(job_id)
                .fetch_one(&mut *tx)
                .await
                .context("finish: status probe failed")?
                .try_get("status")?;
        tx.commit().await.context("finish: commit failed")?;
        return Ok(FinishOutcome {
            job_status: JobStatus::parse(&status)?,
            not_before: None,
            applied: false,
        });
    }

    let job = sqlx::query(
        r#"
        select attempts, max_attempts from scm.sync_jobs
        where job_id = $1
        for update
        "#,
    )
    .bind(job_id)
    .fetch_one(&mut *tx)
    .await
    .context("finish: job lookup failed")?;
    let attempts: i32 = job.try_get("attempts")?;
    let max_attempts: i32 = job.try_get("max_attempts")?;

    let last_error = payload
        .error_summary
        .as_ref()
        .map(|s| scm_redact::redact(&s.message));

    let (job_status, not_before) = match payload.status {
        RunStatus::Completed | RunStatus::NoData => (JobStatus::Completed, None),
        RunStatus::Failed => {
            let attempts_now = attempts + 1;
            let permanent = error_category.map(|c| c.is_permanent()).unwrap_or(false);
            if permanent || attempts_now >= max_attempts {
                (JobStatus::Dead, None)
            } else {
                let delay = chrono::Duration::milliseconds((backoff_seconds * 1000.0) as i64);
                (JobStatus::Pending, Some(Utc::now() + delay))
            }
        }
        RunStatus::Running => (JobStatus::Running, None),
    };

    sqlx::query(
        r#"
        update scm.sync_jobs
        set status = $2,
            attempts = case when $3 then attempts + 1 else attempts end,
            not_before = coalesce($4, not_before),
            last_error = $5,
            last_run_id = $6,
            locked_by = null,
            locked_at = null,
            updated_at = now()
        where job_id = $1
        "#,
    )
    .bind(job_id)
    .bind(job_status.as_str())
    .bind(payload.status == RunStatus::Failed)
    .bind(not_before)
    .bind(&last_error)
    .bind(payload.run_id)
    .execute(&mut *tx)
    .await
    .context("finish: job update failed")?;

    tx.commit().await.context("finish: commit failed")?;
    Ok(FinishOutcome {
        job_status,
        not_before,
        applied: true,
    })
}

// ---------------------------------------------------------------------------
// Queries & admin
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub repo_id: Option<i64>,
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
    pub limit: i64,
}

pub async fn list_sync_jobs(pool: &PgPool, filter: &JobFilter) -> Result<Vec<JobRow>> {
    let limit = if filter.limit > 0 { filter.limit } else { 100 };
    let rows = sqlx::query(&format!(
        r#"
        select {JOB_COLUMNS}
        from scm.sync_jobs
        where ($1::bigint is null or repo_id = $1)
          and ($2::text is null or status = $2)
          and ($3::text is null or job_type = $3)
        order by created_at desc
        limit $4
        "#
    ))
    .bind(filter.repo_id)
    .bind(filter.status.map(|s| s.as_str()))
    .bind(filter.job_type.as_deref())
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("list_sync_jobs failed")?;
    rows.iter().map(JobRow::from_row).collect()
}

pub async fn count_jobs_by_status(pool: &PgPool) -> Result<Vec<(String, i64)>> {
    let rows = sqlx::query(
        r#"
        select status, count(*)::bigint as n
        from scm.sync_jobs
        group by status
        order by status
        "#,
    )
    .fetch_all(pool)
    .await
    .context("count_jobs_by_status failed")?;
    rows.iter()
        .map(|r| Ok((r.try_get("status")?, r.try_get("n")?)))
        .collect()
}

/// Revive dead jobs: back to `pending` with attempts reset. Returns the
/// affected ids; with `dry_run` only reports what would change.
pub async fn reset_dead_jobs(
    pool: &PgPool,
    job_id: Option<Uuid>,
    repo_id: Option<i64>,
    job_type: Option<&str>,
    dry_run: bool,
) -> Result<Vec<Uuid>> {
    if dry_run {
        let rows = sqlx::query(
            r#"
            select job_id from scm.sync_jobs
            where status = 'dead'
              and ($1::uuid is null or job_id = $1)
              and ($2::bigint is null or repo_id = $2)
              and ($3::text is null or job_type = $3)
            "#,
        )
        .bind(job_id)
        .bind(repo_id)
        .bind(job_type)
        .fetch_all(pool)
        .await
        .context("reset_dead_jobs dry-run failed")?;
        return rows.iter().map(|r| Ok(r.try_get("job_id")?)).collect();
    }

    let rows = sqlx::query(
        r#"
        update scm.sync_jobs as j
        set status = 'pending',
            attempts = 0,
            not_before = now(),
            locked_by = null,
            locked_at = null,
            updated_at = now()
        where j.status = 'dead'
          and ($1::uuid is null or j.job_id = $1)
          and ($2::bigint is null or j.repo_id = $2)
          and ($3::text is null or j.job_type = $3)
          and not exists (
              select 1 from scm.sync_jobs live
              where live.repo_id = j.repo_id
                and live.job_type = j.job_type
                and live.status in ('pending', 'running')
          )
        returning j.job_id
        "#,
    )
    .bind(job_id)
    .bind(repo_id)
    .bind(job_type)
    .fetch_all(pool)
    .await
    .context("reset_dead_jobs failed")?;
    rows.iter().map(|r| Ok(r.try_get("job_id")?)).collect()
}

/// Operator kill switch for one job.
pub async fn mark_job_dead(pool: &PgPool, job_id: Uuid, reason: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"
        update scm.sync_jobs
        set status = 'dead',
            last_error = $2,
            locked_by = null,
            locked_at = null,
            updated_at = now()
        where job_id = $1
        "#,
    )
    .bind(job_id)
    .bind(scm_redact::redact(reason))
    .execute(pool)
    .await
    .context("mark_job_dead failed")?;
    Ok(result.rows_affected() == 1)
}
