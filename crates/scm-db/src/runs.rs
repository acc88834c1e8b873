//! The `scm.sync_runs` append-only ledger.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use scm_schemas::{validate_run_finish_payload, HealthStats, RunFinishPayload, RunStatus, SyncMode};

// ---------------------------------------------------------------------------
// RunRow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RunRow {
    pub run_id: Uuid,
    pub repo_id: i64,
    pub job_type: String,
    pub mode: SyncMode,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cursor_before: Option<Value>,
    pub cursor_after: Option<Value>,
    pub counts: Option<Value>,
    pub error_summary_json: Option<Value>,
    pub degradation_json: Option<Value>,
    pub meta_json: Value,
    /// Generated column mirroring `counts->>'synced_count'`.
    pub synced_count: Option<i32>,
}

const RUN_COLUMNS: &str = r#"
    run_id, repo_id, job_type, mode, status,
    started_at, finished_at,
    cursor_before, cursor_after,
    counts, error_summary_json, degradation_json,
    meta_json, synced_count
"#;

impl RunRow {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self> {
        Ok(RunRow {
            run_id: row.try_get("run_id")?,
            repo_id: row.try_get("repo_id")?,
            job_type: row.try_get("job_type")?,
            mode: SyncMode::parse(&row.try_get::<String, _>("mode")?)?,
            status: RunStatus::parse(&row.try_get::<String, _>("status")?)?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            cursor_before: row.try_get("cursor_before")?,
            cursor_after: row.try_get("cursor_after")?,
            counts: row.try_get("counts")?,
            error_summary_json: row.try_get("error_summary_json")?,
            degradation_json: row.try_get("degradation_json")?,
            meta_json: row.try_get("meta_json")?,
            synced_count: row.try_get("synced_count")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Start / finish
// ---------------------------------------------------------------------------

/// Open a run. Idempotent on `run_id` (replayed starts are no-ops).
pub async fn insert_sync_run_start(
    pool: &PgPool,
    run_id: Uuid,
    repo_id: i64,
    job_type: &str,
    mode: SyncMode,
    cursor_before: Option<&Value>,
    meta_json: Option<&Value>,
) -> Result<Uuid> {
    sqlx::query(
        r#"
        insert into scm.sync_runs (run_id, repo_id, job_type, mode, status, cursor_before, meta_json)
        values ($1, $2, $3, $4, 'running', $5, coalesce($6, '{}'::jsonb))
        on conflict (run_id) do nothing
        "#,
    )
    .bind(run_id)
    .bind(repo_id)
    .bind(job_type)
    .bind(mode.as_str())
    .bind(cursor_before)
    .bind(meta_json)
    .execute(pool)
    .await
    .context("insert_sync_run_start failed")?;
    Ok(run_id)
}

/// Finish a run inside an existing transaction. Returns `false` when the
/// run was not in `running` (already finished: idempotent replay).
pub async fn insert_sync_run_finish_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    payload: &RunFinishPayload,
) -> Result<bool> {
    if let Err(problems) = validate_run_finish_payload(payload) {
        anyhow::bail!("invalid run finish payload: {}", problems.join("; "));
    }

    let error_summary = payload
        .error_summary
        .as_ref()
        .map(|s| scm_redact::redact_json(&s.to_value()));
    let degradation = payload
        .degradation
        .as_ref()
        .map(|d| serde_json::to_value(d).unwrap_or(Value::Null));

    let result = sqlx::query(
        r#"
        update scm.sync_runs
        set status = $2,
            finished_at = now(),
            cursor_after = $3,
            counts = $4,
            error_summary_json = $5,
            degradation_json = $6,
            meta_json = coalesce($7, meta_json)
        where run_id = $1
          and status = 'running'
        "#,
    )
    .bind(payload.run_id)
    .bind(payload.status.as_str())
    .bind(&payload.cursor_after)
    .bind(payload.counts.as_value())
    .bind(error_summary)
    .bind(degradation)
    .bind(if payload.meta.is_empty() {
        None
    } else {
        Some(Value::Object(payload.meta.clone()))
    })
    .execute(&mut **tx)
    .await
    .context("insert_sync_run_finish failed")?;

    Ok(result.rows_affected() == 1)
}

/// Standalone finish (one-transaction convenience for tests and repair).
pub async fn insert_sync_run_finish(pool: &PgPool, payload: &RunFinishPayload) -> Result<bool> {
    let mut tx = pool.begin().await.context("run finish: begin failed")?;
    let updated = insert_sync_run_finish_in_tx(&mut tx, payload).await?;
    tx.commit().await.context("run finish: commit failed")?;
    Ok(updated)
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

pub async fn get_sync_run(pool: &PgPool, run_id: Uuid) -> Result<Option<RunRow>> {
    let row = sqlx::query(&format!(
        r#"select {RUN_COLUMNS} from scm.sync_runs where run_id = $1"#
    ))
    .bind(run_id)
    .fetch_optional(pool)
    .await
    .context("get_sync_run failed")?;
    row.as_ref().map(RunRow::from_row).transpose()
}

pub async fn get_latest_sync_run(
    pool: &PgPool,
    repo_id: i64,
    job_type: Option<&str>,
) -> Result<Option<RunRow>> {
    let row = sqlx::query(&format!(
        r#"
        select {RUN_COLUMNS}
        from scm.sync_runs
        where repo_id = $1
          and ($2::text is null or job_type = $2)
        order by started_at desc
        limit 1
        "#
    ))
    .bind(repo_id)
    .bind(job_type)
    .fetch_optional(pool)
    .await
    .context("get_latest_sync_run failed")?;
    row.as_ref().map(RunRow::from_row).transpose()
}

pub async fn list_sync_runs(
    pool: &PgPool,
    repo_id: Option<i64>,
    status: Option<RunStatus>,
    limit: i64,
) -> Result<Vec<RunRow>> {
    let rows = sqlx::query(&format!(
        r#"
        select {RUN_COLUMNS}
        from scm.sync_runs
        where ($1::bigint is null or repo_id = $1)
          and ($2::text is null or status = $2)
        order by started_at desc
        limit $3
        "#
    ))
    .bind(repo_id)
    .bind(status.map(|s| s.as_str()))
    .bind(if limit > 0 { limit } else { 100 })
    .fetch_all(pool)
    .await
    .context("list_sync_runs failed")?;
    rows.iter().map(RunRow::from_row).collect()
}

/// Runs still `running` past the wall-clock ceiling.
pub async fn list_expired_running(
    pool: &PgPool,
    max_duration_seconds: u32,
    limit: i64,
) -> Result<Vec<RunRow>> {
    let rows = sqlx::query(&format!(
        r#"
        select {RUN_COLUMNS}
        from scm.sync_runs
        where status = 'running'
          and started_at + $1 * interval '1 second' < now()
        order by started_at asc
        limit $2
        "#
    ))
    .bind(max_duration_seconds as i32)
    .bind(if limit > 0 { limit } else { 100 })
    .fetch_all(pool)
    .await
    .context("list_expired_running failed")?;
    rows.iter().map(RunRow::from_row).collect()
}

// ---------------------------------------------------------------------------
// Windowed stats
// ---------------------------------------------------------------------------

/// Per-repo aggregates over the trailing window, for scheduler states and
/// per-scope breaker health.
#[derive(Debug, Clone, Default)]
pub struct RepoWindowStats {
    pub repo_id: i64,
    pub total_runs: u64,
    pub failed_runs: u64,
    pub hits_429: u64,
    pub total_requests: u64,
    pub timeout_count: u64,
}

pub async fn window_repo_stats(pool: &PgPool, window_minutes: u32) -> Result<Vec<RepoWindowStats>> {
    let rows = sqlx::query(
        r#"
        select repo_id,
               count(*) filter (where status in ('completed', 'failed', 'no_data'))::bigint as total_runs,
               count(*) filter (where status = 'failed')::bigint as failed_runs,
               coalesce(sum((counts ->> 'total_429_hits')::bigint), 0) as hits_429,
               coalesce(sum((counts ->> 'total_requests')::bigint), 0) as total_requests,
               coalesce(sum((counts ->> 'timeout_count')::bigint), 0) as timeout_count
        from scm.sync_runs
        where started_at >= now() - $1 * interval '1 minute'
        group by repo_id
        "#,
    )
    .bind(window_minutes as i32)
    .fetch_all(pool)
    .await
    .context("window_repo_stats failed")?;

    rows.iter()
        .map(|r| {
            Ok(RepoWindowStats {
                repo_id: r.try_get("repo_id")?,
                total_runs: r.try_get::<i64, _>("total_runs")? as u64,
                failed_runs: r.try_get::<i64, _>("failed_runs")? as u64,
                hits_429: r.try_get::<i64, _>("hits_429")? as u64,
                total_requests: r.try_get::<i64, _>("total_requests")? as u64,
                timeout_count: r.try_get::<i64, _>("timeout_count")? as u64,
            })
        })
        .collect()
}

/// Global health over the trailing window, in breaker input shape.
pub async fn window_health_stats(pool: &PgPool, window_minutes: u32) -> Result<HealthStats> {
    let row = sqlx::query(
        r#"
        select count(*) filter (where status in ('completed', 'failed', 'no_data'))::bigint as total_runs,
               count(*) filter (where status = 'failed')::bigint as failed_runs,
               coalesce(sum((counts ->> 'total_429_hits')::bigint), 0) as hits_429,
               coalesce(sum((counts ->> 'total_requests')::bigint), 0) as total_requests,
               coalesce(sum((counts ->> 'timeout_count')::bigint), 0) as timeout_count
        from scm.sync_runs
        where started_at >= now() - $1 * interval '1 minute'
        "#,
    )
    .bind(window_minutes as i32)
    .fetch_one(pool)
    .await
    .context("window_health_stats failed")?;

    let total_runs = row.try_get::<i64, _>("total_runs")? as u64;
    let failed_runs = row.try_get::<i64, _>("failed_runs")? as u64;
    let hits_429 = row.try_get::<i64, _>("hits_429")? as u64;
    let total_requests = row.try_get::<i64, _>("total_requests")? as u64;
    let timeout_count = row.try_get::<i64, _>("timeout_count")? as u64;

    Ok(HealthStats {
        total_runs,
        failed_rate: if total_runs == 0 {
            0.0
        } else {
            failed_runs as f64 / total_runs as f64
        },
        rate_limit_rate: if total_requests == 0 {
            0.0
        } else {
            (hits_429 as f64 / total_requests as f64).min(1.0)
        },
        total_requests,
        total_timeout_count: timeout_count,
    })
}
