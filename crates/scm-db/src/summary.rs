//! Aggregate snapshot queries backing `status summary`.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;

use crate::kv;

#[derive(Debug, Clone, Default)]
pub struct StatusSummary {
    pub repos_count: i64,
    pub repos_by_type: BTreeMap<String, i64>,
    pub runs_24h_by_status: BTreeMap<String, i64>,
    pub jobs_by_status: BTreeMap<String, i64>,
    pub active_locks: i64,
    pub expired_locks: i64,
    pub cursors_count: i64,
}

pub async fn get_sync_status_summary(pool: &PgPool) -> Result<StatusSummary> {
    let mut summary = StatusSummary::default();

    let row = sqlx::query(r#"select count(*)::bigint as n from scm.repos"#)
        .fetch_one(pool)
        .await
        .context("summary: repos count failed")?;
    summary.repos_count = row.try_get("n")?;

    let rows = sqlx::query(
        r#"select repo_type, count(*)::bigint as n from scm.repos group by repo_type"#,
    )
    .fetch_all(pool)
    .await
    .context("summary: repos by type failed")?;
    for row in rows {
        summary
            .repos_by_type
            .insert(row.try_get("repo_type")?, row.try_get("n")?);
    }

    let rows = sqlx::query(
        r#"
        select status, count(*)::bigint as n
        from scm.sync_runs
        where started_at >= now() - interval '24 hours'
        group by status
        "#,
    )
    .fetch_all(pool)
    .await
    .context("summary: runs by status failed")?;
    for row in rows {
        summary
            .runs_24h_by_status
            .insert(row.try_get("status")?, row.try_get("n")?);
    }

    let rows = sqlx::query(
        r#"select status, count(*)::bigint as n from scm.sync_jobs group by status"#,
    )
    .fetch_all(pool)
    .await
    .context("summary: jobs by status failed")?;
    for row in rows {
        summary
            .jobs_by_status
            .insert(row.try_get("status")?, row.try_get("n")?);
    }

    let row = sqlx::query(
        r#"select count(*)::bigint as n from scm.sync_locks where locked_by is not null"#,
    )
    .fetch_one(pool)
    .await
    .context("summary: active locks failed")?;
    summary.active_locks = row.try_get("n")?;

    let row = sqlx::query(
        r#"
        select count(*)::bigint as n
        from scm.sync_locks
        where locked_by is not null
          and locked_at + lease_seconds * interval '1 second' < now()
        "#,
    )
    .fetch_one(pool)
    .await
    .context("summary: expired locks failed")?;
    summary.expired_locks = row.try_get("n")?;

    let ns = kv::cursor_namespace();
    let row = sqlx::query(r#"select count(*)::bigint as n from logbook.kv where namespace = $1"#)
        .bind(&ns)
        .fetch_one(pool)
        .await
        .context("summary: cursors count failed")?;
    summary.cursors_count = row.try_get("n")?;

    Ok(summary)
}

/// One repo/job-type lag entry (seconds since the cursor last advanced).
#[derive(Debug, Clone)]
pub struct RepoLagRow {
    pub repo_id: i64,
    pub repo_type: String,
    pub job_type: String,
    pub lag_seconds: f64,
}

/// Highest-lag `(repo, job_type)` pairs, worst first.
pub async fn repo_lag_rows(pool: &PgPool, top_n: usize) -> Result<Vec<RepoLagRow>> {
    let cursors = kv::list_cursors(pool, None, 10_000).await?;
    let repos = crate::list_repos(pool, None, 10_000).await?;
    let repo_types: BTreeMap<i64, String> = repos
        .into_iter()
        .map(|r| (r.repo_id, r.repo_type))
        .collect();

    let now = Utc::now();
    let mut rows = Vec::new();
    for entry in cursors {
        let Ok((repo_id, job_type)) = scm_schemas::keys::parse_pause_key(&entry.key) else {
            continue;
        };
        let Some(repo_type) = repo_types.get(&repo_id) else {
            continue;
        };
        let lag = ((now - entry.updated_at).num_milliseconds() as f64 / 1000.0).max(0.0);
        rows.push(RepoLagRow {
            repo_id,
            repo_type: repo_type.clone(),
            job_type,
            lag_seconds: lag,
        });
    }
    rows.sort_by(|a, b| b.lag_seconds.total_cmp(&a.lag_seconds));
    rows.truncate(top_n);
    Ok(rows)
}
