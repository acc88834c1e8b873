//! Postgres access layer for the sync control plane.
//!
//! All coordination state lives in two schemas: `scm` (repos, job queue, run
//! ledger, locks, rate-limit buckets) and `logbook` (the `kv` table holding
//! cursors, breaker state, and pause records). Queries are raw SQL with
//! positional binds; every row struct maps columns explicitly via `try_get`.
//!
//! Transactions are short by contract: claim, heartbeat, and finish each run
//! in their own transaction, and nothing here holds a transaction open
//! across an adapter call.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

pub mod buckets;
pub mod kv;
pub mod locks;
pub mod queue;
pub mod reaper;
pub mod runs;
pub mod summary;

pub use buckets::{
    acquire_tokens, admin_pause_bucket, admin_unpause_bucket, ensure_bucket, get_bucket,
    list_buckets, record_rate_limit_hit, BucketRow,
};
pub use kv::{
    build_cursor_key, clear_expired_pauses, cursor_namespace, delete_circuit_breaker_state,
    delete_cursor, get_cursor_raw, get_paused_repo_job_pairs, get_repo_job_pause, kv_delete,
    kv_get, kv_list, kv_set, list_circuit_breaker_states, list_cursors, list_pauses,
    load_circuit_breaker_state, load_cursor, save_circuit_breaker_state, save_cursor,
    set_cursor_raw, set_repo_job_pause, unset_repo_job_pause, CursorEntry, KvEntry, NS_CURSORS,
    NS_HEALTH, NS_PAUSES,
};
pub use locks::{force_release_lock, list_expired_locks, list_sync_locks, LockRow};
pub use queue::{
    claim_next_job, count_jobs_by_status, enqueue_sync_job, finish_job, heartbeat_job,
    list_sync_jobs, mark_job_dead, queued_pairs, reset_dead_jobs, FinishOutcome, JobFilter, JobRow,
};
pub use reaper::{
    list_expired_running_jobs, list_expired_running_runs, mark_job_as_dead_by_reaper,
    mark_job_as_failed_by_reaper, mark_job_as_pending_by_reaper, mark_run_as_failed_by_reaper,
};
pub use runs::{
    get_latest_sync_run, get_sync_run, insert_sync_run_finish, insert_sync_run_start,
    list_sync_runs, window_health_stats, window_repo_stats, RepoWindowStats, RunRow,
};
pub use summary::{get_sync_status_summary, repo_lag_rows, RepoLagRow, StatusSummary};

/// Mandatory Postgres connection string.
pub const ENV_DB_URL: &str = "POSTGRES_DSN";

/// Connect using `POSTGRES_DSN`.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url).await
}

/// Session-level statement timeout; no control-plane query should ever run
/// longer than a lease heartbeat interval.
const STATEMENT_TIMEOUT: &str = "30s";

pub async fn connect(url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query(&format!("set statement_timeout = '{STATEMENT_TIMEOUT}'"))
                    .execute(conn)
                    .await?;
                Ok(())
            })
        })
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Run embedded migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Test helper: connect from env and ensure migrations are applied.
pub async fn testkit_db_pool() -> Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}

// ---------------------------------------------------------------------------
// Repos
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RepoRow {
    pub repo_id: i64,
    pub repo_type: String,
    pub url: String,
    pub project_key: String,
    pub default_branch: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RepoRow {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self> {
        Ok(RepoRow {
            repo_id: row.try_get("repo_id")?,
            repo_type: row.try_get("repo_type")?,
            url: row.try_get("url")?,
            project_key: row.try_get("project_key")?,
            default_branch: row.try_get("default_branch")?,
            created_at: row.try_get("created_at")?,
        })
    }

    /// Tenant is the first path segment of the project key.
    pub fn tenant_id(&self) -> Option<&str> {
        let first = self.project_key.split('/').next()?;
        if first.is_empty() {
            None
        } else {
            Some(first)
        }
    }
}

/// Upsert one repo row. The registry process owns this table; the core
/// writes only through this helper (tests, admin repair).
pub async fn upsert_repo(
    pool: &PgPool,
    repo_type: &str,
    url: &str,
    project_key: &str,
    default_branch: Option<&str>,
) -> Result<i64> {
    let row = sqlx::query(
        r#"
        insert into scm.repos (repo_type, url, project_key, default_branch)
        values ($1, $2, $3, $4)
        on conflict (repo_type, url)
        do update set
            project_key = excluded.project_key,
            default_branch = coalesce(excluded.default_branch, scm.repos.default_branch),
            updated_at = now()
        returning repo_id
        "#,
    )
    .bind(repo_type)
    .bind(url)
    .bind(project_key)
    .bind(default_branch)
    .fetch_one(pool)
    .await
    .context("upsert_repo failed")?;
    Ok(row.try_get("repo_id")?)
}

pub async fn get_repo(pool: &PgPool, repo_id: i64) -> Result<Option<RepoRow>> {
    let row = sqlx::query(
        r#"
        select repo_id, repo_type, url, project_key, default_branch, created_at
        from scm.repos
        where repo_id = $1
        "#,
    )
    .bind(repo_id)
    .fetch_optional(pool)
    .await
    .context("get_repo failed")?;
    row.as_ref().map(RepoRow::from_row).transpose()
}

pub async fn list_repos(
    pool: &PgPool,
    repo_type: Option<&str>,
    limit: i64,
) -> Result<Vec<RepoRow>> {
    let rows = sqlx::query(
        r#"
        select repo_id, repo_type, url, project_key, default_branch, created_at
        from scm.repos
        where ($1::text is null or repo_type = $1)
        order by created_at desc
        limit $2
        "#,
    )
    .bind(repo_type)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("list_repos failed")?;
    rows.iter().map(RepoRow::from_row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_is_first_project_key_segment() {
        let repo = RepoRow {
            repo_id: 1,
            repo_type: "git".into(),
            url: "https://gitlab.example.com/acme/widget.git".into(),
            project_key: "acme/widget".into(),
            default_branch: Some("main".into()),
            created_at: Utc::now(),
        };
        assert_eq!(repo.tenant_id(), Some("acme"));

        let bare = RepoRow {
            project_key: "solo".into(),
            ..repo.clone()
        };
        assert_eq!(bare.tenant_id(), Some("solo"));

        let empty = RepoRow {
            project_key: String::new(),
            ..repo
        };
        assert_eq!(empty.tenant_id(), None);
    }
}
