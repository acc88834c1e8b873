//! `scm.sync_locks`: cross-job-type coordination rows.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

#[derive(Debug, Clone)]
pub struct LockRow {
    pub lock_id: i64,
    pub repo_id: i64,
    pub job_type: String,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub lease_seconds: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LockRow {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self> {
        Ok(LockRow {
            lock_id: row.try_get("lock_id")?,
            repo_id: row.try_get("repo_id")?,
            job_type: row.try_get("job_type")?,
            locked_by: row.try_get("locked_by")?,
            locked_at: row.try_get("locked_at")?,
            lease_seconds: row.try_get("lease_seconds")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    pub fn is_locked(&self) -> bool {
        self.locked_by.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.locked_at {
            Some(locked_at) if self.is_locked() => {
                (now - locked_at).num_seconds() > self.lease_seconds as i64
            }
            _ => false,
        }
    }
}

pub async fn list_sync_locks(pool: &PgPool, repo_id: Option<i64>, limit: i64) -> Result<Vec<LockRow>> {
    let rows = sqlx::query(
        r#"
        select lock_id, repo_id, job_type, locked_by, locked_at, lease_seconds, created_at, updated_at
        from scm.sync_locks
        where ($1::bigint is null or repo_id = $1)
        order by lock_id desc
        limit $2
        "#,
    )
    .bind(repo_id)
    .bind(if limit > 0 { limit } else { 100 })
    .fetch_all(pool)
    .await
    .context("list_sync_locks failed")?;
    rows.iter().map(LockRow::from_row).collect()
}

pub async fn list_expired_locks(pool: &PgPool, grace_seconds: u32, limit: i64) -> Result<Vec<LockRow>> {
    let rows = sqlx::query(
        r#"
        select lock_id, repo_id, job_type, locked_by, locked_at, lease_seconds, created_at, updated_at
        from scm.sync_locks
        where locked_by is not null
          and locked_at + (lease_seconds + $1) * interval '1 second' < now()
        order by locked_at asc
        limit $2
        "#,
    )
    .bind(grace_seconds as i32)
    .bind(if limit > 0 { limit } else { 100 })
    .fetch_all(pool)
    .await
    .context("list_expired_locks failed")?;
    rows.iter().map(LockRow::from_row).collect()
}

pub async fn force_release_lock(pool: &PgPool, lock_id: i64) -> Result<bool> {
    let result = sqlx::query(
        r#"
        update scm.sync_locks
        set locked_by = null,
            locked_at = null,
            updated_at = now()
        where lock_id = $1
        "#,
    )
    .bind(lock_id)
    .execute(pool)
    .await
    .context("force_release_lock failed")?;
    Ok(result.rows_affected() == 1)
}
