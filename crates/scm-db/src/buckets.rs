//! Per-instance token buckets in `scm.sync_rate_limits`.
//!
//! Token arithmetic happens inside a row-locked transaction: refill by
//! `rate · Δt` capped at `burst`, then deduct. When the bucket is paused or
//! short on tokens the transaction is committed first and the wait happens
//! outside any lock.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::{PgPool, Row};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BucketRow {
    pub instance_key: String,
    pub tokens: f64,
    pub rate: f64,
    pub burst: f64,
    pub paused_until: Option<DateTime<Utc>>,
    pub meta_json: Value,
    pub updated_at: DateTime<Utc>,
}

impl BucketRow {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self> {
        Ok(BucketRow {
            instance_key: row.try_get("instance_key")?,
            tokens: row.try_get("tokens")?,
            rate: row.try_get("rate")?,
            burst: row.try_get("burst")?,
            paused_until: row.try_get("paused_until")?,
            meta_json: row.try_get("meta_json")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    pub fn is_paused(&self, now: DateTime<Utc>) -> bool {
        self.paused_until.map(|t| t > now).unwrap_or(false)
    }

    pub fn pause_remaining_seconds(&self, now: DateTime<Utc>) -> f64 {
        self.paused_until
            .map(|t| ((t - now).num_milliseconds() as f64 / 1000.0).max(0.0))
            .unwrap_or(0.0)
    }

    /// Tokens available right now, with refill projected since the last
    /// write (read-only view; nothing is persisted).
    pub fn projected_tokens(&self, now: DateTime<Utc>) -> f64 {
        let elapsed = ((now - self.updated_at).num_milliseconds() as f64 / 1000.0).max(0.0);
        (self.tokens + self.rate * elapsed).min(self.burst)
    }
}

/// Create the bucket on first observation of an instance.
pub async fn ensure_bucket(
    pool: &PgPool,
    instance_key: &str,
    default_rate: f64,
    default_burst: f64,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into scm.sync_rate_limits (instance_key, tokens, rate, burst)
        values ($1, $2, $3, $2)
        on conflict (instance_key) do nothing
        "#,
    )
    .bind(instance_key)
    .bind(default_burst)
    .bind(default_rate)
    .execute(pool)
    .await
    .context("ensure_bucket failed")?;
    Ok(())
}

pub async fn get_bucket(pool: &PgPool, instance_key: &str) -> Result<Option<BucketRow>> {
    let row = sqlx::query(
        r#"
        select instance_key, tokens, rate, burst, paused_until, meta_json, updated_at
        from scm.sync_rate_limits
        where instance_key = $1
        "#,
    )
    .bind(instance_key)
    .fetch_optional(pool)
    .await
    .context("get_bucket failed")?;
    row.as_ref().map(BucketRow::from_row).transpose()
}

pub async fn list_buckets(pool: &PgPool) -> Result<Vec<BucketRow>> {
    let rows = sqlx::query(
        r#"
        select instance_key, tokens, rate, burst, paused_until, meta_json, updated_at
        from scm.sync_rate_limits
        order by instance_key
        "#,
    )
    .fetch_all(pool)
    .await
    .context("list_buckets failed")?;
    rows.iter().map(BucketRow::from_row).collect()
}

/// Acquire `n` tokens, blocking (outside any transaction) on pauses and
/// refill. `max_wait` bounds the total sleep; exceeding it is an error so a
/// stuck bucket cannot wedge a worker forever.
pub async fn acquire_tokens(
    pool: &PgPool,
    instance_key: &str,
    n: f64,
    max_wait: Duration,
) -> Result<()> {
    let deadline = std::time::Instant::now() + max_wait;

    loop {
        let wait = try_acquire_once(pool, instance_key, n).await?;
        let Some(wait) = wait else {
            return Ok(());
        };

        if std::time::Instant::now() + wait > deadline {
            return Err(anyhow!(
                "rate limit wait for {} exceeds max_wait ({:?})",
                instance_key,
                max_wait
            ));
        }
        tokio::time::sleep(wait).await;
    }
}

/// One locked attempt. Returns `None` on success, or how long to sleep
/// before retrying.
async fn try_acquire_once(pool: &PgPool, instance_key: &str, n: f64) -> Result<Option<Duration>> {
    let mut tx = pool.begin().await.context("bucket: begin failed")?;

    let row = sqlx::query(
        r#"
        select tokens, rate, burst, paused_until, updated_at
        from scm.sync_rate_limits
        where instance_key = $1
        for update
        "#,
    )
    .bind(instance_key)
    .fetch_optional(&mut *tx)
    .await
    .context("bucket: select failed")?;

    let Some(row) = row else {
        // Unknown bucket: nothing limits this instance yet.
        tx.commit().await.context("bucket: commit failed")?;
        return Ok(None);
    };

    let tokens: f64 = row.try_get("tokens")?;
    let rate: f64 = row.try_get("rate")?;
    let burst: f64 = row.try_get("burst")?;
    let paused_until: Option<DateTime<Utc>> = row.try_get("paused_until")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;
    let now = Utc::now();

    if let Some(paused_until) = paused_until {
        if paused_until > now {
            tx.commit().await.context("bucket: commit failed")?;
            let wait = (paused_until - now).num_milliseconds().max(0) as u64;
            return Ok(Some(Duration::from_millis(wait)));
        }
    }

    let elapsed = ((now - updated_at).num_milliseconds() as f64 / 1000.0).max(0.0);
    let available = (tokens + rate * elapsed).min(burst);

    if available < n {
        tx.commit().await.context("bucket: commit failed")?;
        if rate <= 0.0 {
            return Err(anyhow!("bucket {} has zero rate and {} tokens", instance_key, available));
        }
        let wait_secs = (n - available) / rate;
        return Ok(Some(Duration::from_millis((wait_secs * 1000.0).ceil() as u64)));
    }

    sqlx::query(
        r#"
        update scm.sync_rate_limits
        set tokens = $2,
            paused_until = null,
            updated_at = now()
        where instance_key = $1
        "#,
    )
    .bind(instance_key)
    .bind(available - n)
    .execute(&mut *tx)
    .await
    .context("bucket: update failed")?;
    tx.commit().await.context("bucket: commit failed")?;
    Ok(None)
}

/// Pause the bucket after an HTTP 429, honoring `Retry-After`.
pub async fn record_rate_limit_hit(
    pool: &PgPool,
    instance_key: &str,
    retry_after_seconds: f64,
) -> Result<()> {
    sqlx::query(
        r#"
        update scm.sync_rate_limits
        set paused_until = now() + $2 * interval '1 second',
            meta_json = jsonb_set(meta_json, '{pause_source}', '"http_429"'),
            updated_at = now()
        where instance_key = $1
        "#,
    )
    .bind(instance_key)
    .bind(retry_after_seconds)
    .execute(pool)
    .await
    .context("record_rate_limit_hit failed")?;
    Ok(())
}

/// Operator pause with a reason recorded in meta.
pub async fn admin_pause_bucket(
    pool: &PgPool,
    instance_key: &str,
    duration_seconds: f64,
    reason: &str,
) -> Result<bool> {
    let meta_patch = json!({
        "pause_source": "admin",
        "pause_reason": scm_redact::redact(reason),
    });
    let result = sqlx::query(
        r#"
        update scm.sync_rate_limits
        set paused_until = now() + $2 * interval '1 second',
            meta_json = meta_json || $3,
            updated_at = now()
        where instance_key = $1
        "#,
    )
    .bind(instance_key)
    .bind(duration_seconds)
    .bind(meta_patch)
    .execute(pool)
    .await
    .context("admin_pause_bucket failed")?;
    Ok(result.rows_affected() == 1)
}

pub async fn admin_unpause_bucket(pool: &PgPool, instance_key: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"
        update scm.sync_rate_limits
        set paused_until = null,
            meta_json = meta_json - 'pause_source' - 'pause_reason',
            updated_at = now()
        where instance_key = $1
        "#,
    )
    .bind(instance_key)
    .execute(pool)
    .await
    .context("admin_unpause_bucket failed")?;
    Ok(result.rows_affected() == 1)
}
