//! `logbook.kv` access: cursors, circuit-breaker state, pause records.
//!
//! Three namespaces, all last-writer-wins via `ON CONFLICT DO UPDATE`.
//! Cursor values are upgraded to v2 on read; the stored v1 blob is never
//! rewritten in place.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};

use scm_cursor::{cursor_type_for_job, upgrade_cursor, Cursor};
use scm_schemas::keys::build_pause_key;
use scm_schemas::{PauseReasonCode, RepoPauseRecord};

/// Cursor namespace; overridable via `LOGBOOK_NAMESPACE`.
pub const NS_CURSORS: &str = "scm.sync";
pub const NS_HEALTH: &str = "scm.sync_health";
pub const NS_PAUSES: &str = "scm.sync_pauses";

const ENV_LOGBOOK_NAMESPACE: &str = "LOGBOOK_NAMESPACE";

/// Effective cursor namespace for this process.
pub fn cursor_namespace() -> String {
    std::env::var(ENV_LOGBOOK_NAMESPACE)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| NS_CURSORS.to_string())
}

// ---------------------------------------------------------------------------
// Generic KV
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct KvEntry {
    pub namespace: String,
    pub key: String,
    pub value_json: Value,
    pub updated_at: DateTime<Utc>,
}

pub async fn kv_set(pool: &PgPool, namespace: &str, key: &str, value: &Value) -> Result<()> {
    sqlx::query(
        r#"
        insert into logbook.kv (namespace, key, value_json)
        values ($1, $2, $3)
        on conflict (namespace, key) do update
        set value_json = excluded.value_json,
            updated_at = now()
        "#,
    )
    .bind(namespace)
    .bind(key)
    .bind(value)
    .execute(pool)
    .await
    .context("kv_set failed")?;
    Ok(())
}

pub async fn kv_get(pool: &PgPool, namespace: &str, key: &str) -> Result<Option<KvEntry>> {
    let row = sqlx::query(
        r#"
        select namespace, key, value_json, updated_at
        from logbook.kv
        where namespace = $1 and key = $2
        "#,
    )
    .bind(namespace)
    .bind(key)
    .fetch_optional(pool)
    .await
    .context("kv_get failed")?;
    row.map(|r| {
        Ok(KvEntry {
            namespace: r.try_get("namespace")?,
            key: r.try_get("key")?,
            value_json: r.try_get("value_json")?,
            updated_at: r.try_get("updated_at")?,
        })
    })
    .transpose()
}

pub async fn kv_delete(pool: &PgPool, namespace: &str, key: &str) -> Result<bool> {
    let result = sqlx::query(r#"delete from logbook.kv where namespace = $1 and key = $2"#)
        .bind(namespace)
        .bind(key)
        .execute(pool)
        .await
        .context("kv_delete failed")?;
    Ok(result.rows_affected() == 1)
}

pub async fn kv_list(
    pool: &PgPool,
    namespace: &str,
    key_prefix: Option<&str>,
    limit: i64,
) -> Result<Vec<KvEntry>> {
    let rows = sqlx::query(
        r#"
        select namespace, key, value_json, updated_at
        from logbook.kv
        where namespace = $1
          and ($2::text is null or key like $2 || '%')
        order by updated_at desc
        limit $3
        "#,
    )
    .bind(namespace)
    .bind(key_prefix)
    .bind(if limit > 0 { limit } else { 200 })
    .fetch_all(pool)
    .await
    .context("kv_list failed")?;
    rows.iter()
        .map(|r| {
            Ok(KvEntry {
                namespace: r.try_get("namespace")?,
                key: r.try_get("key")?,
                value_json: r.try_get("value_json")?,
                updated_at: r.try_get("updated_at")?,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Cursors
// ---------------------------------------------------------------------------

/// Cursor keys reuse the `repo:<id>:<job_type>` shape of pause keys.
pub fn build_cursor_key(repo_id: i64, job_type: &str) -> String {
    build_pause_key(repo_id, job_type)
}

#[derive(Debug, Clone)]
pub struct CursorEntry {
    pub repo_id: i64,
    pub job_type: String,
    pub cursor: Cursor,
    pub updated_at: DateTime<Utc>,
}

/// Load and upgrade the cursor for one pair. `None` means never synced.
pub async fn load_cursor(
    pool: &PgPool,
    repo_id: i64,
    job_type: &str,
) -> Result<Option<CursorEntry>> {
    let ns = cursor_namespace();
    let entry = kv_get(pool, &ns, &build_cursor_key(repo_id, job_type)).await?;
    let Some(entry) = entry else {
        return Ok(None);
    };
    let cursor_type = cursor_type_for_job(job_type)?;
    let cursor = upgrade_cursor(&entry.value_json, cursor_type)
        .with_context(|| format!("cursor for repo {repo_id} {job_type} is malformed"))?;
    Ok(Some(CursorEntry {
        repo_id,
        job_type: job_type.to_string(),
        cursor,
        updated_at: entry.updated_at,
    }))
}

/// Persist a v2 cursor (the only form ever written).
pub async fn save_cursor(pool: &PgPool, repo_id: i64, job_type: &str, cursor: &Cursor) -> Result<()> {
    let ns = cursor_namespace();
    kv_set(pool, &ns, &build_cursor_key(repo_id, job_type), &cursor.to_value()).await
}

/// Raw cursor value for admin repair (no upgrade applied).
pub async fn get_cursor_raw(pool: &PgPool, repo_id: i64, job_type: &str) -> Result<Option<Value>> {
    let ns = cursor_namespace();
    Ok(kv_get(pool, &ns, &build_cursor_key(repo_id, job_type))
        .await?
        .map(|e| e.value_json))
}

pub async fn set_cursor_raw(pool: &PgPool, repo_id: i64, job_type: &str, value: &Value) -> Result<()> {
    let ns = cursor_namespace();
    kv_set(pool, &ns, &build_cursor_key(repo_id, job_type), value).await
}

pub async fn delete_cursor(pool: &PgPool, repo_id: i64, job_type: &str) -> Result<bool> {
    let ns = cursor_namespace();
    kv_delete(pool, &ns, &build_cursor_key(repo_id, job_type)).await
}

pub async fn list_cursors(pool: &PgPool, key_prefix: Option<&str>, limit: i64) -> Result<Vec<KvEntry>> {
    let ns = cursor_namespace();
    kv_list(pool, &ns, key_prefix, limit).await
}

// ---------------------------------------------------------------------------
// Circuit-breaker state
// ---------------------------------------------------------------------------

pub async fn save_circuit_breaker_state(pool: &PgPool, key: &str, state: &Value) -> Result<()> {
    kv_set(pool, NS_HEALTH, key, state).await
}

/// Load breaker state, trying each candidate key in order (canonical first,
/// then legacy short forms).
pub async fn load_circuit_breaker_state(
    pool: &PgPool,
    candidate_keys: &[String],
) -> Result<Option<Value>> {
    for key in candidate_keys {
        if let Some(entry) = kv_get(pool, NS_HEALTH, key).await? {
            return Ok(Some(entry.value_json));
        }
    }
    Ok(None)
}

pub async fn delete_circuit_breaker_state(pool: &PgPool, key: &str) -> Result<bool> {
    kv_delete(pool, NS_HEALTH, key).await
}

pub async fn list_circuit_breaker_states(pool: &PgPool, limit: i64) -> Result<Vec<KvEntry>> {
    kv_list(pool, NS_HEALTH, None, limit).await
}

// ---------------------------------------------------------------------------
// Pause records
// ---------------------------------------------------------------------------

/// Write (or refresh) a pause record for one pair.
pub async fn set_repo_job_pause(
    pool: &PgPool,
    repo_id: i64,
    job_type: &str,
    pause_duration_seconds: f64,
    reason: &str,
    reason_code: PauseReasonCode,
    failure_rate: f64,
    now: f64,
) -> Result<RepoPauseRecord> {
    let record = RepoPauseRecord {
        repo_id,
        job_type: job_type.to_string(),
        paused_until: now + pause_duration_seconds,
        reason: scm_redact::redact(reason),
        paused_at: now,
        failure_rate,
        reason_code: Some(reason_code.as_str().to_string()),
    };
    kv_set(pool, NS_PAUSES, &build_pause_key(repo_id, job_type), &record.to_value()).await?;
    Ok(record)
}

pub async fn unset_repo_job_pause(pool: &PgPool, repo_id: i64, job_type: &str) -> Result<bool> {
    kv_delete(pool, NS_PAUSES, &build_pause_key(repo_id, job_type)).await
}

pub async fn get_repo_job_pause(
    pool: &PgPool,
    repo_id: i64,
    job_type: &str,
) -> Result<Option<RepoPauseRecord>> {
    let entry = kv_get(pool, NS_PAUSES, &build_pause_key(repo_id, job_type)).await?;
    Ok(entry.map(|e| RepoPauseRecord::from_value(repo_id, job_type, &e.value_json)))
}

pub async fn list_pauses(pool: &PgPool, limit: i64) -> Result<Vec<RepoPauseRecord>> {
    let entries = kv_list(pool, NS_PAUSES, None, limit).await?;
    let mut records = Vec::new();
    for entry in entries {
        let Ok((repo_id, job_type)) = scm_schemas::keys::parse_pause_key(&entry.key) else {
            continue;
        };
        records.push(RepoPauseRecord::from_value(repo_id, &job_type, &entry.value_json));
    }
    Ok(records)
}

/// Pairs whose pause has not yet expired at `now`.
pub async fn get_paused_repo_job_pairs(pool: &PgPool, now: f64) -> Result<Vec<(i64, String)>> {
    let records = list_pauses(pool, 10_000).await?;
    Ok(records
        .into_iter()
        .filter(|r| !r.is_expired(now))
        .map(|r| (r.repo_id, r.job_type))
        .collect())
}

/// Delete expired pause records; returns how many were removed.
pub async fn clear_expired_pauses(pool: &PgPool, now: f64) -> Result<u64> {
    let records = list_pauses(pool, 10_000).await?;
    let mut removed = 0;
    for record in records.iter().filter(|r| r.is_expired(now)) {
        if kv_delete(pool, NS_PAUSES, &build_pause_key(record.repo_id, &record.job_type)).await? {
            removed += 1;
        }
    }
    Ok(removed)
}
