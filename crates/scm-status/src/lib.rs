//! Read-only status projections: one summary snapshot, three renderings
//! (JSON via serde, Prometheus text format, console table).

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use std::collections::BTreeMap;

use scm_schemas::{normalize_instance_key, HealthStats};

mod prometheus;
mod table;

pub use prometheus::format_prometheus;
pub use table::format_table;

// ---------------------------------------------------------------------------
// Snapshot shape
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockCounts {
    pub active: i64,
    pub expired: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerEntry {
    pub key: String,
    pub state: String,
    pub value_json: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketEntry {
    pub instance_key: String,
    pub tokens: f64,
    pub rate: f64,
    pub burst: f64,
    pub is_paused: bool,
    pub pause_remaining_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LagEntry {
    pub repo_id: i64,
    pub repo_type: String,
    pub job_type: String,
    pub lag_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryBackoffEntry {
    pub instance_key: String,
    pub tenant_id: String,
    pub job_type: String,
    pub backoff_seconds: f64,
}

/// Everything `status summary` reports, in one serializable blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncSummary {
    pub repos_count: i64,
    pub repos_by_type: BTreeMap<String, i64>,
    pub runs_24h_by_status: BTreeMap<String, i64>,
    pub jobs_by_status: BTreeMap<String, i64>,
    pub locks: LockCounts,
    pub cursors_count: i64,
    pub window_minutes: u32,
    pub window_health: HealthStats,
    pub queue_by_instance: BTreeMap<String, i64>,
    pub queue_by_tenant: BTreeMap<String, i64>,
    pub top_lag_repos: Vec<LagEntry>,
    pub circuit_breakers: Vec<BreakerEntry>,
    pub rate_limit_buckets: Vec<BucketEntry>,
    pub pauses_by_reason: BTreeMap<String, i64>,
    pub retry_backoffs: Vec<RetryBackoffEntry>,
}

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

/// Assemble the full snapshot. Read-only: never takes row locks.
pub async fn collect_summary(pool: &PgPool, window_minutes: u32, top_lag: usize) -> Result<SyncSummary> {
    let base = scm_db::get_sync_status_summary(pool).await?;
    let window_health = scm_db::window_health_stats(pool, window_minutes).await?;

    let mut summary = SyncSummary {
        repos_count: base.repos_count,
        repos_by_type: base.repos_by_type,
        runs_24h_by_status: base.runs_24h_by_status,
        jobs_by_status: base.jobs_by_status,
        locks: LockCounts {
            active: base.active_locks,
            expired: base.expired_locks,
        },
        cursors_count: base.cursors_count,
        window_minutes,
        window_health,
        ..Default::default()
    };

    let repos = scm_db::list_repos(pool, None, 10_000).await?;
    let repo_info: BTreeMap<i64, (String, String)> = repos
        .iter()
        .map(|r| {
            (
                r.repo_id,
                (
                    normalize_instance_key(&r.url),
                    r.tenant_id().unwrap_or_default().to_string(),
                ),
            )
        })
        .collect();

    let jobs = scm_db::list_sync_jobs(
        pool,
        &scm_db::JobFilter {
            limit: 10_000,
            ..Default::default()
        },
    )
    .await?;
    let now = Utc::now();
    for job in &jobs {
        let (instance, tenant) = repo_info
            .get(&job.repo_id)
            .cloned()
            .unwrap_or_default();
        if matches!(
            job.status,
            scm_schemas::JobStatus::Pending | scm_schemas::JobStatus::Running
        ) {
            *summary.queue_by_instance.entry(instance.clone()).or_insert(0) += 1;
            *summary.queue_by_tenant.entry(tenant.clone()).or_insert(0) += 1;
        }
        if job.status == scm_schemas::JobStatus::Pending && job.not_before > now {
            summary.retry_backoffs.push(RetryBackoffEntry {
                instance_key: instance,
                tenant_id: tenant,
                job_type: job.job_type.clone(),
                backoff_seconds: (job.not_before - now).num_milliseconds() as f64 / 1000.0,
            });
        }
    }

    for lag in scm_db::repo_lag_rows(pool, top_lag).await? {
        summary.top_lag_repos.push(LagEntry {
            repo_id: lag.repo_id,
            repo_type: lag.repo_type,
            job_type: lag.job_type,
            lag_seconds: lag.lag_seconds,
        });
    }

    for entry in scm_db::list_circuit_breaker_states(pool, 1000).await? {
        let state = entry
            .value_json
            .get("state")
            .and_then(Value::as_str)
            .unwrap_or("closed")
            .to_string();
        summary.circuit_breakers.push(BreakerEntry {
            key: entry.key,
            state,
            value_json: entry.value_json,
        });
    }

    for bucket in scm_db::list_buckets(pool).await? {
        summary.rate_limit_buckets.push(BucketEntry {
            instance_key: bucket.instance_key.clone(),
            tokens: bucket.projected_tokens(now),
            rate: bucket.rate,
            burst: bucket.burst,
            is_paused: bucket.is_paused(now),
            pause_remaining_seconds: bucket.pause_remaining_seconds(now),
        });
    }

    let now_epoch = now.timestamp() as f64;
    for pause in scm_db::list_pauses(pool, 10_000).await? {
        if pause.is_expired(now_epoch) {
            continue;
        }
        let code = pause.reason_code.clone().unwrap_or_else(|| "unknown".into());
        *summary.pauses_by_reason.entry(code).or_insert(0) += 1;
    }

    Ok(summary)
}

#[cfg(test)]
pub(crate) fn sample_summary() -> SyncSummary {
    SyncSummary {
        repos_count: 3,
        repos_by_type: BTreeMap::from([("git".into(), 2), ("svn".into(), 1)]),
        runs_24h_by_status: BTreeMap::from([("completed".into(), 5), ("failed".into(), 1)]),
        jobs_by_status: BTreeMap::from([("pending".into(), 2), ("dead".into(), 1)]),
        locks: LockCounts { active: 1, expired: 1 },
        cursors_count: 4,
        window_minutes: 60,
        window_health: HealthStats {
            total_runs: 6,
            failed_rate: 0.25,
            rate_limit_rate: 0.1,
            total_requests: 200,
            total_timeout_count: 2,
        },
        queue_by_instance: BTreeMap::from([("gitlab.example.com".into(), 2)]),
        queue_by_tenant: BTreeMap::from([("acme".into(), 2)]),
        top_lag_repos: vec![LagEntry {
            repo_id: 7,
            repo_type: "git".into(),
            job_type: "commits".into(),
            lag_seconds: 4200.0,
        }],
        circuit_breakers: vec![BreakerEntry {
            key: "acme:instance:gitlab.example.com".into(),
            state: "open".into(),
            value_json: serde_json::json!({"state": "open"}),
        }],
        rate_limit_buckets: vec![BucketEntry {
            instance_key: "gitlab.example.com".into(),
            tokens: 12.5,
            rate: 5.0,
            burst: 100.0,
            is_paused: true,
            pause_remaining_seconds: 30.0,
        }],
        pauses_by_reason: BTreeMap::from([("error_budget".into(), 2)]),
        retry_backoffs: vec![RetryBackoffEntry {
            instance_key: "gitlab.example.com".into(),
            tenant_id: "acme".into(),
            job_type: "mrs".into(),
            backoff_seconds: 45.0,
        }],
    }
}
