//! Row → JSON conversion and printing for command output.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

use scm_db::{JobRow, KvEntry, LockRow, RepoRow, RunRow};

fn ts(value: DateTime<Utc>) -> Value {
    Value::String(value.to_rfc3339_opts(SecondsFormat::Secs, true))
}

fn opt_ts(value: Option<DateTime<Utc>>) -> Value {
    value.map(ts).unwrap_or(Value::Null)
}

pub fn repo_json(repo: &RepoRow) -> Value {
    json!({
        "repo_id": repo.repo_id,
        "repo_type": repo.repo_type,
        "url": repo.url,
        "project_key": repo.project_key,
        "default_branch": repo.default_branch,
        "tenant_id": repo.tenant_id(),
        "created_at": ts(repo.created_at),
    })
}

pub fn job_json(job: &JobRow) -> Value {
    json!({
        "job_id": job.job_id,
        "repo_id": job.repo_id,
        "job_type": job.job_type,
        "mode": job.mode.as_str(),
        "priority": job.priority,
        "status": job.status.as_str(),
        "attempts": job.attempts,
        "max_attempts": job.max_attempts,
        "not_before": ts(job.not_before),
        "locked_by": job.locked_by,
        "locked_at": opt_ts(job.locked_at),
        "lease_seconds": job.lease_seconds,
        "last_error": job.last_error,
        "last_run_id": job.last_run_id,
        "created_at": ts(job.created_at),
        "updated_at": ts(job.updated_at),
    })
}

pub fn run_json(run: &RunRow) -> Value {
    json!({
        "run_id": run.run_id,
        "repo_id": run.repo_id,
        "job_type": run.job_type,
        "mode": run.mode.as_str(),
        "status": run.status.as_str(),
        "started_at": ts(run.started_at),
        "finished_at": opt_ts(run.finished_at),
        "cursor_before": run.cursor_before,
        "cursor_after": run.cursor_after,
        "counts": run.counts,
        "error_summary_json": run.error_summary_json,
        "degradation_json": run.degradation_json,
        "synced_count": run.synced_count,
    })
}

pub fn lock_json(lock: &LockRow, now: DateTime<Utc>) -> Value {
    json!({
        "lock_id": lock.lock_id,
        "repo_id": lock.repo_id,
        "job_type": lock.job_type,
        "locked_by": lock.locked_by,
        "locked_at": opt_ts(lock.locked_at),
        "lease_seconds": lock.lease_seconds,
        "is_locked": lock.is_locked(),
        "is_expired": lock.is_expired(now),
    })
}

pub fn kv_json(entry: &KvEntry) -> Value {
    json!({
        "namespace": entry.namespace,
        "key": entry.key,
        "value_json": entry.value_json,
        "updated_at": ts(entry.updated_at),
    })
}

pub fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(_) => println!("{value}"),
    }
}

pub fn print_rows(rows: Vec<Value>) {
    print_json(&Value::Array(rows));
}
