//! `scm-sync admin ...`: operator repair surface.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::Subcommand;
use serde_json::json;
use uuid::Uuid;

use scm_schemas::{JobStatus, PauseReasonCode};

use crate::render;

#[derive(Subcommand)]
pub enum AdminCmd {
    /// Job repair
    Jobs {
        #[command(subcommand)]
        cmd: JobsCmd,
    },

    /// Lock repair
    Locks {
        #[command(subcommand)]
        cmd: LocksCmd,
    },

    /// Per-(repo, job_type) pause control
    Pauses {
        #[command(subcommand)]
        cmd: PausesCmd,
    },

    /// Cursor repair
    Cursors {
        #[command(subcommand)]
        cmd: CursorsCmd,
    },

    /// Rate-limit bucket control
    RateLimit {
        #[command(subcommand)]
        cmd: RateLimitCmd,
    },
}

#[derive(Subcommand)]
pub enum JobsCmd {
    /// List jobs (defaults to dead ones)
    List {
        #[arg(long, default_value = "dead")]
        status: String,
        #[arg(long = "repo-id")]
        repo_id: Option<i64>,
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },

    /// Revive dead jobs back to pending
    ResetDead {
        #[arg(long = "job-id")]
        job_id: Option<Uuid>,
        #[arg(long = "repo-id")]
        repo_id: Option<i64>,
        #[arg(long = "job-type")]
        job_type: Option<String>,
        #[arg(long = "dry-run")]
        dry_run: bool,
    },

    /// Force one job to dead
    MarkDead {
        #[arg(long = "job-id")]
        job_id: Uuid,
        #[arg(long, default_value = "marked dead by operator")]
        reason: String,
    },
}

#[derive(Subcommand)]
pub enum LocksCmd {
    List {
        /// Only locks with an expired lease
        #[arg(long)]
        expired: bool,
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },

    ForceRelease {
        #[arg(long = "lock-id")]
        lock_id: i64,
    },
}

#[derive(Subcommand)]
pub enum PausesCmd {
    Set {
        #[arg(long = "repo-id")]
        repo_id: i64,
        #[arg(long = "job-type")]
        job_type: String,
        /// Pause duration in seconds
        #[arg(long)]
        duration: f64,
        #[arg(long, default_value = "paused by operator")]
        reason: String,
    },

    Unset {
        #[arg(long = "repo-id")]
        repo_id: i64,
        #[arg(long = "job-type")]
        job_type: String,
    },

    List {
        #[arg(long, default_value_t = 200)]
        limit: i64,
    },
}

#[derive(Subcommand)]
pub enum CursorsCmd {
    Get {
        #[arg(long = "repo-id")]
        repo_id: i64,
        #[arg(long = "job-type")]
        job_type: String,
    },

    /// Overwrite the stored cursor with a JSON value
    Set {
        #[arg(long = "repo-id")]
        repo_id: i64,
        #[arg(long = "job-type")]
        job_type: String,
        /// Cursor JSON (v2 `{version, watermark, stats}` shape)
        #[arg(long)]
        value: String,
    },

    Delete {
        #[arg(long = "repo-id")]
        repo_id: i64,
        #[arg(long = "job-type")]
        job_type: String,
    },
}

#[derive(Subcommand)]
pub enum RateLimitCmd {
    /// Token bucket control
    Buckets {
        #[command(subcommand)]
        cmd: BucketsCmd,
    },
}

#[derive(Subcommand)]
pub enum BucketsCmd {
    List,

    Pause {
        #[arg(long = "instance-key")]
        instance_key: String,
        /// Pause duration in seconds
        #[arg(long)]
        duration: f64,
        #[arg(long, default_value = "paused by operator")]
        reason: String,
    },

    Unpause {
        #[arg(long = "instance-key")]
        instance_key: String,
    },
}

pub async fn run(cmd: AdminCmd) -> Result<()> {
    let pool = scm_db::connect_from_env().await?;

    match cmd {
        AdminCmd::Jobs { cmd } => match cmd {
            JobsCmd::List {
                status,
                repo_id,
                limit,
            } => {
                let status = JobStatus::parse(&status)?;
                let jobs = scm_db::list_sync_jobs(
                    &pool,
                    &scm_db::JobFilter {
                        repo_id,
                        status: Some(status),
                        job_type: None,
                        limit,
                    },
                )
                .await?;
                render::print_rows(jobs.iter().map(render::job_json).collect());
            }
            JobsCmd::ResetDead {
                job_id,
                repo_id,
                job_type,
                dry_run,
            } => {
                let ids =
                    scm_db::reset_dead_jobs(&pool, job_id, repo_id, job_type.as_deref(), dry_run)
                        .await?;
                render::print_json(&json!({
                    "dry_run": dry_run,
                    "affected": ids.len(),
                    "job_ids": ids,
                }));
            }
            JobsCmd::MarkDead { job_id, reason } => {
                if !scm_db::mark_job_dead(&pool, job_id, &reason).await? {
                    return Err(anyhow!("job {job_id} not found"));
                }
                render::print_json(&json!({"job_id": job_id, "status": "dead"}));
            }
        },

        AdminCmd::Locks { cmd } => match cmd {
            LocksCmd::List { expired, limit } => {
                let now = Utc::now();
                let locks = if expired {
                    scm_db::list_expired_locks(&pool, 0, limit).await?
                } else {
                    scm_db::list_sync_locks(&pool, None, limit).await?
                };
                render::print_rows(locks.iter().map(|l| render::lock_json(l, now)).collect());
            }
            LocksCmd::ForceRelease { lock_id } => {
                if !scm_db::force_release_lock(&pool, lock_id).await? {
                    return Err(anyhow!("lock {lock_id} not found"));
                }
                render::print_json(&json!({"lock_id": lock_id, "released": true}));
            }
        },

        AdminCmd::Pauses { cmd } => match cmd {
            PausesCmd::Set {
                repo_id,
                job_type,
                duration,
                reason,
            } => {
                let now = Utc::now().timestamp_millis() as f64 / 1000.0;
                let record = scm_db::set_repo_job_pause(
                    &pool,
                    repo_id,
                    &job_type,
                    duration,
                    &reason,
                    PauseReasonCode::Manual,
                    0.0,
                    now,
                )
                .await?;
                render::print_json(&record.to_value());
            }
            PausesCmd::Unset { repo_id, job_type } => {
                if !scm_db::unset_repo_job_pause(&pool, repo_id, &job_type).await? {
                    return Err(anyhow!("no pause record for repo {repo_id} {job_type}"));
                }
                render::print_json(&json!({"repo_id": repo_id, "job_type": job_type, "removed": true}));
            }
            PausesCmd::List { limit } => {
                let now = Utc::now().timestamp_millis() as f64 / 1000.0;
                let records = scm_db::list_pauses(&pool, limit).await?;
                let rows = records
                    .iter()
                    .map(|r| {
                        let mut value = r.to_value();
                        if let Some(map) = value.as_object_mut() {
                            map.insert("is_expired".into(), r.is_expired(now).into());
                            map.insert(
                                "remaining_seconds".into(),
                                r.remaining_seconds(now).into(),
                            );
                        }
                        value
                    })
                    .collect();
                render::print_rows(rows);
            }
        },

        AdminCmd::Cursors { cmd } => match cmd {
            CursorsCmd::Get { repo_id, job_type } => {
                let value = scm_db::get_cursor_raw(&pool, repo_id, &job_type)
                    .await?
                    .ok_or_else(|| anyhow!("no cursor for repo {repo_id} {job_type}"))?;
                render::print_json(&value);
            }
            CursorsCmd::Set {
                repo_id,
                job_type,
                value,
            } => {
                let parsed: serde_json::Value =
                    serde_json::from_str(&value).context("cursor value is not valid JSON")?;
                if !parsed.is_object() {
                    return Err(anyhow!("cursor value must be a JSON object"));
                }
                scm_db::set_cursor_raw(&pool, repo_id, &job_type, &parsed).await?;
                render::print_json(&json!({"repo_id": repo_id, "job_type": job_type, "saved": true}));
            }
            CursorsCmd::Delete { repo_id, job_type } => {
                if !scm_db::delete_cursor(&pool, repo_id, &job_type).await? {
                    return Err(anyhow!("no cursor for repo {repo_id} {job_type}"));
                }
                render::print_json(&json!({"repo_id": repo_id, "job_type": job_type, "deleted": true}));
            }
        },

        AdminCmd::RateLimit { cmd } => match cmd {
            RateLimitCmd::Buckets { cmd } => match cmd {
                BucketsCmd::List => {
                    let now = Utc::now();
                    let rows = scm_db::list_buckets(&pool)
                        .await?
                        .iter()
                        .map(|b| {
                            json!({
                                "instance_key": b.instance_key,
                                "tokens": b.projected_tokens(now),
                                "rate": b.rate,
                                "burst": b.burst,
                                "is_paused": b.is_paused(now),
                                "pause_remaining_seconds": b.pause_remaining_seconds(now),
                                "meta_json": b.meta_json,
                            })
                        })
                        .collect();
                    render::print_rows(rows);
                }
                BucketsCmd::Pause {
                    instance_key,
                    duration,
                    reason,
                } => {
                    if !scm_db::admin_pause_bucket(&pool, &instance_key, duration, &reason).await? {
                        return Err(anyhow!("bucket {instance_key} not found"));
                    }
                    render::print_json(&json!({"instance_key": instance_key, "paused_for": duration}));
                }
                BucketsCmd::Unpause { instance_key } => {
                    if !scm_db::admin_unpause_bucket(&pool, &instance_key).await? {
                        return Err(anyhow!("bucket {instance_key} not found"));
                    }
                    render::print_json(&json!({"instance_key": instance_key, "paused": false}));
                }
            },
        },
    }

    Ok(())
}
