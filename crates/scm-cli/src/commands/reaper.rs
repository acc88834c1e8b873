//! `scm-sync reaper ...`: recovery entry points.

use anyhow::Result;
use clap::Subcommand;

use scm_config::{JobReapPolicy, ReaperConfig};
use scm_reaper::Reaper;

use crate::render;

#[derive(Subcommand)]
pub enum ReaperCmd {
    /// Detect expired jobs/runs/locks without touching them
    Scan {
        #[arg(long = "job-grace-seconds")]
        job_grace_seconds: Option<u32>,
        #[arg(long = "run-max-seconds")]
        run_max_seconds: Option<u32>,
        #[arg(long = "lock-grace-seconds")]
        lock_grace_seconds: Option<u32>,
    },

    /// Recover: jobs reclassified, stuck runs failed, locks released
    Reap {
        #[arg(long = "job-grace-seconds")]
        job_grace_seconds: Option<u32>,
        #[arg(long = "run-max-seconds")]
        run_max_seconds: Option<u32>,
        #[arg(long = "lock-grace-seconds")]
        lock_grace_seconds: Option<u32>,
        /// What to do with unclassifiable expired jobs
        #[arg(long = "job-policy")]
        job_policy: Option<String>,
        #[arg(long = "max-reaper-backoff-seconds")]
        max_reaper_backoff_seconds: Option<u64>,
        /// Only release expired locks
        #[arg(long = "locks-only")]
        locks_only: bool,
    },

    /// Reap forever on an interval
    Loop {
        #[arg(long, default_value_t = 60)]
        interval: u64,
    },
}

fn build_config(
    job_grace_seconds: Option<u32>,
    run_max_seconds: Option<u32>,
    lock_grace_seconds: Option<u32>,
    job_policy: Option<&str>,
    max_backoff: Option<u64>,
    interval: Option<u64>,
) -> Result<ReaperConfig> {
    let mut config = ReaperConfig::from_env(None);
    if let Some(v) = job_grace_seconds {
        config.job_grace_seconds = v;
    }
    if let Some(v) = run_max_seconds {
        config.run_max_duration_seconds = v;
    }
    if let Some(v) = lock_grace_seconds {
        config.lock_grace_seconds = v;
    }
    if let Some(policy) = job_policy {
        config.job_policy = JobReapPolicy::parse(policy)?;
    }
    if let Some(v) = max_backoff {
        config.max_backoff_seconds = v;
    }
    if let Some(v) = interval {
        config.interval_seconds = v;
    }
    Ok(config)
}

pub async fn run(cmd: ReaperCmd) -> Result<()> {
    let pool = scm_db::connect_from_env().await?;

    match cmd {
        ReaperCmd::Scan {
            job_grace_seconds,
            run_max_seconds,
            lock_grace_seconds,
        } => {
            let config = build_config(
                job_grace_seconds,
                run_max_seconds,
                lock_grace_seconds,
                None,
                None,
                None,
            )?;
            let findings = Reaper::new(pool, config).scan().await?;
            render::print_json(&serde_json::to_value(&findings)?);
        }

        ReaperCmd::Reap {
            job_grace_seconds,
            run_max_seconds,
            lock_grace_seconds,
            job_policy,
            max_reaper_backoff_seconds,
            locks_only,
        } => {
            let config = build_config(
                job_grace_seconds,
                run_max_seconds,
                lock_grace_seconds,
                job_policy.as_deref(),
                max_reaper_backoff_seconds,
                None,
            )?;
            let report = Reaper::new(pool, config).reap(locks_only).await?;
            render::print_json(&serde_json::to_value(&report)?);
        }

        ReaperCmd::Loop { interval } => {
            let config = build_config(None, None, None, None, None, Some(interval))?;
            Reaper::new(pool, config).run_loop().await?;
        }
    }

    Ok(())
}
