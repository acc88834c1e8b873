//! `scm-sync status ...`: read-only queries.

use anyhow::Result;
use chrono::Utc;
use clap::{Subcommand, ValueEnum};

use scm_schemas::{JobStatus, RunStatus};

use crate::render;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Prometheus,
}

#[derive(Subcommand)]
pub enum StatusCmd {
    /// Aggregate snapshot: jobs by status, window rates, lag, buckets
    Summary {
        /// Health window in minutes
        #[arg(long, default_value_t = 60)]
        window: u32,

        /// How many highest-lag repos to include
        #[arg(long = "top-lag", default_value_t = 10)]
        top_lag: usize,

        #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },

    /// List registered repositories
    Repos {
        #[arg(long = "repo-type")]
        repo_type: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },

    /// List queue jobs
    Jobs {
        #[arg(long = "repo-id")]
        repo_id: Option<i64>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long = "job-type")]
        job_type: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },

    /// List run-ledger entries
    Runs {
        #[arg(long = "repo-id")]
        repo_id: Option<i64>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },

    /// List coordination locks
    Locks {
        #[arg(long = "repo-id")]
        repo_id: Option<i64>,
        /// Only locks whose lease has expired
        #[arg(long)]
        expired: bool,
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },

    /// List sync cursors
    Cursors {
        #[arg(long = "repo-id")]
        repo_id: Option<i64>,
        #[arg(long, default_value_t = 200)]
        limit: i64,
    },
}

pub async fn run(cmd: StatusCmd) -> Result<()> {
    let pool = scm_db::connect_from_env().await?;

    match cmd {
        StatusCmd::Summary {
            window,
            top_lag,
            format,
        } => {
            let summary = scm_status::collect_summary(&pool, window, top_lag).await?;
            match format {
                OutputFormat::Json => render::print_json(&serde_json::to_value(&summary)?),
                OutputFormat::Table => print!("{}", scm_status::format_table(&summary)),
                OutputFormat::Prometheus => print!("{}", scm_status::format_prometheus(&summary)),
            }
        }

        StatusCmd::Repos { repo_type, limit } => {
            let repos = scm_db::list_repos(&pool, repo_type.as_deref(), limit).await?;
            render::print_rows(repos.iter().map(render::repo_json).collect());
        }

        StatusCmd::Jobs {
            repo_id,
            status,
            job_type,
            limit,
        } => {
            let status = status.as_deref().map(JobStatus::parse).transpose()?;
            let jobs = scm_db::list_sync_jobs(
                &pool,
                &scm_db::JobFilter {
                    repo_id,
                    status,
                    job_type,
                    limit,
                },
            )
            .await?;
            render::print_rows(jobs.iter().map(render::job_json).collect());
        }

        StatusCmd::Runs {
            repo_id,
            status,
            limit,
        } => {
            let status = status.as_deref().map(RunStatus::parse).transpose()?;
            let runs = scm_db::list_sync_runs(&pool, repo_id, status, limit).await?;
            render::print_rows(runs.iter().map(render::run_json).collect());
        }

        StatusCmd::Locks {
            repo_id,
            expired,
            limit,
        } => {
            let now = Utc::now();
            let locks = if expired {
                scm_db::list_expired_locks(&pool, 0, limit).await?
            } else {
                scm_db::list_sync_locks(&pool, repo_id, limit).await?
            };
            render::print_rows(locks.iter().map(|l| render::lock_json(l, now)).collect());
        }

        StatusCmd::Cursors { repo_id, limit } => {
            let prefix = repo_id.map(|id| format!("repo:{id}:"));
            let entries = scm_db::list_cursors(&pool, prefix.as_deref(), limit).await?;
            render::print_rows(entries.iter().map(render::kv_json).collect());
        }
    }

    Ok(())
}
