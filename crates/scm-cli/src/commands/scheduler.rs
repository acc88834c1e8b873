//! `scm-sync scheduler ...`: one-shot scan and the daemon loop.

use anyhow::Result;
use clap::Subcommand;

use scm_config::{CircuitBreakerConfig, SchedulerConfig};
use scm_scheduler::Scheduler;

use crate::render;

/// Project key used for breaker scope keys unless overridden.
const ENV_PROJECT_KEY: &str = "SCM_PROJECT_KEY";

#[derive(Subcommand)]
pub enum SchedulerCmd {
    /// Single scan: evaluate, enqueue, report
    Scan,

    /// Scan on an interval until interrupted
    Run {
        #[arg(long = "loop", default_value_t = false)]
        run_loop: bool,
        #[arg(long = "scan-interval-seconds")]
        scan_interval_seconds: Option<u64>,
    },

    /// Print the effective configuration
    Config,
}

fn build_scheduler(pool: sqlx::PgPool, scan_interval: Option<u64>) -> Scheduler {
    let mut config = SchedulerConfig::from_env(None);
    if let Some(interval) = scan_interval {
        config.scan_interval_seconds = interval;
    }
    let cb_config = CircuitBreakerConfig::from_env(None);
    let project_key = std::env::var(ENV_PROJECT_KEY).unwrap_or_else(|_| "default".to_string());
    let pool_name = std::env::var(scm_config::ENV_WORKER_POOL).ok();
    Scheduler::new(pool, config, cb_config, project_key, pool_name)
}

pub async fn run(cmd: SchedulerCmd) -> Result<()> {
    match cmd {
        SchedulerCmd::Scan => {
            let pool = scm_db::connect_from_env().await?;
            let report = build_scheduler(pool, None).scan().await?;
            render::print_json(&serde_json::to_value(&report)?);
        }

        SchedulerCmd::Run {
            run_loop,
            scan_interval_seconds,
        } => {
            let pool = scm_db::connect_from_env().await?;
            let scheduler = build_scheduler(pool, scan_interval_seconds);
            if run_loop {
                scheduler.run_loop().await?;
            } else {
                let report = scheduler.scan().await?;
                render::print_json(&serde_json::to_value(&report)?);
            }
        }

        SchedulerCmd::Config => {
            let config = SchedulerConfig::from_env(None);
            let cb_config = CircuitBreakerConfig::from_env(None);
            render::print_json(&serde_json::json!({
                "scheduler": config,
                "circuit_breaker": cb_config,
            }));
        }
    }

    Ok(())
}
