//! The `scm-sync` operator CLI for the sync control plane.
//!
//! This binary is intentionally thin: argument parsing and output
//! formatting live here, all behavior lives in the library crates. Every
//! command exits 0 on success and 1 on error; output is JSON unless a
//! `--format` flag says otherwise.

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod render;

use commands::{admin, reaper, scheduler, status};

#[derive(Parser)]
#[command(name = "scm-sync")]
#[command(about = "SCM synchronization control plane", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read-only status queries
    Status {
        #[command(subcommand)]
        cmd: status::StatusCmd,
    },

    /// Recover crashed leases and stuck runs
    Reaper {
        #[command(subcommand)]
        cmd: reaper::ReaperCmd,
    },

    /// Scan repos and enqueue sync jobs
    Scheduler {
        #[command(subcommand)]
        cmd: scheduler::SchedulerCmd,
    },

    /// Operator repair commands
    Admin {
        #[command(subcommand)]
        cmd: admin::AdminCmd,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Dev convenience; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let cli = Cli::parse();
    match cli.cmd {
        Commands::Status { cmd } => status::run(cmd).await,
        Commands::Reaper { cmd } => reaper::run(cmd).await,
        Commands::Scheduler { cmd } => scheduler::run(cmd).await,
        Commands::Admin { cmd } => admin::run(cmd).await,
    }
}

/// Structured JSON lines on stdout: `ts` (ISO-Z), `level`, `event` fields.
fn init_tracing() {
    tracing_subscriber::fmt()
        .json()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
