//! Job and run status enums with stable wire strings.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Lifecycle of a `scm.sync_jobs` row.
///
/// `Dead` is terminal: the reaper or the finish path escalates to it once
/// `attempts >= max_attempts` (or immediately on a permanent error), and only
/// `admin jobs reset-dead` revives such rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "dead" => Ok(JobStatus::Dead),
            other => Err(anyhow!("invalid job status: {}", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

/// Status of a `scm.sync_runs` ledger row.
///
/// `NoData` is identical to `Completed` except `synced_count == 0`; the
/// cursor may still advance (the watermark moves forward in time even when
/// no new items arrived).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    NoData,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::NoData => "no_data",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "no_data" => Ok(RunStatus::NoData),
            other => Err(anyhow!("invalid run status: {}", other)),
        }
    }

    /// Terminal run statuses close the job; `Running` does not.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

// ---------------------------------------------------------------------------
// SyncMode
// ---------------------------------------------------------------------------

/// Incremental follows the cursor; backfill re-walks a bounded window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Incremental,
    Backfill,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Incremental => "incremental",
            SyncMode::Backfill => "backfill",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "incremental" => Ok(SyncMode::Incremental),
            "backfill" => Ok(SyncMode::Backfill),
            other => Err(anyhow!("invalid sync mode: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_round_trip() {
        for s in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Dead,
        ] {
            assert_eq!(JobStatus::parse(s.as_str()).unwrap(), s);
        }
    }

    #[test]
    fn run_status_round_trip_and_terminality() {
        for s in [
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::NoData,
        ] {
            assert_eq!(RunStatus::parse(s.as_str()).unwrap(), s);
        }
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::NoData.is_terminal());
    }

    #[test]
    fn invalid_status_rejected() {
        assert!(JobStatus::parse("zombie").is_err());
        assert!(RunStatus::parse("").is_err());
        assert!(SyncMode::parse("full").is_err());
    }
}
