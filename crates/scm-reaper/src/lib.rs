//! Lease, run, and lock recovery.
//!
//! Three independent sweeps, each committing per row so a poisoned row
//! never blocks the rest of the batch:
//!
//! 1. running jobs whose lease (plus grace) expired: classified by their
//!    stored `last_error` and routed to `failed` / `pending` / `dead`;
//! 2. running `sync_runs` rows past the wall-clock ceiling: failed with a
//!    `reaper_timeout` summary;
//! 3. expired `sync_locks`: force-released.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use sqlx::PgPool;
use tracing::{info, warn};

use scm_config::{JobReapPolicy, ReaperConfig};
use scm_policy::{calculate_backoff_seconds, classify_last_error};
use scm_schemas::ErrorCategory;

/// Dry-run findings (`reaper scan`).
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanFindings {
    pub expired_jobs: Vec<ExpiredJob>,
    pub expired_runs: Vec<ExpiredRun>,
    pub expired_locks: Vec<ExpiredLock>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExpiredJob {
    pub job_id: uuid::Uuid,
    pub repo_id: i64,
    pub job_type: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub category: String,
    pub planned_action: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExpiredRun {
    pub run_id: uuid::Uuid,
    pub repo_id: i64,
    pub job_type: String,
    pub running_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExpiredLock {
    pub lock_id: i64,
    pub repo_id: i64,
    pub job_type: String,
    pub locked_by: Option<String>,
}

/// What one `reap` pass actually did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReapReport {
    pub jobs_to_failed: usize,
    pub jobs_to_pending: usize,
    pub jobs_to_dead: usize,
    pub runs_failed: usize,
    pub locks_released: usize,
    pub errors: usize,
}

enum PlannedAction {
    Dead(String),
    Failed(String, f64),
    Pending(String, f64),
}

pub struct Reaper {
    pool: PgPool,
    config: ReaperConfig,
}

impl Reaper {
    pub fn new(pool: PgPool, config: ReaperConfig) -> Self {
        Reaper { pool, config }
    }

    /// Detection only; nothing is mutated.
    pub async fn scan(&self) -> Result<ScanFindings> {
        let mut findings = ScanFindings::default();

        for job in scm_db::list_expired_running_jobs(
            &self.pool,
            self.config.job_grace_seconds,
            self.config.batch_limit as i64,
        )
        .await?
        {
            let category = classify_last_error(job.last_error.as_deref());
            let action = self.plan_job_action(job.attempts, job.max_attempts, category);
            findings.expired_jobs.push(ExpiredJob {
                job_id: job.job_id,
                repo_id: job.repo_id,
                job_type: job.job_type,
                attempts: job.attempts,
                max_attempts: job.max_attempts,
                category: category.as_str().to_string(),
                planned_action: match &action {
                    PlannedAction::Dead(_) => "dead".to_string(),
                    PlannedAction::Failed(_, delay) => format!("failed (+{delay:.0}s)"),
                    PlannedAction::Pending(_, delay) => format!("pending (+{delay:.0}s)"),
                },
            });
        }

        let now = Utc::now();
        for run in scm_db::list_expired_running_runs(
            &self.pool,
            self.config.run_max_duration_seconds,
            self.config.batch_limit as i64,
        )
        .await?
        {
            findings.expired_runs.push(ExpiredRun {
                run_id: run.run_id,
                repo_id: run.repo_id,
                job_type: run.job_type,
                running_seconds: (now - run.started_at).num_milliseconds() as f64 / 1000.0,
            });
        }

        for lock in scm_db::list_expired_locks(
            &self.pool,
            self.config.lock_grace_seconds,
            self.config.batch_limit as i64,
        )
        .await?
        {
            findings.expired_locks.push(ExpiredLock {
                lock_id: lock.lock_id,
                repo_id: lock.repo_id,
                job_type: lock.job_type,
                locked_by: lock.locked_by,
            });
        }

        Ok(findings)
    }

    /// Full recovery pass. Per-row failures are counted and skipped.
    pub async fn reap(&self, locks_only: bool) -> Result<ReapReport> {
        let mut report = ReapReport::default();

        if !locks_only {
            self.reap_jobs(&mut report).await;
            self.reap_runs(&mut report).await;
        }
        self.reap_locks(&mut report).await;

        info!(
            event = "reaper.pass",
            jobs_failed = report.jobs_to_failed,
            jobs_pending = report.jobs_to_pending,
            jobs_dead = report.jobs_to_dead,
            runs_failed = report.runs_failed,
            locks_released = report.locks_released,
            errors = report.errors,
        );
        Ok(report)
    }

    /// `reap` forever at the configured interval until ctrl-c.
    pub async fn run_loop(&self) -> Result<()> {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(self.config.interval_seconds));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.reap(false).await {
                        warn!(event = "reaper.pass_failed", error = %err);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!(event = "reaper.shutdown");
                    return Ok(());
                }
            }
        }
    }

    fn plan_job_action(
        &self,
        attempts: i32,
        max_attempts: i32,
        category: ErrorCategory,
    ) -> PlannedAction {
        if category.is_permanent() {
            return PlannedAction::Dead(format!(
                "Reaped: lease expired, permanent error ({})",
                category.as_str()
            ));
        }
        if attempts >= max_attempts {
            return PlannedAction::Dead(
                "Reaped: lease expired, max attempts exceeded".to_string(),
            );
        }
        if category.is_transient() {
            let base = scm_policy::backoff_base_seconds(category, self.config.retry_delay_seconds as f64);
            let jitter = rand::random::<f64>() * base;
            let delay = calculate_backoff_seconds(
                (attempts + 1) as u32,
                category,
                self.config.retry_delay_seconds as f64,
                self.config.max_backoff_seconds as f64,
                jitter,
            );
            return PlannedAction::Failed(
                format!("Reaped: lease expired ({})", category.as_str()),
                delay,
            );
        }
        // Unknown: honor the configured policy.
        let delay = self.config.retry_delay_seconds as f64;
        match self.config.job_policy {
            JobReapPolicy::ToFailed => {
                PlannedAction::Failed("Reaped: lease expired".to_string(), delay)
            }
            JobReapPolicy::ToPending => {
                PlannedAction::Pending("Reaped: lease expired".to_string(), delay)
            }
        }
    }

    async fn reap_jobs(&self, report: &mut ReapReport) {
        let jobs = match scm_db::list_expired_running_jobs(
            &self.pool,
            self.config.job_grace_seconds,
            self.config.batch_limit as i64,
        )
        .await
        {
            Ok(jobs) => jobs,
            Err(err) => {
                warn!(event = "reaper.jobs_query_failed", error = %err);
                report.errors += 1;
                return;
            }
        };

        for job in jobs {
            let category = classify_last_error(job.last_error.as_deref());
            let action = self.plan_job_action(job.attempts, job.max_attempts, category);
            let outcome = match &action {
                PlannedAction::Dead(message) => {
                    scm_db::mark_job_as_dead_by_reaper(&self.pool, job.job_id, message).await
                }
                PlannedAction::Failed(message, delay) => {
                    scm_db::mark_job_as_failed_by_reaper(&self.pool, job.job_id, message, *delay)
                        .await
                }
                PlannedAction::Pending(message, delay) => {
                    scm_db::mark_job_as_pending_by_reaper(&self.pool, job.job_id, message, *delay)
                        .await
                }
            };
            match outcome {
                Ok(true) => match action {
                    PlannedAction::Dead(_) => report.jobs_to_dead += 1,
                    PlannedAction::Failed(_, _) => report.jobs_to_failed += 1,
                    PlannedAction::Pending(_, _) => report.jobs_to_pending += 1,
                },
                Ok(false) => {} // row changed under us; next pass will see it
                Err(err) => {
                    warn!(event = "reaper.job_mark_failed", job_id = %job.job_id, error = %err);
                    report.errors += 1;
                }
            }
        }
    }

    async fn reap_runs(&self, report: &mut ReapReport) {
        let runs = match scm_db::list_expired_running_runs(
            &self.pool,
            self.config.run_max_duration_seconds,
            self.config.batch_limit as i64,
        )
        .await
        {
            Ok(runs) => runs,
            Err(err) => {
                warn!(event = "reaper.runs_query_failed", error = %err);
                report.errors += 1;
                return;
            }
        };

        let now = Utc::now();
        for run in runs {
            let running_seconds = (now - run.started_at).num_milliseconds() as f64 / 1000.0;
            let summary = json!({
                "error_type": "reaper_timeout",
                "running_seconds": running_seconds,
                "message": format!(
                    "run exceeded max duration ({}s)",
                    self.config.run_max_duration_seconds
                ),
            });
            match scm_db::mark_run_as_failed_by_reaper(&self.pool, run.run_id, &summary).await {
                Ok(true) => report.runs_failed += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(event = "reaper.run_mark_failed", run_id = %run.run_id, error = %err);
                    report.errors += 1;
                }
            }
        }
    }

    async fn reap_locks(&self, report: &mut ReapReport) {
        let locks = match scm_db::list_expired_locks(
            &self.pool,
            self.config.lock_grace_seconds,
            self.config.batch_limit as i64,
        )
        .await
        {
            Ok(locks) => locks,
            Err(err) => {
                warn!(event = "reaper.locks_query_failed", error = %err);
                report.errors += 1;
                return;
            }
        };

        for lock in locks {
            match scm_db::force_release_lock(&self.pool, lock.lock_id).await {
                Ok(true) => report.locks_released += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(event = "reaper.lock_release_failed", lock_id = lock.lock_id, error = %err);
                    report.errors += 1;
                }
            }
        }
    }
}
