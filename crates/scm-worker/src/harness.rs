//! The claim loop and per-job execution wrapper.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use scm_config::WorkerConfig;
use scm_schemas::{ErrorCategory, RunResult};

use crate::adapter::{AdapterRegistry, JobContext};
use crate::finalize::finalize_run;

/// Tokens charged against the instance bucket per adapter dispatch.
const TOKENS_PER_RUN: f64 = 1.0;
/// Upper bound on waiting for a paused/drained bucket before giving the
/// job back (the claim lease would expire anyway).
const BUCKET_MAX_WAIT: Duration = Duration::from_secs(120);
/// Bucket shape on first observation of an instance.
const DEFAULT_BUCKET_RATE: f64 = 5.0;
const DEFAULT_BUCKET_BURST: f64 = 100.0;

pub struct WorkerHarness {
    pool: PgPool,
    config: WorkerConfig,
    registry: AdapterRegistry,
    worker_id: String,
    retry_delay_seconds: f64,
    max_backoff_seconds: f64,
}

impl WorkerHarness {
    pub fn new(pool: PgPool, config: WorkerConfig, registry: AdapterRegistry) -> Self {
        let worker_id = format!(
            "{}-{}",
            config.pool.as_deref().unwrap_or("worker"),
            Uuid::new_v4()
        );
        WorkerHarness {
            pool,
            config,
            registry,
            worker_id,
            retry_delay_seconds: 60.0,
            max_backoff_seconds: 1800.0,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run `worker_count` claim loops until ctrl-c. Shutdown is
    /// cooperative: in-flight jobs finalize normally, nothing new is
    /// claimed afterwards.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut handles = Vec::new();
        for idx in 0..self.config.worker_count {
            let harness = Arc::clone(&self);
            let rx = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                harness.claim_loop(idx, rx).await;
            }));
        }

        tokio::signal::ctrl_c().await.context("signal wait failed")?;
        info!(event = "worker.shutdown_requested", worker_id = %self.worker_id);
        let _ = shutdown_tx.send(true);
        for handle in handles {
            let _ = handle.await;
        }
        info!(event = "worker.shutdown_complete", worker_id = %self.worker_id);
        Ok(())
    }

    async fn claim_loop(&self, idx: u32, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.process_one().await {
                Ok(true) => {} // claimed and processed; immediately poll again
                Ok(false) => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(self.config.poll_interval_seconds)) => {}
                        _ = shutdown.changed() => return,
                    }
                }
                Err(err) => {
                    error!(event = "worker.loop_error", loop_index = idx, error = %err);
                    tokio::time::sleep(Duration::from_secs(self.config.poll_interval_seconds)).await;
                }
            }
        }
    }

    /// Claim and fully process one job. `Ok(false)` means the queue was
    /// empty (or the claim raced and lost).
    pub async fn process_one(&self) -> Result<bool> {
        let allowlist = if self.config.pool_repo_allowlist.is_empty() {
            None
        } else {
            Some(self.config.pool_repo_allowlist.as_slice())
        };

        let Some(job) =
            scm_db::claim_next_job(&self.pool, &self.worker_id, self.config.lease_seconds, allowlist)
                .await?
        else {
            return Ok(false);
        };

        let repo = scm_db::get_repo(&self.pool, job.repo_id)
            .await?
            .with_context(|| format!("job {} references missing repo {}", job.job_id, job.repo_id))?;
        let instance_key = (repo.repo_type == "git")
            .then(|| scm_schemas::normalize_instance_key(&repo.url));

        let cursor_before = scm_db::load_cursor(&self.pool, job.repo_id, &job.job_type)
            .await?
            .map(|e| e.cursor);

        let run_id = Uuid::new_v4();
        scm_db::insert_sync_run_start(
            &self.pool,
            run_id,
            job.repo_id,
            &job.job_type,
            job.mode,
            cursor_before.as_ref().map(|c| c.to_value()).as_ref(),
            None,
        )
        .await?;

        // Heartbeat on the side until the job finalizes.
        let (hb_stop_tx, mut hb_stop_rx) = watch::channel(false);
        let hb_pool = self.pool.clone();
        let hb_job_id = job.job_id;
        let hb_worker = self.worker_id.clone();
        let hb_interval = self.config.heartbeat_interval_seconds();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(hb_interval));
            ticker.tick().await; // first tick is immediate; skip it
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match scm_db::heartbeat_job(&hb_pool, hb_job_id, &hb_worker).await {
                            Ok(true) => {}
                            Ok(false) => {
                                warn!(event = "worker.lease_lost", job_id = %hb_job_id);
                                return;
                            }
                            Err(err) => warn!(event = "worker.heartbeat_error", error = %err),
                        }
                    }
                    _ = hb_stop_rx.changed() => return,
                }
            }
        });

        let result = self.execute_adapter(&job, &repo, cursor_before, instance_key.as_deref()).await;

        let _ = hb_stop_tx.send(true);
        let _ = heartbeat.await;

        let outcome = finalize_run(
            &self.pool,
            &job,
            instance_key.as_deref(),
            run_id,
            &result,
            self.retry_delay_seconds,
            self.max_backoff_seconds,
        )
        .await?;

        info!(
            event = "worker.job_finished",
            job_id = %job.job_id,
            repo_id = job.repo_id,
            job_type = %job.job_type,
            run_status = result.status.as_str(),
            job_status = outcome.job_status.as_str(),
            synced_count = result.counts.synced_count(),
        );
        Ok(true)
    }

    /// Dispatch to the adapter with the bucket charged first. Panics and
    /// missing adapters both come back as failed results, never as errors.
    async fn execute_adapter(
        &self,
        job: &scm_db::JobRow,
        repo: &scm_db::RepoRow,
        cursor_before: Option<scm_cursor::Cursor>,
        instance_key: Option<&str>,
    ) -> RunResult {
        let Some(adapter) = self.registry.get(&job.job_type) else {
            return RunResult::failed(
                ErrorCategory::Validation,
                format!("no adapter registered for job type {}", job.job_type),
            );
        };

        if let Some(instance_key) = instance_key {
            if let Err(err) = scm_db::ensure_bucket(
                &self.pool,
                instance_key,
                DEFAULT_BUCKET_RATE,
                DEFAULT_BUCKET_BURST,
            )
            .await
            {
                warn!(event = "worker.bucket_ensure_failed", error = %err);
            }
            if let Err(err) =
                scm_db::acquire_tokens(&self.pool, instance_key, TOKENS_PER_RUN, BUCKET_MAX_WAIT)
                    .await
            {
                return RunResult::failed(
                    ErrorCategory::RateLimited,
                    scm_redact::redact(&format!("bucket wait exceeded: {err}")),
                );
            }
        }

        let ctx = JobContext {
            job: job.clone(),
            repo: repo.clone(),
            cursor_before,
        };
        let handle = tokio::spawn(async move { adapter.execute(&ctx).await });
        match handle.await {
            Ok(result) => result,
            Err(join_err) => {
                error!(event = "worker.adapter_panicked", job_id = %job.job_id, error = %join_err);
                RunResult::failed(
                    ErrorCategory::Unknown,
                    scm_redact::redact(&format!("adapter panicked: {join_err}")),
                )
            }
        }
    }
}

