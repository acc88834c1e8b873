//! Scheduler scan orchestration.
//!
//! One scan is: gather state from Postgres, hydrate the per-scope breaker
//! controllers from KV, run the pure selection policy, enqueue what was
//! admitted, write pause records for repos that blew their error budget,
//! and persist breaker state back to KV. The policy itself lives in
//! `scm-policy`; everything here is I/O and glue.

use std::collections::{BTreeMap, HashSet};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use sqlx::PgPool;
use tracing::{info, warn};

use scm_config::{CircuitBreakerConfig, SchedulerConfig};
use scm_db::RepoWindowStats;
use scm_policy::{
    select_jobs_to_enqueue, should_schedule_repo_health, BudgetSnapshot, CircuitBreakerController,
    InstanceBucketStatus, RepoSyncState, ScopeDecisions, SelectionContext, SyncJobCandidate,
};
use scm_schemas::{
    build_circuit_breaker_key, legacy_circuit_breaker_keys, normalize_instance_key, CbScope,
    HealthStats, PauseReasonCode,
};

/// Job types per repo type; the closed sets the queue understands.
pub const GIT_JOB_TYPES: &[&str] = &["commits", "mrs", "reviews"];
pub const SVN_JOB_TYPES: &[&str] = &["svn"];

/// What one scan did, for logs and the CLI.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub repos_seen: usize,
    pub candidates: usize,
    pub enqueued: usize,
    pub enqueue_races_lost: usize,
    pub pauses_written: usize,
    pub pauses_cleared: u64,
    pub breaker_states: BTreeMap<String, String>,
}

pub struct Scheduler {
    pool: PgPool,
    config: SchedulerConfig,
    cb_config: CircuitBreakerConfig,
    project_key: String,
    pool_name: Option<String>,
}

impl Scheduler {
    pub fn new(
        pool: PgPool,
        config: SchedulerConfig,
        cb_config: CircuitBreakerConfig,
        project_key: impl Into<String>,
        pool_name: Option<String>,
    ) -> Self {
        Scheduler {
            pool,
            config,
            cb_config,
            project_key: project_key.into(),
            pool_name,
        }
    }

    /// One full scan. Returns what happened; failures inside enqueue of a
    /// single candidate are logged and skipped, everything else aborts the
    /// scan.
    pub async fn scan(&self) -> Result<ScanReport> {
        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        let mut report = ScanReport::default();

        report.pauses_cleared = scm_db::clear_expired_pauses(&self.pool, now).await?;

        let repos = scm_db::list_repos(&self.pool, None, 10_000).await?;
        report.repos_seen = repos.len();
        let window_stats = scm_db::window_repo_stats(&self.pool, self.cb_config.window_minutes).await?;
        let stats_by_repo: BTreeMap<i64, &RepoWindowStats> =
            window_stats.iter().map(|s| (s.repo_id, s)).collect();

        // Cursor freshness: a repo's effective cursor age is its stalest pair.
        let cursors = scm_db::list_cursors(&self.pool, None, 100_000).await?;
        let mut cursor_age: BTreeMap<(i64, String), f64> = BTreeMap::new();
        for entry in cursors {
            if let Ok((repo_id, job_type)) = scm_schemas::keys::parse_pause_key(&entry.key) {
                cursor_age.insert(
                    (repo_id, job_type),
                    entry.updated_at.timestamp_millis() as f64 / 1000.0,
                );
            }
        }

        let mut git_states = Vec::new();
        let mut svn_states = Vec::new();
        for repo in &repos {
            let job_types: &[&str] = if repo.repo_type == "svn" {
                SVN_JOB_TYPES
            } else {
                GIT_JOB_TYPES
            };
            // Stalest pair wins; any missing pair reads as never synced.
            let mut oldest: Option<f64> = None;
            let mut missing = false;
            for jt in job_types {
                match cursor_age.get(&(repo.repo_id, jt.to_string())) {
                    Some(ts) => {
                        oldest = Some(oldest.map_or(*ts, |o: f64| o.min(*ts)));
                    }
                    None => missing = true,
                }
            }
            let stats = stats_by_repo.get(&repo.repo_id);

            let state = RepoSyncState {
                repo_id: repo.repo_id,
                repo_type: repo.repo_type.clone(),
                gitlab_instance: (repo.repo_type == "git")
                    .then(|| normalize_instance_key(&repo.url)),
                tenant_id: repo.tenant_id().map(str::to_string),
                cursor_updated_at: if missing { None } else { oldest },
                recent_run_count: stats.map(|s| s.total_runs).unwrap_or(0),
                recent_failed_count: stats.map(|s| s.failed_runs).unwrap_or(0),
                recent_429_hits: stats.map(|s| s.hits_429).unwrap_or(0),
                recent_total_requests: stats.map(|s| s.total_requests).unwrap_or(0),
                is_queued: false,
            };
            if repo.repo_type == "svn" {
                svn_states.push(state);
            } else {
                git_states.push(state);
            }
        }

        let mut ctx = self.build_context(now, &git_states, &window_stats).await?;
        let mut candidates =
            select_jobs_to_enqueue(&git_states, GIT_JOB_TYPES, &self.config, &ctx);
        apply_admissions(&mut ctx.budget, &candidates, &git_states);
        candidates.extend(select_jobs_to_enqueue(
            &svn_states,
            SVN_JOB_TYPES,
            &self.config,
            &ctx,
        ));
        report.candidates = candidates.len();

        report.breaker_states = self.breaker_report(&ctx).await?;

        for candidate in &candidates {
            let cursor_ts = cursor_age
                .get(&(candidate.repo_id, candidate.job_type.clone()))
                .copied();
            match self.enqueue(candidate, cursor_ts, now).await {
                Ok(Some(_)) => report.enqueued += 1,
                Ok(None) => report.enqueue_races_lost += 1,
                Err(err) => warn!(
                    event = "scheduler.enqueue_failed",
                    repo_id = candidate.repo_id,
                    job_type = %candidate.job_type,
                    error = %err,
                ),
            }
        }

        report.pauses_written = self
            .write_error_budget_pauses(&git_states, &svn_states, &ctx, now)
            .await?;

        info!(
            event = "scheduler.scan",
            repos = report.repos_seen,
            candidates = report.candidates,
            enqueued = report.enqueued,
            pauses = report.pauses_written,
        );
        Ok(report)
    }

    /// Run scans forever at the configured interval until ctrl-c.
    pub async fn run_loop(&self) -> Result<()> {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(self.config.scan_interval_seconds));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.scan().await {
                        warn!(event = "scheduler.scan_failed", error = %err);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!(event = "scheduler.shutdown");
                    return Ok(());
                }
            }
        }
    }

    async fn build_context(
        &self,
        now: f64,
        git_states: &[RepoSyncState],
        window_stats: &[RepoWindowStats],
    ) -> Result<SelectionContext> {
        let queued: HashSet<(i64, String)> =
            scm_db::queued_pairs(&self.pool).await?.into_iter().collect();
        let paused: HashSet<(i64, String)> = scm_db::get_paused_repo_job_pairs(&self.pool, now)
            .await?
            .into_iter()
            .collect();

        let mut bucket_statuses = BTreeMap::new();
        let now_ts = Utc::now();
        for bucket in scm_db::list_buckets(&self.pool).await? {
            bucket_statuses.insert(
                bucket.instance_key.clone(),
                InstanceBucketStatus {
                    instance_key: bucket.instance_key.clone(),
                    is_paused: bucket.is_paused(now_ts),
                    pause_remaining_seconds: bucket.pause_remaining_seconds(now_ts),
                    current_tokens: bucket.projected_tokens(now_ts),
                    rate: bucket.rate,
                    burst: bucket.burst,
                },
            );
        }

        let budget = self.build_budget(&queued).await?;
        let decisions = self
            .evaluate_breakers(now, git_states, window_stats)
            .await?;

        Ok(SelectionContext {
            now,
            queued_pairs: queued,
            paused_pairs: paused,
            bucket_statuses,
            budget,
            decisions,
            pool: self.pool_name.clone(),
        })
    }

    async fn build_budget(&self, _queued: &HashSet<(i64, String)>) -> Result<BudgetSnapshot> {
        let mut budget = BudgetSnapshot::empty();
        let jobs = scm_db::list_sync_jobs(
            &self.pool,
            &scm_db::JobFilter {
                limit: 10_000,
                ..Default::default()
            },
        )
        .await?;
        let repos = scm_db::list_repos(&self.pool, None, 10_000).await?;
        let info: BTreeMap<i64, (Option<String>, Option<String>)> = repos
            .iter()
            .map(|r| {
                (
                    r.repo_id,
                    (
                        (r.repo_type == "git").then(|| normalize_instance_key(&r.url)),
                        r.tenant_id().map(str::to_string),
                    ),
                )
            })
            .collect();

        for job in jobs {
            let occupied = match job.status {
                scm_schemas::JobStatus::Running => {
                    budget.global_running += 1;
                    true
                }
                scm_schemas::JobStatus::Pending => {
                    budget.global_pending += 1;
                    true
                }
                _ => false,
            };
            if occupied {
                budget.global_active += 1;
                if let Some((instance, tenant)) = info.get(&job.repo_id) {
                    if let Some(instance) = instance {
                        *budget.by_instance.entry(instance.clone()).or_insert(0) += 1;
                    }
                    if let Some(tenant) = tenant {
                        *budget.by_tenant.entry(tenant.clone()).or_insert(0) += 1;
                    }
                }
            }
        }
        Ok(budget)
    }

    /// Hydrate one controller per scope from KV, feed it the windowed
    /// health for that scope, and collect the resulting decisions.
    async fn evaluate_breakers(
        &self,
        now: f64,
        git_states: &[RepoSyncState],
        window_stats: &[RepoWindowStats],
    ) -> Result<ScopeDecisions> {
        let mut decisions = ScopeDecisions::default();

        let repo_scope: BTreeMap<i64, (Option<String>, Option<String>)> = git_states
            .iter()
            .map(|s| (s.repo_id, (s.gitlab_instance.clone(), s.tenant_id.clone())))
            .collect();

        // Aggregate per scope.
        let mut global = ScopeAgg::default();
        let mut by_instance: BTreeMap<String, ScopeAgg> = BTreeMap::new();
        let mut by_tenant: BTreeMap<String, ScopeAgg> = BTreeMap::new();
        for stats in window_stats {
            global.add(stats);
            if let Some((instance, tenant)) = repo_scope.get(&stats.repo_id) {
                if let Some(instance) = instance {
                    by_instance.entry(instance.clone()).or_default().add(stats);
                }
                if let Some(tenant) = tenant {
                    by_tenant.entry(tenant.clone()).or_default().add(stats);
                }
            }
        }

        decisions.global = Some(
            self.check_scope(&CbScope::Global, &global.health(), now)
                .await?,
        );
        if let Some(pool) = &self.pool_name {
            let decision = self
                .check_scope(&CbScope::Pool(pool.clone()), &global.health(), now)
                .await?;
            decisions.by_pool.insert(pool.clone(), decision);
        }
        for (instance, agg) in &by_instance {
            let decision = self
                .check_scope(&CbScope::Instance(instance.clone()), &agg.health(), now)
                .await?;
            decisions.by_instance.insert(instance.clone(), decision);
        }
        for (tenant, agg) in &by_tenant {
            let decision = self
                .check_scope(&CbScope::Tenant(tenant.clone()), &agg.health(), now)
                .await?;
            decisions.by_tenant.insert(tenant.clone(), decision);
        }

        Ok(decisions)
    }

    async fn check_scope(
        &self,
        scope: &CbScope,
        health: &HealthStats,
        now: f64,
    ) -> Result<scm_policy::CircuitBreakerDecision> {
        let key = build_circuit_breaker_key(&self.project_key, scope);
        let mut controller = CircuitBreakerController::new(key.clone(), self.cb_config.clone());
        let candidates = legacy_circuit_breaker_keys(&self.project_key, scope);
        if let Some(state) = scm_db::load_circuit_breaker_state(&self.pool, &candidates).await? {
            controller.load_state_dict(&state);
        }
        let decision = controller.check(Some(health), now);
        // Writes always use the canonical key, even when state was found
        // under a legacy one.
        scm_db::save_circuit_breaker_state(&self.pool, &key, &controller.get_state_dict())
            .await
            .with_context(|| format!("persist breaker state for {key}"))?;
        Ok(decision)
    }

    async fn breaker_report(&self, ctx: &SelectionContext) -> Result<BTreeMap<String, String>> {
        // States were persisted in check_scope; report the decision states.
        let mut out = BTreeMap::new();
        if let Some(d) = &ctx.decisions.global {
            out.insert(
                build_circuit_breaker_key(&self.project_key, &CbScope::Global),
                d.current_state.clone(),
            );
        }
        for (instance, d) in &ctx.decisions.by_instance {
            out.insert(
                build_circuit_breaker_key(&self.project_key, &CbScope::Instance(instance.clone())),
                d.current_state.clone(),
            );
        }
        for (tenant, d) in &ctx.decisions.by_tenant {
            out.insert(
                build_circuit_breaker_key(&self.project_key, &CbScope::Tenant(tenant.clone())),
                d.current_state.clone(),
            );
        }
        for (pool, d) in &ctx.decisions.by_pool {
            out.insert(
                build_circuit_breaker_key(&self.project_key, &CbScope::Pool(pool.clone())),
                d.current_state.clone(),
            );
        }
        Ok(out)
    }

    async fn enqueue(
        &self,
        candidate: &SyncJobCandidate,
        cursor_ts: Option<f64>,
        now: f64,
    ) -> Result<Option<uuid::Uuid>> {
        let mut payload = serde_json::Map::new();
        payload.insert("reason".into(), candidate.reason.clone().into());
        if let Some(batch) = candidate.suggested_batch_size {
            payload.insert("suggested_batch_size".into(), batch.into());
        }
        if let Some(diff_mode) = &candidate.suggested_diff_mode {
            payload.insert("suggested_diff_mode".into(), diff_mode.clone().into());
        }
        if candidate.mode == scm_schemas::SyncMode::Backfill {
            let (since, until) = scm_policy::compute_backfill_window(cursor_ts, &self.config, now);
            payload.insert("backfill_since".into(), since.into());
            payload.insert("backfill_until".into(), until.into());
        }
        scm_db::enqueue_sync_job(
            &self.pool,
            candidate.repo_id,
            &candidate.job_type,
            candidate.mode,
            candidate.priority,
            self.config.max_attempts,
            Some(serde_json::Value::Object(payload)),
        )
        .await
    }

    /// Repos over the error budget get a pause record per job type so the
    /// next scans skip them without recomputing health.
    async fn write_error_budget_pauses(
        &self,
        git_states: &[RepoSyncState],
        svn_states: &[RepoSyncState],
        ctx: &SelectionContext,
        now: f64,
    ) -> Result<usize> {
        let mut written = 0;
        let all = git_states
            .iter()
            .map(|s| (s, GIT_JOB_TYPES))
            .chain(svn_states.iter().map(|s| (s, SVN_JOB_TYPES)));

        for (state, job_types) in all {
            let (_, reason, _) = should_schedule_repo_health(state, &self.config, now);
            if reason != "error_budget_exceeded" {
                continue;
            }
            let failure_rate = scm_policy::calculate_failure_rate(
                state.recent_failed_count,
                state.recent_run_count,
            );
            for job_type in job_types {
                let pair = (state.repo_id, job_type.to_string());
                if ctx.paused_pairs.contains(&pair) {
                    continue;
                }
                scm_db::set_repo_job_pause(
                    &self.pool,
                    state.repo_id,
                    job_type,
                    self.config.pause_duration_seconds,
                    &format!(
                        "failure rate {:.2} over {} runs",
                        failure_rate, state.recent_run_count
                    ),
                    PauseReasonCode::ErrorBudget,
                    failure_rate,
                    now,
                )
                .await?;
                written += 1;
            }
        }
        Ok(written)
    }
}

/// Scope-level health accumulation from per-repo window stats.
#[derive(Debug, Default, Clone)]
struct ScopeAgg {
    total_runs: u64,
    failed_runs: u64,
    hits_429: u64,
    total_requests: u64,
    timeout_count: u64,
}

impl ScopeAgg {
    fn add(&mut self, stats: &RepoWindowStats) {
        self.total_runs += stats.total_runs;
        self.failed_runs += stats.failed_runs;
        self.hits_429 += stats.hits_429;
        self.total_requests += stats.total_requests;
        self.timeout_count += stats.timeout_count;
    }

    fn health(&self) -> HealthStats {
        HealthStats {
            total_runs: self.total_runs,
            failed_rate: if self.total_runs == 0 {
                0.0
            } else {
                self.failed_runs as f64 / self.total_runs as f64
            },
            rate_limit_rate: if self.total_requests == 0 {
                0.0
            } else {
                (self.hits_429 as f64 / self.total_requests as f64).min(1.0)
            },
            total_requests: self.total_requests,
            total_timeout_count: self.timeout_count,
        }
    }
}

/// Fold freshly admitted candidates into the running budget so a second
/// selection pass (e.g. SVN after git) sees the occupancy.
pub fn apply_admissions(
    budget: &mut BudgetSnapshot,
    admitted: &[SyncJobCandidate],
    states: &[RepoSyncState],
) {
    let by_repo: BTreeMap<i64, &RepoSyncState> = states.iter().map(|s| (s.repo_id, s)).collect();
    for candidate in admitted {
        budget.global_pending += 1;
        budget.global_active += 1;
        if let Some(state) = by_repo.get(&candidate.repo_id) {
            if let Some(instance) = &state.gitlab_instance {
                *budget.by_instance.entry(instance.clone()).or_insert(0) += 1;
            }
            if let Some(tenant) = &state.tenant_id {
                *budget.by_tenant.entry(tenant.clone()).or_insert(0) += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_admissions_accumulates_budget() {
        let states = vec![RepoSyncState {
            gitlab_instance: Some("gitlab.example.com".into()),
            tenant_id: Some("acme".into()),
            ..RepoSyncState::new(1, "git")
        }];
        let mut candidate = SyncJobCandidate::new(1, "commits");
        candidate.priority = 1000;

        let mut budget = BudgetSnapshot::empty();
        apply_admissions(&mut budget, &[candidate.clone(), candidate], &states);

        assert_eq!(budget.global_pending, 2);
        assert_eq!(budget.global_active, 2);
        assert_eq!(budget.by_instance["gitlab.example.com"], 2);
        assert_eq!(budget.by_tenant["acme"], 2);
    }

    #[test]
    fn scope_agg_health_rates() {
        let mut agg = ScopeAgg::default();
        agg.add(&RepoWindowStats {
            repo_id: 1,
            total_runs: 8,
            failed_runs: 2,
            hits_429: 10,
            total_requests: 100,
            timeout_count: 5,
        });
        agg.add(&RepoWindowStats {
            repo_id: 2,
            total_runs: 2,
            failed_runs: 1,
            hits_429: 0,
            total_requests: 0,
            timeout_count: 0,
        });
        let health = agg.health();
        assert_eq!(health.total_runs, 10);
        assert_eq!(health.failed_rate, 0.3);
        assert_eq!(health.rate_limit_rate, 0.1);
        assert_eq!(health.total_timeout_count, 5);

        assert_eq!(ScopeAgg::default().health().failed_rate, 0.0);
    }
}
