//! Candidate selection for the scheduler scan.
//!
//! `select_jobs_to_enqueue` is the single entry point: it takes the repo
//! states plus everything the scan gathered (queued pairs, pauses, bucket
//! snapshots, budget occupancy, breaker decisions) and returns the ordered
//! list of candidates to insert. Deterministic for a given input tuple.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use scm_config::SchedulerConfig;
use scm_schemas::SyncMode;

use crate::breaker::{combine_decisions, CircuitBreakerDecision};

/// Job-type base priorities are spread out by this factor so the additive
/// modifiers (failure rate, bucket penalties) reorder repos within a job
/// type but never across job types, except the bucket-paused penalty,
/// which is deliberately large enough to cross that line.
pub const JOB_TYPE_PRIORITY_SCALE: i64 = 1000;

pub const NEVER_SYNCED_PRIORITY_ADJUSTMENT: i64 = -100;
pub const RATE_LIMITED_PRIORITY_ADJUSTMENT: i64 = 50;

pub const BUCKET_PAUSED_PRIORITY_PENALTY: i64 = 1000;
pub const BUCKET_LOW_TOKENS_PRIORITY_PENALTY: i64 = 100;
/// Tokens below this fraction of burst draw the low-token penalty.
pub const BUCKET_LOW_TOKENS_RATIO: f64 = 0.2;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Everything the scan knows about one repo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoSyncState {
    pub repo_id: i64,
    pub repo_type: String,
    pub gitlab_instance: Option<String>,
    pub tenant_id: Option<String>,
    /// Epoch seconds of the last cursor write; `None` = never synced.
    pub cursor_updated_at: Option<f64>,
    pub recent_run_count: u64,
    pub recent_failed_count: u64,
    pub recent_429_hits: u64,
    pub recent_total_requests: u64,
    /// Repo-level queued flag kept for the legacy single-job-type path;
    /// the per-pair check in `select_jobs_to_enqueue` supersedes it.
    pub is_queued: bool,
}

impl RepoSyncState {
    pub fn new(repo_id: i64, repo_type: impl Into<String>) -> Self {
        RepoSyncState {
            repo_id,
            repo_type: repo_type.into(),
            gitlab_instance: None,
            tenant_id: None,
            cursor_updated_at: None,
            recent_run_count: 0,
            recent_failed_count: 0,
            recent_429_hits: 0,
            recent_total_requests: 0,
            is_queued: false,
        }
    }
}

/// Scheduler-visible snapshot of one instance's token bucket. Read-only;
/// no tokens are consumed here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceBucketStatus {
    pub instance_key: String,
    pub is_paused: bool,
    pub pause_remaining_seconds: f64,
    pub current_tokens: f64,
    pub rate: f64,
    pub burst: f64,
}

/// Current queue occupancy, incremented in-memory as candidates are
/// admitted so one scan can never overshoot the caps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub global_running: u32,
    pub global_pending: u32,
    pub global_active: u32,
    pub by_instance: BTreeMap<String, u32>,
    pub by_tenant: BTreeMap<String, u32>,
}

impl BudgetSnapshot {
    pub fn empty() -> Self {
        BudgetSnapshot::default()
    }

    pub fn to_value(&self) -> Value {
        json!({
            "global_running": self.global_running,
            "global_pending": self.global_pending,
            "global_active": self.global_active,
            "by_instance": self.by_instance,
            "by_tenant": self.by_tenant,
        })
    }
}

/// Breaker decisions per scope, as hydrated by the scan.
#[derive(Debug, Clone, Default)]
pub struct ScopeDecisions {
    pub global: Option<CircuitBreakerDecision>,
    pub by_pool: BTreeMap<String, CircuitBreakerDecision>,
    pub by_instance: BTreeMap<String, CircuitBreakerDecision>,
    pub by_tenant: BTreeMap<String, CircuitBreakerDecision>,
}

/// Non-state inputs for one selection pass.
#[derive(Debug, Clone, Default)]
pub struct SelectionContext {
    pub now: f64,
    pub queued_pairs: HashSet<(i64, String)>,
    pub paused_pairs: HashSet<(i64, String)>,
    pub bucket_statuses: BTreeMap<String, InstanceBucketStatus>,
    pub budget: BudgetSnapshot,
    pub decisions: ScopeDecisions,
    /// Worker pool whose breaker scope applies to this scan, if any.
    pub pool: Option<String>,
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJobCandidate {
    pub repo_id: i64,
    pub job_type: String,
    pub priority: i64,
    pub reason: String,
    pub mode: SyncMode,
    pub bucket_paused: bool,
    pub bucket_penalty_reason: Option<String>,
    pub bucket_penalty_value: i64,
    pub suggested_batch_size: Option<u32>,
    pub suggested_diff_mode: Option<String>,
    pub should_pause: bool,
    pub pause_reason: Option<String>,
}

impl SyncJobCandidate {
    pub fn new(repo_id: i64, job_type: impl Into<String>) -> Self {
        SyncJobCandidate {
            repo_id,
            job_type: job_type.into(),
            priority: 0,
            reason: String::new(),
            mode: SyncMode::Incremental,
            bucket_paused: false,
            bucket_penalty_reason: None,
            bucket_penalty_value: 0,
            suggested_batch_size: None,
            suggested_diff_mode: None,
            should_pause: false,
            pause_reason: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Rate helpers
// ---------------------------------------------------------------------------

/// Seconds since the cursor was last written; infinite when never synced,
/// zero when the write is in the future (clock skew).
pub fn calculate_cursor_age(cursor_updated_at: Option<f64>, now: f64) -> f64 {
    match cursor_updated_at {
        None => f64::INFINITY,
        Some(ts) => (now - ts).max(0.0),
    }
}

pub fn calculate_failure_rate(failed: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (failed as f64 / total as f64).min(1.0)
    }
}

pub fn calculate_rate_limit_rate(hits_429: u64, total_requests: u64) -> f64 {
    if total_requests == 0 {
        0.0
    } else {
        (hits_429 as f64 / total_requests as f64).min(1.0)
    }
}

// ---------------------------------------------------------------------------
// Eligibility
// ---------------------------------------------------------------------------

/// Eligibility rules minus any queued check; used by the scan, which
/// applies its own per-`(repo, job_type)` pair check first, and by pause
/// decisions that must ignore queue state.
///
/// Returns `(should_schedule, reason, priority_adjustment)`.
pub fn should_schedule_repo_health(
    state: &RepoSyncState,
    config: &SchedulerConfig,
    now: f64,
) -> (bool, &'static str, i64) {
    if state.cursor_updated_at.is_none() {
        return (true, "never_synced", NEVER_SYNCED_PRIORITY_ADJUSTMENT);
    }

    let age = calculate_cursor_age(state.cursor_updated_at, now);
    if age < config.cursor_age_threshold_seconds {
        return (false, "within_threshold", 0);
    }

    let failure_rate = calculate_failure_rate(state.recent_failed_count, state.recent_run_count);
    if state.recent_run_count >= config.min_samples as u64
        && failure_rate >= config.error_budget_threshold
    {
        return (false, "error_budget_exceeded", 0);
    }

    let rate_limit_rate =
        calculate_rate_limit_rate(state.recent_429_hits, state.recent_total_requests);
    if rate_limit_rate >= config.rate_limit_hit_threshold {
        return (true, "rate_limited", RATE_LIMITED_PRIORITY_ADJUSTMENT);
    }

    (true, "cursor_age_exceeded", 0)
}

/// Full eligibility including the repo-level queued flag.
pub fn should_schedule_repo(
    state: &RepoSyncState,
    config: &SchedulerConfig,
    now: f64,
) -> (bool, &'static str, i64) {
    if state.is_queued {
        return (false, "already_queued", 0);
    }
    should_schedule_repo_health(state, config, now)
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Total priority for one `(repo, job_type)`; lower runs first.
pub fn compute_job_priority(
    job_type: &str,
    state: &RepoSyncState,
    config: &SchedulerConfig,
    priority_adjustment: i64,
) -> i64 {
    let base = config
        .job_type_priority
        .get(job_type)
        .copied()
        .unwrap_or(10);
    let failure_rate = calculate_failure_rate(state.recent_failed_count, state.recent_run_count);
    let rate_limit_rate =
        calculate_rate_limit_rate(state.recent_429_hits, state.recent_total_requests);

    base * JOB_TYPE_PRIORITY_SCALE
        + priority_adjustment
        + (failure_rate * 100.0).round() as i64
        + (rate_limit_rate * 100.0).round() as i64
}

// ---------------------------------------------------------------------------
// Bucket treatment
// ---------------------------------------------------------------------------

pub fn should_skip_due_to_bucket_pause(
    status: Option<&InstanceBucketStatus>,
    skip_on_bucket_pause: bool,
) -> bool {
    skip_on_bucket_pause && status.map(|s| s.is_paused).unwrap_or(false)
}

/// Priority penalty for an instance's bucket state. Paused buckets demote
/// hard; a draining bucket (tokens strictly below 20% of burst) demotes
/// mildly.
pub fn calculate_bucket_priority_penalty(
    status: Option<&InstanceBucketStatus>,
) -> (i64, Option<&'static str>) {
    let Some(status) = status else {
        return (0, None);
    };
    if status.is_paused {
        return (BUCKET_PAUSED_PRIORITY_PENALTY, Some("bucket_paused"));
    }
    if status.current_tokens < BUCKET_LOW_TOKENS_RATIO * status.burst {
        return (BUCKET_LOW_TOKENS_PRIORITY_PENALTY, Some("low_tokens"));
    }
    (0, None)
}

// ---------------------------------------------------------------------------
// Backfill windows
// ---------------------------------------------------------------------------

/// `(since, until)` epoch-second bounds for a time-based backfill. `since`
/// starts at the cursor (or the repair window when no cursor exists) and is
/// clamped by the maximum window.
pub fn compute_backfill_window(
    cursor_ts: Option<f64>,
    config: &SchedulerConfig,
    now: f64,
) -> (f64, f64) {
    let repair_window = config.backfill_repair_window_hours as f64 * 3600.0;
    let max_window = config.max_backfill_window_hours as f64 * 3600.0;
    let since = cursor_ts.unwrap_or(now - repair_window).max(now - max_window);
    (since, now)
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

struct EligibleCandidate {
    candidate: SyncJobCandidate,
    instance: Option<String>,
    tenant: Option<String>,
    /// Scope keys in probe mode that admission must budget against, with
    /// that scope's probe budget and allowlist verdict.
    probe_scopes: Vec<(String, u32)>,
    probe_allowed: bool,
}

/// The selection pass. See module docs; ordering is by priority (ascending)
/// with tenant interleaving applied when fairness is enabled, and admission
/// is bounded by every budget cap.
pub fn select_jobs_to_enqueue(
    states: &[RepoSyncState],
    job_types: &[&str],
    config: &SchedulerConfig,
    ctx: &SelectionContext,
) -> Vec<SyncJobCandidate> {
    let job_types = mvp_filter(job_types, config);
    if job_types.is_empty() {
        return Vec::new();
    }

    if ctx.budget.global_running >= config.max_running {
        return Vec::new();
    }
    if ctx.budget.global_active >= config.max_queue_depth {
        return Vec::new();
    }

    let mut eligible = Vec::new();
    for state in states {
        for job_type in &job_types {
            let pair = (state.repo_id, job_type.to_string());
            if ctx.queued_pairs.contains(&pair) || ctx.paused_pairs.contains(&pair) {
                continue;
            }

            let (should, reason, adjustment) = should_schedule_repo_health(state, config, ctx.now);
            if !should {
                continue;
            }

            let decision = binding_decision(state, ctx);
            if !decision.combined.allow_sync {
                continue;
            }

            let bucket = state
                .gitlab_instance
                .as_deref()
                .and_then(|i| ctx.bucket_statuses.get(i));
            if should_skip_due_to_bucket_pause(bucket, config.skip_on_bucket_pause) {
                continue;
            }
            let (penalty, penalty_reason) = calculate_bucket_priority_penalty(bucket);

            let mut candidate = SyncJobCandidate::new(state.repo_id, *job_type);
            candidate.priority = compute_job_priority(job_type, state, config, adjustment) + penalty;
            candidate.reason = reason.to_string();
            candidate.bucket_paused = bucket.map(|b| b.is_paused).unwrap_or(false);
            candidate.bucket_penalty_reason = penalty_reason.map(str::to_string);
            candidate.bucket_penalty_value = penalty;
            if decision.combined.is_backfill_only {
                candidate.mode = SyncMode::Backfill;
                candidate.suggested_batch_size = decision.combined.suggested_batch_size;
                candidate.suggested_diff_mode = decision.combined.suggested_diff_mode.clone();
            }

            let probe_allowed = !decision.combined.is_probe_mode
                || decision
                    .combined
                    .probe_job_types_allowlist
                    .iter()
                    .any(|jt| jt.as_str() == *job_type);

            eligible.push(EligibleCandidate {
                candidate,
                instance: state.gitlab_instance.clone(),
                tenant: state.tenant_id.clone(),
                probe_scopes: decision.probe_scopes,
                probe_allowed,
            });
        }
    }

    eligible.sort_by(|a, b| {
        (a.candidate.priority, a.candidate.repo_id, &a.candidate.job_type).cmp(&(
            b.candidate.priority,
            b.candidate.repo_id,
            &b.candidate.job_type,
        ))
    });

    let ordered = if config.enable_tenant_fairness {
        interleave_by_tenant(eligible, config.tenant_fairness_max_per_round.max(1))
    } else {
        eligible
    };

    admit(ordered, config, ctx)
}

fn mvp_filter<'a>(job_types: &[&'a str], config: &SchedulerConfig) -> Vec<&'a str> {
    if !config.mvp_mode_enabled {
        return job_types.to_vec();
    }
    job_types
        .iter()
        .copied()
        .filter(|jt| config.mvp_job_type_allowlist.iter().any(|a| a == jt))
        .collect()
}

struct BindingDecision {
    combined: CircuitBreakerDecision,
    probe_scopes: Vec<(String, u32)>,
}

/// Collect every scope decision that applies to this repo and fold them:
/// the most restrictive wins.
fn binding_decision(state: &RepoSyncState, ctx: &SelectionContext) -> BindingDecision {
    let mut applicable: Vec<(&CircuitBreakerDecision, String)> = Vec::new();

    if let Some(d) = &ctx.decisions.global {
        applicable.push((d, "global".to_string()));
    }
    if let Some(pool) = &ctx.pool {
        if let Some(d) = ctx.decisions.by_pool.get(pool) {
            applicable.push((d, format!("pool:{pool}")));
        }
    }
    if let Some(instance) = &state.gitlab_instance {
        if let Some(d) = ctx.decisions.by_instance.get(instance) {
            applicable.push((d, format!("instance:{instance}")));
        }
    }
    if let Some(tenant) = &state.tenant_id {
        if let Some(d) = ctx.decisions.by_tenant.get(tenant) {
            applicable.push((d, format!("tenant:{tenant}")));
        }
    }

    let decisions: Vec<&CircuitBreakerDecision> = applicable.iter().map(|(d, _)| *d).collect();
    let combined = combine_decisions(&decisions);
    let probe_scopes = applicable
        .iter()
        .filter(|(d, _)| d.is_probe_mode)
        .map(|(d, scope)| (scope.clone(), d.probe_budget))
        .collect();

    BindingDecision {
        combined,
        probe_scopes,
    }
}

/// Round-robin across tenant buckets, taking up to `max_per_round` entries
/// per tenant per pass. Repos with no tenant share one bucket. Bucket order
/// follows each bucket's best (lowest) priority, so the interleave still
/// starts with the most urgent work.
fn interleave_by_tenant(
    eligible: Vec<EligibleCandidate>,
    max_per_round: u32,
) -> Vec<EligibleCandidate> {
    let mut buckets: Vec<(Option<String>, VecDeque<EligibleCandidate>)> = Vec::new();
    for item in eligible {
        let tenant = item.tenant.clone();
        match buckets.iter_mut().find(|(t, _)| *t == tenant) {
            Some((_, bucket)) => bucket.push_back(item),
            None => buckets.push((tenant, VecDeque::from([item]))),
        }
    }
    // Input is priority-sorted, so each bucket's front is its best entry.
    buckets.sort_by(|a, b| {
        let pa = a.1.front().map(|c| c.candidate.priority).unwrap_or(i64::MAX);
        let pb = b.1.front().map(|c| c.candidate.priority).unwrap_or(i64::MAX);
        pa.cmp(&pb)
    });

    let mut ordered = Vec::new();
    loop {
        let mut drained = true;
        for (_, bucket) in buckets.iter_mut() {
            for _ in 0..max_per_round {
                match bucket.pop_front() {
                    Some(item) => {
                        ordered.push(item);
                        drained = false;
                    }
                    None => break,
                }
            }
        }
        if drained {
            break;
        }
    }
    ordered
}

fn admit(
    ordered: Vec<EligibleCandidate>,
    config: &SchedulerConfig,
    ctx: &SelectionContext,
) -> Vec<SyncJobCandidate> {
    let mut budget = ctx.budget.clone();
    let remaining_depth = config.max_queue_depth.saturating_sub(budget.global_active);
    let cap = remaining_depth.min(config.max_enqueue_per_scan) as usize;

    let mut probe_admitted: HashMap<String, u32> = HashMap::new();
    let mut admitted = Vec::new();

    for item in ordered {
        if admitted.len() >= cap {
            break;
        }

        if let Some(instance) = &item.instance {
            if budget.by_instance.get(instance).copied().unwrap_or(0)
                >= config.per_instance_concurrency
            {
                continue;
            }
        }
        if let Some(tenant) = &item.tenant {
            if budget.by_tenant.get(tenant).copied().unwrap_or(0) >= config.per_tenant_concurrency {
                continue;
            }
        }

        if !item.probe_allowed {
            continue;
        }
        if item
            .probe_scopes
            .iter()
            .any(|(scope, budget_cap)| probe_admitted.get(scope).copied().unwrap_or(0) >= *budget_cap)
        {
            continue;
        }

        for (scope, _) in &item.probe_scopes {
            *probe_admitted.entry(scope.clone()).or_insert(0) += 1;
        }
        if let Some(instance) = &item.instance {
            *budget.by_instance.entry(instance.clone()).or_insert(0) += 1;
        }
        if let Some(tenant) = &item.tenant {
            *budget.by_tenant.entry(tenant.clone()).or_insert(0) += 1;
        }
        budget.global_pending += 1;
        budget.global_active += 1;

        admitted.push(item.candidate);
    }

    admitted
}
