//! Scheduling and failure policy, as pure functions.
//!
//! Nothing in this crate touches the database or the clock: every function
//! takes its inputs (states, config, `now`) as arguments and returns plain
//! data. The scheduler, worker, and reaper crates do the I/O and feed this
//! crate; tests drive every branch without a Postgres instance.

pub mod backoff;
pub mod breaker;
pub mod scheduling;

pub use backoff::{backoff_base_seconds, calculate_backoff_seconds, classify_last_error};
pub use breaker::{combine_decisions, CircuitBreakerController, CircuitBreakerDecision, CircuitState};
pub use scheduling::{
    calculate_bucket_priority_penalty, calculate_cursor_age, calculate_failure_rate,
    calculate_rate_limit_rate, compute_backfill_window, compute_job_priority,
    select_jobs_to_enqueue, should_schedule_repo, should_schedule_repo_health,
    should_skip_due_to_bucket_pause, BudgetSnapshot, InstanceBucketStatus, RepoSyncState,
    ScopeDecisions, SelectionContext, SyncJobCandidate, BUCKET_LOW_TOKENS_PRIORITY_PENALTY,
    BUCKET_LOW_TOKENS_RATIO, BUCKET_PAUSED_PRIORITY_PENALTY, JOB_TYPE_PRIORITY_SCALE,
};
