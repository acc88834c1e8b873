//! Shared typed contracts for the SCM sync control plane.
//!
//! Everything that crosses a crate boundary lives here: job/run status
//! enums, the error taxonomy, the counts contract, the run-finish payload,
//! pause records, breaker health inputs, and the key-construction helpers.
//! Higher layers (`scm-policy`, `scm-db`, the worker harness) depend on this
//! crate and never redefine these shapes locally.

pub mod counts;
pub mod errors;
pub mod health;
pub mod keys;
pub mod pause;
pub mod run_contract;
pub mod status;

pub use counts::{
    build_counts, validate_counts_schema, RunCounts, COUNTS_LIMITER_FIELDS,
    COUNTS_OPTIONAL_FIELDS, COUNTS_REQUIRED_FIELDS,
};
pub use errors::ErrorCategory;
pub use health::HealthStats;
pub use keys::{
    build_circuit_breaker_key, build_pause_key, legacy_circuit_breaker_keys,
    normalize_instance_key, parse_pause_key, CbScope,
};
pub use pause::{PauseReasonCode, RepoPauseRecord};
pub use run_contract::{
    build_payload_for_exception, build_payload_for_no_data, build_payload_for_success,
    validate_run_finish_payload, DegradationSnapshot, ErrorSummary, RunError, RunFinishPayload,
    RunResult,
};
pub use status::{JobStatus, RunStatus, SyncMode};
