//! Worker harness: claim loop, adapter dispatch, run finalization.
//!
//! The lease discipline is exactly: short transaction to claim, adapter
//! work outside any transaction (with heartbeats on the side), short
//! transaction to finish. Adapters are black boxes behind [`SyncAdapter`];
//! whatever they do, the job state machine only ever sees a [`RunResult`].

mod adapter;
mod finalize;
mod harness;

pub use adapter::{AdapterRegistry, JobContext, SyncAdapter};
pub use finalize::{advance_cursor, finalize_run};
pub use harness::WorkerHarness;
