//! The adapter seam. GitLab REST and `svn` subprocess adapters live
//! outside this crate; the harness only knows this trait.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use scm_cursor::Cursor;
use scm_db::{JobRow, RepoRow};
use scm_schemas::RunResult;

/// Everything an adapter gets to see for one execution.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job: JobRow,
    pub repo: RepoRow,
    /// Cursor at claim time, already upgraded to v2. `None` on first sync.
    pub cursor_before: Option<Cursor>,
}

/// One sync adapter per job type.
///
/// Implementations must return a [`RunResult`] for every outcome: errors
/// are data here, not panics. The harness still contains panics defensively
/// and converts them to `failed`/`unknown`.
#[async_trait]
pub trait SyncAdapter: Send + Sync {
    async fn execute(&self, ctx: &JobContext) -> RunResult;
}

/// Job-type → adapter dispatch table.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Arc<dyn SyncAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, job_type: impl Into<String>, adapter: Arc<dyn SyncAdapter>) -> Self {
        self.adapters.insert(job_type.into(), adapter);
        self
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn SyncAdapter>> {
        self.adapters.get(job_type).cloned()
    }

    pub fn job_types(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scm_schemas::{ErrorCategory, RunCounts};

    struct StaticAdapter;

    #[async_trait]
    impl SyncAdapter for StaticAdapter {
        async fn execute(&self, _ctx: &JobContext) -> RunResult {
            RunResult::completed(RunCounts::with_synced(1), None)
        }
    }

    #[test]
    fn registry_dispatches_by_job_type() {
        let registry = AdapterRegistry::new().register("commits", Arc::new(StaticAdapter));
        assert!(registry.get("commits").is_some());
        assert!(registry.get("svn").is_none());
        assert_eq!(registry.job_types(), vec!["commits"]);
    }

    #[test]
    fn run_result_constructors_shape() {
        let failed = RunResult::failed(ErrorCategory::Network, "conn reset");
        assert_eq!(failed.counts.synced_count(), 0);
        assert!(failed.error.is_some());
    }
}
