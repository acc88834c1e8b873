// Worker finalize scenarios against a real database: full claim → adapter →
// finalize flow with a stub adapter, and the MR tie-break/no-op re-scan
// behavior of the cursor advance.
//
// DB-backed tests, skipped if POSTGRES_DSN is not set.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use scm_config::WorkerConfig;
use scm_schemas::{JobStatus, RunCounts, RunResult, SyncMode};
use scm_worker::{advance_cursor, AdapterRegistry, JobContext, SyncAdapter, WorkerHarness};

async fn pool_or_skip() -> Option<sqlx::PgPool> {
    if std::env::var(scm_db::ENV_DB_URL).is_err() {
        eprintln!("SKIP: POSTGRES_DSN not set");
        return None;
    }
    Some(scm_db::testkit_db_pool().await.expect("db pool"))
}

fn unique_url(prefix: &str) -> String {
    format!("https://gitlab.example.com/{prefix}/{}.git", Uuid::new_v4())
}

struct FixedResultAdapter {
    result: RunResult,
}

#[async_trait]
impl SyncAdapter for FixedResultAdapter {
    async fn execute(&self, _ctx: &JobContext) -> RunResult {
        self.result.clone()
    }
}

#[tokio::test]
async fn process_one_completes_job_and_advances_cursor() -> Result<()> {
    let Some(pool) = pool_or_skip().await else {
        return Ok(());
    };

    let repo_id =
        scm_db::upsert_repo(&pool, "git", &unique_url("worker"), "acme/worker", None).await?;
    scm_db::enqueue_sync_job(&pool, repo_id, "mrs", SyncMode::Incremental, 1000, 3, None)
        .await?
        .expect("enqueued");

    let mut counts = RunCounts::with_synced(3);
    counts.set("synced_mr_count", 3);
    let adapter = FixedResultAdapter {
        result: RunResult::completed(
            counts,
            Some(json!({"last_mr_updated_at": "2024-01-15T12:00:00Z", "last_mr_iid": 102})),
        ),
    };
    let registry = AdapterRegistry::new().register("mrs", Arc::new(adapter));

    let config = WorkerConfig {
        worker_count: 1,
        pool_repo_allowlist: vec![repo_id],
        ..Default::default()
    };
    let harness = WorkerHarness::new(pool.clone(), config, registry);

    assert!(harness.process_one().await?, "one job should be claimed");

    let jobs = scm_db::list_sync_jobs(
        &pool,
        &scm_db::JobFilter {
            repo_id: Some(repo_id),
            ..Default::default()
        },
    )
    .await?;
    assert_eq!(jobs[0].status, JobStatus::Completed);
    assert!(jobs[0].locked_by.is_none());

    let cursor = scm_db::load_cursor(&pool, repo_id, "mrs").await?.expect("cursor saved");
    assert_eq!(cursor.cursor.last_mr_iid(), Some(102));
    assert_eq!(cursor.cursor.last_sync_count(), 3);

    // Queue drained.
    assert!(!harness.process_one().await?);

    Ok(())
}

#[tokio::test]
async fn mr_tie_break_rescan_is_a_no_op() -> Result<()> {
    let Some(pool) = pool_or_skip().await else {
        return Ok(());
    };

    let repo_id =
        scm_db::upsert_repo(&pool, "git", &unique_url("tiebreak"), "acme/tiebreak", None).await?;
    let ts = "2024-01-15T12:00:00Z";

    let result = RunResult::completed(RunCounts::with_synced(3), None);

    // Initial cursor at (ts, 100).
    assert!(
        advance_cursor(
            &pool,
            repo_id,
            "mrs",
            &json!({"last_mr_updated_at": ts, "last_mr_iid": 100}),
            &result,
        )
        .await?
    );

    // A batch ending at iid 102 on the same timestamp advances.
    assert!(
        advance_cursor(
            &pool,
            repo_id,
            "mrs",
            &json!({"last_mr_updated_at": ts, "last_mr_iid": 102}),
            &result,
        )
        .await?
    );
    let cursor = scm_db::load_cursor(&pool, repo_id, "mrs").await?.unwrap();
    assert_eq!(cursor.cursor.last_mr_iid(), Some(102));
    assert_eq!(cursor.cursor.last_mr_updated_at(), Some(ts));

    // Overlap re-scan ending at the same (ts, iid): no advancement.
    assert!(
        !advance_cursor(
            &pool,
            repo_id,
            "mrs",
            &json!({"last_mr_updated_at": ts, "last_mr_iid": 102}),
            &result,
        )
        .await?
    );

    // A later batch containing iid 103 advances again.
    assert!(
        advance_cursor(
            &pool,
            repo_id,
            "mrs",
            &json!({"last_mr_updated_at": ts, "last_mr_iid": 103}),
            &result,
        )
        .await?
    );
    let cursor = scm_db::load_cursor(&pool, repo_id, "mrs").await?.unwrap();
    assert_eq!(cursor.cursor.last_mr_iid(), Some(103));

    Ok(())
}

#[tokio::test]
async fn failed_run_retries_with_backoff_then_requeues() -> Result<()> {
    let Some(pool) = pool_or_skip().await else {
        return Ok(());
    };

    let repo_id =
        scm_db::upsert_repo(&pool, "git", &unique_url("retry"), "acme/retry", None).await?;
    scm_db::enqueue_sync_job(&pool, repo_id, "commits", SyncMode::Incremental, 1000, 3, None)
        .await?
        .expect("enqueued");

    let adapter = FixedResultAdapter {
        result: RunResult::failed(scm_schemas::ErrorCategory::Timeout, "read timed out"),
    };
    let registry = AdapterRegistry::new().register("commits", Arc::new(adapter));
    let config = WorkerConfig {
        worker_count: 1,
        pool_repo_allowlist: vec![repo_id],
        ..Default::default()
    };
    let harness = WorkerHarness::new(pool.clone(), config, registry);

    assert!(harness.process_one().await?);

    let jobs = scm_db::list_sync_jobs(
        &pool,
        &scm_db::JobFilter {
            repo_id: Some(repo_id),
            ..Default::default()
        },
    )
    .await?;
    let job = &jobs[0];
    assert_eq!(job.status, JobStatus::Pending, "transient failure requeues");
    assert_eq!(job.attempts, 1);
    assert!(job.not_before > chrono::Utc::now(), "backoff delays the retry");
    assert!(job.last_error.is_some());

    // No cursor was written for the failed run.
    assert!(scm_db::load_cursor(&pool, repo_id, "commits").await?.is_none());

    Ok(())
}
