// Queue lease protocol scenario: enqueue -> claim -> heartbeat -> finish,
// plus the counts round-trip through the generated column.
//
// DB-backed test, skipped if POSTGRES_DSN is not set.

use anyhow::Result;
use serde_json::json;
use uuid::Uuid;

use scm_schemas::{
    build_payload_for_success, validate_counts_schema, JobStatus, RunCounts, SyncMode,
};

async fn pool_or_skip() -> Option<sqlx::PgPool> {
    if std::env::var(scm_db::ENV_DB_URL).is_err() {
        eprintln!("SKIP: POSTGRES_DSN not set");
        return None;
    }
    let pool = scm_db::testkit_db_pool().await.expect("db pool");
    Some(pool)
}

fn unique_url(prefix: &str) -> String {
    format!("https://gitlab.example.com/{prefix}/{}.git", Uuid::new_v4())
}

#[tokio::test]
async fn claim_finish_lifecycle_round_trips_counts() -> Result<()> {
    let Some(pool) = pool_or_skip().await else {
        return Ok(());
    };

    let repo_id = scm_db::upsert_repo(&pool, "git", &unique_url("lease"), "acme/lease", None).await?;

    let job_id = scm_db::enqueue_sync_job(&pool, repo_id, "commits", SyncMode::Incremental, 1000, 3, None)
        .await?
        .expect("fresh pair enqueues");

    // A second enqueue for the same live pair is a no-op.
    let dup =
        scm_db::enqueue_sync_job(&pool, repo_id, "commits", SyncMode::Incremental, 1000, 3, None)
            .await?;
    assert!(dup.is_none());

    let allowlist = [repo_id];
    let job = scm_db::claim_next_job(&pool, "worker-001", 300, Some(&allowlist[..]))
        .await?
        .expect("claim returns the pending job");
    assert_eq!(job.job_id, job_id);
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.locked_by.as_deref(), Some("worker-001"));

    assert!(scm_db::heartbeat_job(&pool, job_id, "worker-001").await?);
    assert!(!scm_db::heartbeat_job(&pool, job_id, "worker-999").await?);

    let run_id = Uuid::new_v4();
    scm_db::insert_sync_run_start(
        &pool,
        run_id,
        repo_id,
        "commits",
        SyncMode::Incremental,
        None,
        None,
    )
    .await?;

    let mut counts = RunCounts::with_synced(100);
    counts.set("diff_count", 95).set("total_429_hits", 3);
    let payload = build_payload_for_success(run_id, counts, Some(json!({"last_rev": 10})), None);

    let outcome = scm_db::finish_job(&pool, job_id, &payload, None, 0.0).await?;
    assert!(outcome.applied);
    assert_eq!(outcome.job_status, JobStatus::Completed);

    // Re-finalizing the same run is a no-op.
    let replay = scm_db::finish_job(&pool, job_id, &payload, None, 0.0).await?;
    assert!(!replay.applied);

    let run = scm_db::get_sync_run(&pool, run_id).await?.expect("run row");
    let stored_counts = run.counts.expect("counts stored");
    assert_eq!(stored_counts["synced_count"], 100);
    assert_eq!(stored_counts["diff_count"], 95);
    assert_eq!(stored_counts["total_429_hits"], 3);
    assert_eq!(run.synced_count, Some(100));

    let (ok, missing, type_errors) = validate_counts_schema(&stored_counts);
    assert!(ok);
    assert!(missing.is_empty());
    assert!(type_errors.is_empty());

    Ok(())
}

#[tokio::test]
async fn reaper_escalates_exhausted_job_to_dead() -> Result<()> {
    let Some(pool) = pool_or_skip().await else {
        return Ok(());
    };

    let repo_id = scm_db::upsert_repo(&pool, "git", &unique_url("reap"), "acme/reap", None).await?;
    let job_id = scm_db::enqueue_sync_job(&pool, repo_id, "mrs", SyncMode::Incremental, 2000, 3, None)
        .await?
        .expect("enqueued");

    // Simulate a crashed worker: running, attempts exhausted, lease long gone.
    sqlx::query(
        r#"
        update scm.sync_jobs
        set status = 'running',
            attempts = 3,
            locked_by = 'worker-dead',
            locked_at = now() - interval '600 seconds',
            lease_seconds = 300
        where job_id = $1
        "#,
    )
    .bind(job_id)
    .execute(&pool)
    .await?;

    let expired = scm_db::list_expired_running_jobs(&pool, 60, 100).await?;
    let target = expired
        .iter()
        .find(|j| j.job_id == job_id)
        .expect("expired job detected");
    assert!(target.attempts >= target.max_attempts);

    assert!(
        scm_db::mark_job_as_dead_by_reaper(&pool, job_id, "Reaped: lease expired, max attempts")
            .await?
    );

    let jobs = scm_db::list_sync_jobs(
        &pool,
        &scm_db::JobFilter {
            repo_id: Some(repo_id),
            ..Default::default()
        },
    )
    .await?;
    let job = jobs.iter().find(|j| j.job_id == job_id).expect("job row");
    assert_eq!(job.status, JobStatus::Dead);
    assert!(job.locked_by.is_none());
    assert!(job.last_error.as_deref().unwrap().contains("Reaped"));
    assert!(job.last_error.as_deref().unwrap().contains("max attempts"));

    Ok(())
}

#[tokio::test]
async fn cursor_kv_upgrades_v1_on_read() -> Result<()> {
    let Some(pool) = pool_or_skip().await else {
        return Ok(());
    };

    let repo_id = scm_db::upsert_repo(&pool, "svn", &unique_url("cursor"), "acme/cursor", None).await?;

    // Seed a v1 (flat) cursor blob directly.
    scm_db::set_cursor_raw(
        &pool,
        repo_id,
        "svn",
        &json!({"last_rev": 500, "last_sync_at": "2024-01-15T10:30:00Z", "last_sync_count": 50}),
    )
    .await?;

    let entry = scm_db::load_cursor(&pool, repo_id, "svn").await?.expect("cursor");
    assert_eq!(entry.cursor.version, 2);
    assert_eq!(entry.cursor.last_rev(), 500);
    assert_eq!(entry.cursor.last_sync_count(), 50);

    // The stored blob is still v1; upgrade happens on read only.
    let raw = scm_db::get_cursor_raw(&pool, repo_id, "svn").await?.expect("raw");
    assert!(raw.get("version").is_none());

    Ok(())
}
