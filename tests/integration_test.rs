use std::sync::Arc;

use billing_validate::{
    config::AppConfig,
    db::{self, queries},
    models::job::JobState,
    models::run::RunStatus,
    services::{
        files::FileStore,
        queue::{JobDisposal, JobQueue, QueuedJob},
        rules::RuleEngine,
        worker::WorkerPool,
    },
};
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

/// Shared setup for the live-service tests.
///
/// Note: these require a running PostgreSQL and Redis instance configured
/// via environment variables, and share one queue, so run them serially:
/// cargo test --test integration_test -- --ignored --test-threads=1
async fn setup() -> (AppConfig, PgPool, JobQueue, FileStore) {
    let config = AppConfig::from_env().expect("Failed to load config");

    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run migrations");

    let queue = JobQueue::new(&config.redis_url).expect("Failed to initialize queue");

    let files = FileStore::new(&config.upload_dir);
    files.init().await.expect("Failed to init upload dir");

    (config, db_pool, queue, files)
}

/// A CSV with `rows` valid lines plus one row carrying an invalid date.
fn csv_with_one_bad_row(rows: usize) -> String {
    let mut out = String::from("patient_id,billing_code,amount,units,service_date\n");
    for i in 0..rows {
        out.push_str(&format!(
            "PAT{:05},9162,49.80,1,2026-07-{:02}\n",
            i,
            (i % 28) + 1
        ));
    }
    out.push_str("PAT99999,9162,49.80,1,not-a-date\n");
    out
}

fn worker_pool(
    config: &AppConfig,
    db_pool: PgPool,
    queue: JobQueue,
    files: FileStore,
) -> WorkerPool {
    let engine = RuleEngine::with_default_rules(
        config.amount_ceiling,
        config.claim_window_days,
        Utc::now().date_naive(),
    );
    WorkerPool::new(
        db_pool,
        Arc::new(queue),
        Arc::new(files),
        Arc::new(engine),
        1,
    )
}

/// Full pipeline: a 174-row file with one invalid date row completes with
/// partial-row errors recorded, progress 100, and the source file deleted.
#[tokio::test]
#[ignore]
async fn test_pipeline_completes_with_partial_row_errors() {
    let (config, db_pool, queue, files) = setup().await;

    let csv = csv_with_one_bad_row(173);
    let file_path = files
        .save("claims.csv", csv.as_bytes())
        .await
        .expect("Failed to store upload");

    let run = queries::create_run(&db_pool, &file_path, "claims.csv", Some("test-user"))
        .await
        .expect("Failed to create run");

    let job_id = queue
        .enqueue(run.id, &file_path)
        .await
        .expect("Failed to enqueue");
    queries::set_run_job(&db_pool, run.id, &job_id)
        .await
        .expect("Failed to link job");

    let pool = worker_pool(&config, db_pool.clone(), queue, files);

    // Drain the queue until our job has been picked up and finished.
    let mut processed = false;
    for _ in 0..20 {
        match pool.process_next_job().await.expect("worker error") {
            true => {
                let current = queries::get_run(&db_pool, run.id).await.unwrap().unwrap();
                if current.status.is_terminal() {
                    processed = true;
                    break;
                }
            }
            false => tokio::time::sleep(std::time::Duration::from_millis(200)).await,
        }
    }
    assert!(processed, "job never reached a terminal state");

    let done = queries::get_run(&db_pool, run.id).await.unwrap().unwrap();
    assert_eq!(done.status, RunStatus::Completed);
    assert_eq!(done.progress, 100);
    assert!(done.error_count >= 1, "bad date row must be recorded");

    // PHI input must not persist past processing.
    assert!(!tokio::fs::try_exists(&done.file_path).await.unwrap_or(true));

    let records = queries::fetch_records(&db_pool, run.id).await.unwrap();
    assert_eq!(records.len(), 173);
    assert_eq!(records[0].record_number, 1);

    let total = queries::count_results(&db_pool, run.id).await.unwrap();
    assert!(total >= 1);
}

/// Enqueueing the same run twice yields exactly one job.
#[tokio::test]
#[ignore]
async fn test_enqueue_is_idempotent_per_run() {
    let (_config, db_pool, queue, files) = setup().await;

    let file_path = files.save("dup.csv", b"patient_id,billing_code,amount,service_date\n").await.unwrap();
    let run = queries::create_run(&db_pool, &file_path, "dup.csv", None)
        .await
        .unwrap();

    let depth_before = queue.queue_depth().await.unwrap();
    let first = queue.enqueue(run.id, &file_path).await.unwrap();
    let second = queue.enqueue(run.id, &file_path).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(queue.queue_depth().await.unwrap(), depth_before + 1);

    // Cleanup so later tests see an empty queue.
    assert!(queue.cancel(&first).await.unwrap());
}

/// Cancelling a waiting job guarantees it never transitions to active.
#[tokio::test]
#[ignore]
async fn test_cancel_waiting_job_never_starts() {
    let (_config, db_pool, queue, files) = setup().await;

    let file_path = files.save("cancel.csv", b"x\n").await.unwrap();
    let run = queries::create_run(&db_pool, &file_path, "cancel.csv", None)
        .await
        .unwrap();
    let job_id = queue.enqueue(run.id, &file_path).await.unwrap();

    assert!(queue.cancel(&job_id).await.unwrap());

    let snapshot = queue.status(&job_id).await.unwrap();
    assert_eq!(snapshot.state, JobState::Failed);
    assert!(queue.is_cancelled(&job_id).await.unwrap());
    assert_eq!(queue.queue_position(&job_id).await.unwrap(), None);

    // A second cancel is a no-op on a terminal job.
    assert!(!queue.cancel(&job_id).await.unwrap());

    // The job must never be claimable.
    while let Some(job) = queue.dequeue().await.unwrap() {
        assert_ne!(job.job_id, job_id, "cancelled job was dequeued");
        queue.complete(&job).await.unwrap();
    }
}

/// Queue position is defined only for waiting jobs.
#[tokio::test]
#[ignore]
async fn test_queue_position_null_once_active() {
    let (_config, db_pool, queue, files) = setup().await;

    let file_path = files.save("pos.csv", b"x\n").await.unwrap();
    let run = queries::create_run(&db_pool, &file_path, "pos.csv", None)
        .await
        .unwrap();
    let job_id = queue.enqueue(run.id, &file_path).await.unwrap();

    let position = queue.queue_position(&job_id).await.unwrap();
    assert!(position.is_some_and(|p| p >= 1));

    // Claim it; position must become null, not a number.
    let mut claimed = None;
    while let Some(job) = queue.dequeue().await.unwrap() {
        if job.job_id == job_id {
            claimed = Some(job);
            break;
        }
        queue.complete(&job).await.unwrap();
    }
    let claimed = claimed.expect("job was not claimable");

    assert_eq!(queue.status(&job_id).await.unwrap().state, JobState::Active);
    assert_eq!(queue.queue_position(&job_id).await.unwrap(), None);

    queue.complete(&claimed).await.unwrap();
}

/// A job that exhausts all attempts lands in the dead-letter store with its
/// attempt count, and the run is marked failed by the worker path.
#[tokio::test]
#[ignore]
async fn test_exhausted_job_is_dead_lettered() {
    let (_config, db_pool, queue, files) = setup().await;

    let file_path = files.save("dead.csv", b"x\n").await.unwrap();
    let run = queries::create_run(&db_pool, &file_path, "dead.csv", None)
        .await
        .unwrap();
    let job_id = queue.enqueue(run.id, &file_path).await.unwrap();

    // Simulate the final failed attempt.
    let job = QueuedJob {
        job_id: job_id.clone(),
        run_id: run.id,
        file_path: file_path.clone(),
        attempt: 5,
    };
    let disposal = queue
        .retry_or_fail(&job, "database connection refused")
        .await
        .unwrap();
    assert_eq!(disposal, JobDisposal::DeadLettered);

    queries::mark_run_failed(&db_pool, run.id, "database connection refused")
        .await
        .unwrap();

    let entries = queue.dead_letters(50).await.unwrap();
    let entry = entries
        .iter()
        .find(|e| e.job_id == job_id)
        .expect("dead-letter entry missing");
    assert_eq!(entry.attempts, 5);
    assert_eq!(entry.run_id, run.id);

    let failed = queries::get_run(&db_pool, run.id).await.unwrap().unwrap();
    assert_eq!(failed.status, RunStatus::Failed);
}

/// A failed attempt below the cap is delayed with exponential backoff.
#[tokio::test]
#[ignore]
async fn test_failed_attempt_is_delayed_for_retry() {
    let (_config, db_pool, queue, files) = setup().await;

    let file_path = files.save("retry.csv", b"x\n").await.unwrap();
    let run = queries::create_run(&db_pool, &file_path, "retry.csv", None)
        .await
        .unwrap();
    let job_id = queue.enqueue(run.id, &file_path).await.unwrap();

    let job = QueuedJob {
        job_id: job_id.clone(),
        run_id: run.id,
        file_path: file_path.clone(),
        attempt: 1,
    };
    let disposal = queue.retry_or_fail(&job, "transient broker error").await.unwrap();
    assert_eq!(
        disposal,
        JobDisposal::Retried {
            attempt: 1,
            delay: std::time::Duration::from_secs(2)
        }
    );
    assert_eq!(queue.status(&job_id).await.unwrap().state, JobState::Delayed);

    // After the backoff elapses the job is promoted back to waiting.
    tokio::time::sleep(std::time::Duration::from_millis(2200)).await;
    let mut reclaimed = false;
    while let Some(next) = queue.dequeue().await.unwrap() {
        if next.job_id == job_id {
            assert_eq!(next.attempt, 2);
            reclaimed = true;
            queue.complete(&next).await.unwrap();
            break;
        }
        queue.complete(&next).await.unwrap();
    }
    assert!(reclaimed, "delayed job was not promoted");
}
