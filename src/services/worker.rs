use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::db::queries;
use crate::models::violation::{Severity, Violation};
use crate::services::files::{FileStore, FileStoreError};
use crate::services::parser::{self, ParseError};
use crate::services::queue::{JobDisposal, JobQueue, QueueError, QueuedJob};
use crate::services::rules::RuleEngine;

const POLL_INTERVAL: Duration = Duration::from_millis(1000);

// Progress checkpoints. Parsing owns the 0..=75 span; later stages are fixed
// marks so a status poll can tell the stages apart.
const PARSE_SPAN: f64 = 75.0;
const RECORDS_PERSISTED: i32 = 80;
const RULES_EVALUATED: i32 = 90;
const RESULTS_PERSISTED: i32 = 95;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("file error: {0}")]
    File(String),

    #[error("file error: {0}")]
    Parse(#[from] ParseError),

    #[error("file store error: {0}")]
    Store(#[from] FileStoreError),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// The job's cancellation flag was raised; stop without retrying.
    #[error("job cancelled")]
    Cancelled,
}

/// Bounded-concurrency consumer that drives jobs through
/// parse -> persist -> evaluate -> persist -> cleanup.
pub struct WorkerPool {
    db: PgPool,
    queue: Arc<JobQueue>,
    files: Arc<FileStore>,
    engine: Arc<RuleEngine>,
    concurrency: usize,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(
        db: PgPool,
        queue: Arc<JobQueue>,
        files: Arc<FileStore>,
        engine: Arc<RuleEngine>,
        concurrency: usize,
    ) -> Self {
        Self {
            db,
            queue,
            files,
            engine,
            concurrency: concurrency.max(1),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn the worker tasks. Each task polls the queue independently; the
    /// configured concurrency bounds how many jobs run at once per process.
    pub fn start(self: &Arc<Self>) -> WorkerHandles {
        let mut tasks = Vec::with_capacity(self.concurrency);

        for worker_id in 0..self.concurrency {
            let pool = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                pool.run_loop(worker_id).await;
            }));
        }

        info!(workers = self.concurrency, "worker pool started");
        WorkerHandles {
            shutdown: Arc::clone(&self.shutdown),
            tasks,
        }
    }

    async fn run_loop(&self, worker_id: usize) {
        while !self.shutdown.load(Ordering::Relaxed) {
            match self.process_next_job().await {
                Ok(true) => {
                    debug!(worker_id, "job processed, checking for next job");
                }
                Ok(false) => {
                    sleep(POLL_INTERVAL).await;
                }
                Err(e) => {
                    error!(worker_id, error = %e, "error processing job, will retry");
                    sleep(POLL_INTERVAL).await;
                }
            }
        }
        info!(worker_id, "worker stopped");
    }

    /// Process the next job from the queue.
    /// Returns Ok(true) if a job was processed, Ok(false) if no job available.
    pub async fn process_next_job(&self) -> Result<bool, WorkerError> {
        let job = match self.queue.dequeue().await? {
            Some(j) => j,
            None => return Ok(false),
        };

        info!(
            job_id = %job.job_id,
            run_id = %job.run_id,
            attempt = job.attempt,
            "processing validation job"
        );

        let started = Instant::now();
        match self.process_job(&job).await {
            Ok(summary) => {
                self.queue.complete(&job).await?;
                if let Err(e) = self
                    .queue
                    .record_throughput_sample(summary.file_bytes, started.elapsed())
                    .await
                {
                    debug!(job_id = %job.job_id, error = %e, "throughput sample not recorded");
                }

                metrics::counter!("validation_jobs_completed").increment(1);
                metrics::histogram!("validation_processing_seconds")
                    .record(started.elapsed().as_secs_f64());

                info!(
                    job_id = %job.job_id,
                    run_id = %job.run_id,
                    records = summary.record_count,
                    errors = summary.error_count,
                    warnings = summary.warning_count,
                    elapsed_ms = started.elapsed().as_millis(),
                    "job completed"
                );
                Ok(true)
            }
            Err(WorkerError::Cancelled) => {
                // The cancellation entry point already marked the run and
                // removed queue bookkeeping; nothing left to do.
                info!(job_id = %job.job_id, run_id = %job.run_id, "job stopped at cancellation checkpoint");
                Ok(true)
            }
            Err(e) => {
                error!(job_id = %job.job_id, run_id = %job.run_id, error = %e, "job processing failed");

                // Durable state first, then hand the failure to the queue's
                // retry machinery to decide retry vs dead-letter.
                let message = e.to_string();
                if let Err(db_err) = queries::mark_run_failed(&self.db, job.run_id, &message).await {
                    error!(run_id = %job.run_id, error = %db_err, "failed to record run failure");
                }

                match self.queue.retry_or_fail(&job, &message).await? {
                    JobDisposal::Retried { attempt, delay } => {
                        info!(
                            job_id = %job.job_id,
                            attempt,
                            delay_ms = delay.as_millis(),
                            "job scheduled for retry"
                        );
                    }
                    JobDisposal::DeadLettered => {
                        metrics::counter!("validation_jobs_failed").increment(1);
                        warn!(
                            job_id = %job.job_id,
                            run_id = %job.run_id,
                            attempts = job.attempt,
                            "job failed after max attempts"
                        );
                    }
                }
                Ok(true)
            }
        }
    }

    /// Per-job pipeline. Any error aborts the current attempt; the caller
    /// records the failure and defers to the retry policy.
    async fn process_job(&self, job: &QueuedJob) -> Result<JobSummary, WorkerError> {
        // 1. Resolve the input file before touching any durable state.
        if !self.files.exists(&job.file_path).await {
            return Err(WorkerError::File(format!(
                "input file not found: {}",
                job.file_path
            )));
        }

        // 2. Claim the run.
        queries::mark_run_processing(&self.db, job.run_id, &job.job_id).await?;

        // 3. Stream-parse with byte-proportional progress over 0..=75.
        let data = self.files.read(&job.file_path).await?;
        let file_bytes = data.len() as u64;
        let outcome = self.parse_with_progress(job, data).await?;
        self.checkpoint(job).await?;

        info!(
            run_id = %job.run_id,
            records = outcome.records.len(),
            row_errors = outcome.violations.len(),
            delimiter = outcome.delimiter,
            "file parsed"
        );

        // 4. Persist parsed records in bounded batches.
        let record_count = queries::replace_records(&self.db, job.run_id, &outcome.records).await?;
        self.write_progress(job, RECORDS_PERSISTED).await;
        self.checkpoint(job).await?;

        // 5. Re-read persisted records so violations can reference stable
        // database identifiers, then evaluate the rule set in one pass.
        let persisted = queries::fetch_records(&self.db, job.run_id).await?;
        let mut violations = outcome.violations;
        violations.extend(self.engine.evaluate(&persisted, job.run_id));
        self.write_progress(job, RULES_EVALUATED).await;
        self.checkpoint(job).await?;

        // 6. Persist violations and cache the live preview.
        queries::replace_results(&self.db, job.run_id, &violations).await?;
        self.queue.cache_result_preview(job.run_id, &violations).await;
        self.write_progress(job, RESULTS_PERSISTED).await;

        // 7. PHI-bearing input must not persist past processing. Deletion
        // failures are logged, never fatal.
        if let Err(e) = self.files.delete(&job.file_path).await {
            warn!(run_id = %job.run_id, error = %e, "failed to delete source file");
        }

        // 8. Terminal state.
        let error_count = count_severity(&violations, Severity::Error);
        let warning_count = count_severity(&violations, Severity::Warning);
        queries::mark_run_completed(&self.db, job.run_id, error_count, warning_count).await?;
        self.queue.record_progress(&job.job_id, 100).await?;

        Ok(JobSummary {
            file_bytes,
            record_count,
            error_count,
            warning_count,
        })
    }

    /// Parsing is CPU-bound; run it on the blocking pool and stream its
    /// progress callbacks back through a channel so checkpoint writes stay
    /// async and throttled.
    async fn parse_with_progress(
        &self,
        job: &QueuedJob,
        data: Vec<u8>,
    ) -> Result<parser::ParseOutcome, WorkerError> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<i32>();

        let parse_task = tokio::task::spawn_blocking(move || {
            let mut last_sent = -1;
            parser::parse_billing_file(&data, |fraction| {
                let pct = (fraction * PARSE_SPAN) as i32;
                // Throttle to 5% steps; the channel is unbounded.
                if pct >= last_sent + 5 || (pct as f64 >= PARSE_SPAN && pct != last_sent) {
                    last_sent = pct;
                    let _ = tx.send(pct);
                }
            })
        });

        while let Some(pct) = rx.recv().await {
            self.write_progress(job, pct).await;
        }

        let outcome = parse_task
            .await
            .map_err(|e| WorkerError::File(format!("parser task failed: {e}")))??;
        Ok(outcome)
    }

    /// Both-sided progress write: queue-native field and durable run row.
    /// Best-effort; a transient miss on one side is reconciled by the
    /// monotonic merge on the status surface.
    async fn write_progress(&self, job: &QueuedJob, progress: i32) {
        if let Err(e) = self.queue.record_progress(&job.job_id, progress).await {
            debug!(job_id = %job.job_id, error = %e, "queue progress write failed");
        }
        if let Err(e) = queries::record_run_progress(&self.db, job.run_id, progress).await {
            debug!(run_id = %job.run_id, error = %e, "run progress write failed");
        }
    }

    /// Cooperative cancellation checkpoint.
    async fn checkpoint(&self, job: &QueuedJob) -> Result<(), WorkerError> {
        if self.queue.is_cancelled(&job.job_id).await? {
            return Err(WorkerError::Cancelled);
        }
        Ok(())
    }
}

fn count_severity(violations: &[Violation], severity: Severity) -> i32 {
    violations.iter().filter(|v| v.severity == severity).count() as i32
}

#[derive(Debug)]
struct JobSummary {
    file_bytes: u64,
    record_count: usize,
    error_count: i32,
    warning_count: i32,
}

/// Handle over the spawned worker tasks.
pub struct WorkerHandles {
    shutdown: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerHandles {
    /// Signal shutdown and wait for in-flight jobs to finish their loop
    /// iteration.
    pub async fn stop(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "worker task panicked");
            }
        }
        info!("all workers have stopped");
    }
}
