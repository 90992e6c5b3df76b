use std::time::Duration;

use chrono::Utc;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::job::{JobSnapshot, JobState};
use crate::models::violation::Violation;

const WAITING_KEY: &str = "billing_validate:jobs:waiting";
const ACTIVE_KEY: &str = "billing_validate:jobs:active";
const DELAYED_KEY: &str = "billing_validate:jobs:delayed";
const COMPLETED_KEY: &str = "billing_validate:jobs:completed";
const DEAD_LETTER_KEY: &str = "billing_validate:dead_letter";
const SAMPLES_KEY: &str = "billing_validate:throughput_samples";
const JOB_KEY_PREFIX: &str = "billing_validate:job:";
const PREVIEW_KEY_PREFIX: &str = "billing_validate:preview:";

/// Retry policy: 5 attempts with exponential backoff starting at 2s.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const BACKOFF_BASE: Duration = Duration::from_secs(2);

/// Completed jobs are kept for inspection for 1 hour or the last 100,
/// whichever limit hits first.
const COMPLETED_RETENTION_SECS: i64 = 3600;
const COMPLETED_KEEP: isize = 100;

/// Dead-letter entries outlive the main queue's retention for postmortems.
const DEAD_LETTER_RETENTION_DAYS: i64 = 30;

/// Successfully dead-lettered job hashes expire on the same schedule.
const DEAD_LETTERED_JOB_TTL_SECS: i64 = DEAD_LETTER_RETENTION_DAYS * 24 * 3600;

/// Moving window of completed-job throughput observations.
const THROUGHPUT_SAMPLE_KEEP: isize = 50;

/// Fallback processing rate when no history exists: ~1s per 50KB.
const FALLBACK_BYTES_PER_MS: f64 = 50.0 * 1024.0 / 1000.0;
const ESTIMATE_SAFETY_MARGIN: f64 = 1.2;
const ESTIMATE_FLOOR: Duration = Duration::from_secs(5);

/// Cached "first N violations" preview for live consumption.
const PREVIEW_LIMIT: usize = 10;
const PREVIEW_TTL_SECS: i64 = 300;

/// Job payload serialized into Redis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub job_id: String,
    pub run_id: Uuid,
    pub file_path: String,
    pub attempt: u32,
}

/// Copy of a terminally-failed job, retained for postmortem inspection.
/// Append-only; never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job_id: String,
    pub run_id: Uuid,
    pub file_path: String,
    pub failure_reason: String,
    pub attempts: u32,
    pub failed_at: chrono::DateTime<Utc>,
}

/// What the queue decided to do with a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum JobDisposal {
    /// Another attempt was scheduled after the given delay.
    Retried { attempt: u32, delay: Duration },
    /// Attempts exhausted; the job was copied to the dead-letter store.
    DeadLettered,
}

/// Redis-backed durable job queue for validation runs.
///
/// One job per run: the job identifier is derived from the run identifier,
/// so re-enqueueing the same run is idempotent.
pub struct JobQueue {
    client: redis::Client,
}

impl JobQueue {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self { client })
    }

    /// Deterministic job identity for a run.
    pub fn job_id_for_run(run_id: Uuid) -> String {
        format!("validate-{run_id}")
    }

    fn job_key(job_id: &str) -> String {
        format!("{JOB_KEY_PREFIX}{job_id}")
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }

    /// Admit a validation job for a run.
    ///
    /// If a non-terminal job already exists for this run, its identifier is
    /// returned unchanged and nothing is enqueued (idempotent admission).
    /// A terminal or unknown prior job is replaced by a fresh one.
    pub async fn enqueue(&self, run_id: Uuid, file_path: &str) -> Result<String, QueueError> {
        let job_id = Self::job_id_for_run(run_id);
        let key = Self::job_key(&job_id);
        let mut conn = self.conn().await?;

        let existing: Option<String> = conn.hget(&key, "state").await.map_err(QueueError::Redis)?;
        if let Some(state) = existing {
            if matches!(state.as_str(), "waiting" | "active" | "delayed") {
                debug!(job_id = %job_id, state = %state, "duplicate enqueue ignored");
                return Ok(job_id);
            }
        }

        conn.del::<_, ()>(&key).await.map_err(QueueError::Redis)?;
        conn.hset_multiple::<_, _, _, ()>(
            &key,
            &[
                ("run_id", run_id.to_string()),
                ("file_path", file_path.to_string()),
                ("state", "waiting".to_string()),
                ("attempts", "0".to_string()),
                ("max_attempts", DEFAULT_MAX_ATTEMPTS.to_string()),
                ("progress", "0".to_string()),
                ("cancelled", "0".to_string()),
                ("enqueued_at", Utc::now().to_rfc3339()),
            ],
        )
        .await
        .map_err(QueueError::Redis)?;

        conn.lpush::<_, _, ()>(WAITING_KEY, &job_id)
            .await
            .map_err(QueueError::Redis)?;

        Ok(job_id)
    }

    /// Claim the oldest runnable job, promoting any delayed retries whose
    /// backoff has elapsed first.
    pub async fn dequeue(&self) -> Result<Option<QueuedJob>, QueueError> {
        let mut conn = self.conn().await?;
        self.promote_due_delayed(&mut conn).await?;

        let claimed: Option<String> = conn
            .rpoplpush(WAITING_KEY, ACTIVE_KEY)
            .await
            .map_err(QueueError::Redis)?;

        let Some(job_id) = claimed else {
            return Ok(None);
        };

        let key = Self::job_key(&job_id);
        let (run_id, file_path): (Option<String>, Option<String>) = (
            conn.hget(&key, "run_id").await.map_err(QueueError::Redis)?,
            conn.hget(&key, "file_path").await.map_err(QueueError::Redis)?,
        );

        let (Some(run_id), Some(file_path)) = (run_id, file_path) else {
            // Orphaned id with no bookkeeping; drop it.
            warn!(job_id = %job_id, "claimed job has no metadata, discarding");
            conn.lrem::<_, _, ()>(ACTIVE_KEY, 1, &job_id)
                .await
                .map_err(QueueError::Redis)?;
            return Ok(None);
        };

        let run_id = run_id.parse().map_err(|_| QueueError::Corrupt(job_id.clone()))?;
        let attempt: u32 = conn
            .hincr::<_, _, _, i64>(&key, "attempts", 1)
            .await
            .map_err(QueueError::Redis)? as u32;

        let started_at = Utc::now().to_rfc3339();
        conn.hset_multiple::<_, _, _, ()>(
            &key,
            &[("state", "active"), ("started_at", started_at.as_str())],
        )
        .await
        .map_err(QueueError::Redis)?;

        Ok(Some(QueuedJob {
            job_id,
            run_id,
            file_path,
            attempt,
        }))
    }

    async fn promote_due_delayed(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
    ) -> Result<(), QueueError> {
        let now = Utc::now().timestamp_millis();
        let due: Vec<String> = conn
            .zrangebyscore(DELAYED_KEY, 0, now)
            .await
            .map_err(QueueError::Redis)?;

        for job_id in due {
            conn.zrem::<_, _, ()>(DELAYED_KEY, &job_id)
                .await
                .map_err(QueueError::Redis)?;
            conn.hset::<_, _, _, ()>(Self::job_key(&job_id), "state", "waiting")
                .await
                .map_err(QueueError::Redis)?;
            conn.lpush::<_, _, ()>(WAITING_KEY, &job_id)
                .await
                .map_err(QueueError::Redis)?;
            debug!(job_id = %job_id, "delayed job promoted to waiting");
        }

        Ok(())
    }

    /// Finalize a successful job: drop active bookkeeping, mark completed,
    /// and apply the completed-job retention policy.
    pub async fn complete(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let key = Self::job_key(&job.job_id);
        let mut conn = self.conn().await?;

        conn.lrem::<_, _, ()>(ACTIVE_KEY, 1, &job.job_id)
            .await
            .map_err(QueueError::Redis)?;
        let finished_at = Utc::now().to_rfc3339();
        conn.hset_multiple::<_, _, _, ()>(
            &key,
            &[
                ("state", "completed"),
                ("progress", "100"),
                ("finished_at", finished_at.as_str()),
            ],
        )
        .await
        .map_err(QueueError::Redis)?;
        conn.expire::<_, ()>(&key, COMPLETED_RETENTION_SECS)
            .await
            .map_err(QueueError::Redis)?;

        conn.lpush::<_, _, ()>(COMPLETED_KEY, &job.job_id)
            .await
            .map_err(QueueError::Redis)?;
        conn.ltrim::<_, ()>(COMPLETED_KEY, 0, COMPLETED_KEEP - 1)
            .await
            .map_err(QueueError::Redis)?;

        Ok(())
    }

    /// Decide what happens to a failed attempt: schedule a backoff retry, or
    /// exhaust the job into the dead-letter store.
    pub async fn retry_or_fail(
        &self,
        job: &QueuedJob,
        failure: &str,
    ) -> Result<JobDisposal, QueueError> {
        let key = Self::job_key(&job.job_id);
        let mut conn = self.conn().await?;

        conn.lrem::<_, _, ()>(ACTIVE_KEY, 1, &job.job_id)
            .await
            .map_err(QueueError::Redis)?;
        conn.hset::<_, _, _, ()>(&key, "failure", failure)
            .await
            .map_err(QueueError::Redis)?;

        if job.attempt < DEFAULT_MAX_ATTEMPTS {
            let delay = backoff_delay(job.attempt);
            let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;

            conn.hset::<_, _, _, ()>(&key, "state", "delayed")
                .await
                .map_err(QueueError::Redis)?;
            conn.zadd::<_, _, _, ()>(DELAYED_KEY, &job.job_id, ready_at)
                .await
                .map_err(QueueError::Redis)?;

            return Ok(JobDisposal::Retried {
                attempt: job.attempt,
                delay,
            });
        }

        let finished_at = Utc::now().to_rfc3339();
        conn.hset_multiple::<_, _, _, ()>(
            &key,
            &[("state", "failed"), ("finished_at", finished_at.as_str())],
        )
        .await
        .map_err(QueueError::Redis)?;

        // Best-effort transfer. The failed job hash is only put on a
        // retention clock once the copy succeeds, so a failed transfer
        // leaves the job inspectable in the queue.
        if self.move_to_dead_letter(job, failure).await {
            conn.expire::<_, ()>(&key, DEAD_LETTERED_JOB_TTL_SECS)
                .await
                .map_err(QueueError::Redis)?;
        }

        Ok(JobDisposal::DeadLettered)
    }

    /// Copy a terminally-failed job into the dead-letter store. Failures are
    /// logged, not propagated. Returns whether the copy succeeded.
    pub async fn move_to_dead_letter(&self, job: &QueuedJob, reason: &str) -> bool {
        let entry = DeadLetterEntry {
            job_id: job.job_id.clone(),
            run_id: job.run_id,
            file_path: job.file_path.clone(),
            failure_reason: reason.to_string(),
            attempts: job.attempt,
            failed_at: Utc::now(),
        };

        match self.push_dead_letter(&entry).await {
            Ok(()) => true,
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "dead-letter transfer failed, job retained in queue");
                false
            }
        }
    }

    async fn push_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(entry).map_err(QueueError::Serialize)?;
        let now = entry.failed_at.timestamp();

        conn.zadd::<_, _, _, ()>(DEAD_LETTER_KEY, payload, now)
            .await
            .map_err(QueueError::Redis)?;

        // Prune entries past the retention window.
        let cutoff = now - DEAD_LETTER_RETENTION_DAYS * 24 * 3600;
        conn.zrembyscore::<_, _, _, ()>(DEAD_LETTER_KEY, 0, cutoff)
            .await
            .map_err(QueueError::Redis)?;

        Ok(())
    }

    /// Most recent dead-letter entries, newest first.
    pub async fn dead_letters(&self, limit: isize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let mut conn = self.conn().await?;
        let raw: Vec<String> = conn
            .zrevrange(DEAD_LETTER_KEY, 0, limit - 1)
            .await
            .map_err(QueueError::Redis)?;

        raw.iter()
            .map(|p| serde_json::from_str(p).map_err(QueueError::Serialize))
            .collect()
    }

    /// Request cancellation of a job.
    ///
    /// Permitted only while the job is waiting or active. Cancelling a
    /// waiting job guarantees it never starts; cancelling an active job only
    /// removes queue bookkeeping and raises the cooperative flag — code
    /// already executing inside the worker may still run to its next
    /// checkpoint.
    pub async fn cancel(&self, job_id: &str) -> Result<bool, QueueError> {
        let key = Self::job_key(job_id);
        let mut conn = self.conn().await?;

        let state: Option<String> = conn.hget(&key, "state").await.map_err(QueueError::Redis)?;
        let Some(state) = state else {
            warn!(job_id = %job_id, "cancel requested for unknown job");
            return Ok(false);
        };

        match state.as_str() {
            "waiting" => {
                conn.lrem::<_, _, ()>(WAITING_KEY, 0, job_id)
                    .await
                    .map_err(QueueError::Redis)?;
            }
            "active" => {
                conn.lrem::<_, _, ()>(ACTIVE_KEY, 0, job_id)
                    .await
                    .map_err(QueueError::Redis)?;
            }
            other => {
                warn!(job_id = %job_id, state = other, "cancel requested in non-cancellable state");
                return Ok(false);
            }
        }

        let finished_at = Utc::now().to_rfc3339();
        conn.hset_multiple::<_, _, _, ()>(
            &key,
            &[
                ("state", "failed"),
                ("cancelled", "1"),
                ("failure", "cancelled by operator"),
                ("finished_at", finished_at.as_str()),
            ],
        )
        .await
        .map_err(QueueError::Redis)?;

        Ok(true)
    }

    /// Cooperative cancellation token, checked by workers at checkpoints.
    pub async fn is_cancelled(&self, job_id: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn().await?;
        let flag: Option<String> = conn
            .hget(Self::job_key(job_id), "cancelled")
            .await
            .map_err(QueueError::Redis)?;
        Ok(flag.as_deref() == Some("1"))
    }

    /// Read-only snapshot of a job's queue-side state.
    pub async fn status(&self, job_id: &str) -> Result<JobSnapshot, QueueError> {
        let key = Self::job_key(job_id);
        let mut conn = self.conn().await?;

        let state: Option<String> = conn.hget(&key, "state").await.map_err(QueueError::Redis)?;
        let Some(state) = state else {
            return Ok(JobSnapshot {
                state: JobState::Unknown,
                progress: 0,
                failure: None,
            });
        };

        let progress: Option<String> = conn.hget(&key, "progress").await.map_err(QueueError::Redis)?;
        let failure: Option<String> = conn.hget(&key, "failure").await.map_err(QueueError::Redis)?;

        Ok(JobSnapshot {
            state: state.parse().unwrap_or(JobState::Unknown),
            progress: progress.and_then(|p| p.parse().ok()).unwrap_or(0),
            failure,
        })
    }

    /// 1-indexed FIFO rank of a waiting job, at read time.
    ///
    /// Approximate: concurrent admissions and removals can change the rank
    /// between reads. Defined only for waiting jobs.
    pub async fn queue_position(&self, job_id: &str) -> Result<Option<usize>, QueueError> {
        let snapshot = self.status(job_id).await?;
        if snapshot.state != JobState::Waiting {
            return Ok(None);
        }

        let mut conn = self.conn().await?;
        let waiting: Vec<String> = conn
            .lrange(WAITING_KEY, 0, -1)
            .await
            .map_err(QueueError::Redis)?;

        // LPUSH puts newest at the head; the claim side pops from the tail.
        Ok(waiting
            .iter()
            .position(|id| id == job_id)
            .map(|idx| waiting.len() - idx))
    }

    /// Write a progress checkpoint to the job's native progress field.
    /// Values only move forward.
    pub async fn record_progress(&self, job_id: &str, progress: i32) -> Result<(), QueueError> {
        let key = Self::job_key(job_id);
        let mut conn = self.conn().await?;

        let current: Option<String> = conn.hget(&key, "progress").await.map_err(QueueError::Redis)?;
        let current: i32 = current.and_then(|p| p.parse().ok()).unwrap_or(0);
        let next = progress.clamp(0, 100).max(current);

        conn.hset::<_, _, _, ()>(&key, "progress", next)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Record one completed job's observed throughput for ETA estimation.
    pub async fn record_throughput_sample(
        &self,
        bytes: u64,
        elapsed: Duration,
    ) -> Result<(), QueueError> {
        let elapsed_ms = elapsed.as_millis().max(1) as f64;
        let rate = bytes as f64 / elapsed_ms;

        let mut conn = self.conn().await?;
        conn.lpush::<_, _, ()>(SAMPLES_KEY, rate.to_string())
            .await
            .map_err(QueueError::Redis)?;
        conn.ltrim::<_, ()>(SAMPLES_KEY, 0, THROUGHPUT_SAMPLE_KEEP - 1)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Estimate processing duration for a file from recent job throughput.
    /// Advisory only.
    pub async fn estimate_duration(&self, file_size_bytes: u64) -> Result<Duration, QueueError> {
        let mut conn = self.conn().await?;
        let raw: Vec<String> = conn
            .lrange(SAMPLES_KEY, 0, -1)
            .await
            .map_err(QueueError::Redis)?;

        let samples: Vec<f64> = raw.iter().filter_map(|s| s.parse().ok()).collect();
        Ok(estimate_from_samples(file_size_bytes, &samples))
    }

    /// Cache the first violations of a run for live preview consumption.
    /// Best-effort; failures are logged.
    pub async fn cache_result_preview(&self, run_id: Uuid, violations: &[Violation]) {
        let preview: Vec<&Violation> = violations.iter().take(PREVIEW_LIMIT).collect();
        let key = format!("{PREVIEW_KEY_PREFIX}{run_id}");

        let outcome: Result<(), QueueError> = async {
            let payload = serde_json::to_string(&preview).map_err(QueueError::Serialize)?;
            let mut conn = self.conn().await?;
            conn.set_ex::<_, _, ()>(&key, payload, PREVIEW_TTL_SECS as u64)
                .await
                .map_err(QueueError::Redis)?;
            Ok(())
        }
        .await;

        if let Err(e) = outcome {
            warn!(run_id = %run_id, error = %e, "failed to cache result preview");
        }
    }

    pub async fn result_preview(&self, run_id: Uuid) -> Result<Option<Vec<Violation>>, QueueError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn
            .get(format!("{PREVIEW_KEY_PREFIX}{run_id}"))
            .await
            .map_err(QueueError::Redis)?;

        raw.map(|p| serde_json::from_str(&p).map_err(QueueError::Serialize))
            .transpose()
    }

    /// Check Redis connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Current number of waiting jobs.
    pub async fn queue_depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn().await?;
        let depth: u64 = conn.llen(WAITING_KEY).await.map_err(QueueError::Redis)?;
        Ok(depth)
    }
}

/// Exponential backoff: 2s, 4s, 8s, 16s for attempts 1..=4.
pub fn backoff_delay(failed_attempt: u32) -> Duration {
    BACKOFF_BASE * 2u32.pow(failed_attempt.saturating_sub(1).min(16))
}

/// Pure estimation core: mean observed bytes/ms, fixed-rate fallback when no
/// history exists, 20% safety margin, 5s floor.
pub fn estimate_from_samples(file_size_bytes: u64, samples: &[f64]) -> Duration {
    let rate = if samples.is_empty() {
        FALLBACK_BYTES_PER_MS
    } else {
        samples.iter().sum::<f64>() / samples.len() as f64
    };

    let millis = (file_size_bytes as f64 / rate.max(f64::MIN_POSITIVE)) * ESTIMATE_SAFETY_MARGIN;
    Duration::from_millis(millis as u64).max(ESTIMATE_FLOOR)
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("corrupt job bookkeeping for {0}")]
    Corrupt(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_identity_is_deterministic() {
        let run_id = Uuid::nil();
        assert_eq!(
            JobQueue::job_id_for_run(run_id),
            JobQueue::job_id_for_run(run_id)
        );
        assert_eq!(
            JobQueue::job_id_for_run(run_id),
            "validate-00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn backoff_doubles_from_two_seconds() {
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
        assert_eq!(backoff_delay(4), Duration::from_secs(16));
    }

    #[test]
    fn estimate_falls_back_without_history() {
        // 500 KB at ~50 KB/s is ~10s, times the 1.2 margin.
        let d = estimate_from_samples(500 * 1024, &[]);
        assert!(d >= Duration::from_millis(11_900) && d <= Duration::from_millis(12_100));
    }

    #[test]
    fn estimate_uses_observed_rate() {
        // 100 bytes/ms observed; 1 MB -> ~10.5s, times margin -> ~12.6s.
        let d = estimate_from_samples(1024 * 1024, &[100.0]);
        assert!(d > Duration::from_secs(12) && d < Duration::from_secs(13));
    }

    #[test]
    fn estimate_has_a_floor() {
        assert_eq!(estimate_from_samples(10, &[1000.0]), Duration::from_secs(5));
        assert_eq!(estimate_from_samples(0, &[]), Duration::from_secs(5));
    }

    #[test]
    fn dead_letter_entry_roundtrips() {
        let entry = DeadLetterEntry {
            job_id: "validate-x".to_string(),
            run_id: Uuid::nil(),
            file_path: "/tmp/claims.csv".to_string(),
            failure_reason: "database unavailable".to_string(),
            attempts: 5,
            failed_at: Utc::now(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        let back: DeadLetterEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back.attempts, 5);
        assert_eq!(back.job_id, entry.job_id);
    }
}
