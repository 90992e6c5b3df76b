use std::sync::Arc;

use sqlx::PgPool;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::queries;
use crate::models::api::{ErrorInfo, RunStatusResponse};
use crate::models::job::{JobSnapshot, JobState};
use crate::models::run::{RunStatus, ValidationRun};
use crate::services::queue::JobQueue;

/// Failure taxonomy exposed to clients. Raw messages are classified by
/// keyword matching; this is a best-effort heuristic, not a hard contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Queue,
    File,
    Validation,
    Worker,
}

impl ErrorCategory {
    pub fn code(self) -> &'static str {
        match self {
            ErrorCategory::Queue => "QUEUE_ERROR",
            ErrorCategory::File => "FILE_ERROR",
            ErrorCategory::Validation => "VALIDATION_ERROR",
            ErrorCategory::Worker => "WORKER_ERROR",
        }
    }

    pub fn user_message(self) -> &'static str {
        match self {
            ErrorCategory::Queue => {
                "The processing queue is temporarily unavailable. Your file will be retried automatically."
            }
            ErrorCategory::File => {
                "The uploaded file could not be read. Check the file format and submit it again."
            }
            ErrorCategory::Validation => {
                "Validation could not be completed on this file. Review the reported rows and resubmit."
            }
            ErrorCategory::Worker => {
                "An unexpected processing error occurred. Support has been notified."
            }
        }
    }
}

/// Prioritized matcher list, evaluated in order against the lowercased
/// message; first hit wins, so classification is deterministic.
const CATEGORY_RULES: &[(ErrorCategory, &[&str])] = &[
    (
        ErrorCategory::Queue,
        &["redis", "broker", "queue", "connection refused", "timed out", "timeout"],
    ),
    (
        ErrorCategory::File,
        &["file", "no such", "not found", "unreadable", "empty", "column", "csv", "delimiter"],
    ),
    (
        ErrorCategory::Validation,
        &["rule", "validation", "constraint", "invalid"],
    ),
];

/// Classify a raw failure string into a stable `{code, message}` pair,
/// preserving the raw detail for operators.
pub fn categorize_error(raw: &str) -> ErrorInfo {
    let lowered = raw.to_lowercase();
    let category = CATEGORY_RULES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| lowered.contains(k)))
        .map(|(category, _)| *category)
        .unwrap_or(ErrorCategory::Worker);

    ErrorInfo {
        code: category.code().to_string(),
        message: category.user_message().to_string(),
        details: Some(raw.to_string()),
    }
}

/// Merge the durable run row with the queue's live snapshot into the
/// client-facing read model. Pure; the async wrapper below feeds it.
pub fn merge_status(
    run: &ValidationRun,
    snapshot: Option<&JobSnapshot>,
    queue_position: Option<usize>,
    estimated_seconds_remaining: Option<u64>,
) -> RunStatusResponse {
    // The two progress writes can transiently diverge; surface the furthest.
    let progress = snapshot
        .map(|s| s.progress.max(run.progress))
        .unwrap_or(run.progress);

    let error = match run.status {
        RunStatus::Failed => {
            let raw = run
                .error_message
                .as_deref()
                .or_else(|| snapshot.and_then(|s| s.failure.as_deref()))
                .unwrap_or("unknown failure");
            Some(categorize_error(raw))
        }
        _ => None,
    };

    RunStatusResponse {
        validation_id: run.id,
        job_id: run.job_id.clone(),
        status: run.status,
        // The client contract surfaces a job state or null, never "unknown".
        job_state: snapshot.map(|s| s.state).filter(|s| *s != JobState::Unknown),
        progress,
        queue_position,
        estimated_seconds_remaining,
        error,
    }
}

/// Read-only aggregator over durable storage and the queue.
///
/// Never hard-fails a status read because of a transient broker outage:
/// queue lookups degrade to durable-only data.
pub struct StatusService {
    db: PgPool,
    queue: Arc<JobQueue>,
}

impl StatusService {
    pub fn new(db: PgPool, queue: Arc<JobQueue>) -> Self {
        Self { db, queue }
    }

    pub async fn run_status(&self, run_id: Uuid) -> Result<Option<RunStatusResponse>, sqlx::Error> {
        let Some(run) = queries::get_run(&self.db, run_id).await? else {
            return Ok(None);
        };

        let (snapshot, position) = match &run.job_id {
            Some(job_id) => self.live_view(job_id).await,
            None => (None, None),
        };

        let eta = match snapshot.as_ref().map(|s| s.state) {
            Some(JobState::Waiting) | Some(JobState::Delayed) => self.estimate(&run).await,
            _ => None,
        };

        Ok(Some(merge_status(&run, snapshot.as_ref(), position, eta)))
    }

    async fn live_view(&self, job_id: &str) -> (Option<JobSnapshot>, Option<usize>) {
        let snapshot = match self.queue.status(job_id).await {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(job_id, error = %e, "queue unreachable, serving durable-only status");
                return (None, None);
            }
        };

        let position = match self.queue.queue_position(job_id).await {
            Ok(p) => p,
            Err(e) => {
                debug!(job_id, error = %e, "queue position unavailable");
                None
            }
        };

        (snapshot, position)
    }

    async fn estimate(&self, run: &ValidationRun) -> Option<u64> {
        let size = tokio::fs::metadata(&run.file_path).await.ok()?.len();
        let duration = self.queue.estimate_duration(size).await.ok()?;
        Some(duration.as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn run(status: RunStatus, progress: i32, error: Option<&str>) -> ValidationRun {
        ValidationRun {
            id: Uuid::nil(),
            file_path: "/tmp/claims.csv".to_string(),
            original_filename: "claims.csv".to_string(),
            status,
            progress,
            job_id: Some("validate-0".to_string()),
            error_message: error.map(str::to_string),
            error_count: 0,
            warning_count: 0,
            owner_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn categorization_is_deterministic() {
        let a = categorize_error("Redis connection refused");
        let b = categorize_error("Redis connection refused");
        assert_eq!(a, b);
        assert_eq!(a.code, "QUEUE_ERROR");
    }

    #[test]
    fn file_errors_categorized() {
        assert_eq!(categorize_error("no such file or directory").code, "FILE_ERROR");
        assert_eq!(categorize_error("missing required column: amount").code, "FILE_ERROR");
    }

    #[test]
    fn queue_beats_file_when_both_match() {
        // "queue" appears before "file" in the priority order.
        assert_eq!(
            categorize_error("queue rejected file transfer").code,
            "QUEUE_ERROR"
        );
    }

    #[test]
    fn unknown_failures_default_to_worker() {
        let info = categorize_error("segfault in module X");
        assert_eq!(info.code, "WORKER_ERROR");
        assert_eq!(info.details.as_deref(), Some("segfault in module X"));
    }

    #[test]
    fn merge_prefers_furthest_progress() {
        let r = run(RunStatus::Processing, 40, None);
        let snap = JobSnapshot {
            state: JobState::Active,
            progress: 55,
            failure: None,
        };
        let merged = merge_status(&r, Some(&snap), None, None);
        assert_eq!(merged.progress, 55);
        assert_eq!(merged.job_state, Some(JobState::Active));

        let stale = JobSnapshot {
            state: JobState::Active,
            progress: 10,
            failure: None,
        };
        assert_eq!(merge_status(&r, Some(&stale), None, None).progress, 40);
    }

    #[test]
    fn merge_degrades_without_snapshot() {
        let r = run(RunStatus::Processing, 40, None);
        let merged = merge_status(&r, None, None, None);
        assert_eq!(merged.progress, 40);
        assert_eq!(merged.job_state, None);
        assert!(merged.error.is_none());
    }

    #[test]
    fn failed_run_carries_categorized_error() {
        let r = run(RunStatus::Failed, 75, Some("rule 'unit_limit' failed to evaluate"));
        let merged = merge_status(&r, None, None, None);
        let error = merged.error.unwrap();
        assert_eq!(error.code, "VALIDATION_ERROR");
        assert!(error.details.unwrap().contains("unit_limit"));
    }
}
