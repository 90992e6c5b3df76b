use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Lifecycle of a validation run from upload to terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

/// One user-initiated validation request tied to one uploaded file.
///
/// Mutated only by the worker that owns the run's active job, or by the
/// cancellation entry point. Never deleted by the pipeline itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRun {
    pub id: Uuid,
    pub file_path: String,
    pub original_filename: String,
    pub status: RunStatus,
    /// 0-100, monotonically non-decreasing within a run.
    pub progress: i32,
    /// Queue job identifier, set once per enqueue attempt.
    pub job_id: Option<String>,
    pub error_message: Option<String>,
    pub error_count: i32,
    pub warning_count: i32,
    pub owner_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
