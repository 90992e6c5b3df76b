use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Queue-side state of a validation job.
///
/// `Unknown` covers jobs the broker no longer has bookkeeping for
/// (expired retention, never enqueued).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
    Unknown,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Read-only snapshot of a job as the queue sees it right now.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub state: JobState,
    pub progress: i32,
    pub failure: Option<String>,
}
