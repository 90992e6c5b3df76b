use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::JobState;
use crate::models::run::RunStatus;

/// Metadata portion of a validation submission (multipart text fields).
#[derive(Debug, Default, Deserialize, Validate)]
pub struct SubmitRequest {
    #[garde(length(min = 1, max = 100))]
    pub owner_id: Option<String>,
}

/// Response after accepting a file for validation.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub validation_id: Uuid,
    pub job_id: String,
    pub status: RunStatus,
    pub queue_position: Option<usize>,
    pub estimated_duration_seconds: u64,
}

/// Categorized, user-safe failure description.
///
/// `details` preserves the raw technical message for operator debugging;
/// the end-user-facing `message` never depends on it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Client-facing status read model, merging durable run state with the
/// queue's live snapshot. Stable contract.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatusResponse {
    pub validation_id: Uuid,
    pub job_id: Option<String>,
    pub status: RunStatus,
    pub job_state: Option<JobState>,
    pub progress: i32,
    pub queue_position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_seconds_remaining: Option<u64>,
    pub error: Option<ErrorInfo>,
}

/// Server-to-client push channel messages, one JSON object per event.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Connected { validation_id: Uuid },
    Progress(RunStatusResponse),
    Completed(RunStatusResponse),
    Error(RunStatusResponse),
    Timeout { validation_id: Uuid },
}

/// Response after a cancellation request.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub validation_id: Uuid,
    pub queue_cancelled: bool,
    pub status: RunStatus,
}
