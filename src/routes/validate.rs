use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use serde::Deserialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::db::queries;
use crate::models::api::{CancelResponse, RunStatusResponse, SubmitRequest, SubmitResponse};
use crate::models::run::RunStatus;
use crate::models::violation::Violation;

/// POST /api/v1/validations — upload a billing CSV for validation.
pub async fn submit_validation(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<SubmitResponse>), StatusCode> {
    let mut file_data: Option<Vec<u8>> = None;
    let mut original_filename = "upload.csv".to_string();
    let mut request = SubmitRequest::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?
    {
        match field.name() {
            Some("file") => {
                if let Some(name) = field.file_name() {
                    original_filename = name.to_string();
                }
                let data = field.bytes().await.map_err(|_| StatusCode::BAD_REQUEST)?;
                file_data = Some(data.to_vec());
            }
            Some("owner_id") => {
                let value = field.text().await.map_err(|_| StatusCode::BAD_REQUEST)?;
                request.owner_id = Some(value);
            }
            _ => {}
        }
    }

    let file_data = file_data.ok_or(StatusCode::BAD_REQUEST)?;
    if file_data.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    request.validate().map_err(|_| StatusCode::BAD_REQUEST)?;

    let file_path = state
        .files
        .save(&original_filename, &file_data)
        .await
        .map_err(|e| {
            error!(error = %e, "failed to store uploaded file");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let run = queries::create_run(
        &state.db,
        &file_path,
        &original_filename,
        request.owner_id.as_deref(),
    )
    .await
    .map_err(|e| {
        error!(error = %e, "failed to create validation run");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let job_id = state.queue.enqueue(run.id, &file_path).await.map_err(|e| {
        error!(run_id = %run.id, error = %e, "failed to enqueue validation job");
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    queries::set_run_job(&state.db, run.id, &job_id)
        .await
        .map_err(|e| {
            error!(run_id = %run.id, error = %e, "failed to link job to run");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    // Advisory figures; both can shift under concurrent admissions.
    let queue_position = state.queue.queue_position(&job_id).await.unwrap_or(None);
    let estimated = state
        .queue
        .estimate_duration(file_data.len() as u64)
        .await
        .map(|d| d.as_secs())
        .unwrap_or(5);

    metrics::counter!("validation_jobs_submitted").increment(1);
    info!(
        run_id = %run.id,
        job_id = %job_id,
        bytes = file_data.len(),
        filename = %original_filename,
        "validation accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            validation_id: run.id,
            job_id,
            status: RunStatus::Queued,
            queue_position,
            estimated_duration_seconds: estimated,
        }),
    ))
}

/// GET /api/v1/validations/{id}/status — merged durable + live snapshot.
pub async fn get_validation_status(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<RunStatusResponse>, StatusCode> {
    match state.status.run_status(run_id).await {
        Ok(Some(status)) => Ok(Json(status)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!(run_id = %run_id, error = %e, "status read failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ResultsQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    100
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultsResponse {
    pub validation_id: Uuid,
    pub total: i64,
    pub results: Vec<Violation>,
}

/// GET /api/v1/validations/{id}/results — paged violations for a run.
pub async fn get_validation_results(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    Query(query): Query<ResultsQuery>,
) -> Result<Json<ResultsResponse>, StatusCode> {
    if queries::get_run(&state.db, run_id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .is_none()
    {
        return Err(StatusCode::NOT_FOUND);
    }

    let limit = query.limit.clamp(1, 1000);
    let offset = query.offset.max(0);

    let results = queries::fetch_results(&state.db, run_id, limit, offset)
        .await
        .map_err(|e| {
            error!(run_id = %run_id, error = %e, "results read failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    let total = queries::count_results(&state.db, run_id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(ResultsResponse {
        validation_id: run_id,
        total,
        results,
    }))
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewResponse {
    pub validation_id: Uuid,
    pub cached: bool,
    pub violations: Vec<Violation>,
}

/// GET /api/v1/validations/{id}/results/preview — short-lived cache of the
/// first violations, populated by the worker before the run completes.
pub async fn get_results_preview(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Json<PreviewResponse> {
    match state.queue.result_preview(run_id).await {
        Ok(Some(violations)) => Json(PreviewResponse {
            validation_id: run_id,
            cached: true,
            violations,
        }),
        Ok(None) => Json(PreviewResponse {
            validation_id: run_id,
            cached: false,
            violations: Vec::new(),
        }),
        Err(e) => {
            warn!(run_id = %run_id, error = %e, "preview cache unavailable");
            Json(PreviewResponse {
                validation_id: run_id,
                cached: false,
                violations: Vec::new(),
            })
        }
    }
}

/// POST /api/v1/validations/{id}/cancel — cancellation entry point.
///
/// Attempts queue cancellation and, unless the run already reached a
/// terminal state, marks it failed so the UI never waits on a job the queue
/// silently dropped.
pub async fn cancel_validation(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<CancelResponse>, StatusCode> {
    let run = queries::get_run(&state.db, run_id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;

    let queue_cancelled = match &run.job_id {
        Some(job_id) => match state.queue.cancel(job_id).await {
            Ok(cancelled) => cancelled,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "queue cancel failed, marking run anyway");
                false
            }
        },
        None => false,
    };

    let status = if run.status.is_terminal() {
        run.status
    } else {
        queries::mark_run_failed(&state.db, run_id, "cancelled by operator")
            .await
            .map_err(|e| {
                error!(run_id = %run_id, error = %e, "failed to mark run cancelled");
                StatusCode::INTERNAL_SERVER_ERROR
            })?;
        RunStatus::Failed
    };

    info!(run_id = %run_id, queue_cancelled, "cancellation requested");

    Ok(Json(CancelResponse {
        validation_id: run_id,
        queue_cancelled,
        status,
    }))
}
