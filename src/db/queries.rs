use std::str::FromStr;

use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::models::record::{BillingRecord, ParsedRecord};
use crate::models::run::{RunStatus, ValidationRun};
use crate::models::violation::{Severity, Violation};

/// Rows per INSERT statement. Each record binds 10 parameters, so this keeps
/// every statement far below Postgres's 65535 bind-parameter ceiling.
const RECORD_CHUNK_SIZE: usize = 1000;

/// Rows per result INSERT (9 parameters each).
const RESULT_CHUNK_SIZE: usize = 1000;

fn run_from_row(row: &sqlx::postgres::PgRow) -> Result<ValidationRun, sqlx::Error> {
    let status_str: String = row.try_get("status")?;
    let status = RunStatus::from_str(&status_str).unwrap_or(RunStatus::Queued);

    Ok(ValidationRun {
        id: row.try_get("id")?,
        file_path: row.try_get("file_path")?,
        original_filename: row.try_get("original_filename")?,
        status,
        progress: row.try_get("progress")?,
        job_id: row.try_get("job_id")?,
        error_message: row.try_get("error_message")?,
        error_count: row.try_get("error_count")?,
        warning_count: row.try_get("warning_count")?,
        owner_id: row.try_get("owner_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Insert a new validation run in `queued` state.
pub async fn create_run(
    pool: &PgPool,
    file_path: &str,
    original_filename: &str,
    owner_id: Option<&str>,
) -> Result<ValidationRun, sqlx::Error> {
    let row = sqlx::query(
        r#"
        INSERT INTO validation_runs (status, file_path, original_filename, owner_id)
        VALUES ('queued', $1, $2, $3)
        RETURNING id, status, file_path, original_filename, progress, job_id,
                  error_message, error_count, warning_count, owner_id,
                  created_at, updated_at
        "#,
    )
    .bind(file_path)
    .bind(original_filename)
    .bind(owner_id)
    .fetch_one(pool)
    .await?;

    run_from_row(&row)
}

/// Get a run by ID
pub async fn get_run(pool: &PgPool, run_id: Uuid) -> Result<Option<ValidationRun>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, status, file_path, original_filename, progress, job_id,
               error_message, error_count, warning_count, owner_id,
               created_at, updated_at
        FROM validation_runs
        WHERE id = $1
        "#,
    )
    .bind(run_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(run_from_row).transpose()
}

/// Record the queue job backing this run. Set exactly once per enqueue attempt.
pub async fn set_run_job(pool: &PgPool, run_id: Uuid, job_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE validation_runs
        SET job_id = $1, updated_at = NOW()
        WHERE id = $2
        "#,
    )
    .bind(job_id)
    .bind(run_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Transition a run to `processing` and record its active job.
pub async fn mark_run_processing(
    pool: &PgPool,
    run_id: Uuid,
    job_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE validation_runs
        SET status = 'processing', job_id = $1, error_message = NULL, updated_at = NOW()
        WHERE id = $2
        "#,
    )
    .bind(job_id)
    .bind(run_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Write a progress checkpoint. GREATEST keeps progress monotonically
/// non-decreasing even if checkpoint writes race a retry attempt.
pub async fn record_run_progress(
    pool: &PgPool,
    run_id: Uuid,
    progress: i32,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE validation_runs
        SET progress = GREATEST(progress, $1), updated_at = NOW()
        WHERE id = $2
        "#,
    )
    .bind(progress.clamp(0, 100))
    .bind(run_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Terminal success: progress forced to 100 with violation tallies.
pub async fn mark_run_completed(
    pool: &PgPool,
    run_id: Uuid,
    error_count: i32,
    warning_count: i32,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE validation_runs
        SET status = 'completed', progress = 100,
            error_count = $1, warning_count = $2, updated_at = NOW()
        WHERE id = $3
        "#,
    )
    .bind(error_count)
    .bind(warning_count)
    .bind(run_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Terminal failure with the raw failure message preserved.
pub async fn mark_run_failed(
    pool: &PgPool,
    run_id: Uuid,
    message: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE validation_runs
        SET status = 'failed', error_message = $1, updated_at = NOW()
        WHERE id = $2
        "#,
    )
    .bind(message)
    .bind(run_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Persist parsed records in bounded chunks, replacing any earlier set for
/// the run (reprocessing replaces, never appends).
pub async fn replace_records(
    pool: &PgPool,
    run_id: Uuid,
    records: &[ParsedRecord],
) -> Result<usize, sqlx::Error> {
    sqlx::query("DELETE FROM billing_records WHERE run_id = $1")
        .bind(run_id)
        .execute(pool)
        .await?;

    let mut inserted = 0;
    for chunk in records.chunks(RECORD_CHUNK_SIZE) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO billing_records \
             (id, run_id, record_number, patient_id, billing_code, amount, \
              units, service_date, establishment, context) ",
        );

        builder.push_values(chunk, |mut b, rec| {
            b.push_bind(Uuid::new_v4())
                .push_bind(run_id)
                .push_bind(rec.record_number)
                .push_bind(&rec.patient_id)
                .push_bind(&rec.billing_code)
                .push_bind(rec.amount)
                .push_bind(rec.units)
                .push_bind(rec.service_date)
                .push_bind(&rec.establishment)
                .push_bind(&rec.context);
        });

        let result = builder.build().execute(pool).await?;
        inserted += result.rows_affected() as usize;
    }

    Ok(inserted)
}

/// Re-read the persisted records in input order, so rule evaluation always
/// operates on rows that carry stable database identifiers.
pub async fn fetch_records(
    pool: &PgPool,
    run_id: Uuid,
) -> Result<Vec<BillingRecord>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT id, run_id, record_number, patient_id, billing_code, amount,
               units, service_date, establishment, context
        FROM billing_records
        WHERE run_id = $1
        ORDER BY record_number ASC
        "#,
    )
    .bind(run_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|r| {
            Ok(BillingRecord {
                id: r.try_get("id")?,
                run_id: r.try_get("run_id")?,
                record_number: r.try_get("record_number")?,
                patient_id: r.try_get("patient_id")?,
                billing_code: r.try_get("billing_code")?,
                amount: r.try_get("amount")?,
                units: r.try_get("units")?,
                service_date: r.try_get("service_date")?,
                establishment: r.try_get("establishment")?,
                context: r.try_get("context")?,
            })
        })
        .collect()
}

/// Persist violations in bounded chunks, replacing any earlier set for the run.
pub async fn replace_results(
    pool: &PgPool,
    run_id: Uuid,
    violations: &[Violation],
) -> Result<usize, sqlx::Error> {
    sqlx::query("DELETE FROM validation_results WHERE run_id = $1")
        .bind(run_id)
        .execute(pool)
        .await?;

    let mut inserted = 0;
    for chunk in violations.chunks(RESULT_CHUNK_SIZE) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO validation_results \
             (id, run_id, rule_name, record_id, record_number, severity, \
              category, message, remediation) ",
        );

        builder.push_values(chunk, |mut b, v| {
            b.push_bind(Uuid::new_v4())
                .push_bind(run_id)
                .push_bind(&v.rule_name)
                .push_bind(v.record_id)
                .push_bind(v.record_number)
                .push_bind(v.severity.to_string())
                .push_bind(&v.category)
                .push_bind(&v.message)
                .push_bind(&v.remediation);
        });

        let result = builder.build().execute(pool).await?;
        inserted += result.rows_affected() as usize;
    }

    Ok(inserted)
}

/// Page through a run's violations, errors first then input order.
pub async fn fetch_results(
    pool: &PgPool,
    run_id: Uuid,
    limit: i64,
    offset: i64,
) -> Result<Vec<Violation>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT rule_name, record_id, record_number, severity, category,
               message, remediation
        FROM validation_results
        WHERE run_id = $1
        ORDER BY CASE severity WHEN 'error' THEN 0 WHEN 'warning' THEN 1 ELSE 2 END,
                 record_number ASC NULLS LAST
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(run_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|r| {
            let severity_str: String = r.try_get("severity")?;
            Ok(Violation {
                rule_name: r.try_get("rule_name")?,
                record_id: r.try_get("record_id")?,
                record_number: r.try_get("record_number")?,
                severity: Severity::from_str(&severity_str).unwrap_or(Severity::Info),
                category: r.try_get("category")?,
                message: r.try_get("message")?,
                remediation: r.try_get("remediation")?,
            })
        })
        .collect()
}

/// Total violations stored for a run.
pub async fn count_results(pool: &PgPool, run_id: Uuid) -> Result<i64, sqlx::Error> {
    let row = sqlx::query("SELECT COUNT(*) AS total FROM validation_results WHERE run_id = $1")
        .bind(run_id)
        .fetch_one(pool)
        .await?;

    row.try_get("total")
}
