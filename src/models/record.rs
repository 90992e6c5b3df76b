use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One billing line item parsed from an input row, before persistence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParsedRecord {
    /// 1-indexed, matching input row order.
    pub record_number: i32,
    pub patient_id: String,
    pub billing_code: String,
    pub amount: f64,
    pub units: i32,
    pub service_date: NaiveDate,
    pub establishment: Option<String>,
    pub context: Option<String>,
}

/// A persisted billing line item, tied to exactly one validation run.
///
/// Carries the database identifier so rule violations can be correlated
/// back to source rows. Immutable after the bulk insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    pub record_number: i32,
    pub patient_id: String,
    pub billing_code: String,
    pub amount: f64,
    pub units: i32,
    pub service_date: NaiveDate,
    pub establishment: Option<String>,
    pub context: Option<String>,
}
