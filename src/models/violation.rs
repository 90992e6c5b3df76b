use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// One rule violation produced during evaluation.
///
/// `record_id`/`record_number` are present when the violation points at a
/// specific source row; run-level violations leave them unset. The set of
/// violations for a run is replaced wholesale if the run is reprocessed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub rule_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_number: Option<i32>,
    pub severity: Severity,
    pub category: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl Violation {
    pub fn for_record(
        rule_name: &str,
        record_id: Uuid,
        record_number: i32,
        severity: Severity,
        category: &str,
        message: String,
    ) -> Self {
        Self {
            rule_name: rule_name.to_string(),
            record_id: Some(record_id),
            record_number: Some(record_number),
            severity,
            category: category.to_string(),
            message,
            remediation: None,
        }
    }

    pub fn for_run(
        rule_name: &str,
        severity: Severity,
        category: &str,
        message: String,
    ) -> Self {
        Self {
            rule_name: rule_name.to_string(),
            record_id: None,
            record_number: None,
            severity,
            category: category.to_string(),
            message,
            remediation: None,
        }
    }

    pub fn with_remediation(mut self, hint: &str) -> Self {
        self.remediation = Some(hint.to_string());
        self
    }
}
