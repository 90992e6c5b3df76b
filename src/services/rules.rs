use std::collections::HashMap;

use chrono::NaiveDate;
use tracing::{debug, error};
use uuid::Uuid;

use crate::models::record::BillingRecord;
use crate::models::violation::{Severity, Violation};

/// Error type rules may surface; the engine never lets it cross the
/// evaluation boundary.
pub type RuleError = Box<dyn std::error::Error + Send + Sync>;

/// An independent, pluggable check over a run's billing records.
///
/// Rules must not depend on each other or on evaluation order.
pub trait ValidationRule: Send + Sync {
    fn name(&self) -> &str;

    fn enabled(&self) -> bool {
        true
    }

    fn evaluate(&self, records: &[BillingRecord], run_id: Uuid) -> Result<Vec<Violation>, RuleError>;
}

/// Registry of enabled rules with per-rule fault isolation.
#[derive(Default)]
pub struct RuleEngine {
    rules: Vec<Box<dyn ValidationRule>>,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine preloaded with the standard billing rule set.
    pub fn with_default_rules(amount_ceiling: f64, claim_window_days: i64, today: NaiveDate) -> Self {
        let mut engine = Self::new();
        engine.register(Box::new(AmountThresholdRule::new(amount_ceiling)));
        engine.register(Box::new(MutualExclusionRule::with_default_pairs()));
        engine.register(Box::new(TimeWindowRule::new(claim_window_days, today)));
        engine.register(Box::new(UnitLimitRule::new(UNIT_LIMIT_DEFAULT)));
        engine.register(Box::new(DuplicateLineRule));
        engine
    }

    pub fn register(&mut self, rule: Box<dyn ValidationRule>) {
        self.rules.push(rule);
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Run every enabled rule over the record set.
    ///
    /// A failing rule contributes exactly one synthetic system-error
    /// violation naming it; remaining rules still run, so one broken rule
    /// never blanks out the others' results.
    pub fn evaluate(&self, records: &[BillingRecord], run_id: Uuid) -> Vec<Violation> {
        let mut violations = Vec::new();

        for rule in &self.rules {
            if !rule.enabled() {
                debug!(rule = rule.name(), "skipping disabled rule");
                continue;
            }

            match rule.evaluate(records, run_id) {
                Ok(mut found) => {
                    debug!(rule = rule.name(), count = found.len(), "rule evaluated");
                    violations.append(&mut found);
                }
                Err(e) => {
                    error!(rule = rule.name(), run_id = %run_id, error = %e, "rule evaluation failed");
                    violations.push(Violation::for_run(
                        rule.name(),
                        Severity::Error,
                        "system",
                        format!("rule '{}' failed to evaluate: {}", rule.name(), e),
                    ));
                }
            }
        }

        violations
    }
}

// ── Amount checks ────────────────────────────────────────────────────────

pub struct AmountThresholdRule {
    ceiling: f64,
}

impl AmountThresholdRule {
    pub fn new(ceiling: f64) -> Self {
        Self { ceiling }
    }
}

impl ValidationRule for AmountThresholdRule {
    fn name(&self) -> &str {
        "amount_threshold"
    }

    fn evaluate(&self, records: &[BillingRecord], _run_id: Uuid) -> Result<Vec<Violation>, RuleError> {
        let mut violations = Vec::new();

        for record in records {
            if record.amount <= 0.0 {
                violations.push(Violation::for_record(
                    self.name(),
                    record.id,
                    record.record_number,
                    Severity::Error,
                    "amount",
                    format!(
                        "billed amount must be positive, got {:.2} for code {}",
                        record.amount, record.billing_code
                    ),
                ));
            } else if record.amount > self.ceiling {
                violations.push(
                    Violation::for_record(
                        self.name(),
                        record.id,
                        record.record_number,
                        Severity::Warning,
                        "amount",
                        format!(
                            "billed amount {:.2} exceeds the {:.2} review ceiling",
                            record.amount, self.ceiling
                        ),
                    )
                    .with_remediation("Confirm the amount or attach supporting documentation."),
                );
            }
        }

        Ok(violations)
    }
}

// ── Mutual exclusion ─────────────────────────────────────────────────────

/// Pairs of billing codes that must not appear for the same patient on the
/// same service date.
pub struct MutualExclusionRule {
    pairs: Vec<(String, String)>,
}

impl MutualExclusionRule {
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        Self { pairs }
    }

    pub fn with_default_pairs() -> Self {
        Self::new(vec![
            // Full examination excludes the partial variants billed same-day.
            ("9160".to_string(), "9162".to_string()),
            ("9170".to_string(), "9171".to_string()),
        ])
    }
}

impl ValidationRule for MutualExclusionRule {
    fn name(&self) -> &str {
        "mutual_exclusion"
    }

    fn evaluate(&self, records: &[BillingRecord], _run_id: Uuid) -> Result<Vec<Violation>, RuleError> {
        // (patient, date) -> codes billed that day, with one representative row per code
        let mut by_visit: HashMap<(&str, NaiveDate), HashMap<&str, &BillingRecord>> = HashMap::new();
        for record in records {
            by_visit
                .entry((record.patient_id.as_str(), record.service_date))
                .or_default()
                .entry(record.billing_code.as_str())
                .or_insert(record);
        }

        let mut violations = Vec::new();
        for ((patient, date), codes) in &by_visit {
            for (a, b) in &self.pairs {
                if let (Some(_), Some(second)) = (codes.get(a.as_str()), codes.get(b.as_str())) {
                    violations.push(Violation::for_record(
                        self.name(),
                        second.id,
                        second.record_number,
                        Severity::Error,
                        "exclusion",
                        format!(
                            "codes {a} and {b} are mutually exclusive for patient {patient} on {date}"
                        ),
                    ));
                }
            }
        }

        Ok(violations)
    }
}

// ── Time window ──────────────────────────────────────────────────────────

pub struct TimeWindowRule {
    claim_window_days: i64,
    today: NaiveDate,
}

impl TimeWindowRule {
    pub fn new(claim_window_days: i64, today: NaiveDate) -> Self {
        Self {
            claim_window_days,
            today,
        }
    }
}

impl ValidationRule for TimeWindowRule {
    fn name(&self) -> &str {
        "time_window"
    }

    fn evaluate(&self, records: &[BillingRecord], _run_id: Uuid) -> Result<Vec<Violation>, RuleError> {
        let mut violations = Vec::new();

        for record in records {
            if record.service_date > self.today {
                violations.push(Violation::for_record(
                    self.name(),
                    record.id,
                    record.record_number,
                    Severity::Error,
                    "time_window",
                    format!("service date {} is in the future", record.service_date),
                ));
            } else if (self.today - record.service_date).num_days() > self.claim_window_days {
                violations.push(
                    Violation::for_record(
                        self.name(),
                        record.id,
                        record.record_number,
                        Severity::Warning,
                        "time_window",
                        format!(
                            "service date {} is outside the {}-day claim window",
                            record.service_date, self.claim_window_days
                        ),
                    )
                    .with_remediation("Late claims may require a justification letter."),
                );
            }
        }

        Ok(violations)
    }
}

// ── Unit limits ──────────────────────────────────────────────────────────

const UNIT_LIMIT_DEFAULT: i32 = 10;

pub struct UnitLimitRule {
    max_units: i32,
}

impl UnitLimitRule {
    pub fn new(max_units: i32) -> Self {
        Self { max_units }
    }
}

impl ValidationRule for UnitLimitRule {
    fn name(&self) -> &str {
        "unit_limit"
    }

    fn evaluate(&self, records: &[BillingRecord], _run_id: Uuid) -> Result<Vec<Violation>, RuleError> {
        let mut violations = Vec::new();

        for record in records {
            if record.units < 1 {
                violations.push(Violation::for_record(
                    self.name(),
                    record.id,
                    record.record_number,
                    Severity::Error,
                    "units",
                    format!("units must be at least 1, got {}", record.units),
                ));
            } else if record.units > self.max_units {
                violations.push(Violation::for_record(
                    self.name(),
                    record.id,
                    record.record_number,
                    Severity::Warning,
                    "units",
                    format!(
                        "{} units of code {} exceeds the per-line limit of {}",
                        record.units, record.billing_code, self.max_units
                    ),
                ));
            }
        }

        Ok(violations)
    }
}

// ── Duplicate lines ──────────────────────────────────────────────────────

pub struct DuplicateLineRule;

impl ValidationRule for DuplicateLineRule {
    fn name(&self) -> &str {
        "duplicate_line"
    }

    fn evaluate(&self, records: &[BillingRecord], _run_id: Uuid) -> Result<Vec<Violation>, RuleError> {
        let mut seen: HashMap<(&str, &str, NaiveDate), i32> = HashMap::new();
        let mut violations = Vec::new();

        for record in records {
            let key = (
                record.patient_id.as_str(),
                record.billing_code.as_str(),
                record.service_date,
            );
            match seen.get(&key) {
                Some(first_row) => {
                    violations.push(
                        Violation::for_record(
                            self.name(),
                            record.id,
                            record.record_number,
                            Severity::Warning,
                            "duplicate",
                            format!(
                                "duplicate of row {first_row}: patient {}, code {}, {}",
                                record.patient_id, record.billing_code, record.service_date
                            ),
                        )
                        .with_remediation("Remove the duplicate line or split across service dates."),
                    );
                }
                None => {
                    seen.insert(key, record.record_number);
                }
            }
        }

        Ok(violations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(number: i32, patient: &str, code: &str, amount: f64, date: &str) -> BillingRecord {
        BillingRecord {
            id: Uuid::new_v4(),
            run_id: Uuid::nil(),
            record_number: number,
            patient_id: patient.to_string(),
            billing_code: code.to_string(),
            amount,
            units: 1,
            service_date: date.parse().unwrap(),
            establishment: None,
            context: None,
        }
    }

    fn today() -> NaiveDate {
        "2026-08-01".parse().unwrap()
    }

    struct BrokenRule;

    impl ValidationRule for BrokenRule {
        fn name(&self) -> &str {
            "broken"
        }

        fn evaluate(&self, _: &[BillingRecord], _: Uuid) -> Result<Vec<Violation>, RuleError> {
            Err("reference data unavailable".into())
        }
    }

    struct DisabledRule;

    impl ValidationRule for DisabledRule {
        fn name(&self) -> &str {
            "disabled"
        }

        fn enabled(&self) -> bool {
            false
        }

        fn evaluate(&self, _: &[BillingRecord], _: Uuid) -> Result<Vec<Violation>, RuleError> {
            Err("must never run".into())
        }
    }

    #[test]
    fn negative_amount_is_error() {
        let rule = AmountThresholdRule::new(10_000.0);
        let records = vec![record(1, "P1", "9162", -5.0, "2026-07-01")];
        let violations = rule.evaluate(&records, Uuid::nil()).unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].severity, Severity::Error);
        assert_eq!(violations[0].record_number, Some(1));
    }

    #[test]
    fn amount_over_ceiling_is_warning() {
        let rule = AmountThresholdRule::new(100.0);
        let records = vec![record(1, "P1", "9162", 250.0, "2026-07-01")];
        let violations = rule.evaluate(&records, Uuid::nil()).unwrap();
        assert_eq!(violations[0].severity, Severity::Warning);
        assert!(violations[0].remediation.is_some());
    }

    #[test]
    fn exclusive_codes_same_patient_same_day() {
        let rule = MutualExclusionRule::with_default_pairs();
        let records = vec![
            record(1, "P1", "9160", 80.0, "2026-07-01"),
            record(2, "P1", "9162", 45.0, "2026-07-01"),
        ];
        let violations = rule.evaluate(&records, Uuid::nil()).unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].category, "exclusion");
    }

    #[test]
    fn exclusive_codes_different_days_allowed() {
        let rule = MutualExclusionRule::with_default_pairs();
        let records = vec![
            record(1, "P1", "9160", 80.0, "2026-07-01"),
            record(2, "P1", "9162", 45.0, "2026-07-02"),
        ];
        assert!(rule.evaluate(&records, Uuid::nil()).unwrap().is_empty());
    }

    #[test]
    fn future_service_date_is_error() {
        let rule = TimeWindowRule::new(90, today());
        let records = vec![record(1, "P1", "9162", 45.0, "2026-09-15")];
        let violations = rule.evaluate(&records, Uuid::nil()).unwrap();
        assert_eq!(violations[0].severity, Severity::Error);
    }

    #[test]
    fn stale_service_date_is_warning() {
        let rule = TimeWindowRule::new(90, today());
        let records = vec![record(1, "P1", "9162", 45.0, "2026-01-01")];
        let violations = rule.evaluate(&records, Uuid::nil()).unwrap();
        assert_eq!(violations[0].severity, Severity::Warning);
    }

    #[test]
    fn duplicate_line_points_back_to_first_row() {
        let rule = DuplicateLineRule;
        let records = vec![
            record(1, "P1", "9162", 45.0, "2026-07-01"),
            record(2, "P2", "9162", 45.0, "2026-07-01"),
            record(3, "P1", "9162", 45.0, "2026-07-01"),
        ];
        let violations = rule.evaluate(&records, Uuid::nil()).unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].record_number, Some(3));
        assert!(violations[0].message.contains("row 1"));
    }

    #[test]
    fn broken_rule_is_isolated() {
        let mut engine = RuleEngine::new();
        engine.register(Box::new(AmountThresholdRule::new(100.0)));
        engine.register(Box::new(BrokenRule));
        engine.register(Box::new(TimeWindowRule::new(90, today())));

        let records = vec![record(1, "P1", "9162", 250.0, "2026-09-15")];
        let violations = engine.evaluate(&records, Uuid::nil());

        // amount warning + time window error + exactly one synthetic for the broken rule
        assert_eq!(violations.len(), 3);
        let synthetic: Vec<_> = violations.iter().filter(|v| v.rule_name == "broken").collect();
        assert_eq!(synthetic.len(), 1);
        assert_eq!(synthetic[0].category, "system");
        assert!(synthetic[0].message.contains("broken"));
    }

    #[test]
    fn disabled_rule_never_runs() {
        let mut engine = RuleEngine::new();
        engine.register(Box::new(DisabledRule));
        let records = vec![record(1, "P1", "9162", 45.0, "2026-07-01")];
        assert!(engine.evaluate(&records, Uuid::nil()).is_empty());
    }

    #[test]
    fn default_rule_set_on_clean_records() {
        let engine = RuleEngine::with_default_rules(10_000.0, 90, today());
        assert_eq!(engine.rule_count(), 5);
        let records = vec![
            record(1, "P1", "9162", 45.0, "2026-07-01"),
            record(2, "P2", "9170", 120.0, "2026-07-02"),
        ];
        assert!(engine.evaluate(&records, Uuid::nil()).is_empty());
    }
}
