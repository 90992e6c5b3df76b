use chrono::NaiveDate;
use csv::ReaderBuilder;

use crate::models::record::ParsedRecord;
use crate::models::violation::{Severity, Violation};

/// Rule name attached to per-row parse violations.
const PARSER_RULE: &str = "row_parser";

/// Delimiters probed in the header line, most common first.
const CANDIDATE_DELIMITERS: &[u8] = &[b',', b';', b'\t', b'|'];

/// Outcome of parsing one uploaded file.
///
/// Per-row failures are collected as violations rather than aborting the
/// run; a partial record set is still useful to the operator.
#[derive(Debug)]
pub struct ParseOutcome {
    pub records: Vec<ParsedRecord>,
    pub violations: Vec<Violation>,
    pub delimiter: u8,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("input file is empty")]
    EmptyFile,

    #[error("missing required column: {0}")]
    MissingColumn(&'static str),

    #[error("failed to read CSV header: {0}")]
    Header(#[from] csv::Error),
}

/// Column indexes resolved from the header row.
struct ColumnMap {
    patient_id: usize,
    billing_code: usize,
    amount: usize,
    service_date: usize,
    units: Option<usize>,
    establishment: Option<usize>,
    context: Option<usize>,
}

/// Pick the delimiter that splits the header line into the most fields.
pub fn detect_delimiter(data: &[u8]) -> u8 {
    let header = data.split(|&b| b == b'\n').next().unwrap_or(data);

    CANDIDATE_DELIMITERS
        .iter()
        .copied()
        .max_by_key(|&d| header.iter().filter(|&&b| b == d).count())
        .unwrap_or(b',')
}

/// Stream-parse a delimited billing file into typed records.
///
/// `on_progress` receives the fraction of input bytes consumed (0.0..=1.0);
/// the caller maps it onto its own progress scale.
pub fn parse_billing_file(
    data: &[u8],
    mut on_progress: impl FnMut(f64),
) -> Result<ParseOutcome, ParseError> {
    if data.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ParseError::EmptyFile);
    }

    let delimiter = detect_delimiter(data);
    let total_bytes = data.len() as f64;

    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(data);

    let headers = reader.headers()?.clone();
    let columns = resolve_columns(&headers)?;

    let mut records = Vec::new();
    let mut violations = Vec::new();

    for (index, row) in reader.records().enumerate() {
        // Header is line 1; data rows are 1-indexed below it.
        let record_number = (index + 1) as i32;

        let row = match row {
            Ok(r) => r,
            Err(e) => {
                violations.push(row_violation(record_number, format!("unreadable row: {e}")));
                continue;
            }
        };

        match convert_row(&row, &columns, record_number) {
            Ok(record) => records.push(record),
            Err(message) => violations.push(row_violation(record_number, message)),
        }

        let consumed = row.position().map_or(0, |p| p.byte()) as f64;
        on_progress((consumed / total_bytes).clamp(0.0, 1.0));
    }

    on_progress(1.0);

    Ok(ParseOutcome {
        records,
        violations,
        delimiter,
    })
}

fn row_violation(record_number: i32, message: String) -> Violation {
    Violation {
        rule_name: PARSER_RULE.to_string(),
        record_id: None,
        record_number: Some(record_number),
        severity: Severity::Error,
        category: "parse".to_string(),
        message,
        remediation: Some("Correct the row in the source file and resubmit.".to_string()),
    }
}

fn resolve_columns(headers: &csv::StringRecord) -> Result<ColumnMap, ParseError> {
    let find = |aliases: &[&str]| {
        headers.iter().position(|h| {
            let h = h.trim().to_ascii_lowercase();
            aliases.iter().any(|a| h == *a)
        })
    };

    Ok(ColumnMap {
        patient_id: find(&["patient_id", "patient", "nam"])
            .ok_or(ParseError::MissingColumn("patient_id"))?,
        billing_code: find(&["billing_code", "code", "act_code"])
            .ok_or(ParseError::MissingColumn("billing_code"))?,
        amount: find(&["amount", "billed_amount", "montant"])
            .ok_or(ParseError::MissingColumn("amount"))?,
        service_date: find(&["service_date", "date", "date_service"])
            .ok_or(ParseError::MissingColumn("service_date"))?,
        units: find(&["units", "quantity"]),
        establishment: find(&["establishment", "establishment_code", "etablissement"]),
        context: find(&["context", "context_elements", "contexte"]),
    })
}

fn convert_row(
    row: &csv::StringRecord,
    columns: &ColumnMap,
    record_number: i32,
) -> Result<ParsedRecord, String> {
    let field = |idx: usize, name: &str| -> Result<&str, String> {
        row.get(idx)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| format!("missing value for {name}"))
    };

    let patient_id = field(columns.patient_id, "patient_id")?.to_string();
    let billing_code = field(columns.billing_code, "billing_code")?.to_string();
    let amount = parse_amount(field(columns.amount, "amount")?)?;
    let service_date = parse_date(field(columns.service_date, "service_date")?)?;

    let units = match columns.units.and_then(|i| row.get(i)).filter(|v| !v.is_empty()) {
        Some(raw) => raw
            .parse::<i32>()
            .map_err(|_| format!("invalid units value: {raw:?}"))?,
        None => 1,
    };

    let optional = |idx: Option<usize>| {
        idx.and_then(|i| row.get(i))
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    Ok(ParsedRecord {
        record_number,
        patient_id,
        billing_code,
        amount,
        units,
        service_date,
        establishment: optional(columns.establishment),
        context: optional(columns.context),
    })
}

/// Accepts both dot and comma decimal separators; billing exports from
/// French-locale systems use the latter.
fn parse_amount(raw: &str) -> Result<f64, String> {
    let normalized = raw.trim_start_matches('$').trim().replace(',', ".");
    normalized
        .parse::<f64>()
        .map_err(|_| format!("invalid amount: {raw:?}"))
}

fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%d/%m/%Y"))
        .map_err(|_| format!("invalid service date: {raw:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_csv(rows: usize) -> String {
        let mut out = String::from("patient_id,billing_code,amount,units,service_date\n");
        for i in 0..rows {
            out.push_str(&format!("P{:04},9162,49.80,1,2026-07-0{}\n", i, (i % 9) + 1));
        }
        out
    }

    #[test]
    fn detects_comma_delimiter() {
        assert_eq!(detect_delimiter(b"a,b,c\n1,2,3"), b',');
    }

    #[test]
    fn detects_semicolon_delimiter() {
        assert_eq!(detect_delimiter(b"patient;code;amount\nP1;9162;49,80"), b';');
    }

    #[test]
    fn detects_tab_delimiter() {
        assert_eq!(detect_delimiter(b"a\tb\tc\n"), b'\t');
    }

    #[test]
    fn parses_valid_rows() {
        let csv = sample_csv(5);
        let outcome = parse_billing_file(csv.as_bytes(), |_| {}).unwrap();
        assert_eq!(outcome.records.len(), 5);
        assert!(outcome.violations.is_empty());
        assert_eq!(outcome.records[0].record_number, 1);
        assert_eq!(outcome.records[4].record_number, 5);
        assert_eq!(outcome.records[0].amount, 49.80);
    }

    #[test]
    fn semicolon_file_with_decimal_comma() {
        let csv = "patient_id;billing_code;amount;service_date\nP1;9162;49,80;2026-07-01\n";
        let outcome = parse_billing_file(csv.as_bytes(), |_| {}).unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].amount, 49.80);
        assert_eq!(outcome.records[0].units, 1);
    }

    #[test]
    fn invalid_date_row_is_collected_not_fatal() {
        let mut csv = sample_csv(173);
        csv.push_str("P9999,9162,49.80,1,not-a-date\n");
        let outcome = parse_billing_file(csv.as_bytes(), |_| {}).unwrap();
        assert_eq!(outcome.records.len(), 173);
        assert_eq!(outcome.violations.len(), 1);
        assert_eq!(outcome.violations[0].record_number, Some(174));
        assert_eq!(outcome.violations[0].severity, Severity::Error);
        assert!(outcome.violations[0].message.contains("service date"));
    }

    #[test]
    fn missing_required_column_is_fatal() {
        let csv = "patient_id,amount,service_date\nP1,10.0,2026-07-01\n";
        let err = parse_billing_file(csv.as_bytes(), |_| {}).unwrap_err();
        assert!(matches!(err, ParseError::MissingColumn("billing_code")));
    }

    #[test]
    fn empty_file_is_fatal() {
        assert!(matches!(
            parse_billing_file(b"  \n", |_| {}),
            Err(ParseError::EmptyFile)
        ));
    }

    #[test]
    fn progress_reaches_one() {
        let csv = sample_csv(20);
        let mut last = 0.0;
        parse_billing_file(csv.as_bytes(), |p| last = p).unwrap();
        assert_eq!(last, 1.0);
    }

    #[test]
    fn accepts_alias_headers() {
        let csv = "nam,act_code,montant,date_service\nABCD1234,9162,49.80,2026-07-01\n";
        let outcome = parse_billing_file(csv.as_bytes(), |_| {}).unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].patient_id, "ABCD1234");
    }
}
