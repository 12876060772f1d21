//! Validation gate
//!
//! Checks a whole parsed file against the target table's live schema before
//! anything is loaded. Every rule runs over every row and all violations are
//! collected, so one report shows everything wrong with the file.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

use crate::error::{IngestError, IngestResult};
use crate::record::{FieldValue, TypedRow};
use crate::schema::{ColumnInfo, ColumnKind, TableSchema};

#[allow(clippy::unwrap_used)]
static INTEGER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[+-]?\d+$").unwrap());

#[allow(clippy::unwrap_used)]
static DECIMAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[+-]?(\d+\.?\d*|\.\d+)([eE][+-]?\d+)?$").unwrap());

const TEMPORAL_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
];

/// Outcome of the gate
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub violations: Vec<String>,
}

impl ValidationReport {
    pub fn ok(&self) -> bool {
        self.violations.is_empty()
    }

    /// Fail closed: any violation becomes `ValidationFailed`
    pub fn into_result(self) -> IngestResult<()> {
        if self.ok() {
            Ok(())
        } else {
            Err(IngestError::ValidationFailed(self.violations))
        }
    }
}

pub struct ValidationGate;

impl ValidationGate {
    pub fn validate(rows: &[TypedRow], schema: &TableSchema) -> ValidationReport {
        let mut violations = Vec::new();

        let empty_rows: Vec<usize> = rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.values().all(FieldValue::is_null))
            .map(|(index, _)| index)
            .collect();
        if !empty_rows.is_empty() {
            violations.push(format!("Empty rows found at indices: {:?}", empty_rows));
        }

        for column in &schema.columns {
            if !rows.iter().any(|row| row.contains_key(&column.name)) {
                continue;
            }
            violations.extend(check_column(rows, column));
        }

        ValidationReport { violations }
    }
}

fn check_column(rows: &[TypedRow], column: &ColumnInfo) -> Vec<String> {
    let mut nulls = Vec::new();
    let mut bad_type = Vec::new();
    let mut too_long = Vec::new();

    for (index, row) in rows.iter().enumerate() {
        let Some(value) = row.get(&column.name) else {
            continue;
        };
        let Some(text) = value.render() else {
            if !column.nullable && !column.has_default() {
                nulls.push(index);
            }
            continue;
        };

        match column.kind {
            ColumnKind::Integer if !INTEGER.is_match(&text) => bad_type.push(index),
            ColumnKind::Decimal if !DECIMAL.is_match(&text) => bad_type.push(index),
            kind if kind.is_temporal() && !is_temporal(value) => bad_type.push(index),
            ColumnKind::BoundedText(max) if text.chars().count() > max => too_long.push(index),
            _ => {},
        }
    }

    let mut violations = Vec::new();
    if !nulls.is_empty() {
        violations.push(format!(
            "Null values in non-nullable column {} at rows: {:?}",
            column.name, nulls
        ));
    }
    if !bad_type.is_empty() {
        let message = match column.kind {
            ColumnKind::Integer | ColumnKind::Decimal => "Non-numeric values",
            _ => "Invalid date format",
        };
        violations.push(format!(
            "{} in column {} at rows: {:?}",
            message, column.name, bad_type
        ));
    }
    if let (ColumnKind::BoundedText(max), false) = (column.kind, too_long.is_empty()) {
        violations.push(format!(
            "Values exceeding max length ({}) in column {} at rows: {:?}",
            max, column.name, too_long
        ));
    }
    violations
}

fn is_temporal(value: &FieldValue) -> bool {
    match value {
        FieldValue::Date(_) | FieldValue::DateTime(_) => true,
        FieldValue::String(s) => {
            let s = s.trim();
            NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
                || TEMPORAL_FORMATS
                    .iter()
                    .any(|f| NaiveDateTime::parse_from_str(s, f).is_ok())
                || DateTime::parse_from_rfc3339(s).is_ok()
        },
        _ => false,
    }
}
