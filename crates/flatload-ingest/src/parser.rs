//! Schema-mapped parser
//!
//! Turns positional raw rows into typed rows according to a pattern's column
//! mappings. Pure: the same rows and pattern always produce the same output,
//! so a file can be re-parsed on every attempt.

use chrono::{NaiveDate, NaiveDateTime};
use tracing::{debug, warn};

use crate::catalog::{ColumnMapping, DataType, FilePattern};
use crate::error::{IngestError, IngestResult};
use crate::record::{FieldValue, RawRow, TypedRow, DATETIME_FORMAT, DATE_FORMAT};

const TRUE_VALUES: [&str; 4] = ["true", "1", "yes", "y"];

pub struct SchemaMappedParser<'a> {
    pattern: &'a FilePattern,
}

impl<'a> SchemaMappedParser<'a> {
    pub fn new(pattern: &'a FilePattern) -> Self {
        Self { pattern }
    }

    /// Parse every row, failing on the first bad field
    pub fn parse(&self, rows: &[RawRow]) -> IngestResult<Vec<TypedRow>> {
        let expected = self.pattern.min_columns();
        let found = rows.first().map(Vec::len).unwrap_or(0);
        if rows.is_empty() || found < expected {
            return Err(IngestError::SchemaMismatch { expected, found });
        }

        for mapping in &self.pattern.column_mappings {
            if let DataType::Unknown(name) = &mapping.data_type {
                warn!(
                    pattern = %self.pattern.name,
                    column = %mapping.target_column,
                    data_type = %name,
                    "Unknown data type, treating as string"
                );
            }
        }

        let parsed = rows
            .iter()
            .enumerate()
            .map(|(index, row)| self.parse_row(index, row))
            .collect::<IngestResult<Vec<_>>>()?;

        debug!(pattern = %self.pattern.name, rows = parsed.len(), "Parsed rows");
        Ok(parsed)
    }

    /// Parse one row; `index` is the 0-based data row number
    pub fn parse_row(&self, index: usize, row: &RawRow) -> IngestResult<TypedRow> {
        let mut typed = TypedRow::new();

        for mapping in &self.pattern.column_mappings {
            let raw = row.get(mapping.source_index).map(String::as_str).unwrap_or("");

            if raw.trim().is_empty() {
                if mapping.required {
                    return Err(IngestError::RequiredFieldMissing {
                        row: index,
                        column: mapping.target_column.clone(),
                    });
                }
                typed.insert(mapping.target_column.clone(), FieldValue::Null);
                continue;
            }

            let value = coerce(raw, &mapping.data_type)
                .ok_or_else(|| conversion_error(index, mapping, raw))?;
            typed.insert(mapping.target_column.clone(), value);
        }

        Ok(typed)
    }
}

fn conversion_error(row: usize, mapping: &ColumnMapping, raw: &str) -> IngestError {
    IngestError::TypeConversion {
        row,
        column: mapping.target_column.clone(),
        value: raw.to_string(),
        data_type: mapping.data_type.to_string(),
    }
}

/// Coerce a non-empty raw value; `None` means it does not convert
fn coerce(raw: &str, data_type: &DataType) -> Option<FieldValue> {
    let trimmed = raw.trim();

    match data_type {
        DataType::String | DataType::Unknown(_) => Some(FieldValue::String(trimmed.to_string())),
        DataType::Integer => trimmed.parse::<i64>().ok().map(FieldValue::Integer),
        DataType::Float => trimmed
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(FieldValue::Float),
        DataType::Date => NaiveDate::parse_from_str(trimmed, DATE_FORMAT)
            .ok()
            .map(FieldValue::Date),
        DataType::DateTime => NaiveDateTime::parse_from_str(trimmed, DATETIME_FORMAT)
            .ok()
            .map(FieldValue::DateTime),
        DataType::Boolean => {
            let lowered = trimmed.to_lowercase();
            Some(FieldValue::Boolean(TRUE_VALUES.contains(&lowered.as_str())))
        },
    }
}
