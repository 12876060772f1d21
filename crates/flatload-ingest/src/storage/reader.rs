//! Row decoding shared by every storage backend
//!
//! Delimited text goes through `csv`; JSON arrays and JSON lines through
//! `serde_json`. Every format yields positional string rows. Bytes in a
//! configured non-UTF-8 encoding are transcoded with `encoding_rs` first.

use encoding_rs::{Encoding, UTF_8};
use serde_json::Value;
use std::borrow::Cow;

use crate::catalog::ReadOptions;
use crate::error::{IngestError, IngestResult};
use crate::record::RawRow;

/// Formats the reader understands, by lowercased file extension
pub const SUPPORTED_FORMATS: [&str; 4] = ["csv", "txt", "json", "jsonl"];

/// Lowercased extension of `file_name`, empty when there is none
pub fn format_of(file_name: &str) -> String {
    file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default()
}

/// Decode `bytes` read from `path` into raw rows
pub fn decode(
    bytes: &[u8],
    format: &str,
    options: &ReadOptions,
    path: &str,
) -> IngestResult<Vec<RawRow>> {
    if !SUPPORTED_FORMATS.contains(&format) {
        return Err(IngestError::UnsupportedFormat(if format.is_empty() {
            format!("no extension on '{}'", path)
        } else {
            format.to_string()
        }));
    }

    let bytes = transcode(bytes, options, path)?;
    let mut rows = match format {
        "csv" | "txt" => decode_delimited(&bytes, options, path)?,
        "json" => decode_json(&bytes, options, path)?,
        _ => decode_json_lines(&bytes, options, path)?,
    };

    if options.trim {
        for row in &mut rows {
            for field in row.iter_mut() {
                let trimmed = field.trim();
                if trimmed.len() != field.len() {
                    *field = trimmed.to_string();
                }
            }
        }
    }

    Ok(rows)
}

/// Re-encode `bytes` as UTF-8 when the options name another encoding
fn transcode<'a>(
    bytes: &'a [u8],
    options: &ReadOptions,
    path: &str,
) -> IngestResult<Cow<'a, [u8]>> {
    let Some(label) = &options.encoding else {
        return Ok(Cow::Borrowed(bytes));
    };
    let encoding = Encoding::for_label(label.as_bytes())
        .ok_or_else(|| read_error(path, format!("unknown encoding '{}'", label)))?;
    if encoding == UTF_8 {
        return Ok(Cow::Borrowed(bytes));
    }

    let (text, _, had_errors) = encoding.decode(bytes);
    if had_errors {
        return Err(read_error(path, format!("malformed {} input", encoding.name())));
    }
    Ok(match text {
        Cow::Borrowed(text) => Cow::Borrowed(text.as_bytes()),
        Cow::Owned(text) => Cow::Owned(text.into_bytes()),
    })
}

fn ascii_byte(path: &str, option: &str, c: char) -> IngestResult<u8> {
    u8::try_from(c)
        .ok()
        .filter(u8::is_ascii)
        .ok_or_else(|| read_error(path, format!("{} must be a single ASCII character", option)))
}

fn read_error(path: &str, reason: impl ToString) -> IngestError {
    IngestError::Read {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

fn decode_delimited(bytes: &[u8], options: &ReadOptions, path: &str) -> IngestResult<Vec<RawRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(ascii_byte(path, "delimiter", options.delimiter)?)
        .quote(ascii_byte(path, "quote", options.quote)?)
        .has_headers(options.has_header)
        .flexible(true)
        .from_reader(bytes);

    reader
        .records()
        .map(|record| {
            record
                .map(|r| r.iter().map(str::to_string).collect())
                .map_err(|e| read_error(path, e))
        })
        .collect()
}

/// Flatten one JSON row: arrays by position, objects by key order in the document
fn scalar_row(value: Value, path: &str, line: usize) -> IngestResult<RawRow> {
    let items: Vec<Value> = match value {
        Value::Array(items) => items,
        Value::Object(fields) => fields.into_iter().map(|(_, v)| v).collect(),
        _ => {
            return Err(read_error(
                path,
                format!("row {} is neither an array nor an object", line),
            ))
        },
    };

    items
        .into_iter()
        .map(|item| match item {
            Value::Null => Ok(String::new()),
            Value::String(s) => Ok(s),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Number(n) => Ok(n.to_string()),
            Value::Array(_) | Value::Object(_) => Err(read_error(
                path,
                format!("row {} contains a nested value", line),
            )),
        })
        .collect()
}

fn skip_header(rows: Vec<RawRow>, options: &ReadOptions) -> Vec<RawRow> {
    if options.has_header {
        rows.into_iter().skip(1).collect()
    } else {
        rows
    }
}

fn decode_json(bytes: &[u8], options: &ReadOptions, path: &str) -> IngestResult<Vec<RawRow>> {
    let document: Value = serde_json::from_slice(bytes).map_err(|e| read_error(path, e))?;
    let Value::Array(rows) = document else {
        return Err(read_error(path, "top-level value is not an array of rows"));
    };

    let rows = rows
        .into_iter()
        .enumerate()
        .map(|(i, row)| scalar_row(row, path, i))
        .collect::<IngestResult<Vec<_>>>()?;
    Ok(skip_header(rows, options))
}

fn decode_json_lines(bytes: &[u8], options: &ReadOptions, path: &str) -> IngestResult<Vec<RawRow>> {
    let text = std::str::from_utf8(bytes).map_err(|e| read_error(path, e))?;

    let rows = text
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            let value: Value = serde_json::from_str(line).map_err(|e| read_error(path, e))?;
            scalar_row(value, path, i)
        })
        .collect::<IngestResult<Vec<_>>>()?;
    Ok(skip_header(rows, options))
}
