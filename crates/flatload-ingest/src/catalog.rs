//! Schema catalog
//!
//! Static mapping from pattern name to the file regex, target table, read
//! options and positional column mappings. Built once from configuration at
//! startup and never mutated afterwards.

use encoding_rs::Encoding;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::error::{IngestError, IngestResult};

/// Declared type of a mapped column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DataType {
    String,
    Integer,
    Float,
    Date,
    DateTime,
    Boolean,
    /// Anything else; coerced as a string with a warning
    Unknown(String),
}

impl DataType {
    pub fn as_str(&self) -> &str {
        match self {
            DataType::String => "string",
            DataType::Integer => "integer",
            DataType::Float => "float",
            DataType::Date => "date",
            DataType::DateTime => "datetime",
            DataType::Boolean => "boolean",
            DataType::Unknown(name) => name,
        }
    }
}

impl From<String> for DataType {
    fn from(s: String) -> Self {
        match s.to_lowercase().as_str() {
            "string" => DataType::String,
            "integer" => DataType::Integer,
            "float" => DataType::Float,
            "date" => DataType::Date,
            "datetime" => DataType::DateTime,
            "boolean" => DataType::Boolean,
            _ => DataType::Unknown(s),
        }
    }
}

impl From<DataType> for String {
    fn from(data_type: DataType) -> Self {
        data_type.as_str().to_string()
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One positional source column mapped onto a target column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    #[serde(alias = "column_index")]
    pub source_index: usize,
    #[serde(alias = "db_column")]
    pub target_column: String,
    pub data_type: DataType,
    #[serde(default)]
    pub required: bool,
}

impl ColumnMapping {
    pub fn new(
        source_index: usize,
        target_column: impl Into<String>,
        data_type: DataType,
        required: bool,
    ) -> Self {
        Self {
            source_index,
            target_column: target_column.into(),
            data_type,
            required,
        }
    }
}

/// Read options for one file format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadOptions {
    pub delimiter: char,
    pub has_header: bool,
    pub quote: char,
    /// Trim surrounding whitespace from every raw field while reading
    pub trim: bool,
    /// Source text encoding label (`latin1`, `windows-1252`, ...); UTF-8 when unset
    pub encoding: Option<String>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            delimiter: ',',
            has_header: false,
            quote: '"',
            trim: false,
            encoding: None,
        }
    }
}

impl ReadOptions {
    /// Check the options can drive a reader
    pub fn check(&self) -> Result<(), String> {
        for (option, c) in [("delimiter", self.delimiter), ("quote", self.quote)] {
            if !c.is_ascii() {
                return Err(format!("{} '{}' is not a single ASCII character", option, c));
            }
        }
        if self.delimiter == self.quote {
            return Err("delimiter and quote must differ".to_string());
        }
        if let Some(label) = &self.encoding {
            if Encoding::for_label(label.as_bytes()).is_none() {
                return Err(format!("unknown encoding '{}'", label));
            }
        }
        Ok(())
    }
}

/// Pattern entry as it appears in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilePatternConfig {
    #[serde(alias = "pattern")]
    pub file_regex: String,
    #[serde(alias = "table")]
    pub target_table: String,
    #[serde(default)]
    pub read_options: BTreeMap<String, ReadOptions>,
    pub column_mappings: Vec<ColumnMapping>,
}

/// Compiled, validated pattern
#[derive(Debug, Clone)]
pub struct FilePattern {
    pub name: String,
    pub file_regex: Regex,
    pub target_table: String,
    pub read_options: BTreeMap<String, ReadOptions>,
    pub column_mappings: Vec<ColumnMapping>,
}

impl FilePattern {
    /// Compile and check a configured pattern
    ///
    /// The regex is anchored at the start of the file name.
    pub fn compile(name: &str, config: &FilePatternConfig) -> IngestResult<Self> {
        let file_regex = Regex::new(&format!("^(?:{})", config.file_regex)).map_err(|e| {
            IngestError::config(format!("pattern '{}': invalid file regex: {}", name, e))
        })?;

        if config.target_table.trim().is_empty() {
            return Err(IngestError::config(format!(
                "pattern '{}': target table is empty",
                name
            )));
        }

        if config.column_mappings.is_empty() {
            return Err(IngestError::config(format!(
                "pattern '{}': no column mappings defined",
                name
            )));
        }

        let mut indices = HashSet::new();
        let mut targets = HashSet::new();
        for mapping in &config.column_mappings {
            if !indices.insert(mapping.source_index) {
                return Err(IngestError::config(format!(
                    "pattern '{}': source index {} is mapped more than once",
                    name, mapping.source_index
                )));
            }
            if !targets.insert(mapping.target_column.as_str()) {
                return Err(IngestError::config(format!(
                    "pattern '{}': target column '{}' is mapped more than once",
                    name, mapping.target_column
                )));
            }
        }

        let read_options = config
            .read_options
            .iter()
            .map(|(format, options)| {
                options.check().map_err(|reason| {
                    IngestError::config(format!(
                        "pattern '{}': read options for '{}': {}",
                        name, format, reason
                    ))
                })?;
                Ok((format.to_lowercase(), options.clone()))
            })
            .collect::<IngestResult<_>>()?;

        Ok(Self {
            name: name.to_string(),
            file_regex,
            target_table: config.target_table.clone(),
            read_options,
            column_mappings: config.column_mappings.clone(),
        })
    }

    /// Minimum column count any matching file must have
    pub fn min_columns(&self) -> usize {
        self.column_mappings
            .iter()
            .map(|m| m.source_index + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn matches(&self, file_name: &str) -> bool {
        self.file_regex.is_match(file_name)
    }

    /// Options for `format`, falling back to defaults
    pub fn read_options_for(&self, format: &str) -> ReadOptions {
        self.read_options
            .get(&format.to_lowercase())
            .cloned()
            .unwrap_or_default()
    }
}

/// All configured patterns, ordered by name
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    patterns: Vec<FilePattern>,
}

impl SchemaCatalog {
    pub fn from_config(patterns: &BTreeMap<String, FilePatternConfig>) -> IngestResult<Self> {
        let patterns = patterns
            .iter()
            .map(|(name, config)| FilePattern::compile(name, config))
            .collect::<IngestResult<Vec<_>>>()?;

        Ok(Self { patterns })
    }

    pub fn get(&self, name: &str) -> Option<&FilePattern> {
        self.patterns.iter().find(|p| p.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FilePattern> {
        self.patterns.iter()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
