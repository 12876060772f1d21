//! Live table schema as reported by the relational store
//!
//! Fetched fresh for every attempt; nothing here is cached between files.

use serde::Serialize;

/// Coarse classification of a column's SQL type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ColumnKind {
    Integer,
    Decimal,
    Date,
    Timestamp,
    BoundedText(usize),
    Text,
    Boolean,
    Other,
}

impl ColumnKind {
    /// Classify an SQL type name
    ///
    /// Accepts both `information_schema` spellings with a separate length
    /// (`character varying`, `Some(20)`) and inline forms (`varchar(20)`).
    pub fn from_sql(data_type: &str, max_length: Option<usize>) -> Self {
        let lowered = data_type.trim().to_lowercase();
        let (base, inline_len) = match lowered.split_once('(') {
            Some((base, rest)) => (
                base.trim().to_string(),
                rest.trim_end_matches(')').trim().parse::<usize>().ok(),
            ),
            None => (lowered.clone(), None),
        };
        let length = max_length.or(inline_len);

        match base.as_str() {
            "smallint" | "integer" | "bigint" | "int" | "int2" | "int4" | "int8" | "smallserial"
            | "serial" | "bigserial" => ColumnKind::Integer,
            "numeric" | "decimal" | "real" | "double precision" | "float4" | "float8" => {
                ColumnKind::Decimal
            },
            "date" => ColumnKind::Date,
            t if t.starts_with("timestamp") => ColumnKind::Timestamp,
            "character varying" | "varchar" | "character" | "char" | "bpchar" => match length {
                Some(n) => ColumnKind::BoundedText(n),
                None => ColumnKind::Text,
            },
            "text" => ColumnKind::Text,
            "boolean" | "bool" => ColumnKind::Boolean,
            _ => ColumnKind::Other,
        }
    }

    pub fn is_temporal(self) -> bool {
        matches!(self, ColumnKind::Date | ColumnKind::Timestamp)
    }
}

/// One column of a target table
#[derive(Debug, Clone, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub kind: ColumnKind,
    pub nullable: bool,
    /// Default expression, if the store fills the column itself
    pub default: Option<String>,
    /// Store-native type name used for casts (`udt_name` in Postgres)
    pub sql_type: Option<String>,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, nullable: bool) -> Self {
        let data_type = data_type.into();
        Self {
            name: name.into(),
            kind: ColumnKind::from_sql(&data_type, None),
            data_type,
            nullable,
            default: None,
            sql_type: None,
        }
    }

    /// Build from `information_schema` fields
    pub fn from_catalog(
        name: impl Into<String>,
        data_type: impl Into<String>,
        max_length: Option<usize>,
        nullable: bool,
    ) -> Self {
        let data_type = data_type.into();
        Self {
            name: name.into(),
            kind: ColumnKind::from_sql(&data_type, max_length),
            data_type,
            nullable,
            default: None,
            sql_type: None,
        }
    }

    pub fn with_sql_type(mut self, sql_type: impl Into<String>) -> Self {
        self.sql_type = Some(sql_type.into());
        self
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }
}

/// Columns of a table in ordinal order
#[derive(Debug, Clone, Serialize)]
pub struct TableSchema {
    pub table: String,
    pub columns: Vec<ColumnInfo>,
}

impl TableSchema {
    pub fn new(table: impl Into<String>, columns: Vec<ColumnInfo>) -> Self {
        Self {
            table: table.into(),
            columns,
        }
    }

    pub fn get(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_information_schema_names() {
        assert_eq!(ColumnKind::from_sql("integer", None), ColumnKind::Integer);
        assert_eq!(ColumnKind::from_sql("bigint", None), ColumnKind::Integer);
        assert_eq!(ColumnKind::from_sql("numeric", None), ColumnKind::Decimal);
        assert_eq!(
            ColumnKind::from_sql("timestamp without time zone", None),
            ColumnKind::Timestamp
        );
        assert_eq!(
            ColumnKind::from_sql("character varying", Some(20)),
            ColumnKind::BoundedText(20)
        );
        assert_eq!(ColumnKind::from_sql("character varying", None), ColumnKind::Text);
        assert_eq!(ColumnKind::from_sql("uuid", None), ColumnKind::Other);
    }

    #[test]
    fn test_kind_from_inline_length() {
        assert_eq!(ColumnKind::from_sql("VARCHAR(12)", None), ColumnKind::BoundedText(12));
        assert_eq!(ColumnKind::from_sql("char(2)", None), ColumnKind::BoundedText(2));
    }

    #[test]
    fn test_schema_lookup() {
        let schema = TableSchema::new(
            "orders",
            vec![
                ColumnInfo::new("id", "bigserial", false).with_default("nextval('orders_id_seq')"),
                ColumnInfo::new("code", "varchar(10)", false),
            ],
        );
        assert!(schema.get("id").unwrap().has_default());
        assert_eq!(schema.get("code").unwrap().kind, ColumnKind::BoundedText(10));
        assert!(!schema.contains("missing"));
    }
}
