//! Typed access to column-oriented tool reports
//!
//! External tools report results as whitespace-delimited tables. Rows are
//! parsed against a declared schema up front: field count and field types
//! are validated at parse time and fail with a `Parse` error naming the line
//! and column, never with an out-of-range index later on.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Integer,
    /// Accepts a trailing `%` (tools report identity/coverage that way)
    Float,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Column {
    name: String,
    kind: ColumnType,
}

/// Declared shape of a tool's report rows
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableSchema {
    columns: Vec<Column>,
}

impl TableSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn column(mut self, name: impl Into<String>, kind: ColumnType) -> Self {
        self.columns.push(Column {
            name: name.into(),
            kind,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Parse one data row. `line_no` is 1-based, for error messages.
    pub fn parse_row(&self, line: &str, line_no: usize) -> Result<TableRow> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != self.columns.len() {
            return Err(EngineError::parse(format!(
                "Line {}: expected {} fields, found {}",
                line_no,
                self.columns.len(),
                fields.len()
            )));
        }

        let mut values = Vec::with_capacity(self.columns.len());
        for (column, raw) in self.columns.iter().zip(fields) {
            let value = match column.kind {
                ColumnType::Text => FieldValue::Text(raw.to_string()),
                ColumnType::Integer => {
                    FieldValue::Integer(raw.parse::<i64>().map_err(|_| {
                        EngineError::parse(format!(
                            "Line {}: column '{}' is not an integer: {}",
                            line_no, column.name, raw
                        ))
                    })?)
                }
                ColumnType::Float => {
                    let trimmed = raw.trim_end_matches('%');
                    FieldValue::Float(trimmed.parse::<f64>().map_err(|_| {
                        EngineError::parse(format!(
                            "Line {}: column '{}' is not a float: {}",
                            line_no, column.name, raw
                        ))
                    })?)
                }
            };
            values.push((column.name.clone(), value));
        }
        Ok(TableRow { values })
    }

    /// Parse a whole report, skipping blank lines and `#` comments.
    pub fn parse_report(&self, text: &str) -> Result<Vec<TableRow>> {
        let mut rows = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            rows.push(self.parse_row(line, idx + 1)?);
        }
        Ok(rows)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Float(f64),
}

impl FieldValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Text(_) => "text",
            FieldValue::Integer(_) => "integer",
            FieldValue::Float(_) => "float",
        }
    }
}

/// One parsed report row; fields are looked up by column name.
#[derive(Debug, Clone)]
pub struct TableRow {
    values: Vec<(String, FieldValue)>,
}

impl TableRow {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, name: &str) -> Result<&FieldValue> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .ok_or_else(|| EngineError::parse(format!("No such column: {}", name)))
    }

    pub fn get_str(&self, name: &str) -> Result<&str> {
        match self.get(name)? {
            FieldValue::Text(s) => Ok(s),
            other => Err(self.mismatch(name, "text", other)),
        }
    }

    pub fn get_i64(&self, name: &str) -> Result<i64> {
        match self.get(name)? {
            FieldValue::Integer(v) => Ok(*v),
            other => Err(self.mismatch(name, "integer", other)),
        }
    }

    pub fn get_f64(&self, name: &str) -> Result<f64> {
        match self.get(name)? {
            FieldValue::Float(v) => Ok(*v),
            FieldValue::Integer(v) => Ok(*v as f64),
            other => Err(self.mismatch(name, "float", other)),
        }
    }

    fn mismatch(&self, name: &str, wanted: &str, got: &FieldValue) -> EngineError {
        EngineError::parse(format!(
            "Column '{}' is {}, not {}",
            name,
            got.type_name(),
            wanted
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alignment_schema() -> TableSchema {
        TableSchema::new()
            .column("name", ColumnType::Text)
            .column("start", ColumnType::Integer)
            .column("end", ColumnType::Integer)
            .column("identity", ColumnType::Float)
    }

    #[test]
    fn test_parse_row_named_fields() {
        let schema = alignment_schema();
        let row = schema.parse_row("chr1 100 250 98.5%", 1).unwrap();

        assert_eq!(row.get_str("name").unwrap(), "chr1");
        assert_eq!(row.get_i64("start").unwrap(), 100);
        assert_eq!(row.get_i64("end").unwrap(), 250);
        assert!((row.get_f64("identity").unwrap() - 98.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_wrong_field_count_is_parse_error() {
        let schema = alignment_schema();
        let err = schema.parse_row("chr1 100 250", 7).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Line 7"));
        assert!(msg.contains("expected 4 fields"));
    }

    #[test]
    fn test_wrong_field_type_is_parse_error() {
        let schema = alignment_schema();
        let err = schema.parse_row("chr1 abc 250 98.5", 2).unwrap_err();
        assert!(err.to_string().contains("column 'start'"));
    }

    #[test]
    fn test_missing_column_lookup() {
        let schema = alignment_schema();
        let row = schema.parse_row("chr1 1 2 3.0", 1).unwrap();
        assert!(row.get("score").is_err());
    }

    #[test]
    fn test_typed_lookup_mismatch() {
        let schema = alignment_schema();
        let row = schema.parse_row("chr1 1 2 3.0", 1).unwrap();
        assert!(row.get_i64("name").is_err());
        // Integer column widens to float on request
        assert!((row.get_f64("start").unwrap() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_report_skips_comments_and_blanks() {
        let schema = alignment_schema();
        let report = "# produced by tool v1\n\nchr1 1 10 99%\nchr2 5 20 87.25\n";
        let rows = schema.parse_report(report).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get_str("name").unwrap(), "chr2");
    }

    #[test]
    fn test_parse_report_bad_row_names_line() {
        let schema = alignment_schema();
        let report = "chr1 1 10 99%\nchr2 oops 20 87\n";
        let err = schema.parse_report(report).unwrap_err();
        assert!(err.to_string().contains("Line 2"));
    }

    #[test]
    fn test_schema_serde_roundtrip() {
        let schema = alignment_schema();
        let json = serde_json::to_string(&schema).unwrap();
        let back: TableSchema = serde_json::from_str(&json).unwrap();
        assert_eq!(back.len(), 4);
        assert!(back.parse_row("x 1 2 3.5", 1).is_ok());
    }
}
