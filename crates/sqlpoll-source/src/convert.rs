//! Row to record conversion
//!
//! Rows come back from the execution layer either positionally (values only)
//! or by name (`column -> value`). Positional rows become delimited records,
//! named rows become JSON objects. Every cell is rendered through the value's
//! canonical string form, so both encodings agree on what a value looks like.
//!
//! JSON objects keep the select order of their columns. When two columns
//! share a name the later value wins.

use serde_json::{Map, Value as JsonValue};
use sqlpoll_rdbc::types::{Row, Value};
use std::collections::HashSet;
use tracing::warn;

use crate::config::{OutputFormat, SourceConfig};

/// A result row before conversion
#[derive(Debug, Clone, PartialEq)]
pub enum RawRow {
    /// Column values in select order
    Positional(Vec<Value>),
    /// `(column, value)` pairs in select order
    Named(Vec<(String, Value)>),
}

impl RawRow {
    /// Shape a database row for the given output format
    pub fn from_row(row: Row, format: OutputFormat) -> Self {
        match format {
            OutputFormat::Delimited => Self::Positional(row.into_values()),
            OutputFormat::Json => Self::Named(row.into_pairs()),
        }
    }
}

/// A record ready to be handed downstream
#[derive(Debug, Clone, PartialEq)]
pub enum ConvertedRecord {
    /// Cell strings in column order
    Delimited(Vec<String>),
    /// Object of column name to cell string
    Json(Map<String, JsonValue>),
}

impl ConvertedRecord {
    /// Encode as an event body: one delimited line, or compact JSON
    pub fn to_bytes(&self, encoder: &DelimitedEncoder) -> std::io::Result<Vec<u8>> {
        match self {
            Self::Delimited(fields) => encoder.encode(fields).map(String::into_bytes),
            Self::Json(map) => serde_json::to_vec(map).map_err(std::io::Error::from),
        }
    }
}

/// Render a cell. SQL NULL becomes the empty string.
#[inline]
pub fn render(value: &Value) -> String {
    value.to_string()
}

/// Stateless row converter
#[derive(Debug, Clone, Copy, Default)]
pub struct RowConverter;

impl RowConverter {
    /// Render positional rows as string rows, preserving order.
    ///
    /// `None` and an empty slice both yield an empty result.
    pub fn to_delimited_rows(rows: Option<&[Vec<Value>]>) -> Vec<Vec<String>> {
        rows.unwrap_or_default()
            .iter()
            .map(|row| row.iter().map(render).collect())
            .collect()
    }

    /// Render named rows as a JSON array with one object per row.
    ///
    /// Values are the same strings [`to_delimited_rows`](Self::to_delimited_rows)
    /// would produce. `None` and an empty slice both yield `[]`.
    pub fn to_json_array(rows: Option<&[Vec<(String, Value)>]>) -> JsonValue {
        let rows = rows.unwrap_or_default();
        if let Some(first) = rows.first() {
            warn_duplicate_columns(first);
        }
        JsonValue::Array(
            rows.iter()
                .map(|row| JsonValue::Object(json_object(row)))
                .collect(),
        )
    }

    /// Convert each raw row according to its shape
    pub fn convert(rows: &[RawRow]) -> Vec<ConvertedRecord> {
        let first_named = rows.iter().find_map(|row| match row {
            RawRow::Named(pairs) => Some(pairs),
            RawRow::Positional(_) => None,
        });
        if let Some(pairs) = first_named {
            warn_duplicate_columns(pairs);
        }

        rows.iter()
            .map(|row| match row {
                RawRow::Positional(values) => {
                    ConvertedRecord::Delimited(values.iter().map(render).collect())
                }
                RawRow::Named(pairs) => ConvertedRecord::Json(json_object(pairs)),
            })
            .collect()
    }
}

/// Column names that appear more than once, in select order
fn duplicate_columns(pairs: &[(String, Value)]) -> Vec<&str> {
    let mut seen = HashSet::new();
    let mut duplicates = Vec::new();
    for (column, _) in pairs {
        if !seen.insert(column.as_str()) && !duplicates.contains(&column.as_str()) {
            duplicates.push(column.as_str());
        }
    }
    duplicates
}

fn warn_duplicate_columns(pairs: &[(String, Value)]) {
    let duplicates = duplicate_columns(pairs);
    if !duplicates.is_empty() {
        warn!(
            columns = ?duplicates,
            "Result has duplicate column names, alias them to keep every value in JSON records"
        );
    }
}

fn json_object(pairs: &[(String, Value)]) -> Map<String, JsonValue> {
    pairs
        .iter()
        .map(|(column, value)| (column.clone(), JsonValue::String(render(value))))
        .collect()
}

/// Writes delimited records as single CSV lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelimitedEncoder {
    delimiter: u8,
    quote_all: bool,
}

impl Default for DelimitedEncoder {
    fn default() -> Self {
        Self::new(b',', false)
    }
}

impl DelimitedEncoder {
    /// Create an encoder
    pub fn new(delimiter: u8, quote_all: bool) -> Self {
        Self {
            delimiter,
            quote_all,
        }
    }

    /// Encoder using the configured `delimiter` and `encloseByQuotes`
    pub fn from_config(config: &SourceConfig) -> Self {
        Self::new(config.delimiter, config.enclose_by_quotes)
    }

    /// Field separator
    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }

    /// Encode one record, without a line terminator.
    ///
    /// Fields containing the delimiter, quotes or newlines are quoted; with
    /// `quote_all` every field is.
    pub fn encode(&self, fields: &[String]) -> std::io::Result<String> {
        let quote_style = if self.quote_all {
            csv::QuoteStyle::Always
        } else {
            csv::QuoteStyle::Necessary
        };

        let mut writer = csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .quote_style(quote_style)
            .terminator(csv::Terminator::Any(b'\n'))
            .has_headers(false)
            .from_writer(Vec::new());

        writer.write_record(fields)?;
        let mut bytes = writer.into_inner().map_err(|e| e.into_error())?;
        if bytes.last() == Some(&b'\n') {
            bytes.pop();
        }

        String::from_utf8(bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_null_is_empty() {
        assert_eq!(render(&Value::Null), "");
        assert_eq!(render(&Value::Int64(-4)), "-4");
    }

    #[test]
    fn test_raw_row_from_row() {
        let row = Row::new(
            vec!["id".into(), "name".into()],
            vec![Value::Int32(1), Value::String("a".into())],
        );

        assert_eq!(
            RawRow::from_row(row.clone(), OutputFormat::Delimited),
            RawRow::Positional(vec![Value::Int32(1), Value::String("a".into())])
        );
        assert!(matches!(
            RawRow::from_row(row, OutputFormat::Json),
            RawRow::Named(pairs) if pairs[1].0 == "name"
        ));
    }

    #[test]
    fn test_encode_quotes_when_needed() {
        let encoder = DelimitedEncoder::default();
        let line = encoder
            .encode(&["a".into(), "b,c".into(), "say \"hi\"".into()])
            .unwrap();
        assert_eq!(line, r#"a,"b,c","say ""hi""""#);
    }

    #[test]
    fn test_encode_quote_all_custom_delimiter() {
        let encoder = DelimitedEncoder::new(b'|', true);
        let line = encoder.encode(&["1".into(), "x".into()]).unwrap();
        assert_eq!(line, r#""1"|"x""#);
        assert_eq!(encoder.delimiter(), b'|');
    }

    #[test]
    fn test_json_keeps_select_order() {
        let pairs = vec![
            ("zeta".to_string(), Value::Int32(1)),
            ("alpha".to_string(), Value::Int32(2)),
            ("mid".to_string(), Value::Null),
        ];
        let records = RowConverter::convert(&[RawRow::Named(pairs)]);
        let encoder = DelimitedEncoder::default();
        assert_eq!(
            records[0].to_bytes(&encoder).unwrap(),
            br#"{"zeta":"1","alpha":"2","mid":""}"#.to_vec()
        );
    }

    #[test]
    fn test_duplicate_columns() {
        let pairs = vec![
            ("id".to_string(), Value::Int32(1)),
            ("name".to_string(), Value::Null),
            ("id".to_string(), Value::Int32(2)),
            ("id".to_string(), Value::Int32(3)),
        ];
        assert_eq!(duplicate_columns(&pairs), vec!["id"]);

        let object = json_object(&pairs);
        assert_eq!(object.len(), 2);
        assert_eq!(object["id"], JsonValue::String("3".into()));
        assert_eq!(object.keys().next().map(String::as_str), Some("id"));
    }

    #[test]
    fn test_to_bytes() {
        let encoder = DelimitedEncoder::default();
        let record = ConvertedRecord::Delimited(vec!["1".into(), "".into(), "z".into()]);
        assert_eq!(record.to_bytes(&encoder).unwrap(), b"1,,z".to_vec());

        let mut map = Map::new();
        map.insert("id".into(), JsonValue::String("1".into()));
        let record = ConvertedRecord::Json(map);
        assert_eq!(record.to_bytes(&encoder).unwrap(), br#"{"id":"1"}"#.to_vec());
    }
}
