//! Untyped row values read from staging and production tables.
//!
//! Column sets differ between dumps and the live schema, so rows are kept as
//! name -> value maps rather than structs.

use anyhow::Result;
use rusqlite::types::Value;
use rusqlite::{Params, Statement};
use std::collections::BTreeMap;

/// One row, keyed by column name.
pub type Record = BTreeMap<String, Value>;

/// Run a prepared query and collect every row as a [`Record`].
pub fn query_records<P: Params>(stmt: &mut Statement<'_>, params: P) -> Result<Vec<Record>> {
    let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let rows = stmt
        .query_map(params, |row| {
            let mut record = Record::new();
            for (i, name) in names.iter().enumerate() {
                record.insert(name.clone(), row.get::<_, Value>(i)?);
            }
            Ok(record)
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Read a column as an integer id. Text that parses as an integer is accepted.
pub fn get_i64(record: &Record, column: &str) -> Option<i64> {
    record.get(column).and_then(value_as_i64)
}

/// Read a column as text.
pub fn get_str<'a>(record: &'a Record, column: &str) -> Option<&'a str> {
    match record.get(column) {
        Some(Value::Text(s)) => Some(s.as_str()),
        _ => None,
    }
}

/// Whether a column is present and not NULL.
pub fn is_set(record: &Record, column: &str) -> bool {
    !matches!(record.get(column), None | Some(Value::Null))
}

pub fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(i) => Some(*i),
        Value::Text(s) => s.trim().parse().ok(),
        Value::Real(f) if f.fract() == 0.0 => Some(*f as i64),
        _ => None,
    }
}

/// Render a value for warnings and logs.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => f.to_string(),
        Value::Text(s) => s.clone(),
        Value::Blob(b) => format!("<{} bytes>", b.len()),
    }
}

/// Convert a value to JSON. Blobs become their length.
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Integer(i) => serde_json::Value::from(*i),
        Value::Real(f) => serde_json::Value::from(*f),
        Value::Text(s) => serde_json::Value::from(s.as_str()),
        Value::Blob(b) => serde_json::json!({ "blob_bytes": b.len() }),
    }
}

/// Convert a row to a JSON object.
pub fn record_to_json(record: &Record) -> serde_json::Value {
    serde_json::Value::Object(
        record
            .iter()
            .map(|(k, v)| (k.clone(), value_to_json(v)))
            .collect(),
    )
}
