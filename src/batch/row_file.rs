//! CSV encoding of batch rows and result files.
//!
//! Cells are typed on the way in (integers, floats, booleans, empty as
//! null) except for identity columns, which always stay strings so ids like
//! `"00123"` survive the round trip.

use std::path::Path;

use serde_json::{Map, Number, Value};
use ulid::Ulid;

use crate::error::{ClientError, ClientResult};

pub type Row = Map<String, Value>;

/// Columns never type-inferred.
const STRING_COLUMNS: [&str; 2] = ["security_id", "cache_key"];

/// Field that turns a row into a raw request line when uploading.
const REQUEST_FIELD: &str = "request";

/// Parse CSV text into rows keyed by header.
pub fn parse_rows(text: &str) -> ClientResult<Vec<Row>> {
    let mut reader = csv::Reader::from_reader(text.as_bytes());
    let headers = reader.headers()?.clone();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row = headers
            .iter()
            .zip(record.iter())
            .map(|(column, cell)| (column.to_string(), infer_cell(column, cell)))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

pub fn read_rows(path: &Path) -> ClientResult<Vec<Row>> {
    let text = std::fs::read_to_string(path)?;
    parse_rows(&text)
}

/// Encode rows as CSV, with the union of their columns as header.
pub fn encode_rows(rows: &[Row]) -> ClientResult<Vec<u8>> {
    let mut columns: Vec<&str> = Vec::new();
    for row in rows {
        for column in row.keys() {
            if !columns.contains(&column.as_str()) {
                columns.push(column);
            }
        }
    }

    if columns.is_empty() {
        return Ok(Vec::new());
    }
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&columns)?;
    for row in rows {
        writer.write_record(
            columns
                .iter()
                .map(|column| row.get(*column).map(cell_text).unwrap_or_default()),
        )?;
    }
    writer
        .into_inner()
        .map_err(|e| ClientError::Io(e.into_error()))
}

pub fn write_rows(path: &Path, rows: &[Row]) -> ClientResult<()> {
    std::fs::write(path, encode_rows(rows)?)?;
    Ok(())
}

/// Rows that all carry a string `request` are uploaded as bare lines.
pub fn request_lines(rows: &[Row]) -> Option<String> {
    if rows.is_empty() {
        return None;
    }
    rows.iter()
        .map(|row| row.get(REQUEST_FIELD).and_then(Value::as_str))
        .collect::<Option<Vec<_>>>()
        .map(|lines| lines.join("\n"))
}

/// Name and body of the file uploaded for an offloaded batch.
pub fn upload_body(rows: &[Row]) -> ClientResult<(String, Vec<u8>)> {
    let filename = format!("{}.csv", Ulid::new());
    let body = match request_lines(rows) {
        Some(lines) => lines.into_bytes(),
        None => encode_rows(rows)?,
    };
    Ok((filename, body))
}

fn infer_cell(column: &str, cell: &str) -> Value {
    if STRING_COLUMNS.contains(&column) {
        return Value::String(cell.to_string());
    }
    if cell.is_empty() {
        return Value::Null;
    }
    if let Ok(int) = cell.parse::<i64>() {
        return Value::Number(int.into());
    }
    if let Some(number) = cell.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(number);
    }
    match cell {
        "True" | "true" => Value::Bool(true),
        "False" | "false" => Value::Bool(false),
        _ => Value::String(cell.to_string()),
    }
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
