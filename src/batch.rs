//! Batch requests: inputs, planning and result files.

pub mod planner;
pub mod row_file;

pub use planner::{BatchPlan, Delivery, Plan, plan};
pub use row_file::Row;

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::cache::Resolved;
use crate::error::ClientResult;

/// Methods that describe the service rather than compute anything.
pub const METADATA_METHODS: [&str; 1] = ["list_api_functions"];

/// Where the rows of a batch come from.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchInput {
    Rows(Vec<Row>),
    /// A CSV file with one request per row.
    File(PathBuf),
}

impl BatchInput {
    pub fn into_rows(self) -> ClientResult<Vec<Row>> {
        match self {
            BatchInput::Rows(rows) => Ok(rows),
            BatchInput::File(path) => row_file::read_rows(&path),
        }
    }
}

impl From<Vec<Row>> for BatchInput {
    fn from(rows: Vec<Row>) -> Self {
        BatchInput::Rows(rows)
    }
}

/// One batch call.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRequest {
    pub method: String,
    pub input: BatchInput,
    /// Parameters shared by every row; row values take precedence.
    pub params: Map<String, Value>,
    /// Write the ordered results here as CSV once complete.
    pub output_file: Option<PathBuf>,
}

impl BatchRequest {
    pub fn new(method: impl Into<String>, input: impl Into<BatchInput>) -> Self {
        Self {
            method: method.into(),
            input: input.into(),
            params: Map::new(),
            output_file: None,
        }
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_output_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_file = Some(path.into());
        self
    }
}

/// Flatten ordered results into output rows.
///
/// Object results become rows as they are; other values land in a
/// `result` column, failures in an `error` column.
pub fn result_rows(results: &[ClientResult<Resolved>]) -> Vec<Row> {
    results
        .iter()
        .map(|result| match result {
            Ok(Resolved::Data(Value::Object(row))) => row.clone(),
            Ok(Resolved::Data(value)) => single_column("result", value.clone()),
            Ok(Resolved::Empty) => Row::new(),
            Ok(Resolved::RemoteError(message)) => {
                single_column("error", Value::String(message.clone()))
            }
            Err(e) => single_column("error", Value::String(e.to_string())),
        })
        .collect()
}

pub fn write_results(path: &Path, results: &[ClientResult<Resolved>]) -> ClientResult<()> {
    let rows = result_rows(results);
    row_file::write_rows(path, &rows)?;
    log::info!(
        target: "finx_socket::batch",
        "Wrote {} result(s) to {}",
        rows.len(),
        path.display()
    );
    Ok(())
}

fn single_column(name: &str, value: Value) -> Row {
    let mut row = Row::new();
    row.insert(name.to_string(), value);
    row
}
