//! Resolution of results delivered as files.
//!
//! The receive loop records `{filename, bucket_name}` payloads as
//! [`Resolution::File`]; the waiter calls [`resolve_files`] on the caller's
//! task to download each distinct file once, pick each fingerprint's row by
//! its `cache_key` column, and write the final value back to the cache.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::batch::row_file::Row;
use crate::cache::{CacheStore, FileRef, Fingerprint, Resolution, Resolved};
use crate::error::{ClientError, ClientResult};
use crate::side_channel::SideChannel;

/// One fingerprint whose slot holds a file reference.
#[derive(Debug, Clone)]
pub struct FileResult {
    pub index: usize,
    pub fingerprint: Fingerprint,
    pub file: FileRef,
}

/// Download and match every file result, returning `(index, result)` pairs.
pub async fn resolve_files(
    side_channel: &SideChannel,
    cache: &CacheStore,
    pending: Vec<FileResult>,
) -> Vec<(usize, ClientResult<Resolved>)> {
    let mut downloads: HashMap<FileRef, Result<Vec<Row>, String>> = HashMap::new();
    for item in &pending {
        if !downloads.contains_key(&item.file) {
            let rows = side_channel
                .download_rows(&item.file)
                .await
                .map_err(|e| e.to_string());
            downloads.insert(item.file.clone(), rows);
        }
    }
    log::debug!(
        target: "finx_socket::file_results",
        "Downloaded {} file(s) for {} result(s)",
        downloads.len(),
        pending.len()
    );

    let mut results = Vec::with_capacity(pending.len());
    for item in pending {
        let outcome = match &downloads[&item.file] {
            Ok(rows) => resolve_one(side_channel, &item, rows).await,
            Err(message) => Err(ClientError::side_channel(message.clone())),
        };
        match &outcome {
            Ok(value) => cache.write(&item.fingerprint, Resolution::Data(value.clone())),
            Err(ClientError::Correlation { message, .. }) => {
                cache.write(&item.fingerprint, Resolution::Unmatched(message.clone()))
            }
            Err(_) => {}
        }
        results.push((item.index, outcome.map(Resolved::Data)));
    }
    results
}

async fn resolve_one(
    side_channel: &SideChannel,
    item: &FileResult,
    rows: &[Row],
) -> ClientResult<Value> {
    if !rows.iter().any(|row| row.contains_key("cache_key")) {
        return Ok(rows_value(rows));
    }

    let row = find_row(rows, &item.fingerprint).ok_or_else(|| {
        log::error!(
            target: "finx_socket::file_results",
            "Failed to find result for {} in {}",
            item.fingerprint,
            item.file.filename
        );
        ClientError::correlation(
            &item.fingerprint,
            format!("no row in {} matches", item.file.filename),
        )
    })?;

    match FileRef::from_object(row) {
        Some(nested) => {
            let nested_rows = side_channel.download_rows(&nested).await?;
            let mut value = Map::new();
            value.insert(
                "security_id".into(),
                row.get("security_id").cloned().unwrap_or(Value::Null),
            );
            value.insert("result".into(), rows_value(&nested_rows));
            value.insert(
                "cache_key".into(),
                row.get("cache_key").cloned().unwrap_or(Value::Null),
            );
            Ok(Value::Object(value))
        }
        None => Ok(Value::Object(row.clone())),
    }
}

/// Row whose `cache_key` cell names `fingerprint`.
fn find_row<'a>(rows: &'a [Row], fingerprint: &Fingerprint) -> Option<&'a Row> {
    rows.iter().find(|row| {
        row.get("cache_key")
            .and_then(Value::as_str)
            .and_then(Fingerprint::from_cell)
            .as_ref()
            == Some(fingerprint)
    })
}

fn rows_value(rows: &[Row]) -> Value {
    Value::Array(rows.iter().cloned().map(Value::Object).collect())
}
