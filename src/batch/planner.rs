//! Batching decisions.
//!
//! Every row of a batch is looked up in the cache first. Rows already
//! resolved, or already in flight for another caller, are only waited on;
//! the rows this call claimed are the outstanding set, and only they are
//! sent, inline in the frame or uploaded through the side channel.

use serde_json::{Map, Value};

use super::METADATA_METHODS;
use super::row_file::{self, Row};
use crate::cache::{CacheStore, Fingerprint, Lookup};
use crate::config::ClientSettings;
use crate::error::{ClientError, ClientResult};
use crate::protocol::RequestFrame;
use crate::side_channel::SideChannel;

/// Parameter never forwarded with a batch frame.
const REQUEST_PARAM: &str = "request";

/// How outstanding rows reach the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Rows travel in the frame's `batch_input`.
    Inline,
    /// Rows are uploaded and `batch_input` carries the stored filename.
    Upload,
}

/// What a dispatch has to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    /// Every fingerprint is resolved or in flight elsewhere; just wait.
    Wait { fingerprints: Vec<Fingerprint> },
    /// One claimed request sent as a plain frame.
    Single {
        fingerprint: Fingerprint,
        frame: RequestFrame,
    },
    /// A batch with at least one outstanding row.
    Batch(BatchPlan),
}

impl Plan {
    /// Fingerprints to wait on, in caller order.
    pub fn fingerprints(&self) -> &[Fingerprint] {
        match self {
            Plan::Wait { fingerprints } => fingerprints,
            Plan::Single { fingerprint, .. } => std::slice::from_ref(fingerprint),
            Plan::Batch(batch) => &batch.fingerprints,
        }
    }

    /// Fingerprints this call claimed and must get dispatched.
    pub fn claimed(&self) -> &[Fingerprint] {
        match self {
            Plan::Wait { .. } => &[],
            Plan::Single { fingerprint, .. } => std::slice::from_ref(fingerprint),
            Plan::Batch(batch) => &batch.outstanding,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchPlan {
    /// One fingerprint per input row, in input order.
    pub fingerprints: Vec<Fingerprint>,
    /// Fingerprints claimed by this call.
    pub outstanding: Vec<Fingerprint>,
    pub outstanding_rows: Vec<Row>,
    pub delivery: Delivery,
    base: RequestFrame,
}

impl BatchPlan {
    /// Build the frame to send, uploading the rows first if needed.
    pub async fn frame(&self, side_channel: &SideChannel) -> ClientResult<RequestFrame> {
        let batch_input = match self.delivery {
            Delivery::Inline => rows_value(&self.outstanding_rows),
            Delivery::Upload => {
                let (filename, body) = row_file::upload_body(&self.outstanding_rows)?;
                Value::String(side_channel.upload(&filename, body).await?)
            }
        };
        Ok(self.base.clone().with_batch_input(batch_input))
    }
}

/// Decide how to dispatch `method`.
///
/// With `rows`, this is an explicit batch: each row is merged over `params`
/// and fingerprinted on its own. Without, a single request is planned, and
/// routed through an uploaded one-row batch when its payload is too large
/// for a frame.
pub fn plan(
    cache: &CacheStore,
    settings: &ClientSettings,
    method: &str,
    params: &Map<String, Value>,
    rows: Option<&[Row]>,
) -> ClientResult<Plan> {
    let is_metadata = METADATA_METHODS.contains(&method);
    if is_metadata && let Some(rows) = rows {
        return Err(ClientError::batch_usage(format!(
            "{} cannot be batched ({} row(s) given)",
            method,
            rows.len()
        )));
    }

    match rows {
        Some(rows) => plan_batch(cache, settings, method, params, rows),
        None => plan_single(cache, settings, method, params, is_metadata),
    }
}

fn plan_single(
    cache: &CacheStore,
    settings: &ClientSettings,
    method: &str,
    params: &Map<String, Value>,
    is_metadata: bool,
) -> ClientResult<Plan> {
    let frame = RequestFrame::new(method).with_params(params);
    let size = frame.encode()?.len();
    let oversized = size > settings.payload_size_threshold;
    if oversized && is_metadata {
        return Err(ClientError::batch_usage(format!(
            "{} payload of {} bytes is too large and cannot be batched",
            method, size
        )));
    }

    let fingerprint = Fingerprint::compute(method, params);
    match cache.lookup(&fingerprint) {
        Lookup::Claimed => {}
        Lookup::InFlight | Lookup::Cached(_) => {
            log::debug!(
                target: "finx_socket::batch",
                "Request found in cache: {}",
                fingerprint
            );
            return Ok(Plan::Wait {
                fingerprints: vec![fingerprint],
            });
        }
    }

    if !oversized {
        let frame = frame.with_cache_keys([&fingerprint]);
        return Ok(Plan::Single { fingerprint, frame });
    }

    log::debug!(
        target: "finx_socket::batch",
        "Payload of {} bytes exceeds {}; uploading as a batch file",
        size,
        settings.payload_size_threshold
    );
    // The uploaded row carries every param, so the live frame stays minimal.
    let base = RequestFrame::new(&format!("batch_{}", method))
        .with_run_batch(false)
        .with_cache_keys([&fingerprint]);
    Ok(Plan::Batch(BatchPlan {
        outstanding_rows: vec![frame.fields().clone()],
        outstanding: vec![fingerprint.clone()],
        fingerprints: vec![fingerprint],
        delivery: Delivery::Upload,
        base,
    }))
}

fn plan_batch(
    cache: &CacheStore,
    settings: &ClientSettings,
    method: &str,
    params: &Map<String, Value>,
    rows: &[Row],
) -> ClientResult<Plan> {
    let mut fingerprints = Vec::with_capacity(rows.len());
    let mut outstanding = Vec::new();
    let mut outstanding_rows = Vec::new();
    for row in rows {
        let mut merged = params.clone();
        merged.extend(row.iter().map(|(k, v)| (k.clone(), v.clone())));
        let fingerprint = Fingerprint::compute(method, &merged);
        if cache.lookup(&fingerprint) == Lookup::Claimed {
            outstanding.push(fingerprint.clone());
            outstanding_rows.push(row.clone());
        }
        fingerprints.push(fingerprint);
    }

    log::debug!(
        target: "finx_socket::batch",
        "{} out of {} requests need dispatching",
        outstanding.len(),
        rows.len()
    );
    if outstanding.is_empty() {
        log::debug!(target: "finx_socket::batch", "All requests found in cache");
        return Ok(Plan::Wait { fingerprints });
    }

    let base = batch_frame(method, params, true).with_cache_keys(&outstanding);
    let inline_size = base
        .clone()
        .with_batch_input(rows_value(&outstanding_rows))
        .encode()
        .inspect_err(|_| {
            cache.abandon(&outstanding, crate::cache::AbandonReason::DispatchFailed);
        })?
        .len();
    let delivery = if inline_size > settings.payload_size_threshold
        || outstanding.len() > settings.max_inline_batch_rows
    {
        Delivery::Upload
    } else {
        Delivery::Inline
    };

    Ok(Plan::Batch(BatchPlan {
        fingerprints,
        outstanding,
        outstanding_rows,
        delivery,
        base,
    }))
}

fn batch_frame(method: &str, params: &Map<String, Value>, run_batch: bool) -> RequestFrame {
    let mut forwarded = params.clone();
    forwarded.remove(REQUEST_PARAM);
    RequestFrame::new(&format!("batch_{}", method))
        .with_params(&forwarded)
        .with_run_batch(run_batch)
}

fn rows_value(rows: &[Row]) -> Value {
    Value::Array(rows.iter().cloned().map(Value::Object).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Resolution;
    use serde_json::json;

    fn settings() -> ClientSettings {
        ClientSettings::new("secret", "https://example.test/api/").unwrap()
    }

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn single_request_is_claimed_and_framed() {
        let cache = CacheStore::new();
        let params = object(json!({"security_id": "X", "as_of_date": "2024-01-02", "rate": 1}));

        let plan = plan(&cache, &settings(), "get_price", &params, None).unwrap();

        let Plan::Single { fingerprint, frame } = plan else {
            panic!("expected a single request");
        };
        assert_eq!(fingerprint.primary_key(), "X:2024-01-02:get_price");
        assert_eq!(frame.method(), Some("get_price"));
        assert_eq!(frame.get("cache_key"), Some(&json!([[null, "X:2024-01-02:get_price", "rate:1"]])));
    }

    #[test]
    fn repeated_request_waits_instead_of_dispatching() {
        let cache = CacheStore::new();
        let params = object(json!({"a": 1}));
        plan(&cache, &settings(), "m", &params, None).unwrap();

        let again = plan(&cache, &settings(), "m", &params, None).unwrap();
        assert!(matches!(again, Plan::Wait { .. }));
        assert!(again.claimed().is_empty());
    }

    #[test]
    fn batch_with_cached_and_duplicate_rows_sends_only_outstanding() {
        let cache = CacheStore::new();
        let params = object(json!({"as_of_date": "2024-01-02"}));
        for id in ["A", "B"] {
            let fp = Fingerprint::compute(
                "calculate",
                &object(json!({"as_of_date": "2024-01-02", "security_id": id})),
            );
            cache.write(&fp, Resolution::Data(json!(id)));
        }
        let rows: Vec<Row> = ["A", "C", "B", "D", "E"]
            .iter()
            .map(|id| object(json!({"security_id": id})))
            .collect();

        let plan = plan(&cache, &settings(), "calculate", &params, Some(&rows)).unwrap();

        let Plan::Batch(batch) = &plan else {
            panic!("expected a batch");
        };
        assert_eq!(batch.fingerprints.len(), 5);
        assert_eq!(batch.outstanding.len(), 3);
        assert_eq!(batch.delivery, Delivery::Inline);
        assert_eq!(batch.base.method(), Some("batch_calculate"));
        assert_eq!(batch.base.get("run_batch"), Some(&json!(true)));
        assert_eq!(batch.base.get("cache_key").and_then(Value::as_array).map(Vec::len), Some(3));
    }

    #[test]
    fn identical_rows_are_dispatched_once() {
        let cache = CacheStore::new();
        let rows = vec![object(json!({"security_id": "A"})), object(json!({"security_id": "A"}))];

        let plan = plan(&cache, &settings(), "m", &Map::new(), Some(&rows)).unwrap();

        assert_eq!(plan.fingerprints().len(), 2);
        assert_eq!(plan.claimed().len(), 1);
    }

    #[test]
    fn fully_cached_batch_needs_no_transport() {
        let cache = CacheStore::new();
        let row = object(json!({"security_id": "A"}));
        cache.write(&Fingerprint::compute("m", &row), Resolution::Empty);

        let plan = plan(&cache, &settings(), "m", &Map::new(), Some(&[row])).unwrap();
        assert!(matches!(plan, Plan::Wait { .. }));
    }

    #[test]
    fn many_rows_are_uploaded() {
        let cache = CacheStore::new();
        let rows: Vec<Row> = (0..101)
            .map(|i| object(json!({"security_id": format!("S{}", i)})))
            .collect();

        let plan = plan(&cache, &settings(), "m", &Map::new(), Some(&rows)).unwrap();
        let Plan::Batch(batch) = plan else {
            panic!("expected a batch");
        };
        assert_eq!(batch.delivery, Delivery::Upload);
    }

    #[test]
    fn oversized_single_request_becomes_uploaded_batch() {
        let cache = CacheStore::new();
        let mut settings = settings();
        settings.payload_size_threshold = 64;
        let params = object(json!({"request": "x".repeat(100)}));

        let plan = plan(&cache, &settings, "m", &params, None).unwrap();

        let Plan::Batch(batch) = plan else {
            panic!("expected a batch");
        };
        assert_eq!(batch.delivery, Delivery::Upload);
        assert_eq!(batch.base.method(), Some("batch_m"));
        assert_eq!(batch.base.get("request"), None);
        assert_eq!(batch.base.get("run_batch"), Some(&json!(false)));
        assert_eq!(batch.outstanding_rows[0].get("api_method"), Some(&json!("m")));
    }

    #[test]
    fn oversized_single_request_sends_only_the_filename_live() {
        let cache = CacheStore::new();
        let mut settings = settings();
        settings.payload_size_threshold = 1000;
        let ids: Vec<String> = (0..500).map(|i| format!("SEC{:04}", i)).collect();
        let params = object(json!({
            "security_id": "X",
            "as_of_date": "2024-01-02",
            "input_file": "positions.csv",
            "security_ids": ids,
        }));

        let plan = plan(&cache, &settings, "get_price", &params, None).unwrap();

        let Plan::Batch(batch) = plan else {
            panic!("expected a batch");
        };
        assert_eq!(batch.delivery, Delivery::Upload);
        let live = batch.base.clone().with_batch_input(json!("stored.csv"));
        let mut fields: Vec<&str> = live.fields().keys().map(String::as_str).collect();
        fields.sort_unstable();
        assert_eq!(fields, vec!["api_method", "batch_input", "cache_key", "run_batch"]);

        let encoded = live.encode().unwrap();
        assert!(!encoded.contains("positions.csv"));
        assert_eq!(
            batch.outstanding_rows[0].get("security_ids").and_then(Value::as_array).map(Vec::len),
            Some(500)
        );
        assert_eq!(batch.outstanding_rows[0].get("input_file"), Some(&json!("positions.csv")));
    }

    #[test]
    fn metadata_methods_cannot_be_batched() {
        let cache = CacheStore::new();
        let rows = vec![Map::new()];
        let result = plan(&cache, &settings(), "list_api_functions", &Map::new(), Some(&rows));
        assert!(matches!(result, Err(ClientError::BatchUsage { .. })));
        assert!(cache.is_empty());
    }
}
