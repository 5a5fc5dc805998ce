//! Wire frames exchanged with the analytics service.
//!
//! Every frame is a JSON text message. Outbound frames carry an
//! `api_method`, the caller's parameters and a `cache_key` list of
//! fingerprints; inbound frames are classified into [`InboundFrame`]
//! variants before the correlator sees them.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::cache::Fingerprint;
use crate::error::{ClientError, ClientResult};

/// Field carrying the API key in the authentication frame.
pub const AUTH_FIELD: &str = "finx_api_key";

/// Parameters that steer the client and are never forwarded.
pub const CLIENT_ONLY_PARAMS: [&str; 4] = ["callback", "finx_api_key", "is_batch", "api_method"];

/// Longest field dump logged when a frame fails to encode.
const FIELD_DUMP_LIMIT: usize = 1000;

/// Build the authentication frame sent once per connection.
pub fn auth_frame(api_key: &str) -> String {
    let mut fields = Map::new();
    fields.insert(AUTH_FIELD.to_string(), Value::String(api_key.to_string()));
    Value::Object(fields).to_string()
}

/// An outbound request frame under construction.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestFrame {
    fields: Map<String, Value>,
}

impl RequestFrame {
    pub fn new(method: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("api_method".to_string(), Value::String(method.to_string()));
        Self { fields }
    }

    /// Copy caller parameters into the frame, skipping client-only ones.
    pub fn with_params(mut self, params: &Map<String, Value>) -> Self {
        for (name, value) in params {
            if !CLIENT_ONLY_PARAMS.contains(&name.as_str()) {
                self.fields.insert(name.clone(), value.clone());
            }
        }
        self
    }

    pub fn with_cache_keys<'a>(mut self, keys: impl IntoIterator<Item = &'a Fingerprint>) -> Self {
        let keys = keys.into_iter().map(Fingerprint::to_wire).collect();
        self.fields.insert("cache_key".to_string(), Value::Array(keys));
        self
    }

    pub fn with_batch_input(mut self, input: Value) -> Self {
        self.fields.insert("batch_input".to_string(), input);
        self
    }

    pub fn with_run_batch(mut self, run_batch: bool) -> Self {
        self.fields.insert("run_batch".to_string(), Value::Bool(run_batch));
        self
    }

    /// Attach the server job id so a resent batch resumes instead of restarting.
    pub fn with_monitor_hash_key(mut self, job_id: &str) -> Self {
        self.fields.insert(
            "monitor_hash_key".to_string(),
            Value::String(job_id.to_string()),
        );
        self
    }

    pub fn method(&self) -> Option<&str> {
        self.fields.get("api_method").and_then(Value::as_str)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Serialize the frame, logging a truncated dump of each field on failure.
    pub fn encode(&self) -> ClientResult<String> {
        serde_json::to_string(&self.fields).map_err(|e| {
            for (name, value) in &self.fields {
                let rendered = value.to_string();
                let cut = floor_char_boundary(&rendered, FIELD_DUMP_LIMIT);
                log::error!(
                    target: "finx_socket::protocol",
                    "{}: {}",
                    name,
                    &rendered[..cut]
                );
            }
            ClientError::serialization(e.to_string())
        })
    }
}

/// Largest index <= `limit` that falls on a char boundary.
fn floor_char_boundary(text: &str, limit: usize) -> usize {
    if limit >= text.len() {
        return text.len();
    }
    (0..=limit)
        .rev()
        .find(|index| text.is_char_boundary(*index))
        .unwrap_or(0)
}

/// Progress notifications; these never touch the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressUpdate {
    /// A named task reporting how many of its sub-tasks finished.
    Task {
        task_name: String,
        completed: u64,
        total_tasks: u64,
        progress: f64,
    },
    /// The service began monitoring a batch job.
    StartingMonitor,
    /// Free-form progress payload.
    Status(Value),
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// `{"is_authenticated": true}`
    AuthAck,
    /// Server-assigned id of the most recent batch job.
    JobId(String),
    Progress(ProgressUpdate),
    Error {
        message: String,
        cache_keys: Vec<Fingerprint>,
    },
    Data {
        payload: Value,
        cache_keys: Vec<Fingerprint>,
    },
    /// Anything without a correlation key.
    Status(Value),
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected a JSON object")]
    NotAnObject,
    #[error("invalid cache_key: {0}")]
    CacheKey(String),
    #[error("invalid progress frame: {0}")]
    Progress(String),
}

/// Classify one inbound text frame.
pub fn parse_inbound(text: &str) -> Result<InboundFrame, FrameError> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Object(mut message) = value else {
        return Err(FrameError::NotAnObject);
    };

    if message.get("is_authenticated").is_some_and(is_truthy) {
        return Ok(InboundFrame::AuthAck);
    }

    if let Some(job_id) = message.get("job_id").filter(|v| !v.is_null()) {
        let job_id = match job_id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return Ok(InboundFrame::JobId(job_id));
    }

    let cache_keys = match message.get("cache_key") {
        None | Some(Value::Null) => None,
        Some(raw) => Some(parse_cache_keys(raw)?),
    };

    if let Some(error) = message.remove("error").filter(|v| !v.is_null()) {
        let message = match error {
            Value::String(s) => s,
            other => other.to_string(),
        };
        return Ok(InboundFrame::Error {
            message,
            cache_keys: cache_keys.unwrap_or_default(),
        });
    }

    if let Some(progress) = parse_progress(&message)? {
        return Ok(InboundFrame::Progress(progress));
    }

    let payload = message
        .remove("data")
        .or_else(|| message.remove("message"))
        .unwrap_or_else(|| Value::Object(Map::new()));

    if let Some(status) = payload
        .as_object()
        .and_then(|object| object.get("progress"))
        .filter(|v| !v.is_null())
    {
        return Ok(InboundFrame::Progress(ProgressUpdate::Status(status.clone())));
    }

    match cache_keys {
        Some(cache_keys) => Ok(InboundFrame::Data {
            payload,
            cache_keys,
        }),
        None => Ok(InboundFrame::Status(payload)),
    }
}

fn parse_progress(message: &Map<String, Value>) -> Result<Option<ProgressUpdate>, FrameError> {
    if message.get("starting monitor").is_some_and(is_truthy) {
        return Ok(Some(ProgressUpdate::StartingMonitor));
    }
    let Some(task_name) = message
        .get("task_name")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
    else {
        return Ok(None);
    };

    let count = |field: &str| {
        message
            .get(field)
            .and_then(Value::as_u64)
            .ok_or_else(|| FrameError::Progress(format!("{} missing or not a count", field)))
    };
    let completed = count("completed")?;
    let total_tasks = count("total_tasks")?;
    let progress = match message.get("progress") {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| FrameError::Progress("progress missing or not numeric".into()))?;

    Ok(Some(ProgressUpdate::Task {
        task_name: task_name.to_string(),
        completed,
        total_tasks,
        progress,
    }))
}

/// Accept a list of wire keys, or a single bare key.
fn parse_cache_keys(raw: &Value) -> Result<Vec<Fingerprint>, FrameError> {
    let items = raw
        .as_array()
        .ok_or_else(|| FrameError::CacheKey(raw.to_string()))?;
    if !items.is_empty() && !items.iter().all(Value::is_array) {
        return Fingerprint::from_wire(raw)
            .map(|fp| vec![fp])
            .ok_or_else(|| FrameError::CacheKey(raw.to_string()));
    }
    items
        .iter()
        .map(|item| {
            Fingerprint::from_wire(item).ok_or_else(|| FrameError::CacheKey(item.to_string()))
        })
        .collect()
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(primary: &str) -> Fingerprint {
        Fingerprint::new(primary, "NONE")
    }

    #[test]
    fn auth_frame_carries_only_the_key() {
        let frame: Value = serde_json::from_str(&auth_frame("secret")).unwrap();
        assert_eq!(frame, json!({"finx_api_key": "secret"}));
    }

    #[test]
    fn request_frame_strips_client_only_params() {
        let params = json!({"security_id": "X", "finx_api_key": "k", "is_batch": true, "callback": "f"});
        let frame = RequestFrame::new("get_security_cpr")
            .with_params(params.as_object().unwrap())
            .with_cache_keys([&key("X:None:get_security_cpr")]);

        let encoded: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(
            encoded,
            json!({
                "api_method": "get_security_cpr",
                "security_id": "X",
                "cache_key": [[null, "X:None:get_security_cpr", "NONE"]]
            })
        );
    }

    #[test]
    fn batch_fields_are_set() {
        let frame = RequestFrame::new("batch_get_curve")
            .with_batch_input(json!("upload.csv"))
            .with_run_batch(true)
            .with_monitor_hash_key("job-7");
        assert_eq!(frame.method(), Some("batch_get_curve"));
        assert_eq!(frame.get("batch_input"), Some(&json!("upload.csv")));
        assert_eq!(frame.get("run_batch"), Some(&json!(true)));
        assert_eq!(frame.get("monitor_hash_key"), Some(&json!("job-7")));
    }

    #[test]
    fn classifies_auth_ack() {
        assert_eq!(
            parse_inbound(r#"{"is_authenticated": true}"#).unwrap(),
            InboundFrame::AuthAck
        );
    }

    #[test]
    fn failed_auth_is_status() {
        assert!(matches!(
            parse_inbound(r#"{"is_authenticated": false, "message": "bad key"}"#).unwrap(),
            InboundFrame::Status(_)
        ));
    }

    #[test]
    fn classifies_job_id() {
        assert_eq!(
            parse_inbound(r#"{"job_id": "abc"}"#).unwrap(),
            InboundFrame::JobId("abc".into())
        );
        assert_eq!(
            parse_inbound(r#"{"job_id": 12}"#).unwrap(),
            InboundFrame::JobId("12".into())
        );
    }

    #[test]
    fn classifies_error_with_keys() {
        let frame = parse_inbound(r#"{"error": "boom", "cache_key": [[null, "m", "NONE"]]}"#).unwrap();
        assert_eq!(
            frame,
            InboundFrame::Error {
                message: "boom".into(),
                cache_keys: vec![key("m")],
            }
        );
    }

    #[test]
    fn classifies_task_progress() {
        let frame = parse_inbound(
            r#"{"task_name": "pricing", "completed": 5, "total_tasks": 10, "progress": "50.0"}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            InboundFrame::Progress(ProgressUpdate::Task {
                task_name: "pricing".into(),
                completed: 5,
                total_tasks: 10,
                progress: 50.0,
            })
        );
    }

    #[test]
    fn progress_payload_is_not_data() {
        let frame = parse_inbound(
            r#"{"data": {"progress": 12.5}, "cache_key": [[null, "m", "NONE"]]}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            InboundFrame::Progress(ProgressUpdate::Status(json!(12.5)))
        );
    }

    #[test]
    fn starting_monitor_is_progress() {
        assert_eq!(
            parse_inbound(r#"{"starting monitor": true}"#).unwrap(),
            InboundFrame::Progress(ProgressUpdate::StartingMonitor)
        );
    }

    #[test]
    fn data_falls_back_to_message_field() {
        let frame = parse_inbound(r#"{"message": [1, 2], "cache_key": [[null, "m", "NONE"]]}"#).unwrap();
        assert_eq!(
            frame,
            InboundFrame::Data {
                payload: json!([1, 2]),
                cache_keys: vec![key("m")],
            }
        );
    }

    #[test]
    fn single_bare_cache_key_is_accepted() {
        let frame = parse_inbound(r#"{"data": 3.5, "cache_key": [null, "m", "NONE"]}"#).unwrap();
        assert_eq!(
            frame,
            InboundFrame::Data {
                payload: json!(3.5),
                cache_keys: vec![key("m")],
            }
        );
    }

    #[test]
    fn frame_without_cache_key_is_status() {
        assert_eq!(
            parse_inbound(r#"{"data": {"note": "hi"}}"#).unwrap(),
            InboundFrame::Status(json!({"note": "hi"}))
        );
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(matches!(parse_inbound("not json"), Err(FrameError::Json(_))));
        assert!(matches!(parse_inbound("[1]"), Err(FrameError::NotAnObject)));
        assert!(matches!(
            parse_inbound(r#"{"data": 1, "cache_key": "oops"}"#),
            Err(FrameError::CacheKey(_))
        ));
        assert!(matches!(
            parse_inbound(r#"{"task_name": "t", "completed": "x", "total_tasks": 2, "progress": 1}"#),
            Err(FrameError::Progress(_))
        ));
    }
}
