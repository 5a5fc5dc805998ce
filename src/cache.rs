//! Fingerprint-keyed result cache.
//!
//! The cache is the only channel between the receive loop (which writes
//! results) and callers (which wait for them). Each logical request owns one
//! slot, addressed by its [`Fingerprint`].

pub mod fingerprint;
pub mod store;

pub use fingerprint::Fingerprint;
pub use store::{AbandonReason, CacheSlot, CacheStore, Lookup};

use serde_json::{Map, Value};

/// A reference to a result stored on the service's file side channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileRef {
    pub filename: String,
    pub bucket_name: Option<String>,
}

impl FileRef {
    /// Recognise `{"filename": ..., "bucket_name"?: ...}` payloads.
    pub fn from_object(object: &Map<String, Value>) -> Option<Self> {
        let filename = object.get("filename")?.as_str()?;
        if filename.is_empty() {
            return None;
        }
        Some(Self {
            filename: filename.to_string(),
            bucket_name: object
                .get("bucket_name")
                .and_then(Value::as_str)
                .map(String::from),
        })
    }
}

/// What a resolved cache slot holds.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Data(Value),
    /// Resolved, but the service returned no data.
    Empty,
    /// The service reported an error for this request.
    RemoteError(String),
    /// The result lives in a file that still has to be downloaded.
    File(FileRef),
    /// A result arrived for this fingerprint but no record matched it.
    Unmatched(String),
}

impl Resolution {
    /// Classify a payload pushed for a single fingerprint.
    pub fn from_payload(payload: Value) -> Self {
        if let Some(file) = payload.as_object().and_then(FileRef::from_object) {
            return Resolution::File(file);
        }
        match payload {
            Value::Null => Resolution::Empty,
            other => Resolution::Data(other),
        }
    }
}

/// Caller-facing result of one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Data(Value),
    Empty,
    RemoteError(String),
}

impl Resolved {
    pub fn value(&self) -> Option<&Value> {
        match self {
            Resolved::Data(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Resolved::Data(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_remote_error(&self) -> bool {
        matches!(self, Resolved::RemoteError(_))
    }

    /// JSON view used for output files and the CLI.
    pub fn to_json(&self) -> Value {
        match self {
            Resolved::Data(value) => value.clone(),
            Resolved::Empty => Value::Null,
            Resolved::RemoteError(message) => {
                serde_json::json!({ "error": message })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_payload_is_empty() {
        assert_eq!(Resolution::from_payload(Value::Null), Resolution::Empty);
    }

    #[test]
    fn filename_payload_is_file_reference() {
        let resolution =
            Resolution::from_payload(json!({"filename": "out.csv", "bucket_name": "results"}));
        assert_eq!(
            resolution,
            Resolution::File(FileRef {
                filename: "out.csv".into(),
                bucket_name: Some("results".into()),
            })
        );
    }

    #[test]
    fn ordinary_object_is_data() {
        let payload = json!({"greeks": {"vol": 0.2}});
        assert_eq!(
            Resolution::from_payload(payload.clone()),
            Resolution::Data(payload)
        );
    }

    #[test]
    fn remote_error_renders_as_error_object() {
        let resolved = Resolved::RemoteError("bad security".into());
        assert!(resolved.is_remote_error());
        assert_eq!(resolved.to_json(), json!({"error": "bad security"}));
        assert_eq!(resolved.into_value(), None);
    }
}
