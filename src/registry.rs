//! Table of the service's API methods.
//!
//! Built from the `list_api_functions` listing, the table validates calls by
//! name before they reach the planner: unknown methods and missing required
//! parameters are rejected locally, and optional parameters the caller left
//! out are filled with their listed defaults.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::batch::Row;
use crate::error::{ClientError, ClientResult};

/// Method that returns the listing itself.
pub const LIST_FUNCTIONS_METHOD: &str = "list_api_functions";

/// One entry of the listing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MethodSpec {
    pub name: String,
    #[serde(default)]
    pub required: Vec<String>,
    /// Optional parameters and their defaults.
    #[serde(default)]
    pub optional: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MethodTable {
    methods: BTreeMap<String, MethodSpec>,
}

impl MethodTable {
    /// Parse the listing, given either as a bare list or wrapped in `{"data": [...]}`.
    pub fn from_listing(listing: &Value) -> ClientResult<Self> {
        let entries = match listing {
            Value::Object(object) => object.get("data").cloned().unwrap_or(Value::Null),
            other => other.clone(),
        };
        let specs: Vec<MethodSpec> = serde_json::from_value(entries).map_err(|e| {
            ClientError::serialization(format!("Unreadable function listing: {}", e))
        })?;

        let methods: BTreeMap<String, MethodSpec> = specs
            .into_iter()
            .map(|spec| (spec.name.clone(), spec))
            .collect();
        log::debug!(
            target: "finx_socket::registry",
            "Loaded {} API method(s)",
            methods.len()
        );
        Ok(Self { methods })
    }

    pub fn get(&self, name: &str) -> Option<&MethodSpec> {
        self.methods.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Validate a single call and fill in optional defaults.
    pub fn prepare(&self, name: &str, params: Map<String, Value>) -> ClientResult<Map<String, Value>> {
        let spec = self.spec(name)?;
        if let Some(missing) = spec.required.iter().find(|p| !params.contains_key(*p)) {
            return Err(missing_parameter(name, missing));
        }
        Ok(with_defaults(spec, params))
    }

    /// Validate a batch call: every required parameter must come from the
    /// shared parameters or from every row.
    pub fn prepare_batch(
        &self,
        name: &str,
        params: Map<String, Value>,
        rows: &[Row],
    ) -> ClientResult<Map<String, Value>> {
        let spec = self.spec(name)?;
        let missing = spec.required.iter().find(|p| {
            !params.contains_key(*p) && !rows.iter().all(|row| row.contains_key(*p))
        });
        if let Some(missing) = missing {
            return Err(missing_parameter(name, missing));
        }
        Ok(with_defaults(spec, params))
    }

    fn spec(&self, name: &str) -> ClientResult<&MethodSpec> {
        self.methods.get(name).ok_or_else(|| ClientError::UnknownMethod {
            name: name.to_string(),
        })
    }
}

fn with_defaults(spec: &MethodSpec, mut params: Map<String, Value>) -> Map<String, Value> {
    if let Some(optional) = &spec.optional {
        for (name, default) in optional {
            params
                .entry(name.clone())
                .or_insert_with(|| default.clone());
        }
    }
    params
}

fn missing_parameter(method: &str, parameter: &str) -> ClientError {
    ClientError::MissingParameter {
        method: method.to_string(),
        parameter: parameter.to_string(),
    }
}
