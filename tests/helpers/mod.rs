//! Shared helpers for integration tests.
//!
//! Note: We use `helpers/mod.rs` instead of the modern `helpers.rs` + `helpers/` pattern
//! because Cargo auto-discovers top-level `.rs` files in `tests/` as integration tests.
//! A `tests/helpers.rs` file would be compiled as a standalone test, which we don't want.

#![allow(dead_code)]

pub mod mock_service;

use finx_socket::{ClientContext, ClientSettings, SettingsOverlay};
use serde_json::{Map, Value};

/// API key the mock service accepts.
pub const VALID_KEY: &str = "valid-key";

/// Side channel URL for tests that never touch HTTP.
pub const UNUSED_API_URL: &str = "http://127.0.0.1:9/api/";

pub fn overlay(api_url: &str, ws_url: &str, api_key: &str) -> SettingsOverlay {
    SettingsOverlay {
        api_key: Some(api_key.to_string()),
        api_url: Some(api_url.to_string()),
        ws_url: Some(ws_url.to_string()),
        auth_timeout_ms: Some(1_000),
        request_timeout_secs: Some(10),
        reconnect_backoff_ms: Some(50),
        worker_threads: Some(2),
        ..Default::default()
    }
}

/// Settings pointing the socket at `ws_url` and the side channel at `api_url`.
pub fn settings(api_url: &str, ws_url: &str, api_key: &str) -> ClientSettings {
    ClientSettings::from_overlay(overlay(api_url, ws_url, api_key)).expect("test settings are valid")
}

pub fn context(api_url: &str, ws_url: &str) -> ClientContext {
    ClientContext::new(settings(api_url, ws_url, VALID_KEY)).expect("context starts")
}

pub fn object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().expect("value is an object")
}
