pub mod settings;
pub mod user;

pub use settings::{ClientSettings, SettingsOverlay};
pub use user::{load_user_config, user_config_path};

use std::path::Path;

use crate::error::ClientResult;

pub const API_KEY_ENV: &str = "FINX_API_KEY";
pub const API_URL_ENV: &str = "FINX_API_URL";

/// Merge two overlays, preferring values from `primary` over `fallback`
pub fn merge_settings(
    fallback: Option<SettingsOverlay>,
    primary: Option<SettingsOverlay>,
) -> Option<SettingsOverlay> {
    match (fallback, primary) {
        (None, None) => None,
        (Some(settings), None) => Some(settings),
        (None, Some(settings)) => Some(settings),
        (Some(fallback), Some(primary)) => Some(SettingsOverlay {
            api_key: primary.api_key.or(fallback.api_key),
            api_url: primary.api_url.or(fallback.api_url),
            ws_url: primary.ws_url.or(fallback.ws_url),
            payload_size_threshold: primary
                .payload_size_threshold
                .or(fallback.payload_size_threshold),
            max_inline_batch_rows: primary
                .max_inline_batch_rows
                .or(fallback.max_inline_batch_rows),
            auth_timeout_ms: primary.auth_timeout_ms.or(fallback.auth_timeout_ms),
            request_timeout_secs: primary
                .request_timeout_secs
                .or(fallback.request_timeout_secs),
            reconnect_attempts: primary.reconnect_attempts.or(fallback.reconnect_attempts),
            reconnect_backoff_ms: primary
                .reconnect_backoff_ms
                .or(fallback.reconnect_backoff_ms),
            ping_interval_secs: primary.ping_interval_secs.or(fallback.ping_interval_secs),
            worker_threads: primary.worker_threads.or(fallback.worker_threads),
        }),
    }
}

/// Settings taken from `FINX_API_KEY` / `FINX_API_URL`.
pub fn env_overlay() -> Option<SettingsOverlay> {
    let api_key = std::env::var(API_KEY_ENV).ok().filter(|v| !v.is_empty());
    let api_url = std::env::var(API_URL_ENV).ok().filter(|v| !v.is_empty());
    if api_key.is_none() && api_url.is_none() {
        return None;
    }
    Some(SettingsOverlay {
        api_key,
        api_url,
        ..Default::default()
    })
}

/// Resolve settings: config file, then environment, then explicit overrides.
pub fn resolve_settings(
    config_path: Option<&Path>,
    overrides: Option<SettingsOverlay>,
) -> ClientResult<ClientSettings> {
    let file = load_user_config(config_path)?;
    let merged = merge_settings(merge_settings(file, env_overlay()), overrides);
    ClientSettings::from_overlay(merged.unwrap_or_default())
}
