use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ClientError, ClientResult};

pub const DEFAULT_PAYLOAD_SIZE_THRESHOLD: usize = 100_000;
pub const DEFAULT_MAX_INLINE_BATCH_ROWS: usize = 100;
pub const DEFAULT_AUTH_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 3;
pub const DEFAULT_RECONNECT_BACKOFF_MS: u64 = 500;
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_WORKER_THREADS: usize = 2;

/// Partial settings as read from a config file, the environment, or code.
///
/// Every field is optional so layers can be merged with
/// [`super::merge_settings`] before validation.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SettingsOverlay {
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    /// Socket endpoint; derived from `api_url` when absent.
    pub ws_url: Option<String>,
    pub payload_size_threshold: Option<usize>,
    pub max_inline_batch_rows: Option<usize>,
    pub auth_timeout_ms: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub reconnect_attempts: Option<u32>,
    pub reconnect_backoff_ms: Option<u64>,
    pub ping_interval_secs: Option<u64>,
    pub worker_threads: Option<usize>,
}

/// Validated client settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    api_key: String,
    api_url: Url,
    ws_url: Option<Url>,
    pub payload_size_threshold: usize,
    pub max_inline_batch_rows: usize,
    pub auth_timeout: Duration,
    /// `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
    pub reconnect_attempts: u32,
    pub reconnect_backoff: Duration,
    pub ping_interval: Duration,
    pub worker_threads: usize,
}

impl ClientSettings {
    /// Build settings from an API key and URL with every tunable at its default.
    pub fn new(api_key: impl Into<String>, api_url: &str) -> ClientResult<Self> {
        Self::from_overlay(SettingsOverlay {
            api_key: Some(api_key.into()),
            api_url: Some(api_url.to_string()),
            ..Default::default()
        })
    }

    /// Validate a merged overlay.
    pub fn from_overlay(overlay: SettingsOverlay) -> ClientResult<Self> {
        let api_key = overlay
            .api_key
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                ClientError::config("API key not found - set api_key or FINX_API_KEY")
            })?;
        let raw_url = overlay.api_url.ok_or_else(|| {
            ClientError::config("API URL not found - set api_url or FINX_API_URL")
        })?;
        let worker_threads = overlay.worker_threads.unwrap_or(DEFAULT_WORKER_THREADS);
        if worker_threads == 0 {
            return Err(ClientError::config("worker_threads must be at least 1"));
        }

        let ws_url = overlay
            .ws_url
            .map(|raw| {
                Url::parse(&raw)
                    .map_err(|e| ClientError::config(format!("Invalid socket URL '{}': {}", raw, e)))
            })
            .transpose()?;

        Ok(Self {
            api_key,
            api_url: normalize_api_url(&raw_url)?,
            ws_url,
            payload_size_threshold: overlay
                .payload_size_threshold
                .unwrap_or(DEFAULT_PAYLOAD_SIZE_THRESHOLD),
            max_inline_batch_rows: overlay
                .max_inline_batch_rows
                .unwrap_or(DEFAULT_MAX_INLINE_BATCH_ROWS),
            auth_timeout: Duration::from_millis(
                overlay.auth_timeout_ms.unwrap_or(DEFAULT_AUTH_TIMEOUT_MS),
            ),
            request_timeout: overlay.request_timeout_secs.map(Duration::from_secs),
            reconnect_attempts: overlay
                .reconnect_attempts
                .unwrap_or(DEFAULT_RECONNECT_ATTEMPTS),
            reconnect_backoff: Duration::from_millis(
                overlay
                    .reconnect_backoff_ms
                    .unwrap_or(DEFAULT_RECONNECT_BACKOFF_MS),
            ),
            ping_interval: Duration::from_secs(
                overlay
                    .ping_interval_secs
                    .unwrap_or(DEFAULT_PING_INTERVAL_SECS),
            ),
            worker_threads,
        })
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// The REST base, always ending in `api/`.
    pub fn api_url(&self) -> &Url {
        &self.api_url
    }

    /// WebSocket endpoint, unless configured explicitly derived from the
    /// REST base.
    ///
    /// `https` becomes `wss`, `http` becomes `ws` and `/api/` becomes `/ws/api/`.
    pub fn ws_url(&self) -> ClientResult<Url> {
        if let Some(url) = &self.ws_url {
            return Ok(url.clone());
        }
        let scheme = match self.api_url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => other,
        };
        let path = self.api_url.path().replacen("/api/", "/ws/api/", 1);
        let mut url = self.api_url.clone();
        url.set_path(&path);
        url.set_scheme(scheme)
            .map_err(|_| ClientError::config(format!("Cannot derive socket URL from {}", self.api_url)))?;
        Ok(url)
    }

    pub fn upload_url(&self) -> ClientResult<Url> {
        self.endpoint("batch-upload/")
    }

    pub fn download_url(&self) -> ClientResult<Url> {
        self.endpoint("batch-download/")
    }

    fn endpoint(&self, name: &str) -> ClientResult<Url> {
        self.api_url
            .join(name)
            .map_err(|e| ClientError::config(format!("Invalid endpoint {}: {}", name, e)))
    }
}

/// Ensure the URL ends in `/` and contains `api/`.
fn normalize_api_url(raw: &str) -> ClientResult<Url> {
    let mut normalized = raw.trim().to_string();
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    if !normalized.contains("api/") {
        normalized.push_str("api/");
    }
    Url::parse(&normalized)
        .map_err(|e| ClientError::config(format!("Invalid API URL '{}': {}", raw, e)))
}
