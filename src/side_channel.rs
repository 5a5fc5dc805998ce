//! HTTP side channel for batch payloads and file results.
//!
//! Payloads too large for a socket frame are uploaded as files and the
//! frame carries only the returned filename; results too large for a frame
//! come back as `{filename, bucket_name}` references that are downloaded as
//! CSV.

use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use url::Url;

use crate::batch::row_file::{self, Row};
use crate::cache::FileRef;
use crate::config::ClientSettings;
use crate::error::{ClientError, ClientResult};

/// Response body of `batch-upload/`.
#[derive(Debug, Deserialize)]
struct UploadResponse {
    filename: Option<String>,
    #[serde(default)]
    failed: bool,
    message: Option<String>,
}

pub struct SideChannel {
    http_client: reqwest::Client,
    api_key: String,
    upload_url: Url,
    download_url: Url,
}

impl SideChannel {
    pub fn new(settings: &ClientSettings) -> ClientResult<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("finx-socket/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http_client,
            api_key: settings.api_key().to_string(),
            upload_url: settings.upload_url()?,
            download_url: settings.download_url()?,
        })
    }

    /// Upload a batch file and return the name the service stored it under.
    pub async fn upload(&self, filename: &str, body: Vec<u8>) -> ClientResult<String> {
        log::debug!(
            target: "finx_socket::side_channel",
            "Uploading {} ({} bytes) to {}",
            filename,
            body.len(),
            self.upload_url
        );
        let form = Form::new()
            .text("finx_api_key", self.api_key.clone())
            .text("filename", filename.to_string())
            .part("file", Part::bytes(body).file_name(filename.to_string()));

        let response = self
            .http_client
            .post(self.upload_url.clone())
            .multipart(form)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;

        let parsed: UploadResponse = serde_json::from_str(&text).map_err(|_| {
            log::error!(
                target: "finx_socket::side_channel",
                "Upload error: status_code={} -> {}",
                status,
                text
            );
            ClientError::side_channel(format!("Failed to upload file (status {})", status))
        })?;
        if parsed.failed {
            return Err(ClientError::side_channel(format!(
                "Failed to upload file: {}",
                parsed.message.unwrap_or_default()
            )));
        }
        Ok(parsed.filename.unwrap_or_else(|| filename.to_string()))
    }

    /// Download a result file as raw text.
    pub async fn download_text(&self, file: &FileRef) -> ClientResult<String> {
        let mut query = vec![("filename", file.filename.as_str())];
        if let Some(bucket) = &file.bucket_name {
            query.push(("bucket_name", bucket.as_str()));
        }
        let response = self
            .http_client
            .get(self.download_url.clone())
            .query(&query)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::side_channel(format!(
                "Failed to download {} (status {})",
                file.filename, status
            )));
        }
        Ok(response.text().await?)
    }

    /// Download a result file and parse it as CSV rows.
    pub async fn download_rows(&self, file: &FileRef) -> ClientResult<Vec<Row>> {
        let text = self.download_text(file).await?;
        log::debug!(
            target: "finx_socket::side_channel",
            "Downloaded {} ({} bytes)",
            file.filename,
            text.len()
        );
        row_file::parse_rows(&text)
    }
}
