//! Upload orchestrator.
//!
//! Sequences the two calls a client makes to archive a snippet: upload the
//! image, then persist the record pointing at it. The public operations
//! never fail: they log and return `""` / `false` instead. The sequence is
//! not atomic and an image whose record fails to persist stays in the
//! bucket.

use crate::api::{AddSnippetResponse, UploadResponse};
use crate::config::{ClientConfig, ConfigError};
use crate::snippet_store::NewSnippet;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, instrument, warn};
use url::Url;

/// Errors raised while talking to the snippet API
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} responded with {status}")]
    Status { url: String, status: StatusCode },

    #[error("Invalid response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// A file selected for upload
#[derive(Debug, Clone)]
pub struct SnippetFile {
    pub name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// HTTP client for the snippet API
#[derive(Debug, Clone)]
pub struct SnippetClient {
    http: reqwest::Client,
    base_url: Url,
}

impl SnippetClient {
    /// Build a client from configuration, requiring `client.api_base_url`
    pub fn new(config: &ClientConfig) -> Result<Self, ConfigError> {
        let base_url = config
            .api_base_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingRequired("client.api_base_url".to_string()))?;

        Self::with_base_url(base_url, Duration::from_secs(config.timeout_secs))
    }

    pub fn with_base_url(base_url: &str, timeout: Duration) -> Result<Self, ConfigError> {
        let invalid = |message: String| ConfigError::InvalidValue {
            key: "client.api_base_url".to_string(),
            message,
        };

        let base_url = Url::parse(base_url).map_err(|e| invalid(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(invalid(format!("{base_url} cannot carry a path")));
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| invalid(e.to_string()))?;

        Ok(Self { http, base_url })
    }

    /// URL of an endpoint below the base URL
    fn endpoint(&self, name: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(name);
        }
        url
    }

    /// Upload an image, returning its URL
    pub async fn try_upload_image(&self, file: &SnippetFile) -> Result<String, NetworkError> {
        let mut url = self.endpoint("uploadSnippetToS3");
        url.query_pairs_mut().append_pair("fileName", &file.name);

        let request_error = |source| NetworkError::Request {
            url: url.to_string(),
            source,
        };

        let part = Part::bytes(file.bytes.clone())
            .file_name(file.name.clone())
            .mime_str(&file.content_type)
            .map_err(request_error)?;

        let response = self
            .http
            .post(url.clone())
            .multipart(Form::new().part("file", part))
            .send()
            .await
            .map_err(request_error)?;

        if !response.status().is_success() {
            return Err(NetworkError::Status {
                url: url.to_string(),
                status: response.status(),
            });
        }

        let body: UploadResponse = response.json().await.map_err(|source| NetworkError::Decode {
            url: url.to_string(),
            source,
        })?;

        Ok(body.image_url)
    }

    /// Upload an image, returning its URL or `""` on any failure
    #[instrument(skip(self, file), fields(file_name = %file.name))]
    pub async fn upload_image(&self, file: &SnippetFile) -> String {
        match self.try_upload_image(file).await {
            Ok(url) => url,
            Err(e) => {
                error!(error = %e, "Snippet image upload failed");
                String::new()
            }
        }
    }

    /// Persist a snippet record, returning the server's verdict
    pub async fn try_add_record(&self, snippet: &NewSnippet) -> Result<bool, NetworkError> {
        let url = self.endpoint("addCodeSnippet");

        let response = self
            .http
            .post(url.clone())
            .json(snippet)
            .send()
            .await
            .map_err(|source| NetworkError::Request {
                url: url.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(NetworkError::Status {
                url: url.to_string(),
                status: response.status(),
            });
        }

        let body: AddSnippetResponse =
            response.json().await.map_err(|source| NetworkError::Decode {
                url: url.to_string(),
                source,
            })?;

        Ok(body.success)
    }

    /// Persist a snippet record, returning `false` on any failure
    #[instrument(skip(self, snippet), fields(tag = %snippet.tag))]
    pub async fn add_record(&self, snippet: &NewSnippet) -> bool {
        match self.try_add_record(snippet).await {
            Ok(success) => success,
            Err(e) => {
                error!(error = %e, "Adding snippet record failed");
                false
            }
        }
    }

    /// Upload `file`, then record it under `tag` and `description`.
    ///
    /// The record is only written when the upload produced a URL.
    pub async fn archive(&self, file: &SnippetFile, tag: &str, description: &str) -> bool {
        let image_url = self.upload_image(file).await;
        if image_url.is_empty() {
            return false;
        }

        let snippet = NewSnippet {
            image_url,
            tag: tag.to_string(),
            description: description.to_string(),
        };

        let stored = self.add_record(&snippet).await;
        if !stored {
            warn!(image_url = %snippet.image_url, "Uploaded image has no snippet record");
        }
        stored
    }
}
