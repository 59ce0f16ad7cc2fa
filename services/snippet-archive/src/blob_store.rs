use crate::config::{ConfigError, S3Config};
use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::timeout::TimeoutConfig;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use aws_types::region::Region;
use axum::body::Bytes;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Errors raised by a blob store upload
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Object key must not be empty")]
    InvalidKey,

    #[error("Failed to upload object {key}: {message}")]
    Storage { key: String, message: String },
}

impl UploadError {
    fn storage(key: &str, err: impl std::error::Error) -> Self {
        UploadError::Storage {
            key: key.to_string(),
            message: DisplayErrorContext(err).to_string(),
        }
    }
}

/// Object storage the upload endpoint writes snippet images to
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `key` and return the object's public URL.
    ///
    /// Concurrent uploads to the same key race; the last write wins.
    async fn upload(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<Url, UploadError>;
}

/// S3 (or S3-compatible) blob store
///
/// The SDK client is cheap to clone and safe to share between requests, so
/// one instance is built at startup and handed to the router.
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
    public_base: Url,
    multipart_threshold: usize,
    part_size: usize,
}

impl S3BlobStore {
    /// Create a new S3 blob store, failing fast on incomplete configuration
    pub async fn new(config: &S3Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let public_base = public_base_url(config)?;

        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "snippet-archive-config",
        );

        let timeouts = TimeoutConfig::builder()
            .operation_timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .build();

        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .timeout_config(timeouts)
            // A failed upload is terminal for the request
            .retry_config(RetryConfig::disabled())
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            public_base = %public_base,
            "S3 blob store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            public_base,
            multipart_threshold: config.multipart_threshold_bytes,
            part_size: config.part_size_bytes,
        })
    }

    /// Public URL of an object in this bucket
    pub fn object_url(&self, key: &str) -> Url {
        object_url(&self.public_base, key)
    }

    /// Simple single-part upload for small files
    async fn simple_upload(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<(), UploadError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| UploadError::storage(key, e))?;

        Ok(())
    }

    /// Multipart upload for large files, aborted if any part fails
    async fn multipart_upload(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<(), UploadError> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| UploadError::storage(key, e))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| UploadError::Storage {
                key: key.to_string(),
                message: "No upload ID in response".to_string(),
            })?
            .to_string();

        match self.upload_parts(key, &upload_id, bytes).await {
            Ok(parts) => {
                let completed_upload = CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build();

                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(completed_upload)
                    .send()
                    .await
                    .map_err(|e| UploadError::storage(key, e))?;

                Ok(())
            }
            Err(e) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        key = %key,
                        error = %DisplayErrorContext(abort_err),
                        "Failed to abort multipart upload"
                    );
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        bytes: Bytes,
    ) -> Result<Vec<CompletedPart>, UploadError> {
        let mut completed_parts = Vec::new();

        for (index, range) in part_ranges(bytes.len(), self.part_size).into_iter().enumerate() {
            let part_number = index as i32 + 1;

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(bytes.slice(range)))
                .send()
                .await
                .map_err(|e| UploadError::storage(key, e))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );
        }

        Ok(completed_parts)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self, bytes), fields(size_bytes = bytes.len()))]
    async fn upload(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<Url, UploadError> {
        if key.is_empty() {
            return Err(UploadError::InvalidKey);
        }

        debug!(key = %key, content_type = %content_type, "Uploading object to S3");

        if bytes.len() > self.multipart_threshold {
            self.multipart_upload(key, bytes, content_type).await?;
        } else {
            self.simple_upload(key, bytes, content_type).await?;
        }

        let url = self.object_url(key);
        info!(key = %key, url = %url, "Object uploaded successfully");
        Ok(url)
    }
}

/// Base URL objects of the configured bucket are publicly reachable under.
///
/// Precedence: `public_base_url`, then `endpoint_url` (path-style or
/// virtual-hosted), then the AWS virtual-hosted form
/// `https://{bucket}.s3.{region}.amazonaws.com`.
pub fn public_base_url(config: &S3Config) -> Result<Url, ConfigError> {
    let invalid = |key: &str, message: String| ConfigError::InvalidValue {
        key: key.to_string(),
        message,
    };

    let base = match (&config.public_base_url, &config.endpoint_url) {
        (Some(base), _) => {
            Url::parse(base).map_err(|e| invalid("s3.public_base_url", e.to_string()))?
        }
        (None, Some(endpoint)) => {
            let mut url =
                Url::parse(endpoint).map_err(|e| invalid("s3.endpoint_url", e.to_string()))?;
            if config.force_path_style {
                url = object_url(&url, &config.bucket);
            } else {
                let host = url
                    .host_str()
                    .ok_or_else(|| invalid("s3.endpoint_url", "missing host".to_string()))?
                    .to_string();
                url.set_host(Some(&format!("{}.{}", config.bucket, host)))
                    .map_err(|e| invalid("s3.endpoint_url", e.to_string()))?;
            }
            url
        }
        (None, None) => {
            let raw = format!("https://{}.s3.{}.amazonaws.com", config.bucket, config.region);
            Url::parse(&raw).map_err(|e| invalid("s3.bucket", e.to_string()))?
        }
    };

    if base.cannot_be_a_base() {
        return Err(invalid("s3.public_base_url", format!("{base} cannot carry a path")));
    }
    Ok(base)
}

/// Append the `/`-separated segments of `key` to `base`, percent-encoding each
pub fn object_url(base: &Url, key: &str) -> Url {
    let mut url = base.clone();
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.pop_if_empty().extend(key.split('/'));
    }
    url
}

/// Byte ranges of the parts of a multipart upload
fn part_ranges(len: usize, part_size: usize) -> Vec<std::ops::Range<usize>> {
    let part_size = part_size.max(1);
    (0..len)
        .step_by(part_size)
        .map(|start| start..(start + part_size).min(len))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::s3_config;

    #[test]
    fn test_aws_public_url_shape() {
        let base = public_base_url(&s3_config()).unwrap();
        assert_eq!(
            object_url(&base, "a.png").as_str(),
            "https://snippets.s3.eu-west-1.amazonaws.com/a.png"
        );
    }

    #[test]
    fn test_object_url_encodes_segments() {
        let base = public_base_url(&s3_config()).unwrap();
        assert_eq!(
            object_url(&base, "snippets/2024/01/15/my snippet#1.png").as_str(),
            "https://snippets.s3.eu-west-1.amazonaws.com/snippets/2024/01/15/my%20snippet%231.png"
        );
    }

    #[test]
    fn test_path_style_endpoint_url() {
        let mut config = s3_config();
        config.endpoint_url = Some("http://localhost:9000".to_string());
        config.force_path_style = true;

        let base = public_base_url(&config).unwrap();
        assert_eq!(
            object_url(&base, "a.png").as_str(),
            "http://localhost:9000/snippets/a.png"
        );
    }

    #[test]
    fn test_virtual_hosted_endpoint_url() {
        let mut config = s3_config();
        config.endpoint_url = Some("https://s3.example.com".to_string());

        let base = public_base_url(&config).unwrap();
        assert_eq!(
            object_url(&base, "a.png").as_str(),
            "https://snippets.s3.example.com/a.png"
        );
    }

    #[test]
    fn test_public_base_url_takes_precedence() {
        let mut config = s3_config();
        config.endpoint_url = Some("http://localhost:9000".to_string());
        config.public_base_url = Some("https://cdn.example.com/images/".to_string());

        let base = public_base_url(&config).unwrap();
        assert_eq!(
            object_url(&base, "a.png").as_str(),
            "https://cdn.example.com/images/a.png"
        );
    }

    #[test]
    fn test_unusable_public_base_url_is_rejected() {
        let mut config = s3_config();
        config.public_base_url = Some("mailto:images@example.com".to_string());
        assert!(public_base_url(&config).is_err());

        config.public_base_url = Some("not a url".to_string());
        assert!(public_base_url(&config).is_err());
    }

    #[test]
    fn test_part_ranges() {
        assert_eq!(part_ranges(10, 4), vec![0..4, 4..8, 8..10]);
        assert_eq!(part_ranges(8, 4), vec![0..4, 4..8]);
        assert!(part_ranges(0, 4).is_empty());
    }

    #[tokio::test]
    async fn test_construction_fails_fast_without_credentials() {
        let mut config = s3_config();
        config.secret_access_key.clear();

        let result = S3BlobStore::new(&config).await;
        assert!(matches!(
            result,
            Err(ConfigError::MissingRequired(ref key)) if key == "s3.secret_access_key"
        ));
    }

    #[tokio::test]
    async fn test_rejects_empty_key() {
        let store = S3BlobStore::new(&s3_config()).await.unwrap();
        let result = store.upload("", Bytes::from_static(b"x"), "image/png").await;
        assert!(matches!(result, Err(UploadError::InvalidKey)));
    }
}
