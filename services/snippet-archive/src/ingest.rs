//! Multipart form ingestion.
//!
//! Text parts are collected into a map. File parts are streamed chunk by
//! chunk and, once they grow past the spool threshold, written to a
//! per-part temp file. The temp file is owned by the returned
//! [`UploadedFile`] and removed when it is dropped, so every exit path of a
//! request (success, parse failure, upload failure) cleans up after itself.

use crate::config::UploadConfig;
use axum::body::Bytes;
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::Multipart;
use axum::http::StatusCode;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempPath};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

/// Errors raised while ingesting a multipart body
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Request is not a valid multipart form: {0}")]
    Rejected(String),

    #[error("Malformed multipart body: {0}")]
    Malformed(String),

    #[error("Request body exceeds the configured limit")]
    BodyTooLarge,

    #[error("File part exceeds {limit} bytes")]
    FileTooLarge { limit: usize },

    #[error("Missing required {0}")]
    Missing(&'static str),

    #[error("Failed to spool upload: {0}")]
    Spool(#[from] io::Error),
}

impl From<MultipartRejection> for ParseError {
    fn from(rejection: MultipartRejection) -> Self {
        ParseError::Rejected(rejection.body_text())
    }
}

impl From<MultipartError> for ParseError {
    fn from(err: MultipartError) -> Self {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ParseError::BodyTooLarge
        } else {
            ParseError::Malformed(err.body_text())
        }
    }
}

/// Where the bytes of an uploaded file live
#[derive(Debug)]
enum FileContent {
    Memory(Bytes),
    Spooled(TempPath),
}

/// One file part of a multipart form
#[derive(Debug)]
pub struct UploadedFile {
    /// Form field the file was sent under
    pub field_name: String,
    /// Client-declared file name
    pub file_name: Option<String>,
    /// Client-declared content type
    pub content_type: Option<String>,
    /// Size in bytes
    pub size: u64,
    content: FileContent,
}

impl UploadedFile {
    /// Read the whole file
    pub async fn bytes(&self) -> io::Result<Bytes> {
        match &self.content {
            FileContent::Memory(bytes) => Ok(bytes.clone()),
            FileContent::Spooled(path) => tokio::fs::read(path).await.map(Bytes::from),
        }
    }

    /// Path of the on-disk spool, if the file was spooled
    pub fn spool_path(&self) -> Option<&Path> {
        match &self.content {
            FileContent::Memory(_) => None,
            FileContent::Spooled(path) => Some(path),
        }
    }
}

/// Parsed multipart form
#[derive(Debug, Default)]
pub struct IngestedForm {
    pub fields: HashMap<String, String>,
    pub files: HashMap<String, UploadedFile>,
}

impl IngestedForm {
    /// Remove and return the file sent under `field`
    pub fn take_file(&mut self, field: &str) -> Option<UploadedFile> {
        self.files.remove(field)
    }
}

/// Multipart ingester
#[derive(Debug, Clone)]
pub struct Ingester {
    spool_dir: Option<PathBuf>,
    spool_threshold: usize,
    max_file_bytes: usize,
}

impl Ingester {
    pub fn new(config: &UploadConfig) -> Self {
        Self {
            spool_dir: config.spool_dir.clone(),
            spool_threshold: config.spool_threshold_bytes,
            max_file_bytes: config.max_file_bytes,
        }
    }

    /// Consume a multipart body into text fields and files.
    ///
    /// A later part with the same field name replaces an earlier one.
    #[instrument(skip_all)]
    pub async fn ingest(&self, mut multipart: Multipart) -> Result<IngestedForm, ParseError> {
        let mut form = IngestedForm::default();

        while let Some(mut field) = multipart.next_field().await? {
            let name = field.name().unwrap_or_default().to_string();

            let Some(file_name) = field.file_name().map(str::to_string) else {
                let value = field.text().await?;
                form.fields.insert(name, value);
                continue;
            };
            let content_type = field.content_type().map(str::to_string);

            let mut spool = Spool::new(self);
            while let Some(chunk) = field.chunk().await? {
                spool.write(&chunk).await?;
            }
            let (size, content) = spool.finish().await?;

            debug!(field = %name, file_name = %file_name, size_bytes = size, "File part ingested");

            form.files.insert(
                name.clone(),
                UploadedFile {
                    field_name: name,
                    file_name: Some(file_name).filter(|n| !n.is_empty()),
                    content_type,
                    size,
                    content,
                },
            );
        }

        Ok(form)
    }
}

/// Buffer for one file part, moving to disk past the threshold
struct Spool<'a> {
    ingester: &'a Ingester,
    buffer: Vec<u8>,
    file: Option<(tokio::fs::File, TempPath)>,
    size: u64,
}

impl<'a> Spool<'a> {
    fn new(ingester: &'a Ingester) -> Self {
        Self {
            ingester,
            buffer: Vec::new(),
            file: None,
            size: 0,
        }
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<(), ParseError> {
        self.size += chunk.len() as u64;
        if self.size > self.ingester.max_file_bytes as u64 {
            return Err(ParseError::FileTooLarge {
                limit: self.ingester.max_file_bytes,
            });
        }

        if self.file.is_none() && self.size as usize > self.ingester.spool_threshold {
            let temp = match &self.ingester.spool_dir {
                Some(dir) => NamedTempFile::new_in(dir)?,
                None => NamedTempFile::new()?,
            };
            let (file, path) = temp.into_parts();
            let mut file = tokio::fs::File::from_std(file);
            file.write_all(&self.buffer).await?;
            self.buffer = Vec::new();
            self.file = Some((file, path));
        }

        match &mut self.file {
            Some((file, _)) => file.write_all(chunk).await?,
            None => self.buffer.extend_from_slice(chunk),
        }
        Ok(())
    }

    async fn finish(self) -> Result<(u64, FileContent), ParseError> {
        match self.file {
            Some((mut file, path)) => {
                file.flush().await?;
                Ok((self.size, FileContent::Spooled(path)))
            }
            None => Ok((self.size, FileContent::Memory(Bytes::from(self.buffer)))),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::FromRequest;
    use axum::http::Request;

    pub(crate) const BOUNDARY: &str = "snippet-boundary";

    /// Build a multipart body from (name, optional (file name, content type), data) parts
    pub(crate) fn multipart_body(parts: &[(&str, Option<(&str, &str)>, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, file, data) in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match file {
                Some((file_name, content_type)) => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\nContent-Type: {content_type}\r\n\r\n"
                        )
                        .as_bytes(),
                    );
                }
                None => {
                    body.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                    );
                }
            }
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    async fn multipart(body: Vec<u8>) -> Multipart {
        let request = Request::builder()
            .method("POST")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap();
        Multipart::from_request(request, &()).await.unwrap()
    }

    fn ingester(dir: &Path, threshold: usize, max: usize) -> Ingester {
        Ingester::new(&UploadConfig {
            spool_dir: Some(dir.to_path_buf()),
            spool_threshold_bytes: threshold,
            max_file_bytes: max,
            ..Default::default()
        })
    }

    fn spooled_files(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[tokio::test]
    async fn test_ingest_fields_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let body = multipart_body(&[
            ("tag", None, &b"rust"[..]),
            ("file", Some(("a.png", "image/png")), &b"0123456789"[..]),
        ]);

        let mut form = ingester(dir.path(), 0, 1024)
            .ingest(multipart(body).await)
            .await
            .unwrap();

        assert_eq!(form.fields.get("tag").map(String::as_str), Some("rust"));
        let file = form.take_file("file").unwrap();
        assert_eq!(file.file_name.as_deref(), Some("a.png"));
        assert_eq!(file.content_type.as_deref(), Some("image/png"));
        assert_eq!(file.size, 10);
        assert_eq!(file.bytes().await.unwrap().as_ref(), b"0123456789");

        let spool = file.spool_path().unwrap().to_path_buf();
        assert!(spool.starts_with(dir.path()));
        assert!(spool.exists());

        drop(file);
        assert!(!spool.exists());
        assert_eq!(spooled_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_small_files_stay_in_memory_under_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let body = multipart_body(&[("file", Some(("a.png", "image/png")), &b"tiny"[..])]);

        let mut form = ingester(dir.path(), 64, 1024)
            .ingest(multipart(body).await)
            .await
            .unwrap();

        let file = form.take_file("file").unwrap();
        assert!(file.spool_path().is_none());
        assert_eq!(file.bytes().await.unwrap().as_ref(), b"tiny");
        assert_eq!(spooled_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_oversized_file_is_rejected_and_spool_removed() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![7u8; 4096];
        let body = multipart_body(&[("file", Some(("big.png", "image/png")), &data[..])]);

        let result = ingester(dir.path(), 0, 1000)
            .ingest(multipart(body).await)
            .await;

        assert!(matches!(result, Err(ParseError::FileTooLarge { limit: 1000 })));
        assert_eq!(spooled_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_truncated_body_is_malformed_and_spool_removed() {
        let dir = tempfile::tempdir().unwrap();
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"a.png\"\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(&[1u8; 256]);

        let result = ingester(dir.path(), 0, 1024)
            .ingest(multipart(body).await)
            .await;

        assert!(matches!(result, Err(ParseError::Malformed(_))));
        assert_eq!(spooled_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_missing_content_type_is_not_multipart() {
        let request = Request::builder()
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap();

        let rejection = Multipart::from_request(request, &()).await.unwrap_err();
        assert!(matches!(ParseError::from(rejection), ParseError::Rejected(_)));
    }
}
