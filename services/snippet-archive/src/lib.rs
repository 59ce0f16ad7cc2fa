//! Snippet Archive Service
//!
//! Archive and search code snippets. Clients upload a snippet image, which
//! is stored in S3, and then record its tag and description against the
//! returned image URL in PostgreSQL.
//!
//! ## Features
//!
//! - **Streaming Multipart Ingestion**: file parts are spooled to per-request
//!   temp files that are removed on every exit path
//! - **S3 Storage**: server-generated object keys, multipart uploads for
//!   large images, public URL resolution for AWS and S3-compatible endpoints
//! - **Validated Records**: snippet metadata is checked for required fields
//!   before it reaches the store
//! - **Upload Orchestrator**: HTTP client sequencing upload-then-persist
//!
//! ## Architecture
//!
//! ```text
//!   Client                     API                        S3 Bucket
//! ┌──────────────┐  multipart ┌──────────────┐  put      ┌──────────────┐
//! │ Snippet      │───────────▶│ Upload       │──────────▶│ snippets/    │
//! │ Client       │◀───────────│ Endpoint     │           │   {date}/    │
//! └──────────────┘  imageUrl  └──────────────┘           └──────────────┘
//!        │                           │
//!        │ json                      ▼
//!        │                    ┌──────────────┐
//!        └───────────────────▶│ Record       │           PostgreSQL
//!                             │ Endpoint     │──────────▶┌──────────────┐
//!                             └──────────────┘           │ snippets     │
//!                                                        └──────────────┘
//! ```

pub mod api;
pub mod blob_store;
pub mod client;
pub mod config;
pub mod ingest;
pub mod object_key;
pub mod snippet_store;

pub use api::{create_router, AppState, UploadResponse};
pub use blob_store::{BlobStore, S3BlobStore, UploadError};
pub use client::{NetworkError, SnippetClient, SnippetFile};
pub use config::{Config, ConfigError, KeyStrategy};
pub use ingest::{IngestedForm, Ingester, ParseError, UploadedFile};
pub use snippet_store::{
    NewSnippet, PgSnippetStore, RepositoryError, SnippetQuery, SnippetRecord, SnippetRepository,
    SnippetStore, ValidationError,
};
