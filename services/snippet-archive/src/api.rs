use crate::blob_store::{BlobStore, UploadError};
use crate::config::{ApiConfig, UploadConfig};
use crate::ingest::{Ingester, ParseError};
use crate::object_key::{content_type_for, object_key};
use crate::snippet_store::{
    NewSnippet, RepositoryError, SnippetPage, SnippetQuery, SnippetRecord, SnippetRepository,
    DEFAULT_SEARCH_LIMIT,
};
use anyhow::{Context, Result};
use axum::{
    extract::{
        multipart::MultipartRejection, rejection::JsonRejection, rejection::QueryRejection,
        DefaultBodyLimit, Multipart, Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};
use url::Url;
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub blob_store: Arc<dyn BlobStore>,
    pub repository: SnippetRepository,
    pub ingester: Ingester,
    pub uploads: Arc<UploadConfig>,
}

impl AppState {
    pub fn new(
        blob_store: Arc<dyn BlobStore>,
        repository: SnippetRepository,
        uploads: &UploadConfig,
    ) -> Self {
        Self {
            blob_store,
            repository,
            ingester: Ingester::new(uploads),
            uploads: Arc::new(uploads.clone()),
        }
    }
}

/// Query parameters of the upload endpoint
#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    /// Client-side name of the file, used when the file part has none
    #[serde(rename = "fileName")]
    pub file_name: Option<String>,
}

/// Successful upload response
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub image_url: String,
}

/// Response of the record endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct AddSnippetResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl AddSnippetResponse {
    fn failed(error: String, code: &str) -> Self {
        Self {
            success: false,
            id: None,
            error: Some(error),
            code: Some(code.to_string()),
        }
    }
}

/// Query parameters for snippet listing
#[derive(Debug, Deserialize)]
pub struct SnippetListQuery {
    /// Case-insensitive tag substring
    pub tag: Option<String>,
    /// Maximum results
    #[serde(default = "default_limit")]
    pub limit: i64,
    /// Offset for pagination
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    DEFAULT_SEARCH_LIMIT
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Stage of an upload request a failure happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStage {
    Parsing,
    Uploading,
}

/// Failure of an upload request
#[derive(Debug, Error)]
pub enum UploadFailure {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error(transparent)]
    Upload(#[from] UploadError),
}

impl UploadFailure {
    pub fn stage(&self) -> UploadStage {
        match self {
            UploadFailure::Parse(_) | UploadFailure::UnsupportedContentType(_) => {
                UploadStage::Parsing
            }
            UploadFailure::Upload(_) => UploadStage::Uploading,
        }
    }

    /// Status code of the (empty) error response
    pub fn status(&self) -> StatusCode {
        match self {
            UploadFailure::Parse(ParseError::BodyTooLarge)
            | UploadFailure::Parse(ParseError::FileTooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            UploadFailure::UnsupportedContentType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route(
            "/uploadSnippetToS3",
            post(upload_snippet_image).layer(DefaultBodyLimit::max(config.max_upload_bytes)),
        )
        .route("/addCodeSnippet", post(add_code_snippet))
        .route("/snippets", get(list_snippets))
        .route("/snippets/:snippet_id", get(get_snippet))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "snippet-archive"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.repository.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Upload a snippet image to the blob store.
///
/// Responds `200 {"imageUrl": ...}` or an empty-bodied error status. The
/// multipart spool is released before the response is built.
#[instrument(skip(state, query, multipart))]
async fn upload_snippet_image(
    State(state): State<AppState>,
    query: Result<Query<UploadQuery>, QueryRejection>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    match store_upload(&state, query, multipart).await {
        Ok(url) => {
            metrics::counter!("snippets.uploads.succeeded").increment(1);
            Json(UploadResponse {
                image_url: url.to_string(),
            })
            .into_response()
        }
        Err(e) => {
            metrics::counter!("snippets.uploads.failed").increment(1);
            error!(stage = ?e.stage(), error = %e, "Snippet upload failed");
            e.status().into_response()
        }
    }
}

async fn store_upload(
    state: &AppState,
    query: Result<Query<UploadQuery>, QueryRejection>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Url, UploadFailure> {
    let Query(query) = query.map_err(|e| ParseError::Rejected(e.body_text()))?;
    let requested_name = query
        .file_name
        .filter(|n| !n.is_empty())
        .ok_or(ParseError::Missing("fileName query parameter"))?;

    let multipart = multipart.map_err(ParseError::from)?;
    let mut form = state.ingester.ingest(multipart).await?;
    let file = form
        .take_file("file")
        .ok_or(ParseError::Missing("file part"))?;

    let file_name = file.file_name.clone().unwrap_or(requested_name);
    let content_type = file
        .content_type
        .clone()
        .filter(|ct| !ct.is_empty())
        .unwrap_or_else(|| content_type_for(&file_name).to_string());

    if !content_type_allowed(&state.uploads.allowed_content_types, &content_type) {
        return Err(UploadFailure::UnsupportedContentType(content_type));
    }

    let key = object_key(state.uploads.key_strategy, &file_name, &content_type, Utc::now());
    let bytes = file.bytes().await.map_err(ParseError::from)?;
    metrics::histogram!("snippets.uploads.bytes").record(bytes.len() as f64);

    let url = state.blob_store.upload(&key, bytes, &content_type).await?;
    Ok(url)
}

/// Whether `content_type` matches the allow list (`type/*` wildcards allowed)
fn content_type_allowed(allowed: &[String], content_type: &str) -> bool {
    if allowed.is_empty() {
        return true;
    }

    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    allowed.iter().any(|entry| {
        let entry = entry.trim().to_ascii_lowercase();
        match entry.strip_suffix("/*") {
            Some(prefix) => essence
                .split_once('/')
                .map(|(kind, _)| kind == prefix)
                .unwrap_or(false),
            None => entry == essence,
        }
    })
}

/// Persist snippet metadata for an uploaded image
#[instrument(skip(state, payload))]
async fn add_code_snippet(
    State(state): State<AppState>,
    payload: Result<Json<NewSnippet>, JsonRejection>,
) -> (StatusCode, Json<AddSnippetResponse>) {
    let snippet = match payload {
        Ok(Json(snippet)) => snippet,
        Err(e) => {
            warn!(error = %e, "Rejected snippet payload");
            return (
                StatusCode::BAD_REQUEST,
                Json(AddSnippetResponse::failed(e.body_text(), "INVALID_JSON")),
            );
        }
    };

    match state.repository.insert(snippet).await {
        Ok(id) => (
            StatusCode::OK,
            Json(AddSnippetResponse {
                success: true,
                id: Some(id),
                error: None,
                code: None,
            }),
        ),
        Err(RepositoryError::Validation(e)) => {
            warn!(error = %e, "Snippet failed validation");
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(AddSnippetResponse::failed(e.to_string(), "VALIDATION_ERROR")),
            )
        }
        Err(e) => {
            error!(error = %e, "Failed to insert snippet");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(AddSnippetResponse::failed(
                    "Failed to store snippet".to_string(),
                    "STORE_ERROR",
                )),
            )
        }
    }
}

/// List snippets, newest first
#[instrument(skip(state))]
async fn list_snippets(
    State(state): State<AppState>,
    Query(params): Query<SnippetListQuery>,
) -> Result<Json<SnippetPage>, (StatusCode, Json<ErrorResponse>)> {
    let query = SnippetQuery {
        tag: params.tag,
        limit: params.limit,
        offset: params.offset,
    };

    let page = state.repository.search(&query).await.map_err(|e| {
        error!(error = %e, "Failed to search snippets");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: "Failed to search snippets".to_string(),
                code: "QUERY_ERROR".to_string(),
            }),
        )
    })?;

    Ok(Json(page))
}

/// Get a single snippet
#[instrument(skip(state))]
async fn get_snippet(
    State(state): State<AppState>,
    Path(snippet_id): Path<Uuid>,
) -> Result<Json<SnippetRecord>, (StatusCode, Json<ErrorResponse>)> {
    let snippet = state.repository.get(snippet_id).await.map_err(|e| {
        error!(error = %e, "Failed to get snippet");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: "Failed to get snippet".to_string(),
                code: "QUERY_ERROR".to_string(),
            }),
        )
    })?;

    match snippet {
        Some(s) => Ok(Json(s)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Snippet not found".to_string(),
                code: "NOT_FOUND".to_string(),
            }),
        )),
    }
}

/// Start the API server, draining in-flight requests once `shutdown` fires
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting snippet API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}
