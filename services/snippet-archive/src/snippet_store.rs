use crate::config::DatabaseConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Default and maximum page sizes for snippet searches
pub const DEFAULT_SEARCH_LIMIT: i64 = 50;
pub const MAX_SEARCH_LIMIT: i64 = 100;

/// Snippet metadata as submitted by a client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSnippet {
    /// URL of the uploaded snippet image
    #[serde(default, deserialize_with = "null_as_empty")]
    pub image_url: String,
    /// Search label
    #[serde(default, deserialize_with = "null_as_empty")]
    pub tag: String,
    /// Free text description
    #[serde(default, deserialize_with = "null_as_empty")]
    pub description: String,
}

impl NewSnippet {
    /// Check that every required field carries a value
    pub fn validate(&self) -> Result<(), ValidationError> {
        let fields: Vec<&'static str> = [
            ("imageUrl", &self.image_url),
            ("tag", &self.tag),
            ("description", &self.description),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(field, _)| field)
        .collect();

        if fields.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { fields })
        }
    }
}

/// Treat an explicit JSON `null` like an absent field
fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// A required snippet field was empty or missing
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Missing required snippet fields: {}", .fields.join(", "))]
pub struct ValidationError {
    /// Wire names of the offending fields
    pub fields: Vec<&'static str>,
}

/// Stored snippet record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SnippetRecord {
    /// Unique snippet ID
    pub id: Uuid,
    /// URL of the snippet image in object storage
    pub image_url: String,
    /// Search label
    pub tag: String,
    /// Free text description
    pub description: String,
    /// When the record was created
    pub created_at: DateTime<Utc>,
}

/// Query parameters for snippet search
#[derive(Debug, Clone, PartialEq)]
pub struct SnippetQuery {
    /// Case-insensitive tag substring
    pub tag: Option<String>,
    /// Maximum number of results
    pub limit: i64,
    /// Offset for pagination
    pub offset: i64,
}

impl Default for SnippetQuery {
    fn default() -> Self {
        Self {
            tag: None,
            limit: DEFAULT_SEARCH_LIMIT,
            offset: 0,
        }
    }
}

/// One page of search results
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnippetPage {
    pub snippets: Vec<SnippetRecord>,
    pub has_more: bool,
}

/// Errors raised by [`SnippetRepository`]
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Snippet store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

/// Document store holding snippet records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnippetStore: Send + Sync {
    /// Persist a fully formed record
    async fn insert(&self, record: &SnippetRecord) -> Result<()>;

    /// Fetch a record by ID
    async fn get(&self, id: Uuid) -> Result<Option<SnippetRecord>>;

    /// Records matching the query, newest first
    async fn search(&self, query: &SnippetQuery) -> Result<Vec<SnippetRecord>>;

    /// Check connectivity
    async fn ping(&self) -> Result<()>;
}

/// Validating accessor for snippet records
#[derive(Clone)]
pub struct SnippetRepository {
    store: Arc<dyn SnippetStore>,
}

impl SnippetRepository {
    pub fn new(store: Arc<dyn SnippetStore>) -> Self {
        Self { store }
    }

    /// Validate and persist a snippet, returning its ID.
    ///
    /// The store is never called for an invalid snippet.
    #[instrument(skip(self, snippet), fields(tag = %snippet.tag))]
    pub async fn insert(&self, snippet: NewSnippet) -> Result<Uuid, RepositoryError> {
        if let Err(e) = snippet.validate() {
            metrics::counter!("snippets.records.rejected").increment(1);
            return Err(e.into());
        }

        let record = SnippetRecord {
            id: Uuid::new_v4(),
            image_url: snippet.image_url,
            tag: snippet.tag,
            description: snippet.description,
            created_at: Utc::now(),
        };

        self.store.insert(&record).await?;

        debug!(snippet_id = %record.id, image_url = %record.image_url, "Snippet inserted");
        metrics::counter!("snippets.records.inserted").increment(1);

        Ok(record.id)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<SnippetRecord>, RepositoryError> {
        Ok(self.store.get(id).await?)
    }

    /// Search snippets, clamping the page size to `1..=MAX_SEARCH_LIMIT`.
    ///
    /// One extra record is requested from the store to tell whether another
    /// page follows.
    #[instrument(skip(self))]
    pub async fn search(&self, query: &SnippetQuery) -> Result<SnippetPage, RepositoryError> {
        let limit = query.limit.clamp(1, MAX_SEARCH_LIMIT);
        let store_query = SnippetQuery {
            tag: query
                .tag
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
            limit: limit + 1,
            offset: query.offset.max(0),
        };

        let mut snippets = self.store.search(&store_query).await?;
        let has_more = snippets.len() as i64 > limit;
        snippets.truncate(limit as usize);

        Ok(SnippetPage { snippets, has_more })
    }

    pub async fn ping(&self) -> Result<(), RepositoryError> {
        Ok(self.store.ping().await?)
    }
}

/// PostgreSQL-backed snippet store
pub struct PgSnippetStore {
    pool: PgPool,
}

impl PgSnippetStore {
    /// Create a new store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl SnippetStore for PgSnippetStore {
    async fn insert(&self, record: &SnippetRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO snippets (id, image_url, tag, description, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(record.id)
        .bind(&record.image_url)
        .bind(&record.tag)
        .bind(&record.description)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert snippet")?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<SnippetRecord>> {
        let record = sqlx::query_as::<_, SnippetRecord>(
            r#"
            SELECT id, image_url, tag, description, created_at
            FROM snippets
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query snippet")?;

        Ok(record)
    }

    async fn search(&self, query: &SnippetQuery) -> Result<Vec<SnippetRecord>> {
        let pattern = query.tag.as_deref().map(|t| format!("%{}%", escape_like(t)));

        let records = sqlx::query_as::<_, SnippetRecord>(
            r#"
            SELECT id, image_url, tag, description, created_at
            FROM snippets
            WHERE ($1::text IS NULL OR tag ILIKE $1)
            ORDER BY created_at DESC, id
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(pattern)
        .bind(query.limit)
        .bind(query.offset)
        .fetch_all(&self.pool)
        .await
        .context("Failed to search snippets")?;

        Ok(records)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("Database ping failed")?;
        Ok(())
    }
}

/// Escape LIKE wildcards so a tag matches literally
fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
