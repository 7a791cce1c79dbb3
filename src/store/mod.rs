//! Storage backends for documents and chunk embeddings.
//!
//! A unified [`VectorStore`] trait abstracts over concrete backends so the
//! ingestion pipeline and retrieval path never depend on a specific database:
//!
//! ```text
//!                  ┌──────────────────┐
//!                  │ VectorStore trait│
//!                  │   (async CRUD +  │
//!                  │  nearest-neighbor│
//!                  │      search)     │
//!                  └────────┬─────────┘
//!                           │
//!               ┌───────────┴───────────┐
//!               ▼                       ▼
//!        ┌─────────────┐         ┌─────────────┐
//!        │  Postgres   │         │  In-memory  │
//!        │  pgvector   │         │ (tests/dev) │
//!        └─────────────┘         └─────────────┘
//! ```
//!
//! The unit of consistency is one document together with its chunks: every
//! implementation must make [`VectorStore::upsert_document`] and
//! [`VectorStore::replace_chunks`] atomic, so a failure mid-replacement
//! never leaves a document that reports success while pointing at stale or
//! missing chunks.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::types::{CorpusError, Language, ScrapeStatus};

pub use memory::MemoryVectorStore;
#[cfg(feature = "postgres")]
pub use postgres::PgVectorStore;

/// A stored document row. `url` is the natural key; `content_hash` is the
/// SHA-256 of `content` as lowercase hex and always matches the stored
/// content after a successful write.
#[derive(Clone, Debug)]
pub struct DocumentRecord {
    pub id: Uuid,
    pub url: String,
    pub title: Option<String>,
    pub content: Option<String>,
    pub content_hash: Option<String>,
    pub language: Language,
    pub sitemap_lastmod: Option<DateTime<Utc>>,
    pub last_scraped_at: Option<DateTime<Utc>>,
    pub scrape_status: ScrapeStatus,
    pub embedding_version: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields written when creating or refreshing a document.
#[derive(Clone, Debug)]
pub struct DocumentUpsert {
    pub url: String,
    pub title: Option<String>,
    pub content: String,
    pub content_hash: String,
    pub language: Language,
    pub sitemap_lastmod: Option<DateTime<Utc>>,
    pub last_scraped_at: Option<DateTime<Utc>>,
    pub embedding_version: Option<String>,
    pub metadata: serde_json::Value,
}

/// A chunk ready for insertion, produced by the chunker + embedding step.
#[derive(Clone, Debug)]
pub struct NewChunk {
    pub content: String,
    pub embedding: Vec<f32>,
    pub chunk_index: usize,
    pub metadata: serde_json::Value,
}

/// A stored chunk row. The embedding itself stays in the store; retrieval
/// only needs content, position, and metadata.
#[derive(Clone, Debug)]
pub struct ChunkRecord {
    pub id: Uuid,
    pub document_id: Uuid,
    pub content: String,
    pub chunk_index: usize,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A nearest-neighbor hit: the chunk plus `1 − cosine_distance`.
pub type SearchHit = (ChunkRecord, f32);

/// Unified interface over document + chunk storage with vector search.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Looks a document up by its natural key.
    async fn get_document_by_url(&self, url: &str) -> Result<Option<DocumentRecord>, CorpusError>;

    /// One consistent snapshot of every non-deleted document, used as the
    /// change-detection baseline.
    async fn active_documents(&self) -> Result<Vec<DocumentRecord>, CorpusError>;

    /// Creates or refreshes a document by URL and replaces all of its chunks
    /// in the same unit of work, leaving the document `scraped`.
    ///
    /// Returns the document id and the number of chunks written. The chunk
    /// delete + insert and the document write are atomic together: on error
    /// the previous document/chunk state is fully preserved.
    async fn upsert_document(
        &self,
        document: DocumentUpsert,
        chunks: Vec<NewChunk>,
    ) -> Result<(Uuid, usize), CorpusError>;

    /// Atomically replaces the chunk set of an existing document (old chunks
    /// deleted and new ones inserted in one unit of work), without touching
    /// document content. Returns the number of chunks written.
    async fn replace_chunks(
        &self,
        document_id: Uuid,
        chunks: Vec<NewChunk>,
    ) -> Result<usize, CorpusError>;

    /// Updates bookkeeping fields only; content and chunks stay untouched.
    async fn update_bookkeeping(
        &self,
        url: &str,
        sitemap_lastmod: Option<DateTime<Utc>>,
        last_scraped_at: DateTime<Utc>,
        status: ScrapeStatus,
    ) -> Result<(), CorpusError>;

    /// Sets the scrape status of a document, if it exists.
    async fn mark_status(&self, url: &str, status: ScrapeStatus) -> Result<(), CorpusError>;

    /// Soft-deletes documents by URL (status becomes `deleted`; rows and
    /// chunks are retained). Returns the number of documents updated.
    async fn soft_delete_urls(&self, urls: &[String]) -> Result<usize, CorpusError>;

    /// Physically removes a document and, by cascade, all of its chunks.
    async fn delete_document(&self, url: &str) -> Result<bool, CorpusError>;

    /// All chunks of a document, ordered by `chunk_index`.
    async fn chunks_for_document(&self, document_id: Uuid)
    -> Result<Vec<ChunkRecord>, CorpusError>;

    /// Nearest-neighbor search over chunk embeddings, ordered by descending
    /// similarity. `language` restricts candidates to chunks whose owning
    /// document has that language.
    async fn similarity_search(
        &self,
        query: &[f32],
        k: usize,
        language: Option<Language>,
    ) -> Result<Vec<SearchHit>, CorpusError>;

    async fn count_documents(&self) -> Result<u64, CorpusError>;

    async fn count_chunks(&self) -> Result<u64, CorpusError>;
}
