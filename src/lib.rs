//! Incremental ingestion and retrieval for a bilingual civic web corpus.
//!
//! ```text
//! Sitemap XML ──► sitemap::SitemapClient ──► Vec<SitemapEntry>
//!                                    │
//!                                    ▼
//!                    ingest::ChangeDetector (vs. stored corpus)
//!                                    │ new / changed / unchanged / deleted
//!                                    ▼
//! fetch::PageFetcher ──► ingest::IngestionPipeline
//!                                    │ hash-compare ► chunker::TextChunker
//!                                    │             ► embedding::EmbeddingProvider
//!                                    ▼
//!                       store::VectorStore (atomic doc+chunk replace)
//!
//! query ──► retrieval::Retriever ──► store similarity search ──► retrieval::rank
//!                                    │
//!                                    ▼
//!                        agent::AnswerFlow (detect ► guard ► retrieve ► generate)
//! ```
//!
//! Writes flow top-down: discovery produces fresh [`sitemap::SitemapEntry`]
//! values every run, change detection diffs them against one snapshot of the
//! store, and the pipeline re-ingests exactly the URLs whose content hash
//! actually changed. Each URL is an independent, atomic unit of work. Reads
//! flow bottom-up from the vector store through the ranker.

pub mod agent;
pub mod chunker;
pub mod config;
pub mod embedding;
pub mod fetch;
pub mod ingest;
pub mod retrieval;
pub mod sitemap;
pub mod store;
pub mod types;

pub use chunker::TextChunker;
pub use config::Settings;
pub use embedding::{EmbeddingProvider, MockEmbeddingProvider};
pub use fetch::{HttpPageFetcher, PageFetcher, RawPage};
pub use ingest::{ChangeDetector, ChangeReport, IngestOptions, IngestionPipeline, IngestionStats};
pub use retrieval::{Citation, ContextItem, RankerOptions, Retriever};
pub use sitemap::{SitemapClient, SitemapEntry, UrlFilter};
pub use store::{MemoryVectorStore, VectorStore};
#[cfg(feature = "postgres")]
pub use store::PgVectorStore;
pub use types::{CorpusError, Language, ScrapeStatus};

/// Installs a process-wide tracing subscriber honoring `RUST_LOG`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
