//! Ingestion orchestration.
//!
//! Coordinates discovery output → change detection → fetch → hash comparison
//! → chunk → embed → store, one URL at a time. Each URL is an independent
//! unit of work: its document-plus-chunks replacement is atomic in the store,
//! and a failure on one URL never aborts the rest of the batch.

use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::time::timeout;
use tracing::{info, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::chunker::TextChunker;
use crate::config::Settings;
use crate::embedding::EmbeddingProvider;
use crate::fetch::{PageFetcher, RawPage};
use crate::ingest::change_detector::{ChangeDetector, ChangeReport};
use crate::sitemap::SitemapEntry;
use crate::store::{DocumentUpsert, NewChunk, VectorStore};
use crate::types::{CorpusError, ScrapeStatus};

/// Outcome of ingesting one URL.
#[derive(Clone, Debug)]
pub struct IngestionResult {
    pub url: String,
    pub success: bool,
    pub document_id: Option<Uuid>,
    pub chunks_created: usize,
    pub was_updated: bool,
    pub error: Option<String>,
}

impl IngestionResult {
    fn failure(url: &str, error: &CorpusError) -> Self {
        Self {
            url: url.to_string(),
            success: false,
            document_id: None,
            chunks_created: 0,
            was_updated: false,
            error: Some(error.to_string()),
        }
    }
}

/// Aggregate statistics for one ingestion run.
#[derive(Clone, Debug, Default)]
pub struct IngestionStats {
    pub total_urls: usize,
    pub successful: usize,
    pub failed: usize,
    pub new_documents: usize,
    pub updated_documents: usize,
    pub unchanged_documents: usize,
    pub deleted_documents: usize,
    pub total_chunks: usize,
    pub results: Vec<IngestionResult>,
}

impl IngestionStats {
    pub fn summary(&self) -> String {
        format!(
            "Ingestion complete: {} processed, {} failed, {} new, {} updated, {} unchanged, {} deleted, {} chunks",
            self.successful,
            self.failed,
            self.new_documents,
            self.updated_documents,
            self.unchanged_documents,
            self.deleted_documents,
            self.total_chunks,
        )
    }
}

/// Caller-level switches for a run. These select which entries reach the
/// orchestrator; they change no logic within it.
#[derive(Clone, Debug, Default)]
pub struct IngestOptions {
    /// Keep only entries whose URL contains this substring.
    pub url_filter: Option<String>,
    /// Report what would be done without writing anything.
    pub dry_run: bool,
    /// Bypass change detection and reprocess every entry.
    pub full_reindex: bool,
    /// Upper bound on pages processed this run.
    pub max_pages: Option<usize>,
    /// Physically remove documents that left the sitemap instead of
    /// soft-deleting them.
    pub hard_delete: bool,
}

/// Drives the per-URL ingestion flow against a [`VectorStore`] and an
/// [`EmbeddingProvider`].
pub struct IngestionPipeline {
    settings: Settings,
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    chunker: TextChunker,
}

impl IngestionPipeline {
    pub fn new(
        settings: Settings,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        let chunker = TextChunker::new(settings.chunk_size, settings.chunk_overlap);
        Self {
            settings,
            store,
            embedder,
            chunker,
        }
    }

    /// SHA-256 of the raw page text as lowercase hex: the single source of
    /// truth for "has this page actually changed".
    pub fn content_hash(content: &str) -> String {
        hex::encode(Sha256::digest(content.as_bytes()))
    }

    /// Ingests one fetched page.
    ///
    /// Never returns an error: failures are folded into the result, the
    /// document is marked `failed` best-effort, and the caller moves on to
    /// the next URL.
    #[instrument(skip(self, entry, page), fields(url = %page.url))]
    pub async fn ingest_page(
        &self,
        entry: &SitemapEntry,
        page: &RawPage,
        full_reindex: bool,
    ) -> IngestionResult {
        match self.ingest_page_inner(entry, page, full_reindex).await {
            Ok(result) => result,
            Err(err) => {
                warn!(url = %page.url, error = %err, "ingestion failed");
                // Fail soft: the status update is best-effort and must not
                // mask the original error.
                if let Err(mark_err) = self
                    .store
                    .mark_status(&page.url, ScrapeStatus::Failed)
                    .await
                {
                    warn!(url = %page.url, error = %mark_err, "could not mark document failed");
                }
                IngestionResult::failure(&page.url, &err)
            }
        }
    }

    async fn ingest_page_inner(
        &self,
        entry: &SitemapEntry,
        page: &RawPage,
        full_reindex: bool,
    ) -> Result<IngestionResult, CorpusError> {
        let new_hash = Self::content_hash(&page.content);
        let existing = self.store.get_document_by_url(&page.url).await?;

        if let Some(doc) = &existing {
            if !full_reindex && doc.content_hash.as_deref() == Some(new_hash.as_str()) {
                // Content identical: record the sitemap lastmod and scrape
                // time, leave chunks and embeddings untouched.
                info!(url = %page.url, "content unchanged (hash match)");
                self.store
                    .update_bookkeeping(
                        &page.url,
                        entry.last_modified,
                        Utc::now(),
                        ScrapeStatus::Scraped,
                    )
                    .await?;
                return Ok(IngestionResult {
                    url: page.url.clone(),
                    success: true,
                    document_id: Some(doc.id),
                    chunks_created: 0,
                    was_updated: false,
                    error: None,
                });
            }
        }

        let chunks = self.chunker.chunk_document(
            &page.content,
            &page.url,
            &page.title,
            page.language,
            Some(&page.metadata),
        );
        if chunks.is_empty() {
            warn!(url = %page.url, "page produced no chunks");
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let embeddings = if texts.is_empty() {
            Vec::new()
        } else {
            timeout(self.settings.embed_timeout, self.embedder.embed_batch(&texts))
                .await
                .map_err(|_| CorpusError::Timeout(self.settings.embed_timeout))??
        };

        if embeddings.len() != chunks.len() {
            return Err(CorpusError::Embedding(format!(
                "expected {} vectors, got {}",
                chunks.len(),
                embeddings.len()
            )));
        }
        let expected_dims = self.embedder.dimensions();
        if embeddings.iter().any(|v| v.len() != expected_dims) {
            return Err(CorpusError::Embedding(format!(
                "vector dimension mismatch (expected {expected_dims})"
            )));
        }

        let new_chunks: Vec<NewChunk> = chunks
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(index, (chunk, embedding))| NewChunk {
                content: chunk.content,
                embedding,
                chunk_index: index,
                metadata: chunk.metadata,
            })
            .collect();
        let chunk_count = new_chunks.len();

        let (document_id, chunks_created) = self
            .store
            .upsert_document(
                DocumentUpsert {
                    url: page.url.clone(),
                    title: Some(page.title.clone()),
                    content: page.content.clone(),
                    content_hash: new_hash,
                    language: page.language,
                    sitemap_lastmod: entry.last_modified,
                    last_scraped_at: Some(Utc::now()),
                    embedding_version: Some(self.embedder.model_id().to_string()),
                    metadata: page.metadata.clone(),
                },
                new_chunks,
            )
            .await?;

        info!(url = %page.url, chunks = chunk_count, "ingested page");

        Ok(IngestionResult {
            url: page.url.clone(),
            success: true,
            document_id: Some(document_id),
            chunks_created,
            was_updated: existing.is_some(),
            error: None,
        })
    }

    /// Runs a full incremental pass over the supplied sitemap entries.
    ///
    /// Change detection happens against one snapshot at the start; the store
    /// read failing there is terminal. Everything after is per-URL: fetch and
    /// ingestion failures mark that URL failed and the run continues.
    #[instrument(skip(self, fetcher, entries, options), fields(entries = entries.len()))]
    pub async fn run(
        &self,
        fetcher: &dyn PageFetcher,
        mut entries: Vec<SitemapEntry>,
        options: &IngestOptions,
    ) -> Result<IngestionStats, CorpusError> {
        if let Some(filter) = &options.url_filter {
            entries.retain(|entry| entry.url.contains(filter.as_str()));
            info!(filter = %filter, remaining = entries.len(), "applied url filter");
        }

        let report = if options.full_reindex {
            info!("full reindex requested; treating every entry as changed");
            ChangeReport::full_reindex(entries)
        } else {
            ChangeDetector::new(self.store.as_ref())
                .detect_changes(&entries)
                .await?
        };

        if options.dry_run {
            return Ok(dry_run_stats(&report, options));
        }

        let mut to_process: Vec<SitemapEntry> = report
            .new_entries
            .iter()
            .chain(report.changed_entries.iter())
            .cloned()
            .collect();
        if let Some(max) = options.max_pages {
            to_process.truncate(max);
        }

        let mut stats = IngestionStats {
            total_urls: to_process.len(),
            unchanged_documents: report.unchanged_entries.len(),
            ..IngestionStats::default()
        };

        for (index, entry) in to_process.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.settings.request_delay).await;
            }

            let result = match self.fetch_page(fetcher, entry).await {
                Ok(page) => self.ingest_page(entry, &page, options.full_reindex).await,
                Err(err) => {
                    warn!(url = %entry.url, error = %err, "fetch failed");
                    if let Err(mark_err) = self
                        .store
                        .mark_status(&entry.url, ScrapeStatus::Failed)
                        .await
                    {
                        warn!(url = %entry.url, error = %mark_err, "could not mark document failed");
                    }
                    IngestionResult::failure(&entry.url, &err)
                }
            };

            if result.success {
                stats.successful += 1;
                stats.total_chunks += result.chunks_created;
                if result.chunks_created > 0 {
                    if result.was_updated {
                        stats.updated_documents += 1;
                    } else {
                        stats.new_documents += 1;
                    }
                } else {
                    stats.unchanged_documents += 1;
                }
            } else {
                stats.failed += 1;
            }
            stats.results.push(result);
        }

        if !report.deleted_urls.is_empty() {
            stats.deleted_documents = self
                .handle_deletions(&report.deleted_urls, options.hard_delete)
                .await;
        }

        info!("{}", stats.summary());
        Ok(stats)
    }

    async fn fetch_page(
        &self,
        fetcher: &dyn PageFetcher,
        entry: &SitemapEntry,
    ) -> Result<RawPage, CorpusError> {
        let url = Url::parse(&entry.url)
            .map_err(|err| CorpusError::InvalidDocument(format!("bad url {}: {err}", entry.url)))?;
        timeout(self.settings.request_timeout, fetcher.fetch(&url))
            .await
            .map_err(|_| CorpusError::Timeout(self.settings.request_timeout))?
    }

    /// Soft delete by default; hard delete removes rows and cascades chunks.
    /// Deletion failures are logged per URL and never abort the run.
    async fn handle_deletions(&self, urls: &[String], hard_delete: bool) -> usize {
        if hard_delete {
            let mut removed = 0;
            for url in urls {
                match self.store.delete_document(url).await {
                    Ok(true) => removed += 1,
                    Ok(false) => {}
                    Err(err) => warn!(url = %url, error = %err, "hard delete failed"),
                }
            }
            removed
        } else {
            match self.store.soft_delete_urls(urls).await {
                Ok(count) => count,
                Err(err) => {
                    warn!(error = %err, "soft delete failed");
                    0
                }
            }
        }
    }
}

fn dry_run_stats(report: &ChangeReport, options: &IngestOptions) -> IngestionStats {
    let mut to_process = report.total_to_process();
    if let Some(max) = options.max_pages {
        to_process = to_process.min(max);
    }
    IngestionStats {
        total_urls: to_process,
        new_documents: report.new_entries.len(),
        updated_documents: report.changed_entries.len(),
        unchanged_documents: report.unchanged_entries.len(),
        deleted_documents: report.deleted_urls.len(),
        ..IngestionStats::default()
    }
}
