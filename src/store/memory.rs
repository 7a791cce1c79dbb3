//! In-memory vector store.
//!
//! Keeps the whole corpus in process memory and scores similarity by brute
//! force. Deterministic and dependency-free, which makes it the backend for
//! tests and local development; the Postgres backend is the serving-time
//! implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::types::{CorpusError, Language, ScrapeStatus};

use super::{
    ChunkRecord, DocumentRecord, DocumentUpsert, NewChunk, SearchHit, VectorStore,
};

#[derive(Default)]
struct MemoryState {
    /// Documents keyed by URL, the natural key.
    documents: HashMap<String, DocumentRecord>,
    /// Chunk rows (with embeddings) keyed by owning document id.
    chunks: HashMap<Uuid, Vec<(ChunkRecord, Vec<f32>)>>,
}

#[derive(Clone, Default)]
pub struct MemoryVectorStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn build_chunk_rows(document_id: Uuid, chunks: Vec<NewChunk>) -> Vec<(ChunkRecord, Vec<f32>)> {
        let now = Utc::now();
        chunks
            .into_iter()
            .map(|chunk| {
                (
                    ChunkRecord {
                        id: Uuid::new_v4(),
                        document_id,
                        content: chunk.content,
                        chunk_index: chunk.chunk_index,
                        metadata: chunk.metadata,
                        created_at: now,
                    },
                    chunk.embedding,
                )
            })
            .collect()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn get_document_by_url(&self, url: &str) -> Result<Option<DocumentRecord>, CorpusError> {
        Ok(self.state.read().documents.get(url).cloned())
    }

    async fn active_documents(&self) -> Result<Vec<DocumentRecord>, CorpusError> {
        Ok(self
            .state
            .read()
            .documents
            .values()
            .filter(|doc| doc.scrape_status != ScrapeStatus::Deleted)
            .cloned()
            .collect())
    }

    async fn upsert_document(
        &self,
        document: DocumentUpsert,
        chunks: Vec<NewChunk>,
    ) -> Result<(Uuid, usize), CorpusError> {
        // The new state is assembled before the single write below, so the
        // whole upsert-and-replace is one atomic step.
        let mut state = self.state.write();
        let now = Utc::now();

        let id = state
            .documents
            .get(&document.url)
            .map(|existing| existing.id)
            .unwrap_or_else(Uuid::new_v4);
        let created_at = state
            .documents
            .get(&document.url)
            .map(|existing| existing.created_at)
            .unwrap_or(now);

        let chunk_rows = Self::build_chunk_rows(id, chunks);
        let chunk_count = chunk_rows.len();

        state.documents.insert(
            document.url.clone(),
            DocumentRecord {
                id,
                url: document.url,
                title: document.title,
                content: Some(document.content),
                content_hash: Some(document.content_hash),
                language: document.language,
                sitemap_lastmod: document.sitemap_lastmod,
                last_scraped_at: document.last_scraped_at,
                scrape_status: ScrapeStatus::Scraped,
                embedding_version: document.embedding_version,
                metadata: document.metadata,
                created_at,
                updated_at: now,
            },
        );
        state.chunks.insert(id, chunk_rows);

        Ok((id, chunk_count))
    }

    async fn replace_chunks(
        &self,
        document_id: Uuid,
        chunks: Vec<NewChunk>,
    ) -> Result<usize, CorpusError> {
        let mut state = self.state.write();
        if !state.documents.values().any(|doc| doc.id == document_id) {
            return Err(CorpusError::Storage(format!(
                "no document with id {document_id}"
            )));
        }
        let chunk_rows = Self::build_chunk_rows(document_id, chunks);
        let count = chunk_rows.len();
        state.chunks.insert(document_id, chunk_rows);
        Ok(count)
    }

    async fn update_bookkeeping(
        &self,
        url: &str,
        sitemap_lastmod: Option<DateTime<Utc>>,
        last_scraped_at: DateTime<Utc>,
        status: ScrapeStatus,
    ) -> Result<(), CorpusError> {
        let mut state = self.state.write();
        if let Some(doc) = state.documents.get_mut(url) {
            doc.sitemap_lastmod = sitemap_lastmod;
            doc.last_scraped_at = Some(last_scraped_at);
            doc.scrape_status = status;
            doc.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_status(&self, url: &str, status: ScrapeStatus) -> Result<(), CorpusError> {
        let mut state = self.state.write();
        if let Some(doc) = state.documents.get_mut(url) {
            doc.scrape_status = status;
            doc.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn soft_delete_urls(&self, urls: &[String]) -> Result<usize, CorpusError> {
        let mut state = self.state.write();
        let mut updated = 0;
        for url in urls {
            if let Some(doc) = state.documents.get_mut(url) {
                doc.scrape_status = ScrapeStatus::Deleted;
                doc.updated_at = Utc::now();
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn delete_document(&self, url: &str) -> Result<bool, CorpusError> {
        let mut state = self.state.write();
        match state.documents.remove(url) {
            Some(doc) => {
                state.chunks.remove(&doc.id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn chunks_for_document(
        &self,
        document_id: Uuid,
    ) -> Result<Vec<ChunkRecord>, CorpusError> {
        let state = self.state.read();
        let mut chunks: Vec<ChunkRecord> = state
            .chunks
            .get(&document_id)
            .map(|rows| rows.iter().map(|(chunk, _)| chunk.clone()).collect())
            .unwrap_or_default();
        chunks.sort_by_key(|chunk| chunk.chunk_index);
        Ok(chunks)
    }

    async fn similarity_search(
        &self,
        query: &[f32],
        k: usize,
        language: Option<Language>,
    ) -> Result<Vec<SearchHit>, CorpusError> {
        let state = self.state.read();

        let language_of: HashMap<Uuid, Language> = state
            .documents
            .values()
            .map(|doc| (doc.id, doc.language))
            .collect();

        let mut hits: Vec<SearchHit> = state
            .chunks
            .values()
            .flatten()
            .filter(|(chunk, _)| match language {
                Some(wanted) => language_of.get(&chunk.document_id) == Some(&wanted),
                None => true,
            })
            .map(|(chunk, embedding)| (chunk.clone(), cosine_similarity(query, embedding)))
            .collect();

        hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    async fn count_documents(&self) -> Result<u64, CorpusError> {
        Ok(self.state.read().documents.len() as u64)
    }

    async fn count_chunks(&self) -> Result<u64, CorpusError> {
        Ok(self
            .state
            .read()
            .chunks
            .values()
            .map(|rows| rows.len() as u64)
            .sum())
    }
}

/// `1 − cosine_distance`; zero-magnitude vectors score 0.
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
