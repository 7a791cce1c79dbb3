//! Similarity-hit ranking and the retrieval front door.
//!
//! Raw nearest-neighbor hits tend to be dominated by one strong document.
//! [`rank`] turns them into a deduplicated, source-diverse context set while
//! preserving descending score order, and produces a citation per kept item.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::embedding::EmbeddingProvider;
use crate::store::{SearchHit, VectorStore};
use crate::types::{CorpusError, Language};

/// One context item handed to answer generation.
#[derive(Clone, Debug, PartialEq)]
pub struct ContextItem {
    pub content: String,
    pub url: String,
    pub title: String,
    pub language: Language,
    pub score: f32,
}

/// A user-facing source citation.
#[derive(Clone, Debug, PartialEq)]
pub struct Citation {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

#[derive(Clone, Debug)]
pub struct RankerOptions {
    /// Items a single source URL may contribute.
    pub max_per_source: usize,
    /// Upper bound on selected items.
    pub max_total: usize,
    /// The per-source cap is relaxed while fewer than this many items have
    /// been selected overall, so sparse corpora still yield usable context.
    pub min_items_before_cap: usize,
    /// Character budget for citation snippets.
    pub snippet_max_chars: usize,
}

impl Default for RankerOptions {
    fn default() -> Self {
        Self {
            max_per_source: 1,
            max_total: 5,
            min_items_before_cap: 3,
            snippet_max_chars: 200,
        }
    }
}

/// Selects a source-diverse subset of `hits`, which must already be in the
/// search's descending-score order.
///
/// A first pass enforces the per-source cap. Only if that yields fewer than
/// `min_items_before_cap` items is the cap relaxed and the shortfall filled
/// from the skipped hits, best first; the merged selection is re-ordered by
/// score so the output always descends.
pub fn rank(hits: &[SearchHit], options: &RankerOptions) -> (Vec<ContextItem>, Vec<Citation>) {
    let mut selected: Vec<ContextItem> = Vec::new();
    let mut skipped: Vec<ContextItem> = Vec::new();
    let mut per_source: HashMap<String, usize> = HashMap::new();

    for (chunk, score) in hits {
        if selected.len() >= options.max_total {
            break;
        }
        let item = context_item(chunk, *score);
        let contributed = per_source.entry(item.url.clone()).or_insert(0);
        if *contributed >= options.max_per_source {
            skipped.push(item);
            continue;
        }
        *contributed += 1;
        selected.push(item);
    }

    let floor = options.min_items_before_cap.min(options.max_total);
    if selected.len() < floor {
        for item in skipped {
            if selected.len() >= floor {
                break;
            }
            selected.push(item);
        }
        selected.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }

    let citations = selected
        .iter()
        .map(|item| Citation {
            title: item.title.clone(),
            url: item.url.clone(),
            snippet: truncate_snippet(&item.content, options.snippet_max_chars),
        })
        .collect();

    (selected, citations)
}

fn context_item(chunk: &crate::store::ChunkRecord, score: f32) -> ContextItem {
    let metadata = &chunk.metadata;
    ContextItem {
        content: chunk.content.clone(),
        url: metadata
            .get("url")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        title: metadata
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown")
            .to_string(),
        language: metadata
            .get("language")
            .and_then(|v| v.as_str())
            .map(Language::parse_lenient)
            .unwrap_or_default(),
        score,
    }
}

/// Truncates to the character budget, appending an ellipsis when cut.
fn truncate_snippet(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content.to_string();
    }
    let mut snippet: String = content.chars().take(max_chars).collect();
    snippet.push('…');
    snippet
}

/// Everything the answer path needs from one retrieval.
#[derive(Clone, Debug, Default)]
pub struct RetrievedContext {
    pub items: Vec<ContextItem>,
    pub citations: Vec<Citation>,
    pub average_score: Option<f32>,
}

impl RetrievedContext {
    /// Formats the items into the numbered block the generation prompt
    /// expects.
    pub fn format_context(&self) -> String {
        self.items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                format!(
                    "[Source {}] {}\nURL: {}\nContent: {}\n",
                    i + 1,
                    item.title,
                    item.url,
                    item.content
                )
            })
            .collect::<Vec<_>>()
            .join("\n---\n")
    }
}

/// Query-time front door: embed the query, search the store, rank the hits.
pub struct Retriever {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    top_k: usize,
    options: RankerOptions,
}

impl Retriever {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        top_k: usize,
    ) -> Self {
        Self {
            store,
            embedder,
            top_k,
            options: RankerOptions::default(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: RankerOptions) -> Self {
        self.options = options;
        self
    }

    #[instrument(skip(self, query), err)]
    pub async fn retrieve(
        &self,
        query: &str,
        language: Option<Language>,
    ) -> Result<RetrievedContext, CorpusError> {
        let query_vector = self.embedder.embed_query(query).await?;
        let hits = self
            .store
            .similarity_search(&query_vector, self.top_k, language)
            .await?;
        let (items, citations) = rank(&hits, &self.options);

        let average_score = if items.is_empty() {
            None
        } else {
            Some(items.iter().map(|i| i.score).sum::<f32>() / items.len() as f32)
        };
        debug!(
            retrieved = items.len(),
            average_score = average_score.unwrap_or_default(),
            "retrieval finished"
        );

        Ok(RetrievedContext {
            items,
            citations,
            average_score,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChunkRecord;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn hit(url: &str, content: &str, score: f32) -> SearchHit {
        (
            ChunkRecord {
                id: Uuid::new_v4(),
                document_id: Uuid::new_v4(),
                content: content.to_string(),
                chunk_index: 0,
                metadata: json!({"url": url, "title": format!("Title {url}"), "language": "en"}),
                created_at: Utc::now(),
            },
            score,
        )
    }

    #[test]
    fn caps_single_source_dominance_while_preserving_order() {
        // Top six hits all share one URL; four weaker hits come from
        // distinct sources.
        let mut hits = Vec::new();
        for i in 0..6 {
            hits.push(hit("https://example.org/dominant", &format!("d{i}"), 0.9 - i as f32 * 0.01));
        }
        for (i, source) in ["a", "b", "c", "d"].iter().enumerate() {
            hits.push(hit(
                &format!("https://example.org/{source}"),
                source,
                0.5 - i as f32 * 0.01,
            ));
        }

        let options = RankerOptions {
            max_per_source: 1,
            max_total: 5,
            ..RankerOptions::default()
        };
        let (items, citations) = rank(&hits, &options);

        assert!(items.len() <= 5);
        let dominant_in_first_three = items
            .iter()
            .take(3)
            .filter(|i| i.url == "https://example.org/dominant")
            .count();
        assert!(dominant_in_first_three <= 1);

        for pair in items.windows(2) {
            assert!(pair[0].score >= pair[1].score, "scores must descend");
        }
        assert_eq!(citations.len(), items.len());
    }

    #[test]
    fn cap_relaxes_when_too_few_distinct_sources_exist() {
        let hits = vec![
            hit("https://example.org/only", "first", 0.9),
            hit("https://example.org/only", "second", 0.8),
            hit("https://example.org/only", "third", 0.7),
            hit("https://example.org/only", "fourth", 0.6),
        ];
        let (items, _) = rank(&hits, &RankerOptions::default());

        // One source only: the cap alone would leave a single item, so the
        // selection fills back up to three, still in score order.
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].content, "first");
        assert_eq!(items[1].content, "second");
        assert_eq!(items[2].content, "third");
    }

    #[test]
    fn stops_at_max_total() {
        let hits: Vec<SearchHit> = (0..10)
            .map(|i| hit(&format!("https://example.org/{i}"), "c", 0.9 - i as f32 * 0.05))
            .collect();
        let options = RankerOptions {
            max_total: 4,
            ..RankerOptions::default()
        };
        let (items, _) = rank(&hits, &options);
        assert_eq!(items.len(), 4);
    }

    #[test]
    fn snippets_truncate_with_ellipsis() {
        let long = "x".repeat(300);
        let hits = vec![hit("https://example.org/a", &long, 0.9)];
        let options = RankerOptions {
            snippet_max_chars: 200,
            ..RankerOptions::default()
        };
        let (_, citations) = rank(&hits, &options);
        assert_eq!(citations[0].snippet.chars().count(), 201);
        assert!(citations[0].snippet.ends_with('…'));

        let short_hits = vec![hit("https://example.org/b", "short text", 0.9)];
        let (_, short_citations) = rank(&short_hits, &options);
        assert_eq!(short_citations[0].snippet, "short text");
    }

    #[test]
    fn empty_hits_rank_to_nothing() {
        let (items, citations) = rank(&[], &RankerOptions::default());
        assert!(items.is_empty());
        assert!(citations.is_empty());
    }

    #[test]
    fn format_context_numbers_sources() {
        let context = RetrievedContext {
            items: vec![
                ContextItem {
                    content: "Deadline is April 30.".to_string(),
                    url: "https://example.org/a".to_string(),
                    title: "Deadlines".to_string(),
                    language: Language::En,
                    score: 0.9,
                },
                ContextItem {
                    content: "Benefits are monthly.".to_string(),
                    url: "https://example.org/b".to_string(),
                    title: "Benefits".to_string(),
                    language: Language::En,
                    score: 0.8,
                },
            ],
            citations: vec![],
            average_score: Some(0.85),
        };
        let formatted = context.format_context();
        assert!(formatted.contains("[Source 1] Deadlines"));
        assert!(formatted.contains("[Source 2] Benefits"));
        assert!(formatted.contains("\n---\n"));
    }
}
