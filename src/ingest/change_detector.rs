//! Sitemap-vs-store change detection.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use crate::sitemap::SitemapEntry;
use crate::store::{DocumentRecord, VectorStore};
use crate::types::CorpusError;

/// Outcome of one detection run. Transient: computed per run, never
/// persisted.
#[derive(Clone, Debug, Default)]
pub struct ChangeReport {
    pub new_entries: Vec<SitemapEntry>,
    pub changed_entries: Vec<SitemapEntry>,
    pub unchanged_entries: Vec<SitemapEntry>,
    pub deleted_urls: Vec<String>,
}

impl ChangeReport {
    /// Entries that need fetching and re-ingestion.
    pub fn total_to_process(&self) -> usize {
        self.new_entries.len() + self.changed_entries.len()
    }

    pub fn summary(&self) -> String {
        format!(
            "Change Report:\n  New:       {}\n  Changed:   {}\n  Unchanged: {}\n  Deleted:   {}\n  To Process: {}",
            self.new_entries.len(),
            self.changed_entries.len(),
            self.unchanged_entries.len(),
            self.deleted_urls.len(),
            self.total_to_process(),
        )
    }

    /// Full-reindex bypass: every supplied entry is treated as changed and no
    /// deleted set is computed. This is a caller-level path, separate from
    /// classification.
    pub fn full_reindex(entries: Vec<SitemapEntry>) -> Self {
        Self {
            changed_entries: entries,
            ..Self::default()
        }
    }
}

/// Classifies sitemap entries against the persisted corpus.
pub struct ChangeDetector<'a> {
    store: &'a dyn VectorStore,
}

impl<'a> ChangeDetector<'a> {
    pub fn new(store: &'a dyn VectorStore) -> Self {
        Self { store }
    }

    /// Diffs `entries` against one consistent snapshot of all non-deleted
    /// documents, taken at the start of the call.
    ///
    /// Classification per entry, in priority order: unknown URL → new; both
    /// sides carry a lastmod and the entry's is strictly newer → changed;
    /// entry carries a lastmod the store has not recorded yet → changed
    /// (one-time backfill when lastmod tracking first appears); otherwise →
    /// unchanged. The deleted set is stored URLs absent from the sitemap.
    ///
    /// A store read failure is terminal for the run: there is nothing to
    /// classify without a baseline.
    pub async fn detect_changes(
        &self,
        entries: &[SitemapEntry],
    ) -> Result<ChangeReport, CorpusError> {
        let snapshot = self.store.active_documents().await?;
        let existing: HashMap<&str, &DocumentRecord> = snapshot
            .iter()
            .map(|doc| (doc.url.as_str(), doc))
            .collect();

        info!(
            sitemap_entries = entries.len(),
            stored_documents = existing.len(),
            "comparing sitemap against stored corpus"
        );

        let mut report = ChangeReport::default();

        for entry in entries {
            match existing.get(entry.url.as_str()) {
                None => {
                    debug!(url = %entry.url, "new");
                    report.new_entries.push(entry.clone());
                }
                Some(doc) => match (entry.last_modified, doc.sitemap_lastmod) {
                    (Some(entry_lastmod), Some(stored_lastmod)) => {
                        if entry_lastmod > stored_lastmod {
                            debug!(url = %entry.url, %entry_lastmod, %stored_lastmod, "changed");
                            report.changed_entries.push(entry.clone());
                        } else {
                            report.unchanged_entries.push(entry.clone());
                        }
                    }
                    (Some(_), None) => {
                        // First lastmod ever seen for this document.
                        debug!(url = %entry.url, "changed (no stored lastmod)");
                        report.changed_entries.push(entry.clone());
                    }
                    _ => report.unchanged_entries.push(entry.clone()),
                },
            }
        }

        let sitemap_urls: HashSet<&str> = entries.iter().map(|e| e.url.as_str()).collect();
        report.deleted_urls = existing
            .keys()
            .filter(|url| !sitemap_urls.contains(*url))
            .map(|url| url.to_string())
            .collect();
        report.deleted_urls.sort();

        info!("{}", report.summary());
        Ok(report)
    }
}
