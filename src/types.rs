//! Shared primitive types and the crate-wide error enum.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Corpus language. The corpus is bilingual; everything else is out of scope.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    En,
    Fr,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::En => "en",
            Language::Fr => "fr",
        }
    }

    /// Lenient parse; anything unrecognized falls back to English.
    pub fn parse_lenient(value: &str) -> Self {
        match value {
            "fr" => Language::Fr,
            _ => Language::En,
        }
    }

    /// Infers the language from a URL path. French pages live under `/fr/`
    /// segments or `.fr.` hosts; everything else defaults to English.
    pub fn from_url(url: &str) -> Self {
        if url.contains("/fr/") || url.contains(".fr.") {
            Language::Fr
        } else {
            Language::En
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a stored document.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrapeStatus {
    #[default]
    Pending,
    Scraped,
    Failed,
    Deleted,
}

impl ScrapeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrapeStatus::Pending => "pending",
            ScrapeStatus::Scraped => "scraped",
            ScrapeStatus::Failed => "failed",
            ScrapeStatus::Deleted => "deleted",
        }
    }

    /// Lenient parse; unknown values are treated as pending.
    pub fn parse_lenient(value: &str) -> Self {
        match value {
            "scraped" => ScrapeStatus::Scraped,
            "failed" => ScrapeStatus::Failed,
            "deleted" => ScrapeStatus::Deleted,
            _ => ScrapeStatus::Pending,
        }
    }
}

impl std::fmt::Display for ScrapeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Crate-wide error type for the ingestion and retrieval pipeline.
#[derive(Debug, thiserror::Error)]
pub enum CorpusError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("sitemap parse failed: {0}")]
    Sitemap(String),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for CorpusError {
    fn from(err: sqlx::Error) -> Self {
        CorpusError::Storage(err.to_string())
    }
}
