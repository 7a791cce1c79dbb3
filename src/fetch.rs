//! Page fetching boundary.
//!
//! Fetching and extracting live HTML is an external collaborator to the
//! ingestion core: the orchestrator consumes [`RawPage`] values through the
//! [`PageFetcher`] trait and never touches HTML itself. [`HttpPageFetcher`]
//! is a thin reqwest + scraper implementation of that boundary.

use async_trait::async_trait;
use reqwest::Client;
use scraper::{Html, Selector};
use url::Url;

use crate::config::Settings;
use crate::types::{CorpusError, Language};

/// A fetched, extracted page ready for ingestion.
#[derive(Clone, Debug)]
pub struct RawPage {
    pub url: String,
    pub title: String,
    pub content: String,
    pub language: Language,
    pub metadata: serde_json::Value,
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<RawPage, CorpusError>;
}

/// Fetches pages over HTTP and extracts their main text content.
#[derive(Clone, Debug)]
pub struct HttpPageFetcher {
    client: Client,
}

/// Containers tried in order when looking for the main content region.
const CONTENT_SELECTORS: [&str; 3] = ["main", "article", "body"];

impl HttpPageFetcher {
    pub fn new(settings: &Settings) -> Result<Self, CorpusError> {
        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(settings.request_timeout)
            .use_rustls_tls()
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(&self, url: &Url) -> Result<RawPage, CorpusError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await?
            .error_for_status()?;
        // Redirects may land on a different canonical URL; record the final one.
        let final_url = response.url().to_string();
        let body = response.text().await?;
        Ok(extract_page(&final_url, &body))
    }
}

/// Extracts title and main text from an HTML document.
///
/// Extraction is deliberately thin: the heavy lifting of retrieval quality
/// happens downstream of normalized text, not here.
pub fn extract_page(url: &str, html: &str) -> RawPage {
    let document = Html::parse_document(html);

    let title = select_text(&document, "h1")
        .or_else(|| select_text(&document, "title"))
        .unwrap_or_else(|| "Untitled".to_string());

    let mut content = String::new();
    for selector in CONTENT_SELECTORS {
        if let Some(text) = select_block_text(&document, selector) {
            content = text;
            break;
        }
    }

    let language = Language::from_url(url);

    RawPage {
        url: url.to_string(),
        title,
        language,
        metadata: serde_json::json!({
            "content_length": content.chars().count(),
            "word_count": content.split_whitespace().count(),
        }),
        content,
    }
}

fn select_text(document: &Html, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    let element = document.select(&selector).next()?;
    let text = normalize_whitespace(element.text());
    if text.is_empty() { None } else { Some(text) }
}

fn select_block_text(document: &Html, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    let element = document.select(&selector).next()?;

    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    for piece in element.text() {
        let trimmed = piece.trim();
        if trimmed.is_empty() {
            if !current.is_empty() {
                paragraphs.push(std::mem::take(&mut current));
            }
            continue;
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(trimmed);
    }
    if !current.is_empty() {
        paragraphs.push(current);
    }

    if paragraphs.is_empty() {
        None
    } else {
        Some(paragraphs.join("\n\n"))
    }
}

fn normalize_whitespace<'a>(pieces: impl Iterator<Item = &'a str>) -> String {
    pieces
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Income tax - Example.org</title></head>
<body>
  <nav>Skip to content</nav>
  <main>
    <h1>Personal income tax</h1>
    <p>File your return by April 30.</p>
    <p>Payment arrangements are available.</p>
  </main>
</body>
</html>"#;

    #[test]
    fn extracts_title_from_h1_before_title_tag() {
        let page = extract_page("https://example.org/en/services/taxes.html", PAGE);
        assert_eq!(page.title, "Personal income tax");
        assert_eq!(page.language, Language::En);
    }

    #[test]
    fn extracts_main_content_as_paragraph_separated_text() {
        let page = extract_page("https://example.org/en/services/taxes.html", PAGE);
        assert!(page.content.contains("File your return by April 30."));
        assert!(page.content.contains("Payment arrangements are available."));
        // main is preferred over body, so the nav text is excluded
        assert!(!page.content.contains("Skip to content"));
    }

    #[test]
    fn falls_back_to_title_tag_and_untitled() {
        let page = extract_page(
            "https://example.org/fr/page",
            "<html><head><title>Impôts</title></head><body><p>texte</p></body></html>",
        );
        assert_eq!(page.title, "Impôts");
        assert_eq!(page.language, Language::Fr);

        let bare = extract_page("https://example.org/x", "<html><body><p>hi</p></body></html>");
        assert_eq!(bare.title, "Untitled");
    }
}
