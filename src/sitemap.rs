//! Sitemap-driven URL discovery.
//!
//! Fetches XML sitemaps, flattens nested sitemap indexes into a flat list of
//! [`SitemapEntry`] records, and filters the result by URL pattern. Discovery
//! is rate-limited and sequential against the single source site. A malformed
//! or unreachable sitemap yields zero entries for that subtree only; sibling
//! sitemaps are unaffected.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use quick_xml::Reader;
use quick_xml::events::Event;
use regex::{Regex, RegexBuilder};
use reqwest::Client;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Settings;
use crate::types::{CorpusError, Language};

/// A single `<url>` record from a sitemap. Produced fresh on every discovery
/// run and never persisted directly.
#[derive(Clone, Debug, PartialEq)]
pub struct SitemapEntry {
    pub url: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub change_frequency: Option<String>,
    pub priority: Option<f64>,
}

impl SitemapEntry {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            last_modified: None,
            change_frequency: None,
            priority: None,
        }
    }

    #[must_use]
    pub fn with_last_modified(mut self, lastmod: DateTime<Utc>) -> Self {
        self.last_modified = Some(lastmod);
        self
    }

    /// Language of the page, inferred from the URL path.
    pub fn language(&self) -> Language {
        Language::from_url(&self.url)
    }
}

/// A parsed sitemap document: either an index of child sitemaps or a flat
/// set of URL entries.
#[derive(Clone, Debug, PartialEq)]
pub enum SitemapXml {
    Index(Vec<String>),
    UrlSet(Vec<SitemapEntry>),
}

/// Parses one sitemap XML document.
///
/// Returns an error for malformed XML or an unrecognized document root; the
/// caller decides the blast radius (here: zero entries for that subtree).
pub fn parse_sitemap_xml(xml: &str) -> Result<SitemapXml, CorpusError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Root {
        Index,
        UrlSet,
    }
    #[derive(Clone, Copy, PartialEq)]
    enum Field {
        Loc,
        LastMod,
        ChangeFreq,
        Priority,
    }

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut root: Option<Root> = None;
    let mut child_locs: Vec<String> = Vec::new();
    let mut entries: Vec<SitemapEntry> = Vec::new();
    let mut current: Option<SitemapEntry> = None;
    let mut current_loc: Option<String> = None;
    let mut field: Option<Field> = None;
    // quick-xml reports Eof instead of erroring on truncated input, so open
    // elements are tracked by hand.
    let mut depth = 0usize;

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                depth += 1;
                let name = start.local_name();
                match name.as_ref() {
                    b"sitemapindex" if root.is_none() => root = Some(Root::Index),
                    b"urlset" if root.is_none() => root = Some(Root::UrlSet),
                    b"sitemap" if root == Some(Root::Index) => current_loc = None,
                    b"url" if root == Some(Root::UrlSet) => {
                        current = Some(SitemapEntry::new(String::new()));
                    }
                    b"loc" => field = Some(Field::Loc),
                    b"lastmod" => field = Some(Field::LastMod),
                    b"changefreq" => field = Some(Field::ChangeFreq),
                    b"priority" => field = Some(Field::Priority),
                    _ => {}
                }
            }
            Ok(Event::Text(text)) => {
                let value = text
                    .unescape()
                    .map_err(|err| CorpusError::Sitemap(err.to_string()))?
                    .trim()
                    .to_string();
                match (field, current.as_mut()) {
                    (Some(Field::Loc), Some(entry)) => entry.url = value,
                    (Some(Field::LastMod), Some(entry)) => {
                        entry.last_modified = parse_lastmod(&value);
                    }
                    (Some(Field::ChangeFreq), Some(entry)) => {
                        entry.change_frequency = Some(value);
                    }
                    (Some(Field::Priority), Some(entry)) => {
                        entry.priority = value.parse().ok();
                    }
                    (Some(Field::Loc), None) => current_loc = Some(value),
                    _ => {}
                }
            }
            Ok(Event::End(end)) => {
                depth = depth.saturating_sub(1);
                let name = end.local_name();
                match name.as_ref() {
                    b"url" => {
                        if let Some(entry) = current.take() {
                            if !entry.url.is_empty() {
                                entries.push(entry);
                            }
                        }
                    }
                    b"sitemap" => {
                        if let Some(loc) = current_loc.take() {
                            if !loc.is_empty() {
                                child_locs.push(loc);
                            }
                        }
                    }
                    b"loc" | b"lastmod" | b"changefreq" | b"priority" => field = None,
                    _ => {}
                }
            }
            Ok(Event::Eof) => {
                if depth != 0 {
                    return Err(CorpusError::Sitemap(
                        "unexpected end of document inside an open element".to_string(),
                    ));
                }
                break;
            }
            Ok(_) => {}
            Err(err) => return Err(CorpusError::Sitemap(err.to_string())),
        }
    }

    match root {
        Some(Root::Index) => Ok(SitemapXml::Index(child_locs)),
        Some(Root::UrlSet) => Ok(SitemapXml::UrlSet(entries)),
        None => Err(CorpusError::Sitemap(
            "document root is neither <sitemapindex> nor <urlset>".to_string(),
        )),
    }
}

/// Parses a sitemap `<lastmod>` value.
///
/// Tolerates full ISO-8601 with timezone (including fractional seconds),
/// ISO-8601 without timezone, and a bare date. Anything else is dropped.
pub fn parse_lastmod(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(with_offset) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(with_offset.with_timezone(&Utc));
    }
    // Offsets without a colon, e.g. 2026-01-27T11:05:03-0500.
    if let Ok(with_offset) = DateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(with_offset.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
    }
    None
}

/// Fetches and flattens sitemaps from the source site.
#[derive(Clone, Debug)]
pub struct SitemapClient {
    client: Client,
    request_delay: Duration,
}

impl SitemapClient {
    pub fn new(settings: &Settings) -> Result<Self, CorpusError> {
        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(settings.request_timeout)
            .use_rustls_tls()
            .build()?;
        Ok(Self {
            client,
            request_delay: settings.request_delay,
        })
    }

    /// Wraps an existing client, e.g. one shared with the page fetcher.
    pub fn with_client(client: Client, request_delay: Duration) -> Self {
        Self {
            client,
            request_delay,
        }
    }

    /// Fetches the sitemap at `root` and flattens nested indexes into a flat
    /// entry list.
    ///
    /// Child sitemaps are fetched sequentially with a fixed inter-request
    /// delay. Failures are contained: an unreachable or malformed subtree
    /// contributes zero entries and is logged. No de-duplication of entries
    /// is performed across sibling sitemaps.
    pub async fn fetch_all(&self, root: &Url) -> Vec<SitemapEntry> {
        let mut entries = Vec::new();
        let mut queue: VecDeque<Url> = VecDeque::from([root.clone()]);
        // Index cycles would otherwise loop forever.
        let mut visited: HashSet<String> = HashSet::new();
        let mut first = true;

        while let Some(url) = queue.pop_front() {
            if !visited.insert(url.to_string()) {
                continue;
            }
            if !first {
                tokio::time::sleep(self.request_delay).await;
            }
            first = false;

            let xml = match self.fetch_xml(&url).await {
                Ok(xml) => xml,
                Err(err) => {
                    warn!(url = %url, error = %err, "failed to fetch sitemap; skipping subtree");
                    continue;
                }
            };

            match parse_sitemap_xml(&xml) {
                Ok(SitemapXml::UrlSet(batch)) => {
                    debug!(url = %url, entries = batch.len(), "parsed url sitemap");
                    entries.extend(batch);
                }
                Ok(SitemapXml::Index(children)) => {
                    info!(url = %url, children = children.len(), "flattening sitemap index");
                    for child in children {
                        match Url::parse(&child) {
                            Ok(child_url) => queue.push_back(child_url),
                            Err(err) => {
                                warn!(loc = %child, error = %err, "ignoring unparsable sitemap loc");
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(url = %url, error = %err, "malformed sitemap; skipping subtree");
                }
            }
        }

        entries
    }

    async fn fetch_xml(&self, url: &Url) -> Result<String, CorpusError> {
        let response = self
            .client
            .get(url.clone())
            .header("Accept", "application/xml, text/xml")
            .send()
            .await?
            .error_for_status()?;
        Ok(response.text().await?)
    }
}

/// Regex-based include/exclude filtering of discovered entries.
///
/// Exclusions are checked first; when include patterns are present an entry
/// must match at least one of them. Matching is case-insensitive.
#[derive(Clone, Debug)]
pub struct UrlFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

/// Path patterns that never carry ingestible page text.
const DEFAULT_EXCLUDES: [&str; 8] = [
    r"\.pdf$",
    r"/forms/",
    r"/formulaires/",
    r"/search",
    r"/rechercher",
    r"my-account",
    r"mon-dossier",
    r"#",
];

impl Default for UrlFilter {
    fn default() -> Self {
        Self::new(&[], &DEFAULT_EXCLUDES).expect("default url patterns are valid")
    }
}

impl UrlFilter {
    pub fn new(include: &[&str], exclude: &[&str]) -> Result<Self, CorpusError> {
        Ok(Self {
            include: compile_patterns(include)?,
            exclude: compile_patterns(exclude)?,
        })
    }

    pub fn filter(&self, entries: Vec<SitemapEntry>) -> Vec<SitemapEntry> {
        entries
            .into_iter()
            .filter(|entry| {
                if self.exclude.iter().any(|p| p.is_match(&entry.url)) {
                    return false;
                }
                if !self.include.is_empty() {
                    return self.include.iter().any(|p| p.is_match(&entry.url));
                }
                true
            })
            .collect()
    }
}

fn compile_patterns(patterns: &[&str]) -> Result<Vec<Regex>, CorpusError> {
    patterns
        .iter()
        .map(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|err| CorpusError::InvalidDocument(format!("bad url pattern: {err}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const URLSET: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url>
    <loc>https://example.org/en/services/taxes.html</loc>
    <lastmod>2026-01-27T11:05:03.823-05:00</lastmod>
    <changefreq>weekly</changefreq>
    <priority>0.8</priority>
  </url>
  <url>
    <loc>https://example.org/fr/services/impots.html</loc>
  </url>
</urlset>"#;

    const INDEX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <sitemap><loc>https://example.org/en.sitemap.xml</loc></sitemap>
  <sitemap><loc>https://example.org/fr.sitemap.xml</loc></sitemap>
</sitemapindex>"#;

    #[test]
    fn parses_urlset_entries_with_all_fields() {
        let SitemapXml::UrlSet(entries) = parse_sitemap_xml(URLSET).unwrap() else {
            panic!("expected a urlset");
        };
        assert_eq!(entries.len(), 2);

        let first = &entries[0];
        assert_eq!(first.url, "https://example.org/en/services/taxes.html");
        assert_eq!(
            first.last_modified,
            Some(Utc.with_ymd_and_hms(2026, 1, 27, 16, 5, 3).unwrap() + chrono::Duration::milliseconds(823))
        );
        assert_eq!(first.change_frequency.as_deref(), Some("weekly"));
        assert_eq!(first.priority, Some(0.8));
        assert_eq!(first.language(), Language::En);

        let second = &entries[1];
        assert!(second.last_modified.is_none());
        assert_eq!(second.language(), Language::Fr);
    }

    #[test]
    fn parses_sitemap_index_child_locations() {
        let SitemapXml::Index(children) = parse_sitemap_xml(INDEX).unwrap() else {
            panic!("expected an index");
        };
        assert_eq!(
            children,
            vec![
                "https://example.org/en.sitemap.xml".to_string(),
                "https://example.org/fr.sitemap.xml".to_string(),
            ]
        );
    }

    #[test]
    fn malformed_xml_is_an_error() {
        assert!(parse_sitemap_xml("<urlset><url><loc>broken").is_err());
        assert!(parse_sitemap_xml("not xml at all").is_err());
        assert!(parse_sitemap_xml("<rss><item/></rss>").is_err());
    }

    #[test]
    fn lastmod_tolerates_the_documented_formats() {
        let full = parse_lastmod("2026-01-27T11:05:03.823-05:00").unwrap();
        assert_eq!(full.timezone(), Utc);

        let zulu = parse_lastmod("2025-06-30T08:00:00Z").unwrap();
        assert_eq!(zulu, Utc.with_ymd_and_hms(2025, 6, 30, 8, 0, 0).unwrap());

        let no_offset = parse_lastmod("2025-06-30T08:00:00").unwrap();
        assert_eq!(no_offset, Utc.with_ymd_and_hms(2025, 6, 30, 8, 0, 0).unwrap());

        let bare_date = parse_lastmod("2025-06-30").unwrap();
        assert_eq!(bare_date, Utc.with_ymd_and_hms(2025, 6, 30, 0, 0, 0).unwrap());

        assert!(parse_lastmod("").is_none());
        assert!(parse_lastmod("last tuesday").is_none());
    }

    #[test]
    fn default_filter_drops_forms_and_pdfs() {
        let entries = vec![
            SitemapEntry::new("https://example.org/en/services/taxes.html"),
            SitemapEntry::new("https://example.org/en/forms/t1-general.html"),
            SitemapEntry::new("https://example.org/en/guide.PDF"),
            SitemapEntry::new("https://example.org/fr/rechercher?q=tps"),
        ];
        let kept = UrlFilter::default().filter(entries);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].url, "https://example.org/en/services/taxes.html");
    }

    #[test]
    fn include_patterns_restrict_when_present() {
        let filter = UrlFilter::new(&[r"/services/taxes"], &DEFAULT_EXCLUDES).unwrap();
        let entries = vec![
            SitemapEntry::new("https://example.org/en/services/taxes.html"),
            SitemapEntry::new("https://example.org/en/services/passports.html"),
        ];
        let kept = filter.filter(entries);
        assert_eq!(kept.len(), 1);
        assert!(kept[0].url.contains("/services/taxes"));
    }
}
