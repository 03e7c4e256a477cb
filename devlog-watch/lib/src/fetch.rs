//! Project page fetching and devlog extraction.
//!
//! The scheduler only sees the [`EntryFetcher`] capability: given a project
//! id, produce its entries newest first, or fail. [`DevlogPageFetcher`] is the
//! production implementation, which downloads the project page with `reqwest`
//! and extracts entries with `scraper` using a swappable [`SelectorSet`].

use std::future::Future;
use std::time::Duration;

use reqwest::header::{ACCEPT, COOKIE, USER_AGENT};
use reqwest::{Client, Url};
use scraper::{Html, Selector};
use tracing::{Span, debug, instrument, warn};

use crate::config::WatchConfig;
use crate::error::{ConfigError, FetchError};
use crate::types::Entry;

/// User agent sent with every page request.
pub const FETCH_USER_AGENT: &str = concat!("devlog-watch/", env!("CARGO_PKG_VERSION"));

/// Capability that produces a project's current devlog entries.
///
/// Implementations must return entries newest first. The caller never
/// re-sorts, and only consults the first entry.
///
/// An empty vector means the page was reachable but had nothing parseable;
/// that is not an error.
pub trait EntryFetcher: Send + Sync {
    /// Fetches the entries of `project`, newest first.
    ///
    /// ## Errors
    ///
    /// Returns a [`FetchError`] on network failure, non-success status, or
    /// timeout.
    fn fetch(&self, project: &str) -> impl Future<Output = Result<Vec<Entry>, FetchError>> + Send;
}

/// CSS selectors used to locate devlog entries in a project page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorSet {
    /// One element per devlog entry.
    pub card: String,
    /// Link inside a card; its `href` is the entry slug.
    pub link: String,
    /// Title element inside a card.
    pub title: String,
    /// Time element inside a card; its `datetime` attribute is the timestamp.
    pub time: String,
}

impl Default for SelectorSet {
    fn default() -> Self {
        Self {
            card: ".devlog-card".to_string(),
            link: "a.devlog-link".to_string(),
            title: "h3".to_string(),
            time: "time".to_string(),
        }
    }
}

/// Compiled form of a [`SelectorSet`].
#[derive(Debug, Clone)]
pub struct DevlogExtractor {
    card: Selector,
    link: Selector,
    title: Selector,
    time: Selector,
}

impl DevlogExtractor {
    /// Compiles a selector set.
    ///
    /// ## Errors
    ///
    /// Returns [`ConfigError::InvalidSelector`] naming the first selector
    /// that fails to parse.
    pub fn new(selectors: &SelectorSet) -> Result<Self, ConfigError> {
        Ok(Self {
            card: parse_selector(&selectors.card)?,
            link: parse_selector(&selectors.link)?,
            title: parse_selector(&selectors.title)?,
            time: parse_selector(&selectors.time)?,
        })
    }

    /// Extracts entries from a project page, preserving document order.
    ///
    /// Cards without a link `href` are skipped, since the slug is the only
    /// change-detection key.
    ///
    /// ## Examples
    ///
    /// ```
    /// use devlog_watch_lib::{DevlogExtractor, SelectorSet};
    ///
    /// let extractor = DevlogExtractor::new(&SelectorSet::default()).unwrap();
    /// let html = r#"<div class="devlog-card">
    ///     <a class="devlog-link" href="/projects/42/devlogs/7">open</a>
    ///     <h3> Day 7 </h3>
    ///     <time datetime="2024-06-07T10:00:00Z">June 7</time>
    /// </div>"#;
    /// let entries = extractor.extract(html);
    /// assert_eq!(entries[0].slug, "/projects/42/devlogs/7");
    /// assert_eq!(entries[0].title, "Day 7");
    /// ```
    pub fn extract(&self, html: &str) -> Vec<Entry> {
        let document = Html::parse_document(html);

        document
            .select(&self.card)
            .filter_map(|card| {
                let slug = card
                    .select(&self.link)
                    .next()
                    .and_then(|link| link.value().attr("href"))
                    .map(str::trim)
                    .filter(|href| !href.is_empty())?;

                let title = card
                    .select(&self.title)
                    .next()
                    .map(|el| el.text().collect::<String>().trim().to_string())
                    .unwrap_or_default();

                let published_at = card
                    .select(&self.time)
                    .next()
                    .and_then(|el| el.value().attr("datetime"))
                    .map(|dt| dt.trim().to_string())
                    .filter(|dt| !dt.is_empty());

                Some(Entry::new(slug, title, published_at))
            })
            .collect()
    }
}

fn parse_selector(selector: &str) -> Result<Selector, ConfigError> {
    Selector::parse(selector).map_err(|_| ConfigError::InvalidSelector(selector.to_string()))
}

/// Fetches project pages over HTTP and extracts their devlog entries.
#[derive(Debug, Clone)]
pub struct DevlogPageFetcher {
    client: Client,
    base_url: String,
    cookie: String,
    timeout: Duration,
    extractor: DevlogExtractor,
}

impl DevlogPageFetcher {
    /// Creates a fetcher for pages under `base_url`.
    ///
    /// ## Errors
    ///
    /// Returns a [`ConfigError`] if a selector is invalid or the HTTP client
    /// cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        cookie: impl Into<String>,
        timeout: Duration,
        selectors: &SelectorSet,
    ) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(ConfigError::HttpClient)?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cookie: cookie.into(),
            timeout,
            extractor: DevlogExtractor::new(selectors)?,
        })
    }

    /// Creates a fetcher from the process configuration with default selectors.
    ///
    /// ## Errors
    ///
    /// Returns a [`ConfigError`] if the HTTP client cannot be built.
    pub fn from_config(config: &WatchConfig) -> Result<Self, ConfigError> {
        Self::new(
            config.project_base_url.clone(),
            config.cookie.clone(),
            config.fetch_timeout,
            &SelectorSet::default(),
        )
    }

    /// Builds the page URL for a project, encoding the id as one path segment.
    ///
    /// ## Errors
    ///
    /// Returns [`FetchError::InvalidUrl`] if the base URL cannot carry a path.
    pub fn page_url(&self, project: &str) -> Result<Url, FetchError> {
        let mut url =
            Url::parse(&self.base_url).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| FetchError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .push("projects")
            .push(project);
        Ok(url)
    }
}

impl EntryFetcher for DevlogPageFetcher {
    #[instrument(
        name = "fetch_devlogs",
        skip(self),
        fields(project = %project, http.status_code = tracing::field::Empty)
    )]
    async fn fetch(&self, project: &str) -> Result<Vec<Entry>, FetchError> {
        let url = self.page_url(project)?;

        let response = self
            .client
            .get(url)
            .header(COOKIE, &self.cookie)
            .header(USER_AGENT, FETCH_USER_AGENT)
            .header(
                ACCEPT,
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout(self.timeout)
                } else {
                    FetchError::Http(e)
                }
            })?;

        let status = response.status();
        Span::current().record("http.status_code", status.as_u16());

        if status.as_u16() == 429 {
            warn!("Project host rate limited the fetch");
            return Err(FetchError::RateLimited);
        }

        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
            });
        }

        let html = response.text().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(self.timeout)
            } else {
                FetchError::Http(e)
            }
        })?;

        let entries = self.extractor.extract(&html);
        debug!(entries = entries.len(), "Parsed devlog entries");

        Ok(entries)
    }
}
