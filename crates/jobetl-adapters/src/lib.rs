//! Job search source contracts, the USAJobs client, and fixture-first sources.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use jobetl_storage::{FetchError, HttpClientConfig, HttpFetcher};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info};

pub mod mapper;

pub use mapper::{map_listing, parse_api_date, MapOptions, MappingError};

pub const CRATE_NAME: &str = "jobetl-adapters";

pub const USAJOBS_SEARCH_URL: &str = "https://data.usajobs.gov/api/search";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub keyword: String,
    pub location: String,
}

/// One decoded page of search results; `items` are raw, unmapped objects.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JobPage {
    pub page: u32,
    pub items: Vec<JsonValue>,
    /// Total matches across all pages, when the API reports it.
    pub total_available: Option<u64>,
}

impl JobPage {
    pub fn empty(page: u32) -> Self {
        Self {
            page,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Paginated job search. Implementations fetch exactly the page asked for;
/// the caller owns the iteration bounds.
#[async_trait]
pub trait JobSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_page(&self, query: &SearchQuery, page: u32) -> Result<JobPage, FetchError>;
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(rename = "SearchResult")]
    search_result: Option<SearchResultBody>,
}

#[derive(Debug, Deserialize)]
struct SearchResultBody {
    #[serde(rename = "SearchResultItems")]
    items: Option<Vec<JsonValue>>,
    #[serde(rename = "SearchResultCountAll")]
    count_all: Option<u64>,
}

pub fn decode_search_page(page: u32, body: &[u8]) -> Result<JobPage, FetchError> {
    let response: SearchResponse = serde_json::from_slice(body)?;
    Ok(page_from_response(page, response))
}

fn page_from_document(page: u32, document: JsonValue) -> Result<JobPage, serde_json::Error> {
    let response: SearchResponse = serde_json::from_value(document)?;
    Ok(page_from_response(page, response))
}

fn page_from_response(page: u32, response: SearchResponse) -> JobPage {
    match response.search_result {
        Some(body) => JobPage {
            page,
            items: body.items.unwrap_or_default(),
            total_available: body.count_all,
        },
        None => JobPage::empty(page),
    }
}

#[derive(Debug, Clone)]
pub struct UsaJobsClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub results_per_page: u32,
    pub http: HttpClientConfig,
}

#[derive(Debug)]
pub struct UsaJobsClient {
    http: HttpFetcher,
    base_url: String,
    headers: HeaderMap,
    results_per_page: u32,
}

impl UsaJobsClient {
    pub fn new(config: UsaJobsClientConfig) -> Result<Self> {
        let mut api_key =
            HeaderValue::from_str(&config.api_key).context("api key is not a valid header value")?;
        api_key.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(HeaderName::from_static("authorization-key"), api_key);

        Ok(Self {
            http: HttpFetcher::new(config.http)?,
            base_url: config.base_url,
            headers,
            results_per_page: config.results_per_page.max(1),
        })
    }

    pub fn search_params(&self, query: &SearchQuery, page: u32) -> Vec<(&'static str, String)> {
        vec![
            ("Keyword", query.keyword.clone()),
            ("LocationName", query.location.clone()),
            ("ResultsPerPage", self.results_per_page.to_string()),
            ("Page", page.to_string()),
        ]
    }
}

#[async_trait]
impl JobSource for UsaJobsClient {
    fn source_id(&self) -> &'static str {
        "usajobs"
    }

    async fn fetch_page(&self, query: &SearchQuery, page: u32) -> Result<JobPage, FetchError> {
        info!(page, keyword = %query.keyword, location = %query.location, "fetching search page");
        let params = self.search_params(query, page);
        let response = self
            .http
            .fetch_bytes(&self.base_url, &params, &self.headers)
            .await?;
        let decoded = decode_search_page(page, &response.body)?;
        debug!(
            page,
            items = decoded.items.len(),
            total_available = ?decoded.total_available,
            "decoded search page"
        );
        Ok(decoded)
    }
}

/// Serves recorded search responses, one per page (1-based). Pages past the
/// end come back empty.
#[derive(Debug, Default)]
pub struct FixtureJobSource {
    pages: Vec<JobPage>,
    failure: Option<(u32, u16)>,
    requests: AtomicU32,
}

impl FixtureJobSource {
    pub fn from_items(pages: Vec<Vec<JsonValue>>) -> Self {
        let pages = pages
            .into_iter()
            .enumerate()
            .map(|(i, items)| JobPage {
                page: i as u32 + 1,
                items,
                total_available: None,
            })
            .collect();
        Self {
            pages,
            ..Self::default()
        }
    }

    pub fn from_documents(documents: Vec<JsonValue>) -> Result<Self> {
        let pages = documents
            .into_iter()
            .enumerate()
            .map(|(i, doc)| {
                page_from_document(i as u32 + 1, doc)
                    .with_context(|| format!("decoding fixture page {}", i + 1))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            pages,
            ..Self::default()
        })
    }

    /// A single search response document, or an array of them.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let value: JsonValue =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        let documents = match value {
            JsonValue::Array(docs) => docs,
            doc => vec![doc],
        };
        Self::from_documents(documents).with_context(|| format!("loading {}", path.display()))
    }

    /// Makes `page` fail with an HTTP status error.
    pub fn failing_at(mut self, page: u32, status: u16) -> Self {
        self.failure = Some((page, status));
        self
    }

    pub fn requests(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobSource for FixtureJobSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_page(&self, _query: &SearchQuery, page: u32) -> Result<JobPage, FetchError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if let Some((failing_page, status)) = self.failure {
            if failing_page == page {
                return Err(FetchError::HttpStatus {
                    status,
                    url: format!("fixture://search?Page={page}"),
                });
            }
        }
        let index = page.checked_sub(1).map(|i| i as usize);
        Ok(index
            .and_then(|i| self.pages.get(i))
            .cloned()
            .unwrap_or_else(|| JobPage::empty(page)))
    }
}
