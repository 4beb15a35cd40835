//! Stage-one search backend
//!
//! The registry exposes no listing endpoint; the only way in is the public
//! search form. [`SearchBackend`] abstracts one prefix query against that
//! form so the discovery engine can be driven by a mock in tests.
//! [`HttpSearchBackend`] is the production implementation: it warms the
//! session with a GET of the register page, POSTs the search form, and
//! parses the result rows out of the returned HTML.

use async_trait::async_trait;
use scraper::{Html, Selector};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::fetch::looks_blocked;
use crate::prefix::Partition;

/// Result of one partition query against the registry
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    /// Identifiers harvested from the result rows, in page order
    pub identifiers: Vec<String>,
    /// Rows visible in the result view
    pub total_results: usize,
    /// True when the view was capped and more results exist behind it
    pub truncated: bool,
}

/// Errors from the search surface
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search request timed out")]
    Timeout,

    /// The result view no longer holds a usable search form; the session
    /// must be reopened before the next query
    #[error("search view is stale")]
    Stale,

    #[error("rate limited or blocked by the registry")]
    RateLimited,

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("search form error: {0}")]
    Form(String),
}

impl SearchError {
    /// Whether a retry of the same query can reasonably succeed
    pub fn is_transient(&self) -> bool {
        !matches!(self, SearchError::Form(_))
    }
}

impl From<reqwest::Error> for SearchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SearchError::Timeout
        } else {
            SearchError::Http(err.to_string())
        }
    }
}

/// One prefix-search interaction with the registry.
///
/// `open_session` must be called before every `search`: submitting a query
/// replaces the form view with a result view, so each query starts from a
/// fresh page.
#[async_trait]
pub trait SearchBackend: Send {
    async fn open_session(&mut self) -> Result<(), SearchError>;

    async fn search(&mut self, partition: &Partition) -> Result<SearchOutcome, SearchError>;
}

/// Production backend speaking HTTP to the registry search form
pub struct HttpSearchBackend {
    client: reqwest::Client,
    search_url: String,
    origin: String,
    result_cap: usize,
    min_body_len: usize,
    session_open: bool,
}

impl HttpSearchBackend {
    pub fn new(config: &Config) -> Result<Self, SearchError> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .gzip(true)
            .brotli(true)
            .timeout(config.registry.timeout())
            .connect_timeout(Duration::from_secs(10))
            .user_agent(
                config
                    .registry
                    .user_agents
                    .first()
                    .cloned()
                    .unwrap_or_default(),
            )
            .build()
            .map_err(|e| SearchError::Form(format!("failed to build HTTP client: {}", e)))?;

        let search_url = config.registry.search_url();
        let origin = config.registry.base_url.trim_end_matches('/').to_string();

        Ok(Self {
            client,
            search_url,
            origin,
            result_cap: config.search.result_cap,
            min_body_len: config.fetch.min_body_len,
            session_open: false,
        })
    }

    fn form_fields(partition: &Partition) -> Vec<(&'static str, String)> {
        vec![
            ("name-reg", partition.prefix.clone()),
            (
                "health-profession",
                partition.profession.clone().unwrap_or_default(),
            ),
            ("state", partition.region.clone().unwrap_or_default()),
            ("suburb", String::new()),
            ("postcode", String::new()),
            ("practitioner-row-id", String::new()),
        ]
    }
}

#[async_trait]
impl SearchBackend for HttpSearchBackend {
    /// Load the register page to establish cookies and a believable
    /// referer for the following POST.
    async fn open_session(&mut self) -> Result<(), SearchError> {
        let response = self.client.get(&self.search_url).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(SearchError::RateLimited);
        }
        if !status.is_success() {
            return Err(SearchError::Http(format!(
                "session open returned {}",
                status
            )));
        }
        self.session_open = true;
        debug!("Search session opened");
        Ok(())
    }

    async fn search(&mut self, partition: &Partition) -> Result<SearchOutcome, SearchError> {
        if !self.session_open {
            return Err(SearchError::Stale);
        }
        // A query consumes the form view
        self.session_open = false;

        let response = self
            .client
            .post(&self.search_url)
            .header("Origin", &self.origin)
            .header("Referer", &self.search_url)
            .form(&Self::form_fields(partition))
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::FORBIDDEN
        {
            warn!("Registry returned {} for partition {}", status, partition);
            return Err(SearchError::RateLimited);
        }
        if !status.is_success() {
            return Err(SearchError::Http(format!("search returned {}", status)));
        }

        let body = response.text().await?;
        if looks_blocked(&body, self.min_body_len) {
            warn!("Blocked response page for partition {}", partition);
            return Err(SearchError::RateLimited);
        }

        parse_result_page(&body, self.result_cap)
    }
}

/// Parse identifiers out of a result page.
///
/// Kept synchronous and outside the async paths so the parsed document
/// never lives across an await point.
pub fn parse_result_page(body: &str, result_cap: usize) -> Result<SearchOutcome, SearchError> {
    let row_sel = Selector::parse(".search-results-table-row[data-practitioner-row-id]")
        .map_err(|e| SearchError::Form(e.to_string()))?;
    let no_results_sel =
        Selector::parse(".no-results-message").map_err(|e| SearchError::Form(e.to_string()))?;
    let load_more_sel =
        Selector::parse(".load-more-btn").map_err(|e| SearchError::Form(e.to_string()))?;
    let form_sel =
        Selector::parse("#name-reg").map_err(|e| SearchError::Form(e.to_string()))?;

    let document = Html::parse_document(body);

    let mut identifiers = Vec::new();
    for row in document.select(&row_sel) {
        if let Some(id) = row.value().attr("data-practitioner-row-id") {
            let id = id.trim();
            if !id.is_empty() {
                identifiers.push(id.to_string());
            }
        }
    }

    if identifiers.is_empty() {
        if document.select(&no_results_sel).next().is_some() {
            return Ok(SearchOutcome::default());
        }
        if document.select(&form_sel).next().is_some() {
            // A fresh form page instead of a result view
            return Err(SearchError::Stale);
        }
        return Err(SearchError::Form(
            "result page had neither rows nor a no-results marker".to_string(),
        ));
    }

    let has_load_more = document.select(&load_more_sel).next().is_some();
    let total_results = identifiers.len();
    let truncated = total_results >= result_cap || has_load_more;

    Ok(SearchOutcome {
        identifiers,
        total_results,
        truncated,
    })
}
