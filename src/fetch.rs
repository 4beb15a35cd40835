//! Stage-two detail fetching
//!
//! A [`DetailFetcher`] turns one registration identifier into the raw HTML
//! of its public detail page. Two interchangeable paths exist behind the
//! trait, selected by configuration:
//!
//! - [`DirectFetcher`] posts the lookup form cold, one shot per identifier.
//! - [`SessionFetcher`] mirrors real browser navigation: it warms the
//!   session with a GET of the register page first, carries the cookie jar
//!   forward, and rotates user agents periodically. Use it when the
//!   registry's defense layer starts rejecting the direct path.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use reqwest::header::{HeaderMap, HeaderValue};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{Config, FetchPath};

/// Errors from the detail fetch surface
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,

    #[error("blocked by the registry defense layer")]
    Blocked,

    #[error("no detail document for this identifier")]
    NotFound,

    #[error("HTTP error: {0}")]
    Http(String),
}

impl FetchError {
    /// Whether a retry of the same identifier can reasonably succeed
    pub fn is_transient(&self) -> bool {
        !matches!(self, FetchError::NotFound)
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Http(err.to_string())
        }
    }
}

/// Fetch the detail document for one registration identifier
#[async_trait]
pub trait DetailFetcher: Send {
    async fn fetch(&mut self, reg_id: &str) -> Result<String, FetchError>;

    /// Short label for logs and status output
    fn name(&self) -> &'static str;
}

/// Build the configured fetch path.
pub fn create_fetcher(config: &Config) -> Result<Box<dyn DetailFetcher>, FetchError> {
    match config.fetch.path {
        FetchPath::Direct => Ok(Box::new(DirectFetcher::new(config)?)),
        FetchPath::Session => Ok(Box::new(SessionFetcher::new(config)?)),
    }
}

// Markers that identify a WAF block or captcha interstitial
const BLOCKED_MARKERS: &[&str] = &[
    "request rejected",
    "captcha",
    "too many requests",
    "access denied",
];

/// Blocking pages carry telltale markers or come back suspiciously short.
pub(crate) fn looks_blocked(body: &str, min_body_len: usize) -> bool {
    if body.len() < min_body_len {
        return true;
    }
    let lower = body.to_lowercase();
    BLOCKED_MARKERS.iter().any(|m| lower.contains(m))
}

fn lookup_form(reg_id: &str) -> Vec<(&'static str, String)> {
    vec![
        ("health-profession", String::new()),
        ("state", String::new()),
        ("suburb", String::new()),
        ("postcode", String::new()),
        ("name-reg", String::new()),
        ("practitioner-row-id", reg_id.to_string()),
    ]
}

fn browser_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        "Accept",
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
        ),
    );
    headers.insert(
        "Accept-Language",
        HeaderValue::from_static("en-AU,en;q=0.9,en-US;q=0.8"),
    );
    headers.insert("Sec-Fetch-Dest", HeaderValue::from_static("document"));
    headers.insert("Sec-Fetch-Mode", HeaderValue::from_static("navigate"));
    headers.insert("Sec-Fetch-Site", HeaderValue::from_static("none"));
    headers.insert("Sec-Fetch-User", HeaderValue::from_static("?1"));
    headers.insert(
        "Upgrade-Insecure-Requests",
        HeaderValue::from_static("1"),
    );
    headers
}

fn check_response_status(status: reqwest::StatusCode) -> Result<(), FetchError> {
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(FetchError::NotFound);
    }
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::FORBIDDEN
    {
        return Err(FetchError::Blocked);
    }
    if !status.is_success() {
        return Err(FetchError::Http(format!("status {}", status)));
    }
    Ok(())
}

/// One-shot POST per identifier, no session state
pub struct DirectFetcher {
    client: reqwest::Client,
    search_url: String,
    min_body_len: usize,
}

impl DirectFetcher {
    pub fn new(config: &Config) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.registry.timeout())
            .connect_timeout(Duration::from_secs(10))
            .default_headers(browser_headers())
            .user_agent(
                config
                    .registry
                    .user_agents
                    .first()
                    .cloned()
                    .unwrap_or_default(),
            )
            .build()
            .map_err(|e| FetchError::Http(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            search_url: config.registry.search_url(),
            min_body_len: config.fetch.min_body_len,
        })
    }
}

#[async_trait]
impl DetailFetcher for DirectFetcher {
    async fn fetch(&mut self, reg_id: &str) -> Result<String, FetchError> {
        let response = self
            .client
            .post(&self.search_url)
            .form(&lookup_form(reg_id))
            .send()
            .await?;

        check_response_status(response.status())?;

        let body = response.text().await?;
        if looks_blocked(&body, self.min_body_len) {
            warn!("Blocked response for {}", reg_id);
            return Err(FetchError::Blocked);
        }
        debug!("Fetched {} ({} bytes)", reg_id, body.len());
        Ok(body)
    }

    fn name(&self) -> &'static str {
        "direct"
    }
}

/// Warmed session path with cookie jar and periodic UA rotation
pub struct SessionFetcher {
    client: reqwest::Client,
    search_url: String,
    origin: String,
    user_agents: Vec<String>,
    current_ua: String,
    ua_rotate_every: u64,
    min_body_len: usize,
    request_count: u64,
    warmed: bool,
}

impl SessionFetcher {
    pub fn new(config: &Config) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .gzip(true)
            .brotli(true)
            .timeout(config.registry.timeout())
            .connect_timeout(Duration::from_secs(10))
            .default_headers(browser_headers())
            .build()
            .map_err(|e| FetchError::Http(format!("failed to build HTTP client: {}", e)))?;

        let current_ua = config
            .registry
            .user_agents
            .first()
            .cloned()
            .unwrap_or_default();

        Ok(Self {
            client,
            search_url: config.registry.search_url(),
            origin: config.registry.base_url.trim_end_matches('/').to_string(),
            user_agents: config.registry.user_agents.clone(),
            current_ua,
            ua_rotate_every: config.fetch.ua_rotate_every,
            min_body_len: config.fetch.min_body_len,
            request_count: 0,
            warmed: false,
        })
    }

    /// Establish cookies by loading the register page once, like a browser
    /// arriving at the search form before submitting it.
    async fn warm_up(&mut self) -> Result<(), FetchError> {
        let response = self
            .client
            .get(&self.search_url)
            .header("User-Agent", &self.current_ua)
            .send()
            .await?;
        check_response_status(response.status())?;
        self.warmed = true;
        debug!("Fetch session warmed");
        Ok(())
    }

    fn maybe_rotate_ua(&mut self) {
        if self.ua_rotate_every > 0
            && self.request_count % self.ua_rotate_every == 0
            && self.user_agents.len() > 1
        {
            if let Some(ua) = self.user_agents.choose(&mut rand::thread_rng()) {
                self.current_ua = ua.clone();
                debug!("Rotated user agent");
            }
        }
    }
}

#[async_trait]
impl DetailFetcher for SessionFetcher {
    async fn fetch(&mut self, reg_id: &str) -> Result<String, FetchError> {
        if !self.warmed {
            self.warm_up().await?;
        }

        self.request_count += 1;
        self.maybe_rotate_ua();

        let response = self
            .client
            .post(&self.search_url)
            .header("User-Agent", &self.current_ua)
            .header("Origin", &self.origin)
            .header("Referer", &self.search_url)
            .header("Sec-Fetch-Site", "same-origin")
            .form(&lookup_form(reg_id))
            .send()
            .await?;

        check_response_status(response.status())?;

        let body = response.text().await?;
        if looks_blocked(&body, self.min_body_len) {
            warn!("Blocked response for {}; dropping warmed session", reg_id);
            // Force a fresh warm-up before the next attempt
            self.warmed = false;
            return Err(FetchError::Blocked);
        }
        debug!("Fetched {} ({} bytes)", reg_id, body.len());
        Ok(body)
    }

    fn name(&self) -> &'static str {
        "session"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_markers() {
        let padding = "x".repeat(600);
        assert!(looks_blocked(&format!("{}Request Rejected", padding), 500));
        assert!(looks_blocked(&format!("{}CAPTCHA challenge", padding), 500));
        assert!(looks_blocked("short body", 500));
        assert!(!looks_blocked(&format!("<html>{}</html>", padding), 500));
    }

    #[test]
    fn test_error_transience() {
        assert!(FetchError::Timeout.is_transient());
        assert!(FetchError::Blocked.is_transient());
        assert!(FetchError::Http("status 500".to_string()).is_transient());
        assert!(!FetchError::NotFound.is_transient());
    }

    #[test]
    fn test_factory_selects_configured_path() {
        let mut config = Config::default();
        config.fetch.path = FetchPath::Direct;
        assert_eq!(create_fetcher(&config).unwrap().name(), "direct");
        config.fetch.path = FetchPath::Session;
        assert_eq!(create_fetcher(&config).unwrap().name(), "session");
    }
}
