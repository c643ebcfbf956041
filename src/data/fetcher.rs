//! HTTP client for the activation code page
//!
//! Downloads the page with a browser identity drawn at random from a small
//! pool. No parsing happens here; the body is handed back as text together
//! with the identity used and the number of bytes received.

use std::time::Duration;

use rand::seq::SliceRandom;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Default request timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// Errors that can occur when downloading the page
#[derive(Debug, Error)]
pub enum FetchError {
    /// HTTP request failed (connection, timeout, body read)
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-2xx status
    #[error("Unexpected HTTP status: {0}")]
    Status(u16),

    /// A configured User-Agent is not a valid header value
    #[error("Invalid User-Agent for identity '{0}'")]
    InvalidHeader(String),
}

/// A browser identity: a short label plus the User-Agent it sends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Human-readable name, e.g. "Chrome (Linux)"
    pub label: String,
    /// The `User-Agent` header value
    pub user_agent: String,
}

impl Identity {
    pub fn new(label: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            user_agent: user_agent.into(),
        }
    }
}

/// Realistic desktop browser identities
pub fn default_identities() -> Vec<Identity> {
    vec![
        Identity::new(
            "Chrome (Linux)",
            "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        ),
        Identity::new(
            "Chrome (Windows)",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        ),
        Identity::new(
            "Firefox (Linux)",
            "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
        ),
        Identity::new(
            "Firefox (Windows)",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
        ),
        Identity::new(
            "Edge (Windows)",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0",
        ),
    ]
}

/// A successfully downloaded page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Response body decoded as text (invalid UTF-8 is replaced)
    pub body: String,
    /// Label of the identity that made the request
    pub identity_label: String,
    /// Size of the response body in bytes
    pub bytes: usize,
}

/// Client for downloading the activation code page
#[derive(Debug, Clone)]
pub struct Fetcher {
    /// HTTP client for making requests
    http_client: Client,
    /// Page URL
    url: String,
    /// Identity pool, never empty
    identities: Vec<Identity>,
}

impl Fetcher {
    /// Creates a fetcher for `url`
    ///
    /// # Arguments
    /// * `url` - Page to download
    /// * `identities` - Identity pool; an empty pool falls back to the defaults
    /// * `timeout` - Upper bound for the whole request
    ///
    /// # Returns
    /// * `Err(FetchError::Http)` if the HTTP client cannot be built
    pub fn new(
        url: impl Into<String>,
        identities: Vec<Identity>,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

        let http_client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;

        let identities = if identities.is_empty() {
            default_identities()
        } else {
            identities
        };

        Ok(Self {
            http_client,
            url: url.into(),
            identities,
        })
    }

    /// The page URL this fetcher downloads
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Picks an identity uniformly at random from the pool
    pub fn choose_identity(&self) -> &Identity {
        let mut rng = rand::thread_rng();
        self.identities
            .choose(&mut rng)
            // The pool is never empty, see `new`
            .unwrap_or(&self.identities[0])
    }

    /// Downloads the page once
    ///
    /// # Returns
    /// * `Ok(FetchOutcome)` - body, identity label and byte count
    /// * `Err(FetchError)` - on connection failure, timeout or non-2xx status
    pub async fn fetch(&self) -> Result<FetchOutcome, FetchError> {
        let identity = self.choose_identity();
        let user_agent = HeaderValue::from_str(&identity.user_agent)
            .map_err(|_| FetchError::InvalidHeader(identity.label.clone()))?;

        debug!(url = %self.url, identity = %identity.label, "fetching activation page");

        let response = self
            .http_client
            .get(&self.url)
            .header(USER_AGENT, user_agent)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let raw = response.bytes().await?;
        let outcome = FetchOutcome {
            body: String::from_utf8_lossy(&raw).into_owned(),
            identity_label: identity.label.clone(),
            bytes: raw.len(),
        };

        info!(identity = %outcome.identity_label, bytes = outcome.bytes, "fetched activation page");
        Ok(outcome)
    }
}
