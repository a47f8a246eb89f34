//! Blocking HTTP fetcher over reqwest

use super::{FetchResponse, Fetcher, STATUS_OK};
use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

/// Connection timeout: time to establish TCP connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Overall request timeout, body included. Blobs can be several hundred
/// megabytes.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(4 * 60 * 60);

pub struct HttpFetcher {
    client: Client,
    base: String,
}

impl HttpFetcher {
    /// Fetcher for `<origin>/releases/<branch>/`.
    pub fn new(origin: &str, branch: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("cdnpatch/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base: format!("{}/releases/{}/", origin.trim_end_matches('/'), branch),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path.trim_start_matches('/')).replace(' ', "%20")
    }

    fn send(&self, path: &str, range: Option<(u64, u64)>) -> Result<FetchResponse> {
        let url = self.url(path);
        let mut request = self.client.get(&url);
        if let Some((start, end)) = range {
            request = request.header(reqwest::header::RANGE, format!("bytes={}-{}", start, end));
        }

        let response = request
            .send()
            .with_context(|| format!("Connection failed: {}", truncate_url(&url)))?;

        let status = match response.status() {
            StatusCode::PARTIAL_CONTENT if range.is_some() => STATUS_OK,
            other => other.as_u16(),
        };
        debug!("GET {} -> {}", truncate_url(&url), status);

        Ok(FetchResponse {
            status,
            body: Box::new(response),
        })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, path: &str) -> Result<FetchResponse> {
        self.send(path, None)
    }

    fn fetch_range(&self, path: &str, start: u64, end_inclusive: u64) -> Result<FetchResponse> {
        self.send(path, Some((start, end_inclusive)))
    }
}

/// Truncate URL for display
fn truncate_url(url: &str) -> String {
    if url.len() > 80 {
        let cut = (0..=77).rev().find(|&i| url.is_char_boundary(i)).unwrap_or(0);
        format!("{}...", &url[..cut])
    } else {
        url.to_string()
    }
}
