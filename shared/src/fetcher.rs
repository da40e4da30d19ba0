//! Fetching and parsing of upstream market pages.
//!
//! The actual Steam Market scraping behavior — page layout, anti-automation
//! countermeasures, request shaping — is explicitly out of scope: this
//! module defines the seam (`Fetcher`, `ListingParser`) a real
//! implementation would plug into, plus a working `reqwest`-based fetcher
//! that delegates body interpretation to a pluggable parser. Because each
//! lease carries a different proxy and `reqwest` has no per-request proxy
//! override, a dedicated client is built per fetch; the configured timeout
//! is the one piece reused across calls.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::model::Listing;

/// The classified outcome of a single fetch attempt against a leased proxy.
#[derive(Debug)]
pub enum FetchOutcome {
    Ok(Vec<Listing>),
    RateLimited,
    Upstream5xx,
    Transport(String),
    Parse(String),
}

/// Fetches the raw body of a market page through a given proxy endpoint.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, proxy_endpoint: &str) -> FetchOutcome;
}

/// Interprets a raw response body as a list of listings. Scraping the real
/// Steam Market markup is out of scope; this seam exists so that a body
/// format can be swapped in without touching `HttpFetcher`.
pub trait ListingParser: Send + Sync {
    fn parse(&self, body: &str) -> Result<Vec<Listing>, String>;
}

/// A parser for an already-structured JSON array of listings — the shape a
/// market data API realistically returns, and the one used by tests and any
/// deployment that fronts the actual scraping with its own service.
pub struct JsonListingParser;

impl ListingParser for JsonListingParser {
    fn parse(&self, body: &str) -> Result<Vec<Listing>, String> {
        serde_json::from_str(body).map_err(|e| format!("invalid listing JSON: {e}"))
    }
}

/// An HTTP fetcher that routes each request through the leased proxy and
/// classifies the response by status code before handing the body to a
/// [`ListingParser`].
pub struct HttpFetcher {
    timeout: Duration,
    parser: Box<dyn ListingParser>,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, parser: Box<dyn ListingParser>) -> Self {
        Self { timeout, parser }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, proxy_endpoint: &str) -> FetchOutcome {
        let proxy = match reqwest::Proxy::all(proxy_endpoint) {
            Ok(proxy) => proxy,
            Err(e) => return FetchOutcome::Transport(format!("invalid proxy endpoint: {e}")),
        };

        // reqwest has no per-request proxy override, so each fetch builds a
        // dedicated client carrying this lease's proxy; only the configured
        // timeout is reused across calls.
        let client = match reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.timeout)
            .build()
        {
            Ok(c) => c,
            Err(e) => return FetchOutcome::Transport(format!("failed to build proxied client: {e}")),
        };

        let response = match client.get(url).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return FetchOutcome::Transport(format!("timeout: {e}")),
            Err(e) => return FetchOutcome::Transport(e.to_string()),
        };

        let status = response.status();
        if status.as_u16() == 429 {
            return FetchOutcome::RateLimited;
        }
        if status.is_server_error() {
            return FetchOutcome::Upstream5xx;
        }
        if !status.is_success() {
            return FetchOutcome::Transport(format!("unexpected status {status}"));
        }

        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => return FetchOutcome::Transport(format!("failed to read response body: {e}")),
        };

        debug!(url, proxy_endpoint, body_len = body.len(), "fetched market page");

        match self.parser.parse(&body) {
            Ok(listings) => FetchOutcome::Ok(listings),
            Err(e) => FetchOutcome::Parse(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_parser_rejects_malformed_body() {
        let parser = JsonListingParser;
        assert!(parser.parse("not json").is_err());
    }

    #[test]
    fn json_parser_accepts_listing_array() {
        let parser = JsonListingParser;
        let body = r#"[{"item_name": "AK-47 | Redline", "price_cents": 1500}]"#;
        let listings = parser.parse(body).unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].item_name, "AK-47 | Redline");
    }
}
