// =============================================================================
// REST Client - rate-limited JSON requests against a venue's HTTP API
// =============================================================================
//
// Every request is priced through the venue's weight table and paced by the
// shared rate limiter before it leaves the process. Venue responses are
// returned as raw JSON; adapters own the parsing.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, instrument};

use crate::errors::{Result, StreamError};
use crate::rate_limit::{RateLimiter, WeightTable};

/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct RestClient {
    base_url: String,
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
    weights: Arc<WeightTable>,
    /// Response header carrying the venue's own used-weight figure.
    used_weight_header: Option<&'static str>,
}

impl RestClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    pub fn new(
        base_url: impl Into<String>,
        limiter: Arc<RateLimiter>,
        weights: WeightTable,
    ) -> Result<Self> {
        let base_url = base_url.into();
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StreamError::connection(&base_url, e))?;

        debug!(base_url = %base_url, "RestClient initialised");

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            limiter,
            weights: Arc::new(weights),
            used_weight_header: None,
        })
    }

    /// Resync the limiter from response header `name` after every request.
    pub fn with_used_weight_header(mut self, name: Option<&'static str>) -> Self {
        self.used_weight_header = name;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Full URL of `endpoint`.
    pub fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }

    /// Weight the limiter will charge for this request.
    pub fn cost(&self, endpoint: &str, body: &Value) -> u32 {
        self.weights.cost(endpoint, body)
    }

    // -------------------------------------------------------------------------
    // Requests
    // -------------------------------------------------------------------------

    /// POST `body` as JSON to `endpoint` once the limiter admits it.
    #[instrument(skip(self, body), name = "rest::post")]
    pub async fn post(&self, endpoint: &str, body: &Value) -> Result<Value> {
        let cost = self.cost(endpoint, body);
        self.limiter.throttle(cost).await;

        let url = self.url(endpoint);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| StreamError::connection(&url, e))?;

        let status = resp.status();
        if let Some(header) = self.used_weight_header {
            self.limiter.sync_from_headers(resp.headers(), header);
        }
        let text = resp
            .text()
            .await
            .map_err(|e| StreamError::connection(&url, e))?;

        if !status.is_success() {
            return Err(StreamError::Http {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body: text,
            });
        }

        let value: Value = serde_json::from_str(&text)
            .map_err(|e| StreamError::protocol(format!("{endpoint}: {e}")))?;

        debug!(endpoint, cost, "request completed");
        Ok(value)
    }
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url)
            .field("used_weight_header", &self.used_weight_header)
            .field("limiter", &self.limiter.snapshot())
            .finish()
    }
}
