// =============================================================================
// Rate Limiter - cost-based pacing of outbound calls
// =============================================================================
//
// Token bucket: the budget refills continuously at `refill_per_sec` up to
// `capacity`. A call whose cost exceeds the current budget suspends until
// enough budget has accrued, then deducts the cost under the same lock.
//
// The same limiter paces REST calls and, where the venue charges for them,
// WebSocket subscribe handshakes. Costs come from a static per-endpoint
// weight table.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Usage fraction above which a warning is logged.
const USAGE_WARN_THRESHOLD: f64 = 0.8;

// ---------------------------------------------------------------------------
// Weight table
// ---------------------------------------------------------------------------

/// Weight of one endpoint, optionally refined by the request's `type`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointWeight {
    pub base: u32,
    #[serde(default)]
    pub by_type: HashMap<String, u32>,
}

/// Static per-endpoint weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightTable {
    /// Weight charged for endpoints missing from the table.
    pub default: u32,
    pub endpoints: HashMap<String, EndpointWeight>,
}

impl WeightTable {
    pub fn new(default: u32) -> Self {
        Self {
            default,
            endpoints: HashMap::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: &str, base: u32) -> Self {
        self.endpoints.entry(endpoint.to_string()).or_default().base = base;
        self
    }

    pub fn with_type(mut self, endpoint: &str, request_type: &str, weight: u32) -> Self {
        self.endpoints
            .entry(endpoint.to_string())
            .or_default()
            .by_type
            .insert(request_type.to_string(), weight);
        self
    }

    /// Cost of calling `endpoint` with `params`.
    pub fn cost(&self, endpoint: &str, params: &serde_json::Value) -> u32 {
        let Some(weight) = self.endpoints.get(endpoint) else {
            return self.default;
        };
        params
            .get("type")
            .and_then(|t| t.as_str())
            .and_then(|t| weight.by_type.get(t))
            .copied()
            .unwrap_or(weight.base)
    }
}

// ---------------------------------------------------------------------------
// Token bucket
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket limiter shared by every outbound path of one venue.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    bucket: Mutex<Bucket>,
}

/// Serialisable view of the limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub capacity: f64,
    pub available: f64,
    pub refill_per_sec: f64,
    pub usage_pct: f64,
}

impl RateLimiter {
    /// Create a limiter that starts with a full bucket.
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            bucket.last_refill = now;
        }
    }

    /// Deduct `cost` if affordable now; otherwise report how long to wait.
    ///
    /// A cost larger than the whole capacity is admitted once the bucket is
    /// full and drives the budget negative.
    fn try_take(&self, cost: f64) -> Result<(), Duration> {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        let needed = cost.min(self.capacity);
        if bucket.tokens >= needed {
            bucket.tokens -= cost;
            return Ok(());
        }
        if self.refill_per_sec <= 0.0 {
            return Err(Duration::from_secs(1));
        }
        Err(Duration::from_secs_f64((needed - bucket.tokens) / self.refill_per_sec))
    }

    /// Suspend until `cost` can be paid, then pay it.
    pub async fn throttle(&self, cost: u32) {
        let cost = cost as f64;
        loop {
            match self.try_take(cost) {
                Ok(()) => break,
                Err(wait) => {
                    debug!(cost, wait_ms = wait.as_millis() as u64, "rate limiter pacing call");
                    tokio::time::sleep(wait).await;
                }
            }
        }

        let usage = self.usage();
        if usage >= USAGE_WARN_THRESHOLD {
            warn!(
                usage_pct = usage * 100.0,
                capacity = self.capacity,
                "rate-limit budget above warning threshold"
            );
        }
    }

    /// Resynchronise from a venue-reported figure of weight already used in
    /// the current window.
    pub fn sync_used_weight(&self, used: u32) {
        let mut bucket = self.bucket.lock();
        bucket.tokens = (self.capacity - used as f64).max(0.0);
        bucket.last_refill = Instant::now();
        debug!(used, remaining = bucket.tokens, "rate limiter synced from venue");
    }

    /// Resynchronise from the used-weight response header `name`, if the
    /// response carries a readable one. Returns the figure applied.
    pub fn sync_from_headers(&self, headers: &reqwest::header::HeaderMap, name: &str) -> Option<u32> {
        let used = headers.get(name)?.to_str().ok()?.trim().parse::<u32>().ok()?;
        self.sync_used_weight(used);
        if used as f64 >= self.capacity * USAGE_WARN_THRESHOLD {
            warn!(used_weight = used, capacity = self.capacity, "venue reports weight above warning threshold");
        }
        Some(used)
    }

    /// Budget available right now.
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        bucket.tokens
    }

    /// Consumed fraction of capacity in `[0, 1]`.
    fn usage(&self) -> f64 {
        if self.capacity <= 0.0 {
            return 0.0;
        }
        ((self.capacity - self.available()) / self.capacity).clamp(0.0, 1.0)
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            capacity: self.capacity,
            available: self.available(),
            refill_per_sec: self.refill_per_sec,
            usage_pct: self.usage() * 100.0,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn weight_table_lookup() {
        let table = WeightTable::new(20)
            .with_endpoint("info", 20)
            .with_type("info", "l2Book", 2)
            .with_endpoint("exchange", 1);
        assert_eq!(table.cost("info", &json!({"type": "l2Book", "coin": "BTC"})), 2);
        assert_eq!(table.cost("info", &json!({"type": "userFills"})), 20);
        assert_eq!(table.cost("info", &json!({})), 20);
        assert_eq!(table.cost("exchange", &json!({"type": "order"})), 1);
        assert_eq!(table.cost("unknown", &json!({})), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn call_within_budget_does_not_wait() {
        let rl = RateLimiter::new(10.0, 1.0);
        let start = Instant::now();
        rl.throttle(4).await;
        rl.throttle(6).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(rl.available() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn over_budget_waits_for_deficit_over_rate() {
        let rl = RateLimiter::new(10.0, 5.0);
        rl.throttle(8).await; // 2 left
        let start = Instant::now();
        rl.throttle(7).await; // deficit 5 at 5/s -> 1s
        let waited = start.elapsed().as_secs_f64();
        assert!((waited - 1.0).abs() < 0.05, "waited {waited}s");
        assert!(rl.available() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn cost_above_capacity_waits_for_full_bucket() {
        let rl = RateLimiter::new(10.0, 10.0);
        rl.throttle(10).await;
        let start = Instant::now();
        rl.throttle(15).await;
        let waited = start.elapsed().as_secs_f64();
        assert!((waited - 1.0).abs() < 0.05, "waited {waited}s");
        assert!(rl.available() < 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn refill_is_capped_at_capacity() {
        let rl = RateLimiter::new(10.0, 100.0);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!((rl.available() - 10.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_used_weight_sets_remaining() {
        let rl = RateLimiter::new(1200.0, 20.0);
        rl.sync_used_weight(600);
        assert!((rl.available() - 600.0).abs() < 1e-9);
        rl.sync_used_weight(5000);
        assert_eq!(rl.available(), 0.0);
        let snap = rl.snapshot();
        assert!((snap.usage_pct - 100.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn used_weight_header_resyncs_budget() {
        use reqwest::header::{HeaderMap, HeaderValue};

        let rl = RateLimiter::new(1200.0, 20.0);
        let mut headers = HeaderMap::new();
        assert_eq!(rl.sync_from_headers(&headers, "x-used-weight"), None);
        assert!((rl.available() - 1200.0).abs() < 1e-9);

        headers.insert("x-used-weight", HeaderValue::from_static("garbage"));
        assert_eq!(rl.sync_from_headers(&headers, "x-used-weight"), None);

        headers.insert("x-used-weight", HeaderValue::from_static("300"));
        assert_eq!(rl.sync_from_headers(&headers, "X-Used-Weight"), Some(300));
        assert!((rl.available() - 900.0).abs() < 1e-9);
    }
}
