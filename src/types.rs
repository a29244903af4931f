// =============================================================================
// Unified market structures shared by every exchange adapter
// =============================================================================

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Trade or order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Lifecycle status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Closed,
    Canceled,
    Rejected,
    Expired,
}

impl Default for OrderStatus {
    fn default() -> Self {
        Self::Open
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Canceled => "canceled",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        };
        write!(f, "{s}")
    }
}

/// Market metadata handed to the parse functions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Market {
    /// Venue-native identifier (e.g. `"BTC"` on Hyperliquid perps).
    pub id: String,
    /// Unified symbol (e.g. `"BTC/USDC:USDC"`).
    pub symbol: String,
    pub base: String,
    pub quote: String,
    #[serde(default)]
    pub settle: Option<String>,
    #[serde(default)]
    pub swap: bool,
}

impl Market {
    pub fn spot(id: impl Into<String>, base: &str, quote: &str) -> Self {
        Self {
            id: id.into(),
            symbol: format!("{base}/{quote}"),
            base: base.to_string(),
            quote: quote.to_string(),
            settle: None,
            swap: false,
        }
    }

    /// Linear perpetual settled in `quote`.
    pub fn swap(base: &str, quote: &str) -> Self {
        Self {
            id: base.to_string(),
            symbol: format!("{base}/{quote}:{quote}"),
            base: base.to_string(),
            quote: quote.to_string(),
            settle: Some(quote.to_string()),
            swap: true,
        }
    }
}

/// A public trade print or a private fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub order: Option<String>,
    pub symbol: String,
    pub side: Option<Side>,
    pub price: f64,
    pub amount: f64,
    pub cost: f64,
    pub fee: Option<f64>,
    pub fee_currency: Option<String>,
    pub timestamp: i64,
    pub datetime: Option<String>,
}

/// An order as last reported by the venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: Option<Side>,
    pub order_type: Option<String>,
    pub price: Option<f64>,
    pub amount: Option<f64>,
    pub filled: Option<f64>,
    pub remaining: Option<f64>,
    pub status: OrderStatus,
    pub timestamp: i64,
    pub datetime: Option<String>,
}

/// One candle of a `(symbol, timeframe)` series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ohlcv {
    pub symbol: String,
    pub timeframe: String,
    /// Open time of the bucket in milliseconds.
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// 24h statistics for one market.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub timestamp: Option<i64>,
    pub datetime: Option<String>,
    pub last: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub mark: Option<f64>,
    pub index: Option<f64>,
    pub previous_close: Option<f64>,
    pub change: Option<f64>,
    pub percentage: Option<f64>,
    pub quote_volume: Option<f64>,
}

/// Parsed order-book snapshot or delta. Levels are `(price, size)`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BookUpdate {
    pub symbol: String,
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
    pub timestamp: Option<i64>,
    /// Venue sequence / nonce, when the venue supplies one.
    pub nonce: Option<u64>,
}

// ---------------------------------------------------------------------------
// Cache identity
// ---------------------------------------------------------------------------

/// Records with a stable identity, collapsed by `IdentityCache`.
pub trait Identified {
    fn id(&self) -> &str;
}

/// Records bucketed by time, upserted by `TimestampCache`.
pub trait Timestamped {
    fn timestamp(&self) -> i64;
}

impl Identified for Order {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Identified for Trade {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Timestamped for Ohlcv {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

impl Timestamped for Trade {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Render a millisecond UNIX timestamp as ISO-8601 (`2024-03-11T04:37:52.708Z`).
pub fn iso8601(ms: i64) -> Option<String> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
}

/// Length of a timeframe such as `"1m"`, `"4h"` or `"1w"` in milliseconds.
pub fn timeframe_ms(timeframe: &str) -> Option<i64> {
    let split = timeframe.find(|c: char| !c.is_ascii_digit())?;
    let (amount, unit) = timeframe.split_at(split);
    let amount: i64 = amount.parse().ok()?;
    let unit_ms = match unit {
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        "w" => 604_800_000,
        "M" => 2_592_000_000,
        _ => return None,
    };
    Some(amount * unit_ms)
}

/// Floor `ts` to the start of its `timeframe` bucket.
pub fn align_to_timeframe(ts: i64, timeframe: &str) -> Option<i64> {
    let width = timeframe_ms(timeframe)?;
    Some(ts - ts.rem_euclid(width))
}
