// =============================================================================
// Adapter Contract - what a venue integration supplies to the runtime
// =============================================================================
//
// The runtime never reads venue field names. An adapter provides:
//   * an exact channel-name -> handler table
//   * a way to split a data frame into raw records and name their market
//   * six pure parse functions (raw record, market) -> unified record
//   * subscribe frames per topic, error extraction and REST weights
// =============================================================================

use std::collections::HashMap;

use serde_json::{json, Value};

use crate::errors::{Result, StreamError};
use crate::rate_limit::WeightTable;
use crate::types::{BookUpdate, Market, Ohlcv, Order, Ticker, Trade};

// ---------------------------------------------------------------------------
// Handlers and the channel table
// ---------------------------------------------------------------------------

/// Closed set of inbound message handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Handler {
    Pong,
    /// Subscription acknowledgements and other frames carrying no data.
    Ack,
    Error,
    OrderBookSnapshot,
    OrderBookDelta,
    Trades,
    Ohlcv,
    Orders,
    MyTrades,
    Tickers,
}

/// Exact channel-name lookup. There is no partial or substring matching:
/// a channel that is not in the table is an unrecognised frame.
#[derive(Debug, Clone)]
pub struct ChannelTable {
    entries: HashMap<String, Handler>,
}

impl ChannelTable {
    pub fn new<'a>(entries: impl IntoIterator<Item = (&'a str, Handler)>) -> Result<Self> {
        let mut map = HashMap::new();
        for (name, handler) in entries {
            if name.is_empty() {
                return Err(StreamError::InvalidChannelTable("empty channel name".into()));
            }
            if map.insert(name.to_string(), handler).is_some() {
                return Err(StreamError::InvalidChannelTable(format!(
                    "channel {name} registered twice"
                )));
            }
        }
        Ok(Self { entries: map })
    }

    pub fn lookup(&self, channel: &str) -> Option<Handler> {
        self.entries.get(channel).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// A logical stream a caller can watch. Each topic maps to one message key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    OrderBook { symbol: String },
    Trades { symbol: String },
    Ohlcv { symbol: String, timeframe: String },
    /// Order updates for one symbol, or for every symbol when `None`.
    Orders { symbol: Option<String> },
    MyTrades { symbol: Option<String> },
    /// Every ticker the venue streams.
    Tickers,
    Ticker { symbol: String },
}

impl Topic {
    /// The message key this topic resolves under.
    pub fn key(&self) -> String {
        match self {
            Self::OrderBook { symbol } => format!("orderbook:{symbol}"),
            Self::Trades { symbol } => format!("trade:{symbol}"),
            Self::Ohlcv { symbol, timeframe } => format!("candles:{timeframe}:{symbol}"),
            Self::Orders { symbol: Some(s) } => format!("order:{s}"),
            Self::Orders { symbol: None } => "order".to_string(),
            Self::MyTrades { symbol: Some(s) } => format!("myTrades:{s}"),
            Self::MyTrades { symbol: None } => "myTrades".to_string(),
            Self::Tickers => "tickers".to_string(),
            Self::Ticker { symbol } => format!("ticker:{symbol}"),
        }
    }

    pub fn symbol(&self) -> Option<&str> {
        match self {
            Self::OrderBook { symbol }
            | Self::Trades { symbol }
            | Self::Ohlcv { symbol, .. }
            | Self::Ticker { symbol } => Some(symbol),
            Self::Orders { symbol } | Self::MyTrades { symbol } => symbol.as_deref(),
            Self::Tickers => None,
        }
    }

    /// Whether the topic streams account data.
    pub fn is_private(&self) -> bool {
        matches!(self, Self::Orders { .. } | Self::MyTrades { .. })
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

// ---------------------------------------------------------------------------
// Markets
// ---------------------------------------------------------------------------

/// Market metadata indexed by venue id and unified symbol.
#[derive(Debug, Clone, Default)]
pub struct Markets {
    by_id: HashMap<String, Market>,
    by_symbol: HashMap<String, Market>,
}

impl Markets {
    pub fn new(markets: impl IntoIterator<Item = Market>) -> Self {
        let mut out = Self::default();
        for m in markets {
            out.by_id.insert(m.id.clone(), m.clone());
            out.by_symbol.insert(m.symbol.clone(), m);
        }
        out
    }

    pub fn by_id(&self, id: &str) -> Option<&Market> {
        self.by_id.get(id)
    }

    pub fn by_symbol(&self, symbol: &str) -> Result<&Market> {
        self.by_symbol
            .get(symbol)
            .ok_or_else(|| StreamError::UnknownSymbol(symbol.to_string()))
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.by_symbol.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn len(&self) -> usize {
        self.by_symbol.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_symbol.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Adapter trait
// ---------------------------------------------------------------------------

pub trait Adapter: Send + Sync + 'static {
    fn id(&self) -> &'static str;

    fn markets(&self) -> Vec<Market>;

    /// Channel name -> handler bindings, validated into a [`ChannelTable`].
    fn channels(&self) -> Vec<(&'static str, Handler)>;

    /// Wire channel name of an inbound message.
    fn channel_of<'a>(&self, msg: &'a Value) -> Option<&'a str> {
        msg.get("channel").and_then(Value::as_str)
    }

    fn ping_frame(&self) -> Value {
        json!({ "method": "ping" })
    }

    /// Subscribe frame for `topic`. `market` is resolved from the topic's
    /// symbol; `user` is the configured account address.
    fn subscribe_frame(&self, topic: &Topic, market: Option<&Market>, user: Option<&str>) -> Result<Value>;

    /// Frame that undoes [`subscribe_frame`](Self::subscribe_frame).
    fn unsubscribe_frame(&self, subscribe: &Value) -> Value {
        let mut frame = subscribe.clone();
        frame["method"] = json!("unsubscribe");
        frame
    }

    /// Shallow-merge caller `params` into a subscribe frame. Top-level keys
    /// of `params` win; anything but an object is ignored.
    fn extend_frame(&self, mut frame: Value, params: &Value) -> Value {
        if let (Some(dst), Some(src)) = (frame.as_object_mut(), params.as_object()) {
            for (k, v) in src {
                dst.insert(k.clone(), v.clone());
            }
        }
        frame
    }

    /// Raw records carried by a data message for `handler`.
    fn records(&self, handler: Handler, msg: &Value) -> Vec<Value>;

    /// Venue market id a raw record refers to.
    fn market_id(&self, handler: Handler, record: &Value) -> Option<String>;

    // --- The six parse functions ---------------------------------------------

    fn parse_trade(&self, raw: &Value, market: Option<&Market>) -> Result<Trade>;

    fn parse_order_book_snapshot(&self, raw: &Value, market: Option<&Market>) -> Result<BookUpdate>;

    fn parse_order_book_delta(&self, raw: &Value, market: Option<&Market>) -> Result<BookUpdate>;

    fn parse_order(&self, raw: &Value, market: Option<&Market>) -> Result<Order>;

    fn parse_ohlcv(&self, raw: &Value, market: Option<&Market>) -> Result<Ohlcv>;

    fn parse_ticker(&self, raw: &Value, market: Option<&Market>) -> Result<Ticker>;

    // -------------------------------------------------------------------------

    /// Error text and the message keys it implicates. An empty key list
    /// means the error concerns the whole connection.
    fn parse_error(&self, msg: &Value) -> (String, Vec<String>);

    /// REST weight table.
    fn weights(&self) -> WeightTable;

    /// Response header in which the venue reports weight already used, when
    /// it publishes one.
    fn used_weight_header(&self) -> Option<&'static str> {
        None
    }

    /// REST endpoint and body of an order-book snapshot request.
    fn order_book_request(&self, market: &Market) -> (&'static str, Value);
}

// ---------------------------------------------------------------------------
// Lenient field helpers for adapters
// ---------------------------------------------------------------------------

/// A JSON value that may be either a decimal string or a number.
pub fn safe_float(val: &Value) -> Option<f64> {
    match val {
        Value::String(s) => s.parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

pub fn safe_float_field(obj: &Value, key: &str) -> Option<f64> {
    obj.get(key).and_then(safe_float)
}

/// Integer field given as a number or a numeric string.
pub fn safe_integer_field(obj: &Value, key: &str) -> Option<i64> {
    match obj.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// String field; numbers are rendered (ids are often numeric on the wire).
pub fn safe_string_field(obj: &Value, key: &str) -> Option<String> {
    match obj.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse `(price, size)` levels given either as `[price, size]` pairs or as
/// objects keyed by `price_key` / `size_key`.
pub fn parse_levels(levels: &Value, price_key: &str, size_key: &str) -> Result<Vec<(f64, f64)>> {
    let Some(items) = levels.as_array() else {
        return Ok(Vec::new());
    };
    items
        .iter()
        .map(|level| {
            let (price, size) = match level {
                Value::Array(pair) if pair.len() >= 2 => (safe_float(&pair[0]), safe_float(&pair[1])),
                Value::Object(_) => (
                    safe_float_field(level, price_key),
                    safe_float_field(level, size_key),
                ),
                _ => (None, None),
            };
            match (price, size) {
                (Some(p), Some(s)) => Ok((p, s)),
                _ => Err(StreamError::protocol(format!("malformed book level: {level}"))),
            }
        })
        .collect()
}
