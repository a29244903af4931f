// =============================================================================
// Market Store - lazily created per-symbol caches and books
// =============================================================================
//
// The store is the shared mutable state that watch calls read after the
// router wakes them. Each container is synchronised on its own, independently
// of the router's notification slots.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::market_data::cache::{ArrayCache, IdentityCache, TimestampCache};
use crate::market_data::orderbook::OrderBookManager;
use crate::types::{timeframe_ms, Ohlcv, Order, Ticker, Trade};

/// Capacities of the history caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheLimits {
    pub trades: usize,
    pub ohlcv: usize,
    pub orders: usize,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            trades: 1000,
            ohlcv: 1000,
            orders: 1000,
        }
    }
}

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub timeframe: String,
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

pub struct MarketStore {
    limits: CacheLimits,
    pub books: OrderBookManager,
    trades: RwLock<HashMap<String, ArrayCache<Trade>>>,
    candles: RwLock<HashMap<CandleKey, TimestampCache<Ohlcv>>>,
    orders: RwLock<IdentityCache<Order>>,
    my_trades: RwLock<IdentityCache<Trade>>,
    tickers: RwLock<HashMap<String, Ticker>>,
}

impl MarketStore {
    pub fn new(limits: CacheLimits) -> Self {
        Self {
            limits,
            books: OrderBookManager::new(),
            trades: RwLock::new(HashMap::new()),
            candles: RwLock::new(HashMap::new()),
            orders: RwLock::new(IdentityCache::new(limits.orders)),
            my_trades: RwLock::new(IdentityCache::new(limits.orders)),
            tickers: RwLock::new(HashMap::new()),
        }
    }

    pub fn limits(&self) -> CacheLimits {
        self.limits
    }

    // -------------------------------------------------------------------------
    // Public trades
    // -------------------------------------------------------------------------

    pub fn append_trade(&self, trade: Trade) {
        let mut map = self.trades.write();
        map.entry(trade.symbol.clone())
            .or_insert_with(|| ArrayCache::new(self.limits.trades))
            .append(trade);
    }

    /// Newest `limit` trades for `symbol` stamped at or after `since`,
    /// oldest first.
    pub fn trades(&self, symbol: &str, since: Option<i64>, limit: Option<usize>) -> Vec<Trade> {
        let map = self.trades.read();
        map.get(symbol)
            .map(|c| c.tail_where(c.limit_for(limit), |t| at_or_after(t.timestamp, since)))
            .unwrap_or_default()
    }

    // -------------------------------------------------------------------------
    // Candles
    // -------------------------------------------------------------------------

    pub fn upsert_candle(&self, candle: Ohlcv) {
        let key = CandleKey {
            symbol: candle.symbol.clone(),
            timeframe: candle.timeframe.clone(),
        };
        let mut map = self.candles.write();
        let limit = self.limits.ohlcv;
        map.entry(key)
            .or_insert_with_key(|k| match timeframe_ms(&k.timeframe) {
                Some(width) => TimestampCache::with_bucket(limit, width),
                None => TimestampCache::new(limit),
            })
            .append(candle);
    }

    pub fn candles(&self, symbol: &str, timeframe: &str, since: Option<i64>, limit: Option<usize>) -> Vec<Ohlcv> {
        let key = CandleKey {
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
        };
        let map = self.candles.read();
        map.get(&key)
            .map(|c| c.tail_where(c.limit_for(limit), |k| at_or_after(k.timestamp, since)))
            .unwrap_or_default()
    }

    // -------------------------------------------------------------------------
    // Orders and fills (identity caches spanning all symbols)
    // -------------------------------------------------------------------------

    pub fn upsert_order(&self, order: Order) {
        self.orders.write().append(order);
    }

    pub fn orders(&self, symbol: Option<&str>, since: Option<i64>, limit: Option<usize>) -> Vec<Order> {
        let cache = self.orders.read();
        cache.tail_where(cache.limit_for(limit), |o| {
            symbol.map_or(true, |s| o.symbol == s) && at_or_after(o.timestamp, since)
        })
    }

    pub fn upsert_my_trade(&self, trade: Trade) {
        self.my_trades.write().append(trade);
    }

    pub fn my_trades(&self, symbol: Option<&str>, since: Option<i64>, limit: Option<usize>) -> Vec<Trade> {
        let cache = self.my_trades.read();
        cache.tail_where(cache.limit_for(limit), |t| {
            symbol.map_or(true, |s| t.symbol == s) && at_or_after(t.timestamp, since)
        })
    }

    // -------------------------------------------------------------------------
    // Tickers (latest value per symbol)
    // -------------------------------------------------------------------------

    pub fn set_ticker(&self, ticker: Ticker) {
        self.tickers.write().insert(ticker.symbol.clone(), ticker);
    }

    pub fn ticker(&self, symbol: &str) -> Option<Ticker> {
        self.tickers.read().get(symbol).cloned()
    }

    /// Tickers for `symbols`, or every known ticker, sorted by symbol.
    pub fn tickers(&self, symbols: Option<&[String]>) -> Vec<Ticker> {
        let map = self.tickers.read();
        let mut out: Vec<Ticker> = match symbols {
            Some(wanted) => wanted.iter().filter_map(|s| map.get(s).cloned()).collect(),
            None => map.values().cloned().collect(),
        };
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        out
    }
}

/// `since` is inclusive; `None` keeps everything.
fn at_or_after(timestamp: i64, since: Option<i64>) -> bool {
    since.map_or(true, |s| timestamp >= s)
}

impl Default for MarketStore {
    fn default() -> Self {
        Self::new(CacheLimits::default())
    }
}
