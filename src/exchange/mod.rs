// =============================================================================
// Exchange - the watch surface of one venue
// =============================================================================
//
// Each `watch_*` call resolves the topic to a message key, makes sure the key
// is registered on the venue's connection (sending the subscribe frame only
// the first time), waits for the next resolution and then reads the freshest
// state out of the shared store. Repeated calls are the polling pattern.
//
// Nothing here retries. A dropped connection fails every watch with a
// retryable `Connection` error until the caller invokes `reconnect`.
// =============================================================================

pub mod adapter;
pub mod dispatch;
pub mod hyperliquid;

#[cfg(test)]
pub(crate) mod fixture;

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::config::StreamConfig;
use crate::errors::{Result, StreamError};
use crate::market_data::{MarketStore, OrderBook};
use crate::rate_limit::{RateLimitSnapshot, RateLimiter};
use crate::rest::RestClient;
use crate::types::{Market, Ohlcv, Order, Ticker, Trade};
use crate::ws::{Connector, KeepaliveConfig, Router, TungsteniteConnector};

pub use adapter::{Adapter, ChannelTable, Handler, Markets, Topic};
pub use dispatch::{Dispatcher, Stamp};
pub use hyperliquid::Hyperliquid;

pub struct Exchange<A: Adapter> {
    adapter: Arc<A>,
    config: StreamConfig,
    markets: Arc<Markets>,
    store: Arc<MarketStore>,
    router: Router<Stamp>,
    limiter: Arc<RateLimiter>,
    rest: RestClient,
}

impl<A: Adapter> Exchange<A> {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    pub fn new(adapter: A, config: StreamConfig) -> Result<Self> {
        Self::with_connector(adapter, config, Arc::new(TungsteniteConnector))
    }

    /// Build over an explicit transport.
    pub fn with_connector(adapter: A, config: StreamConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        let channels = ChannelTable::new(adapter.channels())?;
        let markets = Arc::new(Markets::new(adapter.markets()));
        let store = Arc::new(MarketStore::new(config.cache_limits()));
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit.capacity,
            config.rate_limit.refill_per_sec,
        ));
        let rest = RestClient::new(&config.rest_url, limiter.clone(), adapter.weights())?
            .with_used_weight_header(adapter.used_weight_header());

        let adapter = Arc::new(adapter);
        let dispatcher = Arc::new(Dispatcher::new(
            adapter.clone(),
            channels,
            markets.clone(),
            store.clone(),
        ));
        let keepalive = KeepaliveConfig::new(config.keepalive(), config.pong_timeout_factor);
        let router = Router::new(connector, dispatcher, keepalive).with_limiter(limiter.clone());

        info!(
            exchange = adapter.id(),
            markets = markets.len(),
            ws_url = %config.ws_url,
            "exchange initialised"
        );

        Ok(Self {
            adapter,
            config,
            markets,
            store,
            router,
            limiter,
            rest,
        })
    }

    pub fn id(&self) -> &'static str {
        self.adapter.id()
    }

    pub fn markets(&self) -> &Markets {
        &self.markets
    }

    pub fn market(&self, symbol: &str) -> Result<&Market> {
        self.markets.by_symbol(symbol)
    }

    /// Shared state every watch reads from.
    pub fn store(&self) -> &MarketStore {
        &self.store
    }

    pub fn rate_limit(&self) -> RateLimitSnapshot {
        self.limiter.snapshot()
    }

    // -------------------------------------------------------------------------
    // Subscription plumbing
    // -------------------------------------------------------------------------

    /// Venue frame for `topic` with caller `params` merged in.
    fn subscribe_frame(&self, topic: &Topic, params: Option<&Value>) -> Result<Value> {
        let market = topic.symbol().map(|s| self.markets.by_symbol(s)).transpose()?;
        let frame = self
            .adapter
            .subscribe_frame(topic, market, self.config.user.as_deref())?;
        Ok(match params {
            Some(params) => self.adapter.extend_frame(frame, params),
            None => frame,
        })
    }

    /// Register `topic` and wait for its next resolution.
    async fn watch(&self, topic: Topic, params: Option<&Value>) -> Result<Stamp> {
        let frame = self.subscribe_frame(&topic, params)?.to_string();
        let conn = self.router.connect(&self.config.ws_url).await?;

        if let Topic::OrderBook { symbol } = &topic {
            self.store.books.claim(symbol, conn.id())?;
        }

        let key = topic.key();
        let cost = self.config.subscribe_cost.unwrap_or(0);
        let mut reader = conn.subscribe(&key, Some(frame), cost).await?;
        reader.wait(self.config.watch_timeout()).await
    }

    /// Stop watching `topic`. The unsubscribe frame goes out only once no
    /// other watched key shares the subscription. Pass the `params` the topic
    /// was watched with so the frames match.
    pub async fn unwatch(&self, topic: Topic, params: Option<&Value>) -> Result<()> {
        let subscribe = self.subscribe_frame(&topic, params)?;
        let unsubscribe = self.adapter.unsubscribe_frame(&subscribe).to_string();
        debug!(exchange = self.id(), key = %topic, "unwatch");
        self.router
            .unsubscribe(&self.config.ws_url, &topic.key(), Some(unsubscribe))
            .await
    }

    // -------------------------------------------------------------------------
    // Watch operations
    //
    // `params` is merged into the subscribe frame. List watchers return the
    // newest `limit` records stamped at or after `since`.
    // -------------------------------------------------------------------------

    /// Next update of `symbol`'s book, truncated to `limit` levels per side.
    pub async fn watch_order_book(
        &self,
        symbol: &str,
        limit: Option<usize>,
        params: Option<&Value>,
    ) -> Result<OrderBook> {
        self.watch(Topic::OrderBook { symbol: symbol.to_string() }, params).await?;
        self.store
            .books
            .limit(symbol, limit)
            .ok_or_else(|| StreamError::protocol(format!("{symbol} resolved without a book")))
    }

    pub async fn watch_trades(
        &self,
        symbol: &str,
        since: Option<i64>,
        limit: Option<usize>,
        params: Option<&Value>,
    ) -> Result<Vec<Trade>> {
        self.watch(Topic::Trades { symbol: symbol.to_string() }, params).await?;
        Ok(self.store.trades(symbol, since, limit))
    }

    pub async fn watch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        since: Option<i64>,
        limit: Option<usize>,
        params: Option<&Value>,
    ) -> Result<Vec<Ohlcv>> {
        let topic = Topic::Ohlcv {
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
        };
        self.watch(topic, params).await?;
        Ok(self.store.candles(symbol, timeframe, since, limit))
    }

    /// Order updates for `symbol`, or for every market when `None`.
    pub async fn watch_orders(
        &self,
        symbol: Option<&str>,
        since: Option<i64>,
        limit: Option<usize>,
        params: Option<&Value>,
    ) -> Result<Vec<Order>> {
        self.watch(Topic::Orders { symbol: symbol.map(String::from) }, params).await?;
        Ok(self.store.orders(symbol, since, limit))
    }

    pub async fn watch_my_trades(
        &self,
        symbol: Option<&str>,
        since: Option<i64>,
        limit: Option<usize>,
        params: Option<&Value>,
    ) -> Result<Vec<Trade>> {
        self.watch(Topic::MyTrades { symbol: symbol.map(String::from) }, params).await?;
        Ok(self.store.my_trades(symbol, since, limit))
    }

    pub async fn watch_ticker(&self, symbol: &str, params: Option<&Value>) -> Result<Ticker> {
        self.watch(Topic::Ticker { symbol: symbol.to_string() }, params).await?;
        self.store
            .ticker(symbol)
            .ok_or_else(|| StreamError::protocol(format!("{symbol} resolved without a ticker")))
    }

    /// Latest tickers, restricted to `symbols` when given.
    pub async fn watch_tickers(&self, symbols: Option<&[String]>, params: Option<&Value>) -> Result<Vec<Ticker>> {
        if let Some(symbols) = symbols {
            for s in symbols {
                self.markets.by_symbol(s)?;
            }
        }
        self.watch(Topic::Tickers, params).await?;
        Ok(self.store.tickers(symbols))
    }

    // -------------------------------------------------------------------------
    // REST
    // -------------------------------------------------------------------------

    /// One-off order-book snapshot over REST. The result is not merged into
    /// the streamed book.
    pub async fn fetch_order_book(&self, symbol: &str, limit: Option<usize>) -> Result<OrderBook> {
        let market = self.markets.by_symbol(symbol)?;
        let (endpoint, body) = self.adapter.order_book_request(market);
        let raw = self.rest.post(endpoint, &body).await?;
        let update = self.adapter.parse_order_book_snapshot(&raw, Some(market))?;

        let mut book = OrderBook::new(symbol);
        book.reset(&update);
        Ok(book.limit(limit))
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Reopen the venue connection after it dropped; a live connection is
    /// left alone. Registrations are not carried over: the next watch of
    /// each topic subscribes again.
    pub async fn reconnect(&self) -> Result<()> {
        let conn = self.router.restore(&self.config.ws_url).await?;
        info!(exchange = self.id(), id = conn.id(), "connection ready");
        Ok(())
    }

    pub async fn close(&self) {
        self.router.close_all().await;
        info!(exchange = self.id(), "exchange closed");
    }
}
