// =============================================================================
// Dispatcher - channel lookup, parse, store write, key fan-out
// =============================================================================
//
// Runs on the connection's reader, one message at a time. Each handler parses
// the message's records with the adapter, writes them into the shared market
// store, and returns the message keys to wake. A single message may wake a
// symbol-scoped key and an aggregate key (`order:BTC/USD` and `order`).
//
// Slots are resolved with a `Stamp` rather than the data itself; watchers read
// the freshest state from the store after waking.
// =============================================================================

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::errors::StreamError;
use crate::exchange::adapter::{Adapter, ChannelTable, Handler, Markets};
use crate::market_data::{DeltaOutcome, MarketStore};
use crate::types::Market;
use crate::ws::{Dispatch, MessageHandler};

/// Monotonic resolution counter handed to woken watchers.
pub type Stamp = u64;

pub struct Dispatcher<A: Adapter> {
    adapter: Arc<A>,
    channels: ChannelTable,
    markets: Arc<Markets>,
    store: Arc<MarketStore>,
    stamp: AtomicU64,
}

impl<A: Adapter> Dispatcher<A> {
    pub fn new(
        adapter: Arc<A>,
        channels: ChannelTable,
        markets: Arc<Markets>,
        store: Arc<MarketStore>,
    ) -> Self {
        Self {
            adapter,
            channels,
            markets,
            store,
            stamp: AtomicU64::new(0),
        }
    }

    fn handler_of(&self, msg: &Value) -> Option<Handler> {
        self.adapter
            .channel_of(msg)
            .and_then(|channel| self.channels.lookup(channel))
    }

    fn market_for(&self, handler: Handler, record: &Value) -> Option<&Market> {
        self.adapter
            .market_id(handler, record)
            .and_then(|id| self.markets.by_id(&id))
    }

    /// Parse every record of `msg` with `parse`, logging and skipping
    /// records that fail.
    fn parse_records<T>(
        &self,
        handler: Handler,
        msg: &Value,
        parse: impl Fn(&A, &Value, Option<&Market>) -> crate::errors::Result<T>,
    ) -> Vec<T> {
        self.adapter
            .records(handler, msg)
            .iter()
            .filter_map(|record| {
                let market = self.market_for(handler, record);
                match parse(self.adapter.as_ref(), record, market) {
                    Ok(parsed) => Some(parsed),
                    Err(e) => {
                        warn!(exchange = self.adapter.id(), handler = ?handler, error = %e, "failed to parse record");
                        None
                    }
                }
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Handlers (each returns the keys to wake)
    // -------------------------------------------------------------------------

    fn on_book_snapshot(&self, msg: &Value) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        for update in self.parse_records(Handler::OrderBookSnapshot, msg, A::parse_order_book_snapshot) {
            self.store.books.apply_snapshot(&update);
            keys.insert(format!("orderbook:{}", update.symbol));
        }
        keys
    }

    fn on_book_delta(&self, msg: &Value) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        for update in self.parse_records(Handler::OrderBookDelta, msg, A::parse_order_book_delta) {
            if self.store.books.apply_delta(&update) == DeltaOutcome::Applied {
                keys.insert(format!("orderbook:{}", update.symbol));
            }
        }
        keys
    }

    fn on_trades(&self, msg: &Value) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        for trade in self.parse_records(Handler::Trades, msg, A::parse_trade) {
            keys.insert(format!("trade:{}", trade.symbol));
            self.store.append_trade(trade);
        }
        keys
    }

    fn on_ohlcv(&self, msg: &Value) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        for candle in self.parse_records(Handler::Ohlcv, msg, A::parse_ohlcv) {
            keys.insert(format!("candles:{}:{}", candle.timeframe, candle.symbol));
            self.store.upsert_candle(candle);
        }
        keys
    }

    fn on_orders(&self, msg: &Value) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        for order in self.parse_records(Handler::Orders, msg, A::parse_order) {
            keys.insert(format!("order:{}", order.symbol));
            self.store.upsert_order(order);
        }
        if !keys.is_empty() {
            keys.insert("order".to_string());
        }
        keys
    }

    fn on_my_trades(&self, msg: &Value) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        for trade in self.parse_records(Handler::MyTrades, msg, A::parse_trade) {
            keys.insert(format!("myTrades:{}", trade.symbol));
            self.store.upsert_my_trade(trade);
        }
        if !keys.is_empty() {
            keys.insert("myTrades".to_string());
        }
        keys
    }

    fn on_tickers(&self, msg: &Value) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        for ticker in self.parse_records(Handler::Tickers, msg, A::parse_ticker) {
            keys.insert(format!("ticker:{}", ticker.symbol));
            self.store.set_ticker(ticker);
        }
        if !keys.is_empty() {
            keys.insert("tickers".to_string());
        }
        keys
    }
}

impl<A: Adapter> MessageHandler<Stamp> for Dispatcher<A> {
    fn ping_frame(&self) -> String {
        self.adapter.ping_frame().to_string()
    }

    fn is_pong(&self, msg: &Value) -> bool {
        self.handler_of(msg) == Some(Handler::Pong)
    }

    fn dispatch(&self, msg: &Value) -> Dispatch<Stamp> {
        let Some(channel) = self.adapter.channel_of(msg) else {
            debug!(exchange = self.adapter.id(), "dropping frame without channel");
            return Dispatch::Ignore;
        };
        let Some(handler) = self.channels.lookup(channel) else {
            debug!(exchange = self.adapter.id(), channel, "dropping frame on unrecognised channel");
            return Dispatch::Ignore;
        };

        let keys = match handler {
            Handler::Pong | Handler::Ack => return Dispatch::Ignore,
            Handler::Error => {
                let (text, keys) = self.adapter.parse_error(msg);
                return Dispatch::Reject {
                    keys,
                    error: StreamError::Exchange(format!("{} {}", self.adapter.id(), text)),
                };
            }
            Handler::OrderBookSnapshot => self.on_book_snapshot(msg),
            Handler::OrderBookDelta => self.on_book_delta(msg),
            Handler::Trades => self.on_trades(msg),
            Handler::Ohlcv => self.on_ohlcv(msg),
            Handler::Orders => self.on_orders(msg),
            Handler::MyTrades => self.on_my_trades(msg),
            Handler::Tickers => self.on_tickers(msg),
        };

        if keys.is_empty() {
            return Dispatch::Ignore;
        }
        let stamp = self.stamp.fetch_add(1, Ordering::Relaxed) + 1;
        Dispatch::Resolve(keys.into_iter().map(|k| (k, stamp)).collect())
    }

    fn on_disconnect(&self, conn_id: u64, url: &str) {
        self.store.books.release_owner(conn_id);
        info!(exchange = self.adapter.id(), url, conn_id, "released order-book claims");
    }
}
