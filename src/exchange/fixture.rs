// Small fictional venue for exercising the runtime: numbered book deltas,
// per-market data channels and key-scoped error frames.
//
//   {"channel":"book","data":{"market":"BTCUSD","seq":1,"bids":[[p,s]],"asks":[]}}
//   {"channel":"book.delta","data":{...same fields...}}
//   {"channel":"trades","data":[{"market","id","price","size","side","ts"}]}
//   {"channel":"orders","data":[{"market","id","status","price","size","filled","ts"}]}
//   {"channel":"error","key":"orderbook:BTC/USD","msg":"..."}

use serde_json::{json, Value};

use crate::errors::{Result, StreamError};
use crate::exchange::adapter::{
    parse_levels, safe_float_field, safe_integer_field, safe_string_field, Adapter, Handler, Topic,
};
use crate::rate_limit::WeightTable;
use crate::types::{iso8601, BookUpdate, Market, Ohlcv, Order, OrderStatus, Side, Ticker, Trade};

pub const URL: &str = "wss://mock.test/ws";
pub const BTC: &str = "BTC/USD";
pub const ETH: &str = "ETH/USD";

#[derive(Debug, Default)]
pub struct Venue;

fn symbol(market: Option<&Market>) -> Result<String> {
    market
        .map(|m| m.symbol.clone())
        .ok_or_else(|| StreamError::UnknownSymbol("unknown market".into()))
}

fn book(raw: &Value, market: Option<&Market>) -> Result<BookUpdate> {
    Ok(BookUpdate {
        symbol: symbol(market)?,
        bids: parse_levels(&raw["bids"], "price", "size")?,
        asks: parse_levels(&raw["asks"], "price", "size")?,
        timestamp: safe_integer_field(raw, "ts"),
        nonce: raw["seq"].as_u64(),
    })
}

impl Adapter for Venue {
    fn id(&self) -> &'static str {
        "mockex"
    }

    fn markets(&self) -> Vec<Market> {
        vec![
            Market::spot("BTCUSD", "BTC", "USD"),
            Market::spot("ETHUSD", "ETH", "USD"),
        ]
    }

    fn channels(&self) -> Vec<(&'static str, Handler)> {
        vec![
            ("pong", Handler::Pong),
            ("subscribed", Handler::Ack),
            ("error", Handler::Error),
            ("book", Handler::OrderBookSnapshot),
            ("book.delta", Handler::OrderBookDelta),
            ("trades", Handler::Trades),
            ("candles", Handler::Ohlcv),
            ("orders", Handler::Orders),
            ("fills", Handler::MyTrades),
            ("tickers", Handler::Tickers),
        ]
    }

    fn subscribe_frame(&self, topic: &Topic, market: Option<&Market>, user: Option<&str>) -> Result<Value> {
        let id = market.map(|m| m.id.as_str());
        let frame = match topic {
            Topic::OrderBook { .. } => json!({"method": "subscribe", "channel": "book", "market": id}),
            Topic::Trades { .. } => json!({"method": "subscribe", "channel": "trades", "market": id}),
            Topic::Ohlcv { timeframe, .. } => {
                json!({"method": "subscribe", "channel": "candles", "market": id, "tf": timeframe})
            }
            Topic::Orders { .. } | Topic::MyTrades { .. } => {
                let user = user.ok_or_else(|| StreamError::Config("user required".into()))?;
                let channel = if matches!(topic, Topic::Orders { .. }) { "orders" } else { "fills" };
                json!({"method": "subscribe", "channel": channel, "user": user})
            }
            Topic::Tickers | Topic::Ticker { .. } => json!({"method": "subscribe", "channel": "tickers"}),
        };
        Ok(frame)
    }

    fn records(&self, _handler: Handler, msg: &Value) -> Vec<Value> {
        match &msg["data"] {
            Value::Array(items) => items.clone(),
            obj @ Value::Object(_) => vec![obj.clone()],
            _ => Vec::new(),
        }
    }

    fn market_id(&self, _handler: Handler, record: &Value) -> Option<String> {
        safe_string_field(record, "market")
    }

    fn parse_trade(&self, raw: &Value, market: Option<&Market>) -> Result<Trade> {
        let price = safe_float_field(raw, "price").ok_or_else(|| StreamError::protocol("price"))?;
        let amount = safe_float_field(raw, "size").ok_or_else(|| StreamError::protocol("size"))?;
        let timestamp = safe_integer_field(raw, "ts").unwrap_or_default();
        Ok(Trade {
            id: safe_string_field(raw, "id").ok_or_else(|| StreamError::protocol("id"))?,
            order: None,
            symbol: symbol(market)?,
            side: match raw["side"].as_str() {
                Some("buy") => Some(Side::Buy),
                Some("sell") => Some(Side::Sell),
                _ => None,
            },
            price,
            amount,
            cost: price * amount,
            fee: None,
            fee_currency: None,
            timestamp,
            datetime: iso8601(timestamp),
        })
    }

    fn parse_order_book_snapshot(&self, raw: &Value, market: Option<&Market>) -> Result<BookUpdate> {
        book(raw, market)
    }

    fn parse_order_book_delta(&self, raw: &Value, market: Option<&Market>) -> Result<BookUpdate> {
        book(raw, market)
    }

    fn parse_order(&self, raw: &Value, market: Option<&Market>) -> Result<Order> {
        let timestamp = safe_integer_field(raw, "ts").unwrap_or_default();
        Ok(Order {
            id: safe_string_field(raw, "id").ok_or_else(|| StreamError::protocol("id"))?,
            client_order_id: None,
            symbol: symbol(market)?,
            side: None,
            order_type: None,
            price: safe_float_field(raw, "price"),
            amount: safe_float_field(raw, "size"),
            filled: safe_float_field(raw, "filled"),
            remaining: None,
            status: match raw["status"].as_str() {
                Some("closed") => OrderStatus::Closed,
                Some("canceled") => OrderStatus::Canceled,
                _ => OrderStatus::Open,
            },
            timestamp,
            datetime: iso8601(timestamp),
        })
    }

    fn parse_ohlcv(&self, raw: &Value, market: Option<&Market>) -> Result<Ohlcv> {
        let f = |k: &str| safe_float_field(raw, k).ok_or_else(|| StreamError::protocol(k.to_string()));
        Ok(Ohlcv {
            symbol: symbol(market)?,
            timeframe: safe_string_field(raw, "tf").ok_or_else(|| StreamError::protocol("tf"))?,
            timestamp: safe_integer_field(raw, "t").ok_or_else(|| StreamError::protocol("t"))?,
            open: f("o")?,
            high: f("h")?,
            low: f("l")?,
            close: f("c")?,
            volume: f("v")?,
        })
    }

    fn parse_ticker(&self, raw: &Value, market: Option<&Market>) -> Result<Ticker> {
        Ok(Ticker {
            symbol: symbol(market)?,
            last: safe_float_field(raw, "last"),
            ..Ticker::default()
        })
    }

    fn parse_error(&self, msg: &Value) -> (String, Vec<String>) {
        let text = msg["msg"].as_str().unwrap_or("error").to_string();
        let keys = msg["key"].as_str().map(|k| vec![k.to_string()]).unwrap_or_default();
        (text, keys)
    }

    fn weights(&self) -> WeightTable {
        WeightTable::new(1).with_endpoint("book", 5)
    }

    fn used_weight_header(&self) -> Option<&'static str> {
        Some("x-mock-used-weight")
    }

    fn order_book_request(&self, market: &Market) -> (&'static str, Value) {
        ("book", json!({ "market": market.id }))
    }
}
