// =============================================================================
// Hyperliquid Adapter - channel table, subscribe frames and parse functions
// =============================================================================
//
// Perpetuals are addressed on the wire by their base coin ("BTC"), spot
// markets by their venue id. Every public and private channel shares the one
// WebSocket endpoint. `l2Book` always carries a full snapshot, so this venue
// has no delta channel.
// =============================================================================

use serde_json::{json, Value};

use crate::errors::{Result, StreamError};
use crate::exchange::adapter::{
    parse_levels, safe_float, safe_float_field, safe_integer_field, safe_string_field, Adapter, Handler, Topic,
};
use crate::rate_limit::WeightTable;
use crate::types::{iso8601, BookUpdate, Market, Ohlcv, Order, OrderStatus, Side, Ticker, Trade};

/// Settlement currency of every perpetual.
const SETTLE: &str = "USDC";

/// Placeholder address accepted by `webData2` for market-wide data.
const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

#[derive(Debug, Clone)]
pub struct Hyperliquid {
    markets: Vec<Market>,
}

impl Hyperliquid {
    pub fn new(markets: Vec<Market>) -> Self {
        Self { markets }
    }

    /// Markets for `symbols`. `BASE/USDC:USDC` and bare base coins ("BTC")
    /// are perpetuals; `BASE/QUOTE` without a settle suffix is a spot pair
    /// whose venue id is the pair name itself ("PURR/USDC").
    pub fn from_symbols(symbols: &[String]) -> Self {
        let markets = symbols
            .iter()
            .filter_map(|s| {
                let s = s.trim();
                match s.split_once('/') {
                    Some((base, quote)) if !quote.contains(':') && !base.is_empty() && !quote.is_empty() => {
                        Some(Market::spot(s, base, quote))
                    }
                    _ => {
                        let base = s.split('/').next()?.trim();
                        (!base.is_empty()).then(|| Market::swap(base, SETTLE))
                    }
                }
            })
            .collect();
        Self::new(markets)
    }

    /// Wire coin of a market.
    fn coin(market: &Market) -> &str {
        if market.swap {
            &market.base
        } else {
            &market.id
        }
    }

    fn symbol_of(market: Option<&Market>, raw: &Value, field: &str) -> Result<String> {
        match market {
            Some(m) => Ok(m.symbol.clone()),
            None => Err(StreamError::UnknownSymbol(
                safe_string_field(raw, field).unwrap_or_default(),
            )),
        }
    }

    fn side(code: Option<&str>) -> Option<Side> {
        match code? {
            "A" => Some(Side::Sell),
            "B" => Some(Side::Buy),
            _ => None,
        }
    }

    fn order_status(status: &str) -> OrderStatus {
        match status {
            "open" | "triggered" => OrderStatus::Open,
            "filled" => OrderStatus::Closed,
            "canceled" | "marginCanceled" | "scheduledCancel" => OrderStatus::Canceled,
            "rejected" => OrderStatus::Rejected,
            _ => OrderStatus::Open,
        }
    }
}

impl Adapter for Hyperliquid {
    fn id(&self) -> &'static str {
        "hyperliquid"
    }

    fn markets(&self) -> Vec<Market> {
        self.markets.clone()
    }

    fn channels(&self) -> Vec<(&'static str, Handler)> {
        vec![
            ("pong", Handler::Pong),
            ("subscriptionResponse", Handler::Ack),
            ("error", Handler::Error),
            ("l2Book", Handler::OrderBookSnapshot),
            ("trades", Handler::Trades),
            ("candle", Handler::Ohlcv),
            ("orderUpdates", Handler::Orders),
            ("userFills", Handler::MyTrades),
            ("webData2", Handler::Tickers),
        ]
    }

    fn subscribe_frame(&self, topic: &Topic, market: Option<&Market>, user: Option<&str>) -> Result<Value> {
        let coin = || {
            market
                .map(Self::coin)
                .ok_or_else(|| StreamError::UnknownSymbol(topic.symbol().unwrap_or_default().to_string()))
        };
        let address = || {
            user.filter(|u| !u.is_empty())
                .ok_or_else(|| StreamError::Config(format!("{topic} requires a user address")))
        };

        let subscription = match topic {
            Topic::OrderBook { .. } => json!({ "type": "l2Book", "coin": coin()? }),
            Topic::Trades { .. } => json!({ "type": "trades", "coin": coin()? }),
            Topic::Ohlcv { timeframe, .. } => {
                json!({ "type": "candle", "coin": coin()?, "interval": timeframe })
            }
            Topic::Orders { .. } => json!({ "type": "orderUpdates", "user": address()? }),
            Topic::MyTrades { .. } => json!({ "type": "userFills", "user": address()? }),
            Topic::Tickers | Topic::Ticker { .. } => {
                json!({ "type": "webData2", "user": ZERO_ADDRESS })
            }
        };

        Ok(json!({ "method": "subscribe", "subscription": subscription }))
    }

    fn records(&self, handler: Handler, msg: &Value) -> Vec<Value> {
        let data = &msg["data"];
        match handler {
            Handler::Trades | Handler::Orders => data.as_array().cloned().unwrap_or_default(),
            Handler::MyTrades => data["fills"].as_array().cloned().unwrap_or_default(),
            Handler::Tickers => {
                // Spot contexts name their own coin.
                let mut records = data["spotAssetCtxs"].as_array().cloned().unwrap_or_default();
                // Perp contexts are positional: universe[i] describes assetCtxs[i].
                let universe = data["meta"]["universe"].as_array().cloned().unwrap_or_default();
                let ctxs = data["assetCtxs"].as_array().cloned().unwrap_or_default();
                records.extend(universe.into_iter().zip(ctxs).map(|(mut meta, ctx)| {
                    if let (Some(m), Some(c)) = (meta.as_object_mut(), ctx.as_object()) {
                        m.extend(c.clone());
                    }
                    meta
                }));
                records
            }
            _ if data.is_object() => vec![data.clone()],
            _ => Vec::new(),
        }
    }

    fn market_id(&self, handler: Handler, record: &Value) -> Option<String> {
        let field = match handler {
            Handler::Ohlcv => "s",
            Handler::Orders => return safe_string_field(&record["order"], "coin"),
            Handler::Tickers => {
                return safe_string_field(record, "name").or_else(|| safe_string_field(record, "coin"))
            }
            _ => "coin",
        };
        safe_string_field(record, field)
    }

    fn parse_trade(&self, raw: &Value, market: Option<&Market>) -> Result<Trade> {
        let symbol = Self::symbol_of(market, raw, "coin")?;
        let price = safe_float_field(raw, "px")
            .ok_or_else(|| StreamError::protocol("trade without px"))?;
        let amount = safe_float_field(raw, "sz")
            .ok_or_else(|| StreamError::protocol("trade without sz"))?;
        let timestamp = safe_integer_field(raw, "time").unwrap_or_default();
        let fee = safe_float_field(raw, "fee");

        Ok(Trade {
            id: safe_string_field(raw, "tid")
                .ok_or_else(|| StreamError::protocol("trade without tid"))?,
            order: safe_string_field(raw, "oid"),
            symbol,
            side: Self::side(raw["side"].as_str()),
            price,
            amount,
            cost: price * amount,
            fee,
            fee_currency: fee.map(|_| SETTLE.to_string()),
            timestamp,
            datetime: iso8601(timestamp),
        })
    }

    fn parse_order_book_snapshot(&self, raw: &Value, market: Option<&Market>) -> Result<BookUpdate> {
        let symbol = Self::symbol_of(market, raw, "coin")?;
        let levels = &raw["levels"];
        Ok(BookUpdate {
            symbol,
            bids: parse_levels(&levels[0], "px", "sz")?,
            asks: parse_levels(&levels[1], "px", "sz")?,
            timestamp: safe_integer_field(raw, "time"),
            nonce: None,
        })
    }

    fn parse_order_book_delta(&self, _raw: &Value, _market: Option<&Market>) -> Result<BookUpdate> {
        Err(StreamError::protocol("hyperliquid streams full l2Book snapshots only"))
    }

    fn parse_order(&self, raw: &Value, market: Option<&Market>) -> Result<Order> {
        let order = &raw["order"];
        let symbol = Self::symbol_of(market, order, "coin")?;
        let amount = safe_float_field(order, "origSz");
        let remaining = safe_float_field(order, "sz");
        let timestamp = safe_integer_field(raw, "statusTimestamp")
            .or_else(|| safe_integer_field(order, "timestamp"))
            .unwrap_or_default();

        Ok(Order {
            id: safe_string_field(order, "oid")
                .ok_or_else(|| StreamError::protocol("order without oid"))?,
            client_order_id: safe_string_field(order, "cloid"),
            symbol,
            side: Self::side(order["side"].as_str()),
            order_type: Some("limit".to_string()),
            price: safe_float_field(order, "limitPx"),
            amount,
            filled: amount.zip(remaining).map(|(a, r)| a - r),
            remaining,
            status: raw["status"].as_str().map(Self::order_status).unwrap_or_default(),
            timestamp,
            datetime: iso8601(timestamp),
        })
    }

    fn parse_ohlcv(&self, raw: &Value, market: Option<&Market>) -> Result<Ohlcv> {
        let symbol = Self::symbol_of(market, raw, "s")?;
        let field = |key: &str| {
            safe_float_field(raw, key)
                .ok_or_else(|| StreamError::protocol(format!("candle without {key}")))
        };
        Ok(Ohlcv {
            symbol,
            timeframe: raw["i"]
                .as_str()
                .ok_or_else(|| StreamError::protocol("candle without interval"))?
                .to_string(),
            timestamp: safe_integer_field(raw, "t")
                .ok_or_else(|| StreamError::protocol("candle without open time"))?,
            open: field("o")?,
            high: field("h")?,
            low: field("l")?,
            close: field("c")?,
            volume: field("v")?,
        })
    }

    fn parse_ticker(&self, raw: &Value, market: Option<&Market>) -> Result<Ticker> {
        let field = if raw.get("name").is_some() { "name" } else { "coin" };
        let symbol = Self::symbol_of(market, raw, field)?;
        let last = safe_float_field(raw, "midPx");
        let previous_close = safe_float_field(raw, "prevDayPx");
        let change = last.zip(previous_close).map(|(l, p)| l - p);
        let percentage = change
            .zip(previous_close)
            .filter(|(_, p)| *p != 0.0)
            .map(|(c, p)| c / p * 100.0);

        Ok(Ticker {
            symbol,
            timestamp: None,
            datetime: None,
            last,
            bid: raw["impactPxs"].get(0).and_then(safe_float),
            ask: raw["impactPxs"].get(1).and_then(safe_float),
            mark: safe_float_field(raw, "markPx"),
            index: safe_float_field(raw, "oraclePx"),
            previous_close,
            change,
            percentage,
            quote_volume: safe_float_field(raw, "dayNtlVlm"),
        })
    }

    fn parse_error(&self, msg: &Value) -> (String, Vec<String>) {
        let text = match &msg["data"] {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        // The venue does not say which subscription failed.
        (text, Vec::new())
    }

    fn weights(&self) -> WeightTable {
        let mut table = WeightTable::new(20).with_endpoint("info", 20).with_endpoint("exchange", 1);
        for light in ["l2Book", "allMids", "clearinghouseState", "orderStatus"] {
            table = table.with_type("info", light, 2);
        }
        table
    }

    fn order_book_request(&self, market: &Market) -> (&'static str, Value) {
        ("info", json!({ "type": "l2Book", "coin": Self::coin(market) }))
    }
}
