// =============================================================================
// Aurora Stream - unified streaming market-data client core
// =============================================================================
//
// Layering, bottom up:
//   ws          transport, keepalive, message-key router
//   market_data bounded caches, order-book engine, shared store
//   rate_limit  token bucket and REST weight tables
//   exchange    adapter contract, dispatcher, `Exchange` watch surface
// =============================================================================

pub mod config;
pub mod errors;
pub mod exchange;
pub mod market_data;
pub mod rate_limit;
pub mod rest;
pub mod types;
pub mod ws;

pub use config::StreamConfig;
pub use errors::{Result, StreamError};
pub use exchange::{Adapter, Exchange, Hyperliquid, Topic};
pub use market_data::{MarketStore, OrderBook};
pub use rate_limit::{RateLimiter, WeightTable};
