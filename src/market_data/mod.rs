pub mod cache;
pub mod orderbook;
pub mod store;

pub use cache::{ArrayCache, IdentityCache, TimestampCache};
pub use orderbook::{BookState, DeltaOutcome, Ladder, OrderBook, OrderBookManager};
pub use store::{CacheLimits, CandleKey, MarketStore};
