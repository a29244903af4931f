// =============================================================================
// Order Book Engine - per-symbol snapshot/delta merge
// =============================================================================
//
// Per symbol:  UNINITIALIZED --snapshot--> SYNCED --snapshot--> SYNCED (fresh)
//
// Ladders are sorted `Vec<(price, size)>` kept strictly monotonic after every
// mutation: bids descending, asks ascending, no duplicate prices, no zero
// sizes. A symbol's book is owned by exactly one connection at a time; the
// claim is checked at subscribe time.
// =============================================================================

use std::cmp::Ordering;
use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{Result, StreamError};
use crate::types::{iso8601, BookUpdate};

/// Which direction a ladder is sorted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookSide {
    Bids,
    Asks,
}

/// One side of the book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ladder {
    side: BookSide,
    levels: Vec<(f64, f64)>,
}

impl Ladder {
    pub fn new(side: BookSide) -> Self {
        Self {
            side,
            levels: Vec::new(),
        }
    }

    /// Ordering of `price` relative to a resting level, in ladder order.
    fn order(&self, level_price: f64, price: f64) -> Ordering {
        match self.side {
            BookSide::Bids => price.total_cmp(&level_price),
            BookSide::Asks => level_price.total_cmp(&price),
        }
    }

    /// Insert, replace or (size <= 0) remove the level at `price`.
    pub fn store(&mut self, price: f64, size: f64) {
        if !price.is_finite() {
            return;
        }
        let found = self
            .levels
            .binary_search_by(|&(p, _)| self.order(p, price));
        match (found, size > 0.0) {
            (Ok(i), true) => self.levels[i].1 = size,
            (Ok(i), false) => {
                self.levels.remove(i);
            }
            (Err(i), true) => self.levels.insert(i, (price, size)),
            (Err(_), false) => {}
        }
    }

    /// Replace every level, dropping non-positive sizes.
    pub fn replace(&mut self, levels: &[(f64, f64)]) {
        self.levels = levels
            .iter()
            .copied()
            .filter(|&(p, s)| s > 0.0 && p.is_finite())
            .collect();
        let side = self.side;
        self.levels.sort_by(|a, b| match side {
            BookSide::Bids => b.0.total_cmp(&a.0),
            BookSide::Asks => a.0.total_cmp(&b.0),
        });
        self.levels.dedup_by(|later, earlier| later.0 == earlier.0);
    }

    pub fn top(&self, n: usize) -> &[(f64, f64)] {
        &self.levels[..n.min(self.levels.len())]
    }

    pub fn best(&self) -> Option<(f64, f64)> {
        self.levels.first().copied()
    }

    pub fn levels(&self) -> &[(f64, f64)] {
        &self.levels
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// True when prices are strictly monotonic in ladder order.
    pub fn is_sorted(&self) -> bool {
        self.levels
            .windows(2)
            .all(|w| self.order(w[0].0, w[1].0) == Ordering::Less)
    }
}

/// Book state for a single symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: String,
    pub bids: Ladder,
    pub asks: Ladder,
    /// Last applied sequence / nonce.
    pub nonce: Option<u64>,
    pub timestamp: Option<i64>,
    pub datetime: Option<String>,
}

impl OrderBook {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            bids: Ladder::new(BookSide::Bids),
            asks: Ladder::new(BookSide::Asks),
            nonce: None,
            timestamp: None,
            datetime: None,
        }
    }

    /// Replace both ladders wholesale.
    pub fn reset(&mut self, snapshot: &BookUpdate) {
        self.bids.replace(&snapshot.bids);
        self.asks.replace(&snapshot.asks);
        self.nonce = snapshot.nonce;
        self.stamp(snapshot.timestamp);
    }

    /// Merge a delta. A delta whose nonce does not advance the book is
    /// rejected with `StaleData` and leaves the book untouched.
    pub fn apply_delta(&mut self, delta: &BookUpdate) -> Result<()> {
        if let (Some(incoming), Some(last)) = (delta.nonce, self.nonce) {
            if incoming <= last {
                return Err(StreamError::StaleData {
                    symbol: self.symbol.clone(),
                    incoming,
                    last,
                });
            }
        }
        for &(price, size) in &delta.bids {
            self.bids.store(price, size);
        }
        for &(price, size) in &delta.asks {
            self.asks.store(price, size);
        }
        if delta.nonce.is_some() {
            self.nonce = delta.nonce;
        }
        self.stamp(delta.timestamp);
        Ok(())
    }

    fn stamp(&mut self, timestamp: Option<i64>) {
        if timestamp.is_some() {
            self.timestamp = timestamp;
            self.datetime = timestamp.and_then(iso8601);
        }
    }

    /// Copy of the book truncated to the top `n` levels per side.
    pub fn limit(&self, n: Option<usize>) -> OrderBook {
        let mut view = self.clone();
        if let Some(n) = n {
            view.bids.levels.truncate(n);
            view.asks.levels.truncate(n);
        }
        view
    }

    pub fn spread(&self) -> Option<f64> {
        Some(self.asks.best()?.0 - self.bids.best()?.0)
    }
}

/// Synchronisation state of a symbol's book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookState {
    Uninitialized,
    Synced,
}

/// Outcome of applying a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    Applied,
    /// No snapshot yet; the delta was dropped.
    Uninitialized,
    /// Sequence regression; the delta was dropped.
    Stale,
}

/// Manages order books for multiple symbols plus their connection owners.
pub struct OrderBookManager {
    books: RwLock<HashMap<String, OrderBook>>,
    owners: RwLock<HashMap<String, u64>>,
}

impl OrderBookManager {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
            owners: RwLock::new(HashMap::new()),
        }
    }

    /// Claim `symbol` for connection `owner`. Idempotent for the same owner.
    pub fn claim(&self, symbol: &str, owner: u64) -> Result<()> {
        let mut owners = self.owners.write();
        match owners.get(symbol) {
            Some(&current) if current != owner => Err(StreamError::OwnershipConflict {
                symbol: symbol.to_string(),
                owner: current,
            }),
            _ => {
                owners.insert(symbol.to_string(), owner);
                Ok(())
            }
        }
    }

    /// Drop every claim held by `owner` (its connection went away).
    pub fn release_owner(&self, owner: u64) {
        self.owners.write().retain(|_, o| *o != owner);
    }

    pub fn owner(&self, symbol: &str) -> Option<u64> {
        self.owners.read().get(symbol).copied()
    }

    /// Create or wholesale replace the book for the snapshot's symbol.
    pub fn apply_snapshot(&self, snapshot: &BookUpdate) {
        let mut books = self.books.write();
        books
            .entry(snapshot.symbol.clone())
            .or_insert_with(|| OrderBook::new(&snapshot.symbol))
            .reset(snapshot);
    }

    /// Merge a delta into an already synced book.
    pub fn apply_delta(&self, delta: &BookUpdate) -> DeltaOutcome {
        let mut books = self.books.write();
        let Some(book) = books.get_mut(&delta.symbol) else {
            debug!(symbol = %delta.symbol, "delta before snapshot dropped");
            return DeltaOutcome::Uninitialized;
        };
        match book.apply_delta(delta) {
            Ok(()) => DeltaOutcome::Applied,
            Err(e) => {
                debug!(error = %e, "stale delta dropped");
                DeltaOutcome::Stale
            }
        }
    }

    pub fn state(&self, symbol: &str) -> BookState {
        if self.books.read().contains_key(symbol) {
            BookState::Synced
        } else {
            BookState::Uninitialized
        }
    }

    /// Top `n` levels per side without mutating the book.
    pub fn limit(&self, symbol: &str, n: Option<usize>) -> Option<OrderBook> {
        self.books.read().get(symbol).map(|b| b.limit(n))
    }

    pub fn symbols(&self) -> Vec<String> {
        self.books.read().keys().cloned().collect()
    }
}

impl Default for OrderBookManager {
    fn default() -> Self {
        Self::new()
    }
}
