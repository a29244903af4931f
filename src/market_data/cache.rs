// =============================================================================
// Bounded Caches - fixed-capacity history windows
// =============================================================================
//
// All three variants keep at most `capacity` live entries and evict the oldest
// entry first. They are plain data structures; the store wraps them in locks.
//
//   ArrayCache      append-only, arrival order (raw trade prints)
//   TimestampCache  upsert by timeframe bucket, ascending by time (candles)
//   IdentityCache   upsert by id at original position (orders, fills)
// =============================================================================

use std::collections::{HashMap, VecDeque};

use crate::types::{Identified, Timestamped};

/// `min(requested, held)`; `None` requests everything held.
fn bounded(requested: Option<usize>, held: usize) -> usize {
    requested.map_or(held, |n| n.min(held))
}

// ---------------------------------------------------------------------------
// ArrayCache
// ---------------------------------------------------------------------------

/// Append-only ring with no identity.
#[derive(Debug, Clone)]
pub struct ArrayCache<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> ArrayCache<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
        }
    }

    pub fn append(&mut self, item: T) {
        self.items.push_back(item);
        while self.items.len() > self.capacity {
            self.items.pop_front();
        }
    }

    pub fn limit_for(&self, requested: Option<usize>) -> usize {
        bounded(requested, self.items.len())
    }

    /// Newest `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> Vec<T> {
        let start = self.items.len().saturating_sub(n);
        self.items.iter().skip(start).cloned().collect()
    }

    /// Newest `n` entries matching `pred`, oldest first.
    pub fn tail_where(&self, n: usize, pred: impl Fn(&T) -> bool) -> Vec<T> {
        let mut picked: Vec<T> = self.items.iter().rev().filter(|t| pred(t)).take(n).cloned().collect();
        picked.reverse();
        picked
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ---------------------------------------------------------------------------
// TimestampCache
// ---------------------------------------------------------------------------

/// Ring of time buckets kept in ascending order.
///
/// Inserting a record whose bucket already exists replaces it in place (the
/// open candle is still mutating); otherwise a new bucket is inserted at its
/// sorted position, normally the back.
#[derive(Debug, Clone)]
pub struct TimestampCache<T> {
    items: VecDeque<T>,
    capacity: usize,
    /// Bucket width in ms; `None` means the record's timestamp is the bucket.
    bucket_ms: Option<i64>,
}

impl<T: Clone + Timestamped> TimestampCache<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
            bucket_ms: None,
        }
    }

    /// Cache that aligns timestamps to `bucket_ms` before matching.
    pub fn with_bucket(capacity: usize, bucket_ms: i64) -> Self {
        let mut cache = Self::new(capacity);
        cache.bucket_ms = (bucket_ms > 0).then_some(bucket_ms);
        cache
    }

    fn bucket(&self, ts: i64) -> i64 {
        match self.bucket_ms {
            Some(width) => ts - ts.rem_euclid(width),
            None => ts,
        }
    }

    pub fn append(&mut self, item: T) {
        let bucket = self.bucket(item.timestamp());

        // Fast path: same bucket as the newest entry, or strictly newer.
        if let Some(last) = self.items.back() {
            let last_bucket = self.bucket(last.timestamp());
            if last_bucket == bucket {
                if let Some(slot) = self.items.back_mut() {
                    *slot = item;
                }
                return;
            }
            if last_bucket > bucket {
                let found = self
                    .items
                    .binary_search_by_key(&bucket, |c| self.bucket(c.timestamp()));
                match found {
                    Ok(i) => self.items[i] = item,
                    Err(0) if self.items.len() >= self.capacity => {
                        // Older than the whole window; it would be evicted at once.
                    }
                    Err(i) => {
                        self.items.insert(i, item);
                        self.trim();
                    }
                }
                return;
            }
        }

        self.items.push_back(item);
        self.trim();
    }

    fn trim(&mut self) {
        while self.items.len() > self.capacity {
            self.items.pop_front();
        }
    }

    pub fn limit_for(&self, requested: Option<usize>) -> usize {
        bounded(requested, self.items.len())
    }

    pub fn tail(&self, n: usize) -> Vec<T> {
        let start = self.items.len().saturating_sub(n);
        self.items.iter().skip(start).cloned().collect()
    }

    pub fn tail_where(&self, n: usize, pred: impl Fn(&T) -> bool) -> Vec<T> {
        let mut picked: Vec<T> = self.items.iter().rev().filter(|t| pred(t)).take(n).cloned().collect();
        picked.reverse();
        picked
    }

    pub fn last(&self) -> Option<&T> {
        self.items.back()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

// ---------------------------------------------------------------------------
// IdentityCache
// ---------------------------------------------------------------------------

/// Ring that collapses repeated deliveries of the same id.
///
/// Positions are tracked as absolute sequence numbers so that an upsert is
/// O(1) even after the front of the ring has been evicted.
#[derive(Debug, Clone)]
pub struct IdentityCache<T> {
    items: VecDeque<T>,
    capacity: usize,
    /// id -> absolute sequence of its entry.
    index: HashMap<String, u64>,
    /// Absolute sequence of `items[0]`.
    head: u64,
}

impl<T: Clone + Identified> IdentityCache<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
            index: HashMap::new(),
            head: 0,
        }
    }

    /// Replace the entry with the same id in place, or append a new one.
    pub fn append(&mut self, item: T) {
        if let Some(&seq) = self.index.get(item.id()) {
            let pos = (seq - self.head) as usize;
            self.items[pos] = item;
            return;
        }

        let seq = self.head + self.items.len() as u64;
        self.index.insert(item.id().to_string(), seq);
        self.items.push_back(item);

        while self.items.len() > self.capacity {
            if let Some(evicted) = self.items.pop_front() {
                self.index.remove(evicted.id());
            }
            self.head += 1;
        }
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        let seq = *self.index.get(id)?;
        self.items.get((seq - self.head) as usize)
    }

    pub fn limit_for(&self, requested: Option<usize>) -> usize {
        bounded(requested, self.items.len())
    }

    pub fn tail(&self, n: usize) -> Vec<T> {
        let start = self.items.len().saturating_sub(n);
        self.items.iter().skip(start).cloned().collect()
    }

    /// Newest `n` entries matching `pred`, oldest first.
    pub fn tail_where(&self, n: usize, pred: impl Fn(&T) -> bool) -> Vec<T> {
        let mut picked: Vec<T> = self.items.iter().rev().filter(|t| pred(t)).take(n).cloned().collect();
        picked.reverse();
        picked
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Ohlcv, Order, OrderStatus};

    fn order(id: &str, status: OrderStatus) -> Order {
        Order {
            id: id.to_string(),
            client_order_id: None,
            symbol: "BTC/USD".into(),
            side: None,
            order_type: None,
            price: None,
            amount: None,
            filled: None,
            remaining: None,
            status,
            timestamp: 0,
            datetime: None,
        }
    }

    fn candle(ts: i64, close: f64) -> Ohlcv {
        Ohlcv {
            symbol: "BTC/USD".into(),
            timeframe: "1m".into(),
            timestamp: ts,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn append_only_keeps_newest_window() {
        let mut cache = ArrayCache::new(3);
        for i in 1..=5 {
            cache.append(i);
        }
        assert_eq!(cache.tail(10), vec![3, 4, 5]);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn limit_for_is_min_of_requested_and_held() {
        let mut cache = ArrayCache::new(10);
        cache.append(1);
        cache.append(2);
        assert_eq!(cache.limit_for(Some(5)), 2);
        assert_eq!(cache.limit_for(Some(1)), 1);
        assert_eq!(cache.limit_for(None), 2);
        assert_eq!(cache.tail(cache.limit_for(Some(1))), vec![2]);
    }

    #[test]
    fn identity_upsert_collapses_at_original_position() {
        let mut cache = IdentityCache::new(10);
        cache.append(order("1", OrderStatus::Open));
        cache.append(order("2", OrderStatus::Open));
        cache.append(order("1", OrderStatus::Closed));

        let all = cache.tail(10);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "1");
        assert_eq!(all[0].status, OrderStatus::Closed);
        assert_eq!(all[1].id, "2");
    }

    #[test]
    fn identity_eviction_forgets_ids() {
        let mut cache = IdentityCache::new(2);
        cache.append(order("a", OrderStatus::Open));
        cache.append(order("b", OrderStatus::Open));
        cache.append(order("c", OrderStatus::Open));
        assert!(cache.get("a").is_none());

        // "b" is still addressable after the head moved.
        cache.append(order("b", OrderStatus::Canceled));
        assert_eq!(cache.get("b").map(|o| o.status), Some(OrderStatus::Canceled));
        assert_eq!(cache.len(), 2);

        // A re-delivered evicted id becomes a new entry at the back.
        cache.append(order("a", OrderStatus::Closed));
        let ids: Vec<String> = cache.iter().map(|o| o.id.clone()).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }

    #[test]
    fn timestamp_bucket_replaces_open_candle() {
        let mut cache = TimestampCache::new(3);
        cache.append(candle(0, 1.0));
        cache.append(candle(60_000, 2.0));
        cache.append(candle(60_000, 2.5));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.last().map(|c| c.close), Some(2.5));

        cache.append(candle(120_000, 3.0));
        cache.append(candle(180_000, 4.0));
        let closes: Vec<f64> = cache.tail(10).iter().map(|c| c.close).collect();
        assert_eq!(closes, vec![2.5, 3.0, 4.0]);
    }

    #[test]
    fn timestamp_cache_stays_sorted_on_late_bucket() {
        let mut cache = TimestampCache::new(5);
        cache.append(candle(0, 1.0));
        cache.append(candle(120_000, 3.0));
        cache.append(candle(60_000, 2.0));
        cache.append(candle(0, 1.5));
        let ts: Vec<i64> = cache.tail(10).iter().map(|c| c.timestamp).collect();
        assert_eq!(ts, vec![0, 60_000, 120_000]);
        assert_eq!(cache.tail(10)[0].close, 1.5);
    }

    #[test]
    fn timestamp_cache_aligns_to_bucket_width() {
        let mut cache = TimestampCache::with_bucket(5, 60_000);
        cache.append(candle(60_000, 1.0));
        cache.append(candle(60_500, 1.1));
        cache.append(candle(119_999, 1.2));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.last().map(|c| c.close), Some(1.2));
    }

    #[test]
    fn timestamp_cache_drops_bucket_older_than_full_window() {
        let mut cache = TimestampCache::new(2);
        cache.append(candle(60_000, 2.0));
        cache.append(candle(120_000, 3.0));
        cache.append(candle(0, 1.0));
        let ts: Vec<i64> = cache.tail(10).iter().map(|c| c.timestamp).collect();
        assert_eq!(ts, vec![60_000, 120_000]);
    }
}
