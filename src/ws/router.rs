// =============================================================================
// Subscription Router - message keys, latest-value slots, connection pool
// =============================================================================
//
// A slot is a notification primitive, not a queue: resolving a key overwrites
// the single buffered value and wakes every reader of it. The state readers
// actually consume (books, caches) lives elsewhere under its own lock, so a
// slow reader only ever sees the freshest state and never a backlog.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tracing::info;

use crate::errors::{Result, StreamError};
use crate::rate_limit::RateLimiter;
use crate::ws::connection::{Connection, ConnectionStatus, KeepaliveConfig};
use crate::ws::transport::Connector;

// ---------------------------------------------------------------------------
// Dispatch contract
// ---------------------------------------------------------------------------

/// Result of dispatching one decoded inbound message.
#[derive(Debug)]
pub enum Dispatch<V> {
    /// Resolve each key with its value. Keys nobody registered are skipped.
    Resolve(Vec<(String, V)>),
    /// Fail the listed keys; an empty list fails every key on the connection.
    Reject { keys: Vec<String>, error: StreamError },
    Ignore,
}

/// Venue-aware half of the reader path, called by the connection driver for
/// every inbound message.
pub trait MessageHandler<V>: Send + Sync + 'static {
    fn ping_frame(&self) -> String;

    fn is_pong(&self, msg: &Value) -> bool;

    fn dispatch(&self, msg: &Value) -> Dispatch<V>;

    /// Connection `conn_id` to `url` went away.
    fn on_disconnect(&self, _conn_id: u64, _url: &str) {}
}

// ---------------------------------------------------------------------------
// Slot
// ---------------------------------------------------------------------------

/// Latest-value slot of one message key.
pub struct Slot<V> {
    key: String,
    tx: watch::Sender<Option<Result<V>>>,
}

impl<V: Clone> Slot<V> {
    pub(crate) fn new(key: &str) -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            key: key.to_string(),
            tx,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Overwrite the buffered value and wake every reader.
    pub fn resolve(&self, value: Result<V>) {
        self.tx.send_replace(Some(value));
    }

    /// A new consumer of this key. It sees resolutions made after this call.
    pub fn reader(self: &Arc<Self>) -> SlotReader<V> {
        SlotReader {
            rx: self.tx.subscribe(),
            slot: self.clone(),
        }
    }
}

/// One consumer's view of a [`Slot`]. Each reader tracks what it has already
/// seen, so every consumer gets the latest value exactly once.
pub struct SlotReader<V> {
    slot: Arc<Slot<V>>,
    rx: watch::Receiver<Option<Result<V>>>,
}

impl<V: Clone> SlotReader<V> {
    pub fn key(&self) -> &str {
        self.slot.key()
    }

    /// Return the latest value this reader has not seen, else suspend until
    /// the next resolution or until `timeout` elapses. Resolutions made while
    /// the reader was away collapse into the newest one. A timeout leaves the
    /// reader and the key's registration untouched.
    pub async fn wait(&mut self, timeout: Duration) -> Result<V> {
        // The reader holds the slot, so the sender outlives it.
        if !self.rx.has_changed().unwrap_or(false)
            && tokio::time::timeout(timeout, self.rx.changed()).await.is_err()
        {
            return Err(StreamError::Timeout {
                key: self.slot.key.clone(),
                after: timeout,
            });
        }

        self.rx
            .borrow_and_update()
            .clone()
            .unwrap_or_else(|| Err(StreamError::protocol(format!("{} woken without value", self.slot.key))))
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Pool of connections keyed by URL plus the subscribe/watch surface.
pub struct Router<V> {
    connector: Arc<dyn Connector>,
    handler: Arc<dyn MessageHandler<V>>,
    keepalive: KeepaliveConfig,
    limiter: Option<Arc<RateLimiter>>,
    connections: tokio::sync::Mutex<HashMap<String, Arc<Connection<V>>>>,
}

impl<V: Clone + Send + Sync + 'static> Router<V> {
    pub fn new(
        connector: Arc<dyn Connector>,
        handler: Arc<dyn MessageHandler<V>>,
        keepalive: KeepaliveConfig,
    ) -> Self {
        Self {
            connector,
            handler,
            keepalive,
            limiter: None,
            connections: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Charge subscribe costs to `limiter`.
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Return the live connection to `url`, opening one if none exists.
    ///
    /// A connection that dropped is not replaced here: this fails with a
    /// connection error until [`reconnect`](Self::reconnect) is called.
    pub async fn connect(&self, url: &str) -> Result<Arc<Connection<V>>> {
        let mut pool = self.connections.lock().await;
        if let Some(conn) = pool.get(url) {
            match conn.status() {
                ConnectionStatus::Open => return Ok(conn.clone()),
                ConnectionStatus::Reconnecting => {
                    return Err(StreamError::connection(url, "connection lost, reconnect required"))
                }
                ConnectionStatus::Closed => {}
            }
        }
        let conn = self.open(url).await?;
        pool.insert(url.to_string(), conn.clone());
        Ok(conn)
    }

    /// Discard whatever connection `url` has and open a fresh one. Nothing is
    /// resubscribed; the next watch of each key sends its frame again.
    pub async fn reconnect(&self, url: &str) -> Result<Arc<Connection<V>>> {
        let mut pool = self.connections.lock().await;
        if let Some(old) = pool.remove(url) {
            info!(url, id = old.id(), status = %old.status(), "replacing connection");
            old.close();
        }
        let conn = self.open(url).await?;
        pool.insert(url.to_string(), conn.clone());
        Ok(conn)
    }

    /// Like [`reconnect`](Self::reconnect), but a connection that is still
    /// open is returned unchanged. Safe to call from several watchers that
    /// all saw the same drop.
    pub async fn restore(&self, url: &str) -> Result<Arc<Connection<V>>> {
        let mut pool = self.connections.lock().await;
        if let Some(conn) = pool.get(url) {
            if conn.is_open() {
                return Ok(conn.clone());
            }
        }
        let conn = self.open(url).await?;
        if let Some(old) = pool.insert(url.to_string(), conn.clone()) {
            info!(url, old = old.id(), new = conn.id(), "connection restored");
        }
        Ok(conn)
    }

    async fn open(&self, url: &str) -> Result<Arc<Connection<V>>> {
        Connection::open(
            self.connector.as_ref(),
            url,
            self.handler.clone(),
            self.keepalive,
            self.limiter.clone(),
        )
        .await
    }

    pub async fn connection(&self, url: &str) -> Option<Arc<Connection<V>>> {
        self.connections.lock().await.get(url).cloned()
    }

    /// Register `key` on the connection to `url`; see [`Connection::subscribe`].
    pub async fn subscribe(
        &self,
        url: &str,
        key: &str,
        frame: Option<String>,
        cost: u32,
    ) -> Result<SlotReader<V>> {
        let conn = self.connect(url).await?;
        conn.subscribe(key, frame, cost).await
    }

    /// Subscribe and wait for the next resolution of `key`.
    pub async fn watch(
        &self,
        url: &str,
        key: &str,
        frame: Option<String>,
        cost: u32,
        timeout: Duration,
    ) -> Result<V> {
        let mut reader = self.subscribe(url, key, frame, cost).await?;
        reader.wait(timeout).await
    }

    pub async fn unsubscribe(&self, url: &str, key: &str, frame: Option<String>) -> Result<()> {
        match self.connection(url).await {
            Some(conn) if conn.is_open() => conn.unsubscribe(key, frame).await,
            _ => Ok(()),
        }
    }

    pub async fn close_all(&self) {
        let mut pool = self.connections.lock().await;
        for (_, conn) in pool.drain() {
            conn.close();
        }
    }
}
