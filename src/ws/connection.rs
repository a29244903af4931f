// =============================================================================
// Connection - one duplex transport per URL with keepalive
// =============================================================================
//
// A single driver task owns the transport and multiplexes four event sources:
// inbound frames, queued outbound frames, the keepalive tick and an explicit
// close. Inbound frames are therefore processed strictly one at a time.
//
// When the transport drops or the pong deadline passes, the connection moves
// to `Reconnecting`, closes the transport and fails every slot registered on
// it with a retryable connection error. It never reconnects by itself.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::errors::{Result, StreamError};
use crate::rate_limit::RateLimiter;
use crate::ws::router::{Dispatch, MessageHandler, Slot, SlotReader};
use crate::ws::transport::{Connector, FrameSink, FrameStream};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Open,
    /// Transport lost; the caller must reconnect explicitly.
    Reconnecting,
    /// Closed on request.
    Closed,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Application-level ping policy.
#[derive(Debug, Clone, Copy)]
pub struct KeepaliveConfig {
    interval: Duration,
    /// Pong deadline as a multiple of `interval`.
    timeout_factor: u32,
}

const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

impl KeepaliveConfig {
    /// A zero `interval` falls back to the default; the driver's tick needs a
    /// non-zero period.
    pub fn new(interval: Duration, timeout_factor: u32) -> Self {
        let interval = if interval.is_zero() {
            warn!(default_ms = DEFAULT_KEEPALIVE_INTERVAL.as_millis() as u64, "zero keepalive interval, using default");
            DEFAULT_KEEPALIVE_INTERVAL
        } else {
            interval
        };
        Self {
            interval,
            timeout_factor: timeout_factor.max(1),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.interval * self.timeout_factor
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self::new(DEFAULT_KEEPALIVE_INTERVAL, 2)
    }
}

// ---------------------------------------------------------------------------
// Registrations
// ---------------------------------------------------------------------------

/// Keys registered on a connection and the subscribe frames they share.
struct Registry<V> {
    slots: HashMap<String, Arc<Slot<V>>>,
    key_frames: HashMap<String, String>,
    frame_keys: HashMap<String, HashSet<String>>,
}

impl<V> Default for Registry<V> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
            key_frames: HashMap::new(),
            frame_keys: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

pub struct Connection<V> {
    id: u64,
    url: String,
    status: RwLock<ConnectionStatus>,
    last_pong: Mutex<Instant>,
    keepalive: KeepaliveConfig,
    registry: Mutex<Registry<V>>,
    outbound: mpsc::UnboundedSender<String>,
    shutdown: Arc<Notify>,
    limiter: Option<Arc<RateLimiter>>,
}

impl<V: Clone + Send + Sync + 'static> Connection<V> {
    /// Open a transport to `url` and spawn its driver task.
    pub async fn open(
        connector: &dyn Connector,
        url: &str,
        handler: Arc<dyn MessageHandler<V>>,
        keepalive: KeepaliveConfig,
        limiter: Option<Arc<RateLimiter>>,
    ) -> Result<Arc<Self>> {
        let (sink, stream) = connector.connect(url).await?;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(Notify::new());

        let conn = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            url: url.to_string(),
            status: RwLock::new(ConnectionStatus::Open),
            last_pong: Mutex::new(Instant::now()),
            keepalive,
            registry: Mutex::new(Registry::default()),
            outbound,
            shutdown: shutdown.clone(),
            limiter,
        });

        info!(url = %conn.url, id = conn.id, "connection open");

        tokio::spawn(drive(
            Arc::downgrade(&conn),
            sink,
            stream,
            outbound_rx,
            shutdown,
            handler,
            keepalive,
        ));

        Ok(conn)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    pub fn is_open(&self) -> bool {
        self.status() == ConnectionStatus::Open
    }

    pub fn keepalive(&self) -> KeepaliveConfig {
        self.keepalive
    }

    /// Time since the last pong (or since open).
    pub fn since_last_pong(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Message keys currently registered, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.registry.lock().slots.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn ensure_open(&self) -> Result<()> {
        match self.status() {
            ConnectionStatus::Open => Ok(()),
            ConnectionStatus::Reconnecting => Err(StreamError::connection(
                &self.url,
                "connection lost, reconnect required",
            )),
            ConnectionStatus::Closed => Err(StreamError::connection(&self.url, "connection closed")),
        }
    }

    /// Queue a frame, paying `cost` to the limiter first when non-zero.
    pub async fn send(&self, frame: String, cost: u32) -> Result<()> {
        self.ensure_open()?;
        if cost > 0 {
            if let Some(limiter) = &self.limiter {
                limiter.throttle(cost).await;
            }
        }
        self.outbound
            .send(frame)
            .map_err(|_| StreamError::connection(&self.url, "connection driver stopped"))
    }

    /// Register `key`, sending `frame` only if no registered key already
    /// sent an identical one. Returns a reader of the key's slot that sees
    /// every resolution made after the registration.
    pub async fn subscribe(&self, key: &str, frame: Option<String>, cost: u32) -> Result<SlotReader<V>> {
        self.ensure_open()?;

        let (reader, first_frame) = {
            let mut guard = self.registry.lock();
            let reg = &mut *guard;
            if let Some(slot) = reg.slots.get(key).cloned() {
                (slot.reader(), None)
            } else {
                Self::register(reg, key, frame)
            }
        };
        // A drop racing the registration may have failed the slots before
        // this one was added.
        self.ensure_open()?;

        match first_frame {
            Some(frame) => {
                debug!(url = %self.url, key, "sending subscribe frame");
                self.send(frame, cost).await?;
            }
            None => debug!(url = %self.url, key, "key registered without new frame"),
        }
        Ok(reader)
    }

    fn register(reg: &mut Registry<V>, key: &str, frame: Option<String>) -> (SlotReader<V>, Option<String>) {
        let slot = Arc::new(Slot::new(key));
        reg.slots.insert(key.to_string(), slot.clone());

        let mut first_frame = None;
        if let Some(frame) = frame {
            let keys = reg.frame_keys.entry(frame.clone()).or_default();
            if keys.is_empty() {
                first_frame = Some(frame.clone());
            }
            keys.insert(key.to_string());
            reg.key_frames.insert(key.to_string(), frame);
        }
        (slot.reader(), first_frame)
    }

    /// Drop `key`. `frame` is sent only when no remaining key shares the
    /// subscribe frame `key` was registered with.
    pub async fn unsubscribe(&self, key: &str, frame: Option<String>) -> Result<()> {
        let last = {
            let mut guard = self.registry.lock();
            let reg = &mut *guard;
            if reg.slots.remove(key).is_none() {
                return Ok(());
            }
            match reg.key_frames.remove(key) {
                Some(sub) => {
                    let empty = reg.frame_keys.get_mut(&sub).map_or(false, |keys| {
                        keys.remove(key);
                        keys.is_empty()
                    });
                    if empty {
                        reg.frame_keys.remove(&sub);
                    }
                    empty
                }
                None => false,
            }
        };

        if let (true, Some(frame)) = (last, frame) {
            debug!(url = %self.url, key, "sending unsubscribe frame");
            self.send(frame, 0).await?;
        }
        Ok(())
    }

    /// Close on request. Pending slots fail with a connection error.
    pub fn close(&self) {
        *self.status.write() = ConnectionStatus::Closed;
        self.shutdown.notify_one();
    }

    // -------------------------------------------------------------------------
    // Driver callbacks
    // -------------------------------------------------------------------------

    fn slot(&self, key: &str) -> Option<Arc<Slot<V>>> {
        self.registry.lock().slots.get(key).cloned()
    }

    fn all_slots(&self) -> Vec<Arc<Slot<V>>> {
        self.registry.lock().slots.values().cloned().collect()
    }

    fn on_frame(&self, text: &str, handler: &dyn MessageHandler<V>) {
        let msg: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                debug!(url = %self.url, error = %e, "dropping malformed frame");
                return;
            }
        };

        if handler.is_pong(&msg) {
            *self.last_pong.lock() = Instant::now();
            return;
        }

        match handler.dispatch(&msg) {
            Dispatch::Resolve(updates) => {
                for (key, value) in updates {
                    if let Some(slot) = self.slot(&key) {
                        slot.resolve(Ok(value));
                    }
                }
            }
            Dispatch::Reject { keys, error } => {
                warn!(url = %self.url, keys = ?keys, error = %error, "exchange error");
                let slots = if keys.is_empty() {
                    self.all_slots()
                } else {
                    keys.iter().filter_map(|k| self.slot(k)).collect()
                };
                for slot in slots {
                    slot.resolve(Err(error.clone()));
                }
            }
            Dispatch::Ignore => {}
        }
    }

    fn on_closed(&self, reason: &str, handler: &dyn MessageHandler<V>) {
        let requested = {
            let mut status = self.status.write();
            if *status == ConnectionStatus::Open {
                *status = ConnectionStatus::Reconnecting;
                false
            } else {
                true
            }
        };

        if requested {
            info!(url = %self.url, id = self.id, "connection closed");
        } else {
            warn!(url = %self.url, id = self.id, reason, "connection lost");
        }

        // Claims tied to this connection go before any watcher wakes up and
        // retries.
        handler.on_disconnect(self.id, &self.url);
        let error = StreamError::connection(&self.url, reason);
        for slot in self.all_slots() {
            slot.resolve(Err(error.clone()));
        }
    }
}

impl<V> std::fmt::Debug for Connection<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("status", &*self.status.read())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Driver task
// ---------------------------------------------------------------------------

async fn drive<V: Clone + Send + Sync + 'static>(
    conn: Weak<Connection<V>>,
    mut sink: FrameSink,
    mut stream: FrameStream,
    mut outbound: mpsc::UnboundedReceiver<String>,
    shutdown: Arc<Notify>,
    handler: Arc<dyn MessageHandler<V>>,
    keepalive: KeepaliveConfig,
) {
    let mut ticker = interval_at(Instant::now() + keepalive.interval(), keepalive.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason: String = loop {
        tokio::select! {
            _ = shutdown.notified() => break "closed by caller".to_string(),

            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        break e.to_string();
                    }
                }
                None => break "connection dropped".to_string(),
            },

            _ = ticker.tick() => {
                let Some(conn) = conn.upgrade() else {
                    break "connection dropped".to_string();
                };
                let silent = conn.since_last_pong();
                if silent >= keepalive.timeout() {
                    warn!(url = %conn.url, silent_ms = silent.as_millis() as u64, "pong deadline missed");
                    break format!("no pong for {} ms", silent.as_millis());
                }
                if let Err(e) = sink.send(handler.ping_frame()).await {
                    break e.to_string();
                }
            }

            inbound = stream.next() => match inbound {
                Some(Ok(text)) => {
                    let Some(conn) = conn.upgrade() else {
                        break "connection dropped".to_string();
                    };
                    conn.on_frame(&text, handler.as_ref());
                }
                Some(Err(StreamError::Protocol(reason))) => {
                    debug!(reason = %reason, "dropping undecodable frame");
                }
                Some(Err(e)) => {
                    error!(error = %e, "transport read error");
                    break e.to_string();
                }
                None => break "stream closed by peer".to_string(),
            },
        }
    };

    let _ = sink.close().await;
    if let Some(conn) = conn.upgrade() {
        conn.on_closed(&reason, handler.as_ref());
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::mock::{MockConnector, TestHandler};
    use serde_json::json;

    const URL: &str = "wss://mock.test/ws";

    async fn open(
        connector: &Arc<MockConnector>,
        handler: Arc<TestHandler>,
    ) -> Arc<Connection<i64>> {
        Connection::open(
            connector.as_ref(),
            URL,
            handler,
            KeepaliveConfig::new(Duration::from_secs(20), 2),
            None,
        )
        .await
        .unwrap()
    }

    #[test]
    fn zero_keepalive_interval_falls_back_to_default() {
        let keepalive = KeepaliveConfig::new(Duration::ZERO, 0);
        assert_eq!(keepalive.interval(), Duration::from_secs(20));
        assert_eq!(keepalive.timeout(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_keepalive_connection_still_delivers_frames() {
        let connector = MockConnector::new();
        let conn = Connection::<i64>::open(
            connector.as_ref(),
            URL,
            Arc::new(TestHandler::default()),
            KeepaliveConfig::new(Duration::ZERO, 2),
            None,
        )
        .await
        .unwrap();
        let mut peer = connector.take_peer().unwrap();

        let mut slot = conn.subscribe("k", Some("{\"sub\":1}".into()), 0).await.unwrap();
        assert_eq!(peer.recv_within(Duration::from_secs(1)).await, Some(json!({"sub": 1})));
        peer.send_json(json!({"channel": "data", "key": "k", "value": 3}));
        assert_eq!(slot.wait(Duration::from_secs(1)).await, Ok(3));
        assert!(conn.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn missed_pong_fails_pending_watch_and_enters_reconnecting() {
        let connector = MockConnector::new();
        let handler = Arc::new(TestHandler::default());
        let conn = open(&connector, handler.clone()).await;
        let mut peer = connector.take_peer().unwrap();

        let mut slot = conn.subscribe("k", Some("{\"sub\":1}".into()), 0).await.unwrap();
        let start = Instant::now();
        let result = slot.wait(Duration::from_secs(100)).await;

        assert!(matches!(result, Err(StreamError::Connection { .. })), "{result:?}");
        assert_eq!(start.elapsed(), Duration::from_secs(40));
        assert_eq!(conn.status(), ConnectionStatus::Reconnecting);
        assert_eq!(handler.disconnects.lock().as_slice(), &[conn.id()]);

        // The subscribe frame and one ping went out before the deadline.
        assert_eq!(peer.recv_json().await, Some(json!({"sub": 1})));
        assert_eq!(peer.recv_json().await, Some(json!({"method": "ping"})));

        // Future watches on the dead connection fail too.
        let again = conn.subscribe("other", None, 0).await;
        assert!(matches!(again, Err(StreamError::Connection { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn pongs_keep_connection_open() {
        let connector = MockConnector::new();
        let conn = open(&connector, Arc::new(TestHandler::default())).await;
        let mut peer = connector.take_peer().unwrap();

        let responder = tokio::spawn(async move {
            let mut pings = 0;
            while let Some(frame) = peer.recv_json().await {
                if frame["method"] == "ping" {
                    pings += 1;
                    peer.send_json(json!({"channel": "pong"}));
                }
                if pings == 10 {
                    break;
                }
            }
            (pings, peer)
        });

        let (pings, _peer) = responder.await.unwrap();
        assert_eq!(pings, 10);
        assert!(conn.is_open());
        assert!(conn.since_last_pong() <= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frames_are_dropped() {
        let connector = MockConnector::new();
        let conn = open(&connector, Arc::new(TestHandler::default())).await;
        let peer = connector.take_peer().unwrap();
        let mut slot = conn.subscribe("k", None, 0).await.unwrap();

        peer.send_raw("definitely not json");
        peer.send_json(json!({"channel": "unknown"}));
        peer.send_json(json!({"channel": "data", "key": "k", "value": 7}));

        assert_eq!(slot.wait(Duration::from_secs(5)).await, Ok(7));
        assert!(conn.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn peer_drop_fails_slots_with_connection_error() {
        let connector = MockConnector::new();
        let conn = open(&connector, Arc::new(TestHandler::default())).await;
        let peer = connector.take_peer().unwrap();
        let a = conn.subscribe("a", None, 0).await.unwrap();
        let b = conn.subscribe("b", None, 0).await.unwrap();

        drop(peer);

        for mut slot in [a, b] {
            let err = slot.wait(Duration::from_secs(5)).await.unwrap_err();
            assert!(err.is_retryable());
        }
        assert_eq!(conn.status(), ConnectionStatus::Reconnecting);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disconnect_hook_runs_before_watchers_wake() {
        let connector = MockConnector::new();
        let handler = Arc::new(TestHandler::default());
        let conn = open(&connector, handler.clone()).await;
        let peer = connector.take_peer().unwrap();
        let mut slot = conn.subscribe("k", None, 0).await.unwrap();

        let waiter = {
            let handler = handler.clone();
            tokio::spawn(async move {
                let result = slot.wait(Duration::from_secs(5)).await;
                (result, handler.disconnects.lock().len())
            })
        };
        drop(peer);

        let (result, disconnects_seen) = waiter.await.unwrap();
        assert!(result.unwrap_err().is_retryable());
        assert_eq!(disconnects_seen, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shared_frame_sent_once_and_unsubscribed_after_last_key() {
        let connector = MockConnector::new();
        let conn = open(&connector, Arc::new(TestHandler::default())).await;
        let mut peer = connector.take_peer().unwrap();

        let frame = json!({"method": "subscribe", "subscription": {"type": "orderUpdates"}}).to_string();
        conn.subscribe("order", Some(frame.clone()), 0).await.unwrap();
        conn.subscribe("order:BTC", Some(frame.clone()), 0).await.unwrap();
        conn.subscribe("order", Some(frame.clone()), 0).await.unwrap();
        assert_eq!(conn.keys(), vec!["order", "order:BTC"]);

        let sent = peer.recv_within(Duration::from_millis(50)).await.unwrap();
        assert_eq!(sent["method"], "subscribe");
        assert!(peer.recv_within(Duration::from_millis(50)).await.is_none());

        let unsub = json!({"method": "unsubscribe"}).to_string();
        conn.unsubscribe("order", Some(unsub.clone())).await.unwrap();
        assert!(peer.recv_within(Duration::from_millis(50)).await.is_none());
        conn.unsubscribe("order:BTC", Some(unsub)).await.unwrap();
        assert_eq!(
            peer.recv_within(Duration::from_millis(50)).await,
            Some(json!({"method": "unsubscribe"}))
        );
        assert!(conn.keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn close_marks_closed_and_fails_slots() {
        let connector = MockConnector::new();
        let conn = open(&connector, Arc::new(TestHandler::default())).await;
        let _peer = connector.take_peer().unwrap();
        let mut slot = conn.subscribe("k", None, 0).await.unwrap();

        conn.close();
        assert!(slot.wait(Duration::from_secs(5)).await.is_err());
        assert_eq!(conn.status(), ConnectionStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_cost_is_paid_to_limiter() {
        let connector = MockConnector::new();
        let limiter = Arc::new(RateLimiter::new(10.0, 1.0));
        let conn = Connection::<i64>::open(
            connector.as_ref(),
            URL,
            Arc::new(TestHandler::default()),
            KeepaliveConfig::default(),
            Some(limiter.clone()),
        )
        .await
        .unwrap();
        let _peer = connector.take_peer().unwrap();

        conn.subscribe("a", Some("a".into()), 4).await.unwrap();
        conn.subscribe("a", Some("a".into()), 4).await.unwrap();
        assert!((limiter.available() - 6.0).abs() < 1e-6);
    }
}
