// In-memory transport for tests: every `connect` hands the test a `MockPeer`
// standing in for the venue side of the socket.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{sink, stream};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::errors::{Result, StreamError};
use crate::ws::router::{Dispatch, MessageHandler};
use crate::ws::transport::{Connector, FrameSink, FrameStream};

/// Venue side of one mock connection.
pub struct MockPeer {
    pub url: String,
    to_client: mpsc::UnboundedSender<Result<String>>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MockPeer {
    pub fn send_json(&self, value: Value) {
        let _ = self.to_client.send(Ok(value.to_string()));
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.to_client.send(Ok(text.to_string()));
    }

    /// Next frame written by the client, parsed as JSON.
    pub async fn recv_json(&mut self) -> Option<Value> {
        let frame = self.from_client.recv().await?;
        serde_json::from_str(&frame).ok()
    }

    /// Next frame within `within`, or `None`.
    pub async fn recv_within(&mut self, within: Duration) -> Option<Value> {
        tokio::time::timeout(within, self.recv_json()).await.ok().flatten()
    }

    /// Next frame that is not a keepalive ping.
    pub async fn recv_non_ping(&mut self) -> Option<Value> {
        loop {
            let frame = self.recv_json().await?;
            if frame.get("method").and_then(Value::as_str) != Some("ping") {
                return Some(frame);
            }
        }
    }
}

#[derive(Default)]
pub struct MockConnector {
    peers: Mutex<Vec<MockPeer>>,
    refuse: AtomicBool,
    connects: AtomicU64,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take the peer of the most recent connection.
    pub fn take_peer(&self) -> Option<MockPeer> {
        self.peers.lock().pop()
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream)> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(StreamError::connection(url, "connection refused"));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);

        let (to_client, client_rx) = mpsc::unbounded_channel::<Result<String>>();
        let (client_tx, from_client) = mpsc::unbounded_channel::<String>();
        self.peers.lock().push(MockPeer {
            url: url.to_string(),
            to_client,
            from_client,
        });

        let sink_url = url.to_string();
        let frames = sink::unfold(client_tx, move |tx, frame: String| {
            let url = sink_url.clone();
            async move {
                tx.send(frame)
                    .map_err(|_| StreamError::connection(url, "peer gone"))?;
                Ok::<_, StreamError>(tx)
            }
        });
        let inbound = stream::unfold(client_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        Ok((Box::pin(frames), Box::pin(inbound)))
    }
}

/// Minimal handler: `{"channel":"pong"}` is a pong, `{"channel":"data",
/// "key":k,"value":n}` resolves `k` with `n`, and `{"channel":"error",
/// "keys":[..],"msg":..}` rejects the listed keys.
#[derive(Default)]
pub struct TestHandler {
    pub disconnects: Mutex<Vec<u64>>,
}

impl MessageHandler<i64> for TestHandler {
    fn ping_frame(&self) -> String {
        json!({"method": "ping"}).to_string()
    }

    fn is_pong(&self, msg: &Value) -> bool {
        msg.get("channel").and_then(Value::as_str) == Some("pong")
    }

    fn dispatch(&self, msg: &Value) -> Dispatch<i64> {
        match msg.get("channel").and_then(Value::as_str) {
            Some("data") => {
                let key = msg["key"].as_str().unwrap_or_default().to_string();
                let value = msg["value"].as_i64().unwrap_or_default();
                Dispatch::Resolve(vec![(key, value)])
            }
            Some("error") => Dispatch::Reject {
                keys: msg["keys"]
                    .as_array()
                    .map(|a| a.iter().filter_map(|k| k.as_str().map(String::from)).collect())
                    .unwrap_or_default(),
                error: StreamError::Exchange(msg["msg"].as_str().unwrap_or_default().to_string()),
            },
            _ => Dispatch::Ignore,
        }
    }

    fn on_disconnect(&self, conn_id: u64, _url: &str) {
        self.disconnects.lock().push(conn_id);
    }
}
