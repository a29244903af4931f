// =============================================================================
// Transport - raw duplex text-frame primitive under a Connection
// =============================================================================

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::errors::{Result, StreamError};

/// Outbound half: accepts serialized text frames.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = StreamError> + Send>>;

/// Inbound half: yields text frames until the peer goes away.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Opens a duplex transport to a URL.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream)>;
}

/// WebSocket transport backed by tokio-tungstenite.
///
/// Binary frames are decoded as UTF-8. Protocol-level ping/pong frames are
/// answered by tungstenite itself and never surface. A close frame ends the
/// stream with a connection error.
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream)> {
        let (ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| StreamError::connection(url, e))?;
        debug!(url, "websocket handshake complete");

        let (sink, stream) = ws.split();

        let sink_url = url.to_string();
        let sink = sink
            .sink_map_err(move |e| StreamError::connection(&sink_url, e))
            .with(|frame: String| future::ready(Ok::<_, StreamError>(Message::Text(frame))));

        let stream_url = url.to_string();
        let stream = stream.filter_map(move |msg| {
            let url = stream_url.clone();
            async move {
                match msg {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(Message::Binary(bytes)) => Some(
                        String::from_utf8(bytes).map_err(|e| StreamError::protocol(e)),
                    ),
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => None,
                    Ok(Message::Close(frame)) => {
                        let reason = frame
                            .map(|f| format!("close frame: {} {}", f.code, f.reason))
                            .unwrap_or_else(|| "close frame".to_string());
                        Some(Err(StreamError::connection(url, reason)))
                    }
                    Err(e) => Some(Err(StreamError::connection(url, e))),
                }
            }
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}
