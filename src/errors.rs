// =============================================================================
// Stream Errors - failure taxonomy of the streaming runtime
// =============================================================================
//
// Every failure is scoped to one connection or one watch call. Nothing here is
// process-fatal, and recovery (reconnect, resubscribe) is always an explicit
// caller action.
// =============================================================================

use std::time::Duration;

use thiserror::Error;

/// Convenience alias used throughout the library.
pub type Result<T, E = StreamError> = std::result::Result<T, E>;

/// Errors surfaced by connections, the router and the exchange facade.
///
/// `Clone` because a single connection failure is broadcast to every pending
/// slot registered on that connection.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StreamError {
    /// Transport drop or failed keepalive. Retryable.
    #[error("connection error on {url}: {reason}")]
    Connection { url: String, reason: String },

    /// Malformed or unrecognised frame. Dropped locally, never surfaced to
    /// watchers.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Explicit error payload sent by the venue.
    #[error("exchange error: {0}")]
    Exchange(String),

    /// No resolution arrived before the caller's deadline.
    #[error("timed out after {after:?} waiting for {key}")]
    Timeout { key: String, after: Duration },

    /// Order-book delta whose sequence does not advance the book.
    #[error("stale delta for {symbol}: sequence {incoming} <= {last}")]
    StaleData {
        symbol: String,
        incoming: u64,
        last: u64,
    },

    /// A second connection tried to own an already owned order book.
    #[error("order book {symbol} is owned by connection {owner}")]
    OwnershipConflict { symbol: String, owner: u64 },

    #[error("unknown symbol {0}")]
    UnknownSymbol(String),

    #[error("invalid channel table: {0}")]
    InvalidChannelTable(String),

    /// A watch needs configuration that is missing (e.g. a user address).
    #[error("configuration: {0}")]
    Config(String),

    /// Non-success HTTP status from a REST endpoint.
    #[error("http {status} from {endpoint}: {body}")]
    Http {
        endpoint: String,
        status: u16,
        body: String,
    },
}

impl StreamError {
    pub fn connection(url: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Connection {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    pub fn protocol(reason: impl std::fmt::Display) -> Self {
        Self::Protocol(reason.to_string())
    }

    /// Whether the caller may simply retry (after reconnecting, for
    /// connection errors).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }
}
