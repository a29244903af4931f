pub mod connection;
pub mod router;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock;

pub use connection::{Connection, ConnectionStatus, KeepaliveConfig};
pub use router::{Dispatch, MessageHandler, Router, Slot, SlotReader};
pub use transport::{Connector, FrameSink, FrameStream, TungsteniteConnector};
