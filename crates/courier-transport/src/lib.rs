//! Transport abstraction layer for relay sessions
//!
//! The control plane only ever talks to a peer through [`TransportConnection`]:
//! a send primitive that pushes one frame down the peer's channel, and a
//! receive primitive that yields the next inbound frame or `None` once the
//! peer is gone.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │              courier-control (registry, router)          │
//! └─────────────────────────────────────────────────────────┘
//!                           │ Uses traits
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │            courier-transport (this crate)                │
//! │  - TransportListener    - TransportConnection            │
//! │  - TransportConnector   - memory (in-process pairs)      │
//! └─────────────────────────────────────────────────────────┘
//!                           │ Implemented by
//!                           ↓
//!              courier-transport-websocket
//! ```

pub mod memory;

use async_trait::async_trait;
use courier_proto::{CodecError, Frame};
use std::fmt::Debug;
use std::net::SocketAddr;
use thiserror::Error;

pub use memory::MemoryConnection;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Failed to bind {address}:{port}: {reason}")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

impl From<CodecError> for TransportError {
    fn from(err: CodecError) -> Self {
        TransportError::ProtocolError(err.to_string())
    }
}

impl TransportError {
    /// Whether the peer sent something that could not be understood, as
    /// opposed to the channel itself failing
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, TransportError::ProtocolError(_))
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A live duplex channel to one peer
///
/// Implementations must be safe to share behind an `Arc`: one task receives
/// while any number of tasks send. Frames sent through one connection reach
/// the peer in send order.
#[async_trait]
pub trait TransportConnection: Send + Sync + Debug {
    /// Push one frame down the channel
    async fn send_frame(&self, frame: &Frame) -> TransportResult<()>;

    /// Wait for the next inbound frame
    ///
    /// Returns `None` once the peer has closed the channel or [`close`] was
    /// called locally. Undecodable input yields [`TransportError::ProtocolError`].
    ///
    /// [`close`]: TransportConnection::close
    async fn recv_frame(&self) -> TransportResult<Option<Frame>>;

    /// Close the channel; pending and future receives return `None`
    async fn close(&self, reason: &str);

    /// Check if the connection is closed
    fn is_closed(&self) -> bool;

    /// Get the remote peer address
    fn remote_address(&self) -> SocketAddr;

    /// Get connection statistics
    fn stats(&self) -> ConnectionStats;

    /// Stable identifier for this physical connection
    ///
    /// Distinguishes two sessions that registered under the same peer id.
    fn connection_id(&self) -> String;
}

/// Statistics about a connection
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    /// Number of frames sent
    pub frames_sent: u64,

    /// Number of frames received
    pub frames_received: u64,

    /// Number of bytes sent
    pub bytes_sent: u64,

    /// Number of bytes received
    pub bytes_received: u64,

    /// Connection uptime (seconds)
    pub uptime_secs: u64,
}

/// Server-side: Listens for incoming transport connections
#[async_trait]
pub trait TransportListener: Send + Sync + Debug {
    /// The connection type accepted by this listener
    type Connection: TransportConnection + 'static;

    /// Accept an incoming connection
    ///
    /// Returns the connection and the remote address of the connecting peer.
    async fn accept(&self) -> TransportResult<(Self::Connection, SocketAddr)>;

    /// Get the local address this listener is bound to
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Close the listener (stop accepting new connections)
    async fn close(&self);
}

/// Client-side: Establishes outgoing transport connections
#[async_trait]
pub trait TransportConnector: Send + Sync + Debug {
    /// The connection type created by this connector
    type Connection: TransportConnection + 'static;

    /// Connect to a relay
    async fn connect(&self, addr: SocketAddr) -> TransportResult<Self::Connection>;
}
