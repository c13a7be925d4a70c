//! WebSocket transport implementation using tokio-tungstenite
//!
//! Each relay frame is carried as one WebSocket text message holding the
//! frame's JSON encoding. Binary messages holding UTF-8 JSON are accepted on
//! receive. The transport is plain `ws://`; peers that need encryption put
//! the relay behind a TLS terminator.

pub mod config;
pub mod connection;
pub mod listener;

pub use config::{WebSocketConfig, MAX_INTERVAL};
pub use connection::WebSocketConnection;
pub use listener::{WebSocketConnector, WebSocketListener};
