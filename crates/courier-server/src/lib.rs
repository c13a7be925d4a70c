//! Courier relay server
//!
//! Wires the WebSocket listener, the session handler and the retention
//! sweeper together and runs the accept loop until shutdown.

pub mod server;

pub use server::{shutdown_signal, RelayServer, RelayServerConfig, ServerError};
