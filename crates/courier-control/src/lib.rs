//! Control plane for the relay
//!
//! Owns the peer registry and the command-record store, and implements the
//! session lifecycle around them: handshake, command routing, response
//! correlation, client list snapshots and background retention sweeps.
pub mod config;
pub mod correlator;
pub mod handler;
pub mod publisher;
pub mod records;
pub mod registry;
pub mod router;
pub mod state;
pub mod sweeper;

pub use config::{ConfigError, DuplicateIdPolicy, RelayConfig, MAX_WINDOW};
pub use correlator::{CorrelationOutcome, ResponseCorrelator};
pub use handler::{HandshakeError, RelayHandler};
pub use publisher::ClientListPublisher;
pub use records::CommandStore;
pub use registry::{Peer, PeerChannel, PeerRegistry};
pub use router::{CommandRouter, RouteOutcome, UndeliverableReason};
pub use state::{RelayState, SharedState};
pub use sweeper::{RetentionSweeper, SweepReport};
