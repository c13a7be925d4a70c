//! Shared relay state

use crate::records::CommandStore;
use crate::registry::PeerRegistry;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Registry and command records, guarded together
///
/// Routing and correlation read the registry and write records in one step,
/// so both live behind a single lock. Never hold the guard across a send.
#[derive(Debug, Default)]
pub struct RelayState {
    pub registry: PeerRegistry,
    pub records: CommandStore,
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedState {
        Arc::new(Mutex::new(Self::new()))
    }
}

pub type SharedState = Arc<Mutex<RelayState>>;
