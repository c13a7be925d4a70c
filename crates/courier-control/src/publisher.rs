//! Client list snapshots

use crate::config::RelayConfig;
use crate::state::SharedState;
use chrono::{DateTime, Utc};
use courier_proto::{Frame, PeerSummary};
use courier_transport::{TransportConnection, TransportResult};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Serializes read-only registry snapshots for controllers
#[derive(Clone)]
pub struct ClientListPublisher {
    state: SharedState,
    config: Arc<RelayConfig>,
}

impl ClientListPublisher {
    pub fn new(state: SharedState, config: Arc<RelayConfig>) -> Self {
        Self { state, config }
    }

    /// Consistent copy of the registry taken under the state lock
    pub async fn snapshot(&self) -> BTreeMap<String, PeerSummary> {
        self.snapshot_at(Utc::now()).await
    }

    /// Snapshot as of `now`
    ///
    /// Peers whose grace window has already run out are purged first, so the
    /// list never depends on when the sweeper last ran.
    pub async fn snapshot_at(&self, now: DateTime<Utc>) -> BTreeMap<String, PeerSummary> {
        let mut state = self.state.lock().await;
        let purged = state
            .registry
            .reclaim_disconnected(self.config.grace_window(), now);
        if !purged.is_empty() {
            debug!(purged_peers = ?purged, "Purged expired peers before listing");
        }
        state.registry.snapshot()
    }

    pub async fn client_list(&self) -> Frame {
        Frame::ClientList {
            peers: self.snapshot().await,
        }
    }

    /// Send the current client list to one requester
    pub async fn publish(&self, requester: &dyn TransportConnection) -> TransportResult<()> {
        let frame = self.client_list().await;
        if let Frame::ClientList { peers } = &frame {
            debug!(
                connection_id = %requester.connection_id(),
                peers = peers.len(),
                "Sending client list"
            );
        }
        requester.send_frame(&frame).await
    }
}
