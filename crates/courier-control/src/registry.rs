//! Peer registry for tracking connected and recently disconnected peers
//!
//! The registry is the authoritative id → peer mapping. It is not internally
//! synchronized; it lives inside [`RelayState`](crate::RelayState), behind the
//! same lock as the command-record store, so that every operation here is
//! atomic with respect to sessions and the sweeper.

use chrono::{DateTime, Utc};
use courier_proto::{CommandRequest, PeerSummary, Role};
use courier_transport::TransportConnection;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

/// Live send/receive handle of a connected peer
pub type PeerChannel = Arc<dyn TransportConnection>;

/// A registered peer
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: String,
    pub role: Role,
    /// Present only while connected
    pub channel: Option<PeerChannel>,
    /// Attributes supplied by an agent at handshake time
    pub metadata: Option<Value>,
    /// Display name supplied by a controller at handshake time
    pub username: Option<String>,
    pub last_seen: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
    /// Commands from this peer that could not be delivered (never redelivered)
    pub pending: VecDeque<CommandRequest>,
}

impl Peer {
    pub fn new(id: impl Into<String>, role: Role, channel: Option<PeerChannel>) -> Self {
        Self {
            id: id.into(),
            role,
            channel,
            metadata: None,
            username: None,
            last_seen: Utc::now(),
            disconnected_at: None,
            pending: VecDeque::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Option<Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_username(mut self, username: Option<String>) -> Self {
        self.username = username;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    pub fn connection_id(&self) -> Option<String> {
        self.channel.as_ref().map(|channel| channel.connection_id())
    }

    /// Serializable view with the channel stripped
    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            role: self.role,
            last_seen: self.last_seen,
            metadata: self.metadata.clone(),
            username: self.username.clone(),
            connected: self.is_connected(),
            disconnected_at: self.disconnected_at,
            pending: self.pending.len(),
        }
    }
}

/// Registry of peers keyed by id
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<String, Peer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace a peer record
    ///
    /// Sets `last_seen` to now and clears `disconnected_at`. If the id was
    /// already registered, the old record is returned; when it had the same
    /// role its pending queue is carried over to the new record.
    pub fn upsert(&mut self, mut peer: Peer) -> Option<Peer> {
        peer.last_seen = Utc::now();
        peer.disconnected_at = None;

        let old_peer = self.peers.remove(&peer.id);

        if let Some(ref replaced) = old_peer {
            if replaced.role == peer.role && peer.pending.is_empty() {
                peer.pending = replaced.pending.clone();
            }

            tracing::info!(
                peer_id = %peer.id,
                role = %peer.role,
                old_role = %replaced.role,
                was_connected = replaced.is_connected(),
                "Re-registered existing peer"
            );
        } else {
            tracing::info!(
                peer_id = %peer.id,
                role = %peer.role,
                "Registered new peer"
            );
        }

        self.peers.insert(peer.id.clone(), peer);
        old_peer
    }

    /// Get a peer only if it is registered with the expected role
    pub fn lookup(&self, id: &str, expected_role: Role) -> Option<&Peer> {
        self.peers.get(id).filter(|peer| peer.role == expected_role)
    }

    /// Get a peer regardless of role
    pub fn get(&self, id: &str) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.peers.contains_key(id)
    }

    /// Drop the channel and start the grace timer
    ///
    /// The record stays queryable until purged. Returns false if the id is
    /// unknown or already disconnected.
    pub fn mark_disconnected(&mut self, id: &str) -> bool {
        match self.peers.get_mut(id) {
            Some(peer) if peer.is_connected() => {
                peer.channel = None;
                peer.disconnected_at = Some(Utc::now());
                tracing::debug!(peer_id = %id, "Peer marked disconnected");
                true
            }
            _ => false,
        }
    }

    /// Mark the peer disconnected only if `connection_id` is still its channel
    ///
    /// A session that was superseded by a newer registration under the same
    /// id must not disconnect the newer one when it ends.
    pub fn mark_session_closed(&mut self, id: &str, connection_id: &str) -> bool {
        let owns_record = self
            .peers
            .get(id)
            .and_then(Peer::connection_id)
            .is_some_and(|current| current == connection_id);

        if owns_record {
            self.mark_disconnected(id)
        } else {
            tracing::debug!(
                peer_id = %id,
                connection_id = %connection_id,
                "Stale session ended; registry record belongs to a newer connection"
            );
            false
        }
    }

    /// Remove a peer record entirely
    pub fn purge(&mut self, id: &str) -> Option<Peer> {
        let removed = self.peers.remove(id);
        if removed.is_some() {
            tracing::info!(peer_id = %id, "Purged peer");
        }
        removed
    }

    /// Purge every peer whose `disconnected_at` is older than `grace`
    pub fn reclaim_disconnected(
        &mut self,
        grace: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Vec<String> {
        let expired: Vec<String> = self
            .peers
            .values()
            .filter(|peer| {
                peer.disconnected_at
                    .is_some_and(|disconnected_at| now - disconnected_at > grace)
            })
            .map(|peer| peer.id.clone())
            .collect();

        for id in &expired {
            self.purge(id);
        }

        expired
    }

    /// Append an undeliverable command to a peer's pending queue
    ///
    /// The oldest entry is dropped once the queue holds `max` entries.
    pub fn queue_pending(&mut self, id: &str, request: CommandRequest, max: usize) -> bool {
        let Some(peer) = self.peers.get_mut(id) else {
            return false;
        };

        while peer.pending.len() >= max.max(1) {
            peer.pending.pop_front();
        }
        peer.pending.push_back(request);
        true
    }

    /// Point-in-time copy of all records, without channels
    pub fn snapshot(&self) -> BTreeMap<String, PeerSummary> {
        self.peers
            .iter()
            .map(|(id, peer)| (id.clone(), peer.summary()))
            .collect()
    }

    /// Channels of all connected peers
    pub fn snapshot_channels(&self) -> Vec<PeerChannel> {
        self.peers
            .values()
            .filter_map(|peer| peer.channel.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn connected_count(&self) -> usize {
        self.peers.values().filter(|peer| peer.is_connected()).count()
    }

    #[cfg(test)]
    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut Peer> {
        self.peers.get_mut(id)
    }
}
