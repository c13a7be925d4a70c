//! Connection gateway and per-session frame loop

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use courier_proto::{Frame, Handshake, Role};
use courier_transport::{TransportConnection, TransportError};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{DuplicateIdPolicy, RelayConfig};
use crate::correlator::ResponseCorrelator;
use crate::publisher::ClientListPublisher;
use crate::registry::{Peer, PeerChannel};
use crate::router::CommandRouter;
use crate::state::{RelayState, SharedState};
use crate::sweeper::RetentionSweeper;

/// Reasons a connection never became a registered session
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("no handshake within {0:?}")]
    Timeout(Duration),

    #[error("connection closed before handshake")]
    Closed,

    #[error("malformed handshake: {0}")]
    Malformed(String),

    #[error("expected handshake, got {0}")]
    UnexpectedFrame(&'static str),

    #[error("peer id {0} is held by a live session")]
    DuplicateLive(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl HandshakeError {
    /// Whether the peer is still reachable to be told why
    fn should_notify(&self) -> bool {
        !matches!(self, HandshakeError::Closed | HandshakeError::Transport(_))
    }
}

/// Identity resolved by a successful handshake
#[derive(Debug, Clone)]
struct Session {
    id: String,
    role: Role,
}

/// Handles relay connections from controllers and agents
#[derive(Clone)]
pub struct RelayHandler {
    state: SharedState,
    config: Arc<RelayConfig>,
    router: CommandRouter,
    correlator: ResponseCorrelator,
    publisher: ClientListPublisher,
}

impl RelayHandler {
    pub fn new(config: RelayConfig) -> Self {
        Self::with_state(RelayState::shared(), config)
    }

    pub fn with_state(state: SharedState, config: RelayConfig) -> Self {
        let config = Arc::new(config);
        Self {
            router: CommandRouter::new(state.clone(), config.clone()),
            correlator: ResponseCorrelator::new(state.clone(), config.clone()),
            publisher: ClientListPublisher::new(state.clone(), config.clone()),
            state,
            config,
        }
    }

    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn publisher(&self) -> &ClientListPublisher {
        &self.publisher
    }

    /// Sweeper bound to this handler's state and windows
    pub fn sweeper(&self) -> RetentionSweeper {
        RetentionSweeper::new(self.state.clone(), self.config.clone())
    }

    /// Tell every connected peer to go away and close its channel
    pub async fn close_all(&self, reason: &str) -> usize {
        let channels: Vec<PeerChannel> = {
            let state = self.state.lock().await;
            state.registry.snapshot_channels()
        };

        for channel in &channels {
            let _ = channel
                .send_frame(&Frame::Disconnect {
                    reason: reason.to_string(),
                })
                .await;
            channel.close(reason).await;
        }

        channels.len()
    }

    /// Drive one connection from handshake to close
    ///
    /// Returns once the session has ended and its registry record (if any)
    /// has been marked disconnected.
    pub async fn handle_connection(&self, connection: PeerChannel) -> Result<(), HandshakeError> {
        let remote_addr = connection.remote_address();
        debug!("New relay connection from {}", remote_addr);

        let session = match self.handshake(&connection).await {
            Ok(session) => session,
            Err(e) => {
                warn!("Handshake from {} failed: {}", remote_addr, e);
                if e.should_notify() {
                    let _ = connection
                        .send_frame(&Frame::Disconnect {
                            reason: e.to_string(),
                        })
                        .await;
                }
                connection.close("handshake failed").await;
                return Err(e);
            }
        };

        info!(
            peer_id = %session.id,
            role = %session.role,
            remote_addr = %remote_addr,
            "Session established"
        );

        self.run_session(&connection, &session).await;
        self.finish_session(&connection, &session).await;
        Ok(())
    }

    async fn handshake(&self, connection: &PeerChannel) -> Result<Session, HandshakeError> {
        let timeout = self.config.handshake_timeout;
        let first_frame = match tokio::time::timeout(timeout, connection.recv_frame()).await {
            Err(_) => return Err(HandshakeError::Timeout(timeout)),
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => return Err(HandshakeError::Closed),
            Ok(Err(e)) if e.is_protocol_error() => {
                return Err(HandshakeError::Malformed(e.to_string()))
            }
            Ok(Err(e)) => return Err(HandshakeError::Transport(e)),
        };

        let frame_name = first_frame.name();
        let Frame::Handshake(handshake) = first_frame else {
            return Err(HandshakeError::UnexpectedFrame(frame_name));
        };

        let (session, superseded) = self.register(connection, handshake).await?;

        if let Some(old_channel) = superseded {
            if old_channel.connection_id() != connection.connection_id() {
                info!(peer_id = %session.id, "Superseding previous session");
                let _ = old_channel
                    .send_frame(&Frame::Disconnect {
                        reason: "superseded by a newer session".to_string(),
                    })
                    .await;
                old_channel.close("superseded").await;
            }
        }

        // Sent on resume too; the peer always learns its authoritative id
        if let Err(e) = connection
            .send_frame(&Frame::AssignId {
                id: session.id.clone(),
            })
            .await
        {
            self.state
                .lock()
                .await
                .registry
                .mark_session_closed(&session.id, &connection.connection_id());
            return Err(HandshakeError::Transport(e));
        }

        Ok(session)
    }

    /// Resolve the id and upsert the peer; returns the replaced live channel
    async fn register(
        &self,
        connection: &PeerChannel,
        handshake: Handshake,
    ) -> Result<(Session, Option<PeerChannel>), HandshakeError> {
        let role = handshake.role;
        let (metadata, username) = match role {
            Role::Agent => (handshake.metadata.clone(), None),
            Role::Controller => (None, handshake.username.clone()),
        };

        let mut state = self.state.lock().await;

        let id = match handshake.requested_id() {
            Some(requested) => {
                let live = state
                    .registry
                    .get(requested)
                    .is_some_and(|peer| peer.is_connected());
                if live && self.config.duplicate_ids == DuplicateIdPolicy::RejectLive {
                    return Err(HandshakeError::DuplicateLive(requested.to_string()));
                }
                requested.to_string()
            }
            None => {
                let mut id = Uuid::new_v4().to_string();
                while state.registry.contains(&id) {
                    id = Uuid::new_v4().to_string();
                }
                id
            }
        };

        let peer = Peer::new(id.clone(), role, Some(connection.clone()))
            .with_metadata(metadata)
            .with_username(username);
        let replaced = state.registry.upsert(peer);

        Ok((Session { id, role }, replaced.and_then(|peer| peer.channel)))
    }

    async fn run_session(&self, connection: &PeerChannel, session: &Session) {
        loop {
            let frame = match connection.recv_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!(peer_id = %session.id, "Connection closed");
                    break;
                }
                Err(e) if e.is_protocol_error() => {
                    warn!(peer_id = %session.id, error = %e, "Protocol error, ending session");
                    let _ = connection
                        .send_frame(&Frame::Disconnect {
                            reason: format!("protocol error: {}", e),
                        })
                        .await;
                    break;
                }
                Err(e) => {
                    warn!(peer_id = %session.id, error = %e, "Transport error, ending session");
                    break;
                }
            };

            if self.dispatch(connection, session, frame).await.is_break() {
                break;
            }
        }
    }

    async fn dispatch(
        &self,
        connection: &PeerChannel,
        session: &Session,
        frame: Frame,
    ) -> ControlFlow<()> {
        match (session.role, frame) {
            (_, Frame::Ping { timestamp }) => {
                if let Err(e) = connection.send_frame(&Frame::Pong { timestamp }).await {
                    debug!(peer_id = %session.id, error = %e, "Failed to send pong");
                    return ControlFlow::Break(());
                }
            }
            (_, Frame::Disconnect { reason }) => {
                info!(peer_id = %session.id, reason = %reason, "Peer requested disconnect");
                return ControlFlow::Break(());
            }
            (Role::Controller, Frame::Command(request)) => {
                self.router.route(&session.id, request).await;
            }
            (Role::Controller, Frame::RequestClientList) => {
                if let Err(e) = self.publisher.publish(connection.as_ref()).await {
                    debug!(peer_id = %session.id, error = %e, "Failed to send client list");
                    return ControlFlow::Break(());
                }
            }
            (Role::Agent, Frame::Response(response)) => {
                self.correlator.correlate(&session.id, response).await;
            }
            (role, other) => {
                warn!(
                    peer_id = %session.id,
                    role = %role,
                    frame = other.name(),
                    "Ignoring frame not valid for session role"
                );
            }
        }
        ControlFlow::Continue(())
    }

    async fn finish_session(&self, connection: &PeerChannel, session: &Session) {
        let marked = self
            .state
            .lock()
            .await
            .registry
            .mark_session_closed(&session.id, &connection.connection_id());

        connection.close("session ended").await;

        info!(
            peer_id = %session.id,
            role = %session.role,
            superseded = !marked,
            "Session ended"
        );
    }
}
