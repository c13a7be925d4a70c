//! Command routing from controllers to agents

use crate::config::RelayConfig;
use crate::registry::PeerChannel;
use crate::state::SharedState;
use chrono::Utc;
use courier_proto::{CommandRecord, CommandRequest, Frame, Role};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Why a command ended up in the controller's pending queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndeliverableReason {
    /// No peer is registered under the target id
    UnknownTarget,
    /// The target id belongs to a controller
    RoleMismatch,
    /// The target agent is in its grace window
    TargetDisconnected,
    /// Writing to the agent's channel failed
    SendFailed,
}

impl fmt::Display for UndeliverableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            UndeliverableReason::UnknownTarget => "unknown target",
            UndeliverableReason::RoleMismatch => "target is not an agent",
            UndeliverableReason::TargetDisconnected => "target disconnected",
            UndeliverableReason::SendFailed => "send to target failed",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Record created and sent to the agent
    Dispatched { command_id: String },
    /// Appended to the origin's pending queue; nothing was sent
    Queued { reason: UndeliverableReason },
}

/// Dispatches controller commands to connected agents
#[derive(Clone)]
pub struct CommandRouter {
    state: SharedState,
    config: Arc<RelayConfig>,
}

impl CommandRouter {
    pub fn new(state: SharedState, config: Arc<RelayConfig>) -> Self {
        Self { state, config }
    }

    /// Route one command issued by `origin`
    ///
    /// The controller never receives an error frame: undeliverable commands
    /// are parked in its pending queue and never retried.
    pub async fn route(&self, origin: &str, request: CommandRequest) -> RouteOutcome {
        let (record, channel) = {
            let mut state = self.state.lock().await;

            let target = match state.registry.get(&request.target) {
                None => Err(UndeliverableReason::UnknownTarget),
                Some(peer) if peer.role != Role::Agent => Err(UndeliverableReason::RoleMismatch),
                Some(peer) => peer
                    .channel
                    .clone()
                    .ok_or(UndeliverableReason::TargetDisconnected),
            };

            let channel: PeerChannel = match target {
                Ok(channel) => channel,
                Err(reason) => {
                    state
                        .registry
                        .queue_pending(origin, request.clone(), self.config.max_pending);
                    drop(state);
                    warn!(
                        origin = %origin,
                        target = %request.target,
                        kind = %request.kind,
                        reason = %reason,
                        "Command undeliverable, added to pending queue"
                    );
                    return RouteOutcome::Queued { reason };
                }
            };

            let mut command_id = Uuid::new_v4().to_string();
            while state.records.contains(&command_id) {
                command_id = Uuid::new_v4().to_string();
            }

            let record = CommandRecord {
                id: command_id,
                origin: origin.to_string(),
                target: request.target.clone(),
                issued_at: Utc::now(),
                responded_at: None,
                kind: request.kind.clone(),
                payload: request.payload.clone(),
                response: None,
            };

            // Stored before sending so a fast response always finds it
            state.records.insert(record.clone());
            (record, channel)
        };

        let command_id = record.id.clone();
        match channel.send_frame(&Frame::RelayedCommand(record)).await {
            Ok(()) => {
                info!(
                    command_id = %command_id,
                    origin = %origin,
                    target = %request.target,
                    kind = %request.kind,
                    "Command dispatched"
                );
                RouteOutcome::Dispatched { command_id }
            }
            Err(e) => {
                let mut state = self.state.lock().await;
                state.records.remove(&command_id);
                state
                    .registry
                    .queue_pending(origin, request.clone(), self.config.max_pending);
                drop(state);

                warn!(
                    origin = %origin,
                    target = %request.target,
                    error = %e,
                    "Failed to deliver command, added to pending queue"
                );
                RouteOutcome::Queued {
                    reason: UndeliverableReason::SendFailed,
                }
            }
        }
    }
}
