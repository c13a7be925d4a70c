//! Response correlation from agents back to controllers

use crate::config::RelayConfig;
use crate::state::SharedState;
use chrono::Utc;
use courier_proto::{CommandResponse, Frame, Role};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of handling one agent response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrelationOutcome {
    /// Record updated and forwarded to the originating controller
    Delivered { origin: String },
    /// Record updated but the controller is gone or unreachable; dropped
    OriginUnavailable { origin: String },
    /// No record with that id
    UnknownCommand,
    /// Record found but past retention; removed and dropped
    Expired,
    /// Record already carries a response
    AlreadyAnswered,
    /// Responder is not the agent the command was sent to
    WrongResponder { expected: String },
}

/// Matches agent responses to command records
#[derive(Clone)]
pub struct ResponseCorrelator {
    state: SharedState,
    config: Arc<RelayConfig>,
}

impl ResponseCorrelator {
    pub fn new(state: SharedState, config: Arc<RelayConfig>) -> Self {
        Self { state, config }
    }

    /// Correlate a response sent by agent `responder`
    ///
    /// Every outcome is non-fatal for the agent's session.
    pub async fn correlate(
        &self,
        responder: &str,
        response: CommandResponse,
    ) -> CorrelationOutcome {
        let command_id = response.command_id;

        let (record, channel) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let now = Utc::now();

            let Some(record) = state.records.get_mut(&command_id) else {
                drop(guard);
                warn!(
                    command_id = %command_id,
                    responder = %responder,
                    "Response for unknown command dropped"
                );
                return CorrelationOutcome::UnknownCommand;
            };

            if now - record.issued_at > self.config.retention_window() {
                state.records.remove(&command_id);
                drop(guard);
                warn!(
                    command_id = %command_id,
                    responder = %responder,
                    "Response for expired command dropped"
                );
                return CorrelationOutcome::Expired;
            }

            if record.target != responder {
                let expected = record.target.clone();
                drop(guard);
                warn!(
                    command_id = %command_id,
                    responder = %responder,
                    expected = %expected,
                    "Response from an agent the command was not sent to"
                );
                return CorrelationOutcome::WrongResponder { expected };
            }

            if record.is_answered() {
                drop(guard);
                debug!(command_id = %command_id, "Duplicate response ignored");
                return CorrelationOutcome::AlreadyAnswered;
            }

            record.response = Some(response.response);
            record.responded_at = Some(now);
            let record = record.clone();

            let channel = state
                .registry
                .lookup(&record.origin, Role::Controller)
                .and_then(|peer| peer.channel.clone());

            (record, channel)
        };

        let origin = record.origin.clone();
        let Some(channel) = channel else {
            info!(
                command_id = %command_id,
                origin = %origin,
                "Origin not connected, response dropped"
            );
            return CorrelationOutcome::OriginUnavailable { origin };
        };

        match channel.send_frame(&Frame::RelayedResponse(record)).await {
            Ok(()) => {
                info!(
                    command_id = %command_id,
                    origin = %origin,
                    responder = %responder,
                    "Response relayed"
                );
                CorrelationOutcome::Delivered { origin }
            }
            Err(e) => {
                warn!(
                    command_id = %command_id,
                    origin = %origin,
                    error = %e,
                    "Failed to relay response, dropped"
                );
                CorrelationOutcome::OriginUnavailable { origin }
            }
        }
    }
}
