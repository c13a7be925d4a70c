//! Protocol frame types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Role a peer declares in its handshake
///
/// The role is fixed for the lifetime of a peer record; a controller issues
/// commands, an agent executes them and answers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Controller,
    #[serde(alias = "infected")]
    Agent,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Controller => "controller",
            Role::Agent => "agent",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First frame of every session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Handshake {
    pub role: Role,
    /// Previously assigned id, when resuming
    #[serde(default, alias = "client_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Free-form attributes (agents only)
    #[serde(default, alias = "data", skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Display name (controllers only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl Handshake {
    pub fn controller() -> Self {
        Self {
            role: Role::Controller,
            id: None,
            metadata: None,
            username: None,
        }
    }

    pub fn agent(metadata: Value) -> Self {
        Self {
            role: Role::Agent,
            id: None,
            metadata: Some(metadata),
            username: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// The id the peer asks to resume, ignoring empty strings
    pub fn requested_id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.trim().is_empty())
    }
}

/// A controller's request to run something on an agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandRequest {
    pub target: String,
    #[serde(alias = "command_type")]
    pub kind: String,
    #[serde(alias = "command")]
    pub payload: Value,
}

/// An agent's answer to a relayed command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandResponse {
    pub command_id: String,
    pub response: Value,
}

/// Server-held record correlating a dispatched command with its response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandRecord {
    pub id: String,
    pub origin: String,
    pub target: String,
    pub issued_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
    pub kind: String,
    pub payload: Value,
    pub response: Option<Value>,
}

impl CommandRecord {
    pub fn is_answered(&self) -> bool {
        self.responded_at.is_some()
    }
}

/// Per-peer entry of a client list snapshot
///
/// Carries only serializable state; connection handles never appear here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerSummary {
    pub role: Role,
    pub last_seen: DateTime<Utc>,
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub connected: bool,
    #[serde(default)]
    pub disconnected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pending: usize,
}

/// Main relay protocol frame enum
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Peer declares its role (and optionally resumes an id)
    Handshake(Handshake),
    /// Relay tells the peer which id it is registered under
    AssignId { id: String },

    /// Controller asks the relay to deliver a command to an agent
    Command(CommandRequest),
    /// Relay delivers a command record to its target agent
    RelayedCommand(CommandRecord),
    /// Agent answers a relayed command
    Response(CommandResponse),
    /// Relay forwards the answered record to the originating controller
    RelayedResponse(CommandRecord),

    /// Controller asks for a registry snapshot
    RequestClientList,
    /// Registry snapshot keyed by peer id
    ClientList { peers: BTreeMap<String, PeerSummary> },

    Ping { timestamp: u64 },
    Pong { timestamp: u64 },
    Disconnect { reason: String },
}

impl Frame {
    /// Wire name of the frame, for logging
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Handshake(_) => "handshake",
            Frame::AssignId { .. } => "assign_id",
            Frame::Command(_) => "command",
            Frame::RelayedCommand(_) => "relayed_command",
            Frame::Response(_) => "response",
            Frame::RelayedResponse(_) => "relayed_response",
            Frame::RequestClientList => "request_client_list",
            Frame::ClientList { .. } => "client_list",
            Frame::Ping { .. } => "ping",
            Frame::Pong { .. } => "pong",
            Frame::Disconnect { .. } => "disconnect",
        }
    }

    /// Required-field checks serde cannot express
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Frame::AssignId { id } if id.is_empty() => Err("assign_id: empty id".to_string()),
            Frame::Command(request) => {
                if request.target.trim().is_empty() {
                    return Err("command: empty target".to_string());
                }
                if request.kind.is_empty() {
                    return Err("command: empty kind".to_string());
                }
                Ok(())
            }
            Frame::Response(response) if response.command_id.trim().is_empty() => {
                Err("response: empty command_id".to_string())
            }
            Frame::RelayedCommand(record) | Frame::RelayedResponse(record)
                if record.id.is_empty() =>
            {
                Err(format!("{}: empty record id", self.name()))
            }
            _ => Ok(()),
        }
    }
}
