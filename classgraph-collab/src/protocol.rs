//! Binary wire protocol between clients and the hub.
//!
//! One [`WireMessage`] per WebSocket binary frame, bincode-encoded:
//! ```text
//! client ──► hub     Join, Leave, Mutation(Envelope), Resync, Ping
//! hub    ──► client  Welcome, Mutation(Envelope), Presence, Rejected, Pong
//! ```
//!
//! An [`Envelope`] describes one mutation: the room it belongs to, the
//! session that produced it, and when. Minimal-payload kinds name a single
//! entity; `import_document` and `persist_snapshot` carry the whole document.

use std::time::SystemTime;

use classgraph_core::{GraphDocument, Mutation, MutationKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::role::Role;

/// Origin used for envelopes the hub itself produces (resync snapshots).
pub const HUB_ORIGIN: Uuid = Uuid::nil();

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// One mutation on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Project id of the room.
    pub room: Uuid,
    /// Session that produced the mutation.
    pub origin: Uuid,
    pub mutation: Mutation,
    /// Origin wall clock, milliseconds since the epoch.
    pub at: u64,
}

impl Envelope {
    pub fn new(room: Uuid, origin: Uuid, mutation: Mutation) -> Self {
        Self {
            room,
            origin,
            mutation,
            at: now_millis(),
        }
    }

    pub fn kind(&self) -> MutationKind {
        self.mutation.kind()
    }

    /// Whether `session_id` produced this envelope.
    pub fn is_echo_for(&self, session_id: Uuid) -> bool {
        self.origin == session_id
    }
}

/// Room membership change, sent to every member except the subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceEvent {
    Joined { user_id: Uuid },
    Left { user_id: Uuid },
}

impl PresenceEvent {
    pub fn user_id(&self) -> Uuid {
        match self {
            PresenceEvent::Joined { user_id } | PresenceEvent::Left { user_id } => *user_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub user_id: Uuid,
    pub role: Role,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Join the room for `project_id`. Must be the first message.
    Join { project_id: Uuid, user_id: Uuid },
    Leave,
    /// Reply to `Join`: the session id, the role resolved for it, the room's
    /// current document and the other members already present.
    Welcome {
        session_id: Uuid,
        role: Role,
        document: GraphDocument,
        members: Vec<Member>,
    },
    Mutation(Envelope),
    Presence(PresenceEvent),
    /// Sent to the originating session only.
    Rejected {
        kind: Option<MutationKind>,
        reason: String,
    },
    /// Ask the hub for a fresh `import_document`.
    Resync,
    Ping,
    Pong,
}

impl WireMessage {
    pub fn label(&self) -> &'static str {
        match self {
            WireMessage::Join { .. } => "join",
            WireMessage::Leave => "leave",
            WireMessage::Welcome { .. } => "welcome",
            WireMessage::Mutation(_) => "mutation",
            WireMessage::Presence(_) => "presence",
            WireMessage::Rejected { .. } => "rejected",
            WireMessage::Resync => "resync",
            WireMessage::Ping => "ping",
            WireMessage::Pong => "pong",
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
}
