use classgraph_core::{ApplyError, EntityRef, MutationKind};
use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::protocol::ProtocolError;
use crate::role::Role;
use crate::storage::StoreError;

/// Errors surfaced by the sync engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Malformed, mis-addressed or structurally inconsistent input.
    /// Dropped and logged, never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The session's role may not originate this mutation. No envelope
    /// is built or sent.
    #[error("{role} may not originate {kind}")]
    Authorization { role: Role, kind: MutationKind },

    /// A remote patch referenced an entity this replica does not have.
    /// Recovered by asking the hub for a resync.
    #[error("{0} not found")]
    NotFound(EntityRef),

    #[error("transport error: {0}")]
    Transport(String),

    /// Retried by the next coalesced snapshot.
    #[error(transparent)]
    Persistence(#[from] StoreError),
}

impl SyncError {
    /// Whether the replica may have diverged from the hub.
    pub fn needs_resync(&self) -> bool {
        matches!(self, SyncError::NotFound(_) | SyncError::Validation(_))
    }
}

impl From<ApplyError> for SyncError {
    fn from(err: ApplyError) -> Self {
        match err {
            ApplyError::NotFound(entity) => SyncError::NotFound(entity),
            other => SyncError::Validation(other.to_string()),
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        SyncError::Validation(err.to_string())
    }
}

impl From<tungstenite::Error> for SyncError {
    fn from(err: tungstenite::Error) -> Self {
        SyncError::Transport(err.to_string())
    }
}
