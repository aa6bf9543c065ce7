//! Synchronization error taxonomy.
//!
//! Every variant is recoverable locally. Only repeated `MalformedMessage`
//! from one connection ends that connection.

use thiserror::Error;

use crate::{entity::PlayerId, net::ConnectionId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Join rejected because the session is at its participant cap.
    #[error("session is full")]
    CapacityExceeded,

    /// Structurally invalid message; dropped, connection kept.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Command from a connection that owns no entity in the session.
    #[error("connection {0} has no authority in this session")]
    UnauthorizedMutation(ConnectionId),

    /// Mutation arrived after the entity was removed.
    #[error("unknown identity {0}")]
    UnknownIdentity(PlayerId),

    /// Client received an update for an identity it never saw added.
    #[error("state desync on {0}")]
    StateDesync(PlayerId),

    /// Session already disposed.
    #[error("session disposed")]
    Disposed,
}

impl SyncError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        SyncError::MalformedMessage(msg.into())
    }
}
