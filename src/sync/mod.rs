//! Synchronization module for OT-based real-time collaboration.
//!
//! This module implements the authoritative side of the protocol and the
//! matching client state machine. It provides:
//! - Per-channel revision logs with rebase-on-submit
//! - Binary and JSON WebSocket protocol messages
//! - The collaboration server (membership, submit, broadcast, resync)
//! - The client synchronization state machine

pub mod client;
pub mod protocol;
pub mod revision_log;
pub mod server;

pub use client::{ClientState, ClientSync};
pub use revision_log::{Committed, RevisionLog, Snapshot};
pub use server::{SyncServer, SyncServerConfig};

use crate::ot::OtError;

/// Unique identifier for a channel (one shared document)
pub type ChannelId = String;

/// Unique identifier for a peer connection
pub type PeerId = String;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during synchronization
#[derive(Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Peer not registered
    PeerNotFound(PeerId),
    /// Peer submitted to a channel it has not joined
    NotJoined(ChannelId),
    /// Channel has reached its member limit
    ChannelFull(ChannelId),
    /// Server has reached its channel limit
    TooManyChannels,
    /// Client claims a revision the server has not reached
    RevisionAhead { base: u64, current: u64 },
    /// Client's base revision has been compacted out of history
    RevisionTooOld { base: u64, oldest: u64 },
    /// Rebase or apply failed
    Transform(OtError),
    /// Applying the operation would exceed the document size limit
    DocumentTooLarge { chars: usize, max: usize },
    /// Invalid message
    InvalidMessage(String),
    /// Storage operation failed
    StorageError(String),
}

impl SyncError {
    /// Whether the client should drop its pending state and reload the
    /// channel snapshot. Any rejected submission from a member qualifies:
    /// the client's outstanding operation will never be acknowledged.
    pub fn requires_resync(&self) -> bool {
        matches!(
            self,
            SyncError::RevisionAhead { .. }
                | SyncError::RevisionTooOld { .. }
                | SyncError::Transform(_)
                | SyncError::DocumentTooLarge { .. }
        )
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::PeerNotFound(id) => write!(f, "Peer not found: {}", id),
            SyncError::NotJoined(id) => write!(f, "Not joined to channel: {}", id),
            SyncError::ChannelFull(id) => write!(f, "Channel is full: {}", id),
            SyncError::TooManyChannels => write!(f, "Too many channels"),
            SyncError::RevisionAhead { base, current } => {
                write!(f, "Revision {} is ahead of server revision {}", base, current)
            }
            SyncError::RevisionTooOld { base, oldest } => {
                write!(f, "Revision {} is older than retained history ({})", base, oldest)
            }
            SyncError::Transform(err) => write!(f, "Transform failed: {}", err),
            SyncError::DocumentTooLarge { chars, max } => {
                write!(f, "Document too large: {} chars (max: {})", chars, max)
            }
            SyncError::InvalidMessage(msg) => write!(f, "Invalid message: {}", msg),
            SyncError::StorageError(msg) => write!(f, "Storage error: {}", msg),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<OtError> for SyncError {
    fn from(err: OtError) -> Self {
        SyncError::Transform(err)
    }
}

impl From<crate::storage::StorageError> for SyncError {
    fn from(err: crate::storage::StorageError) -> Self {
        SyncError::StorageError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_error_display() {
        let err = SyncError::NotJoined("test-123".to_string());
        assert_eq!(err.to_string(), "Not joined to channel: test-123");

        let err = SyncError::Transform(OtError::TooShort);
        assert_eq!(err.to_string(), "Transform failed: first operation is too short");
    }

    #[test]
    fn test_requires_resync() {
        assert!(SyncError::RevisionAhead { base: 2, current: 1 }.requires_resync());
        assert!(SyncError::RevisionTooOld { base: 0, oldest: 4 }.requires_resync());
        assert!(SyncError::Transform(OtError::TooLong).requires_resync());
        assert!(!SyncError::NotJoined("c".into()).requires_resync());
        assert!(SyncError::DocumentTooLarge { chars: 10, max: 5 }.requires_resync());
    }
}
