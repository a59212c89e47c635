//! Client-side synchronization state machine.
//!
//! A client keeps at most one operation in flight. Edits made while waiting
//! for the server's acknowledgement are composed into a single buffer that
//! is sent once the in-flight operation is confirmed. Remote operations are
//! transformed against both before they touch the local document, and the
//! pending operations are replaced by their transformed counterparts so they
//! stay valid against the new base.
//!
//! ```text
//!                  local edit                     local edit
//!  Synchronized ──────────────▶ AwaitingAck ──────────────▶ AwaitingAckWithBuffer
//!       ▲                          │    ▲                          │
//!       └──────── ack ─────────────┘    └───── ack (send buffer) ──┘
//! ```
//!
//! The machine does no I/O: every transition that must reach the server
//! returns a [`Submission`] for the caller to send.

use tracing::debug;

use super::revision_log::Snapshot;
use super::{SyncError, SyncResult};
use crate::ot::{transform, OtResult, TextOperation};

/// Pending-operation state of a client
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ClientState {
    /// Nothing in flight
    #[default]
    Synchronized,
    /// One operation sent, not yet acknowledged
    AwaitingAck { outstanding: TextOperation },
    /// One operation in flight plus local edits made since
    AwaitingAckWithBuffer {
        outstanding: TextOperation,
        buffer: TextOperation,
    },
}

/// An operation the caller must send to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub base_revision: u64,
    pub operation: TextOperation,
}

/// Local replica of one channel's document
#[derive(Debug, Clone)]
pub struct ClientSync {
    document: String,
    revision: u64,
    state: ClientState,
}

impl ClientSync {
    /// Initialize from the server's `init` snapshot
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            document: snapshot.document,
            revision: snapshot.revision,
            state: ClientState::Synchronized,
        }
    }

    /// Local document, including unacknowledged edits
    pub fn document(&self) -> &str {
        &self.document
    }

    /// Last server revision incorporated locally
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn state(&self) -> &ClientState {
        &self.state
    }

    /// Whether any local edit is still unacknowledged
    pub fn has_pending(&self) -> bool {
        !matches!(self.state, ClientState::Synchronized)
    }

    /// Apply an edit made locally. Returns the submission to send when the
    /// client was idle; otherwise the edit is buffered.
    pub fn apply_local(&mut self, operation: TextOperation) -> OtResult<Option<Submission>> {
        let document = operation.apply(&self.document)?;

        let (state, submission) = match std::mem::take(&mut self.state) {
            ClientState::Synchronized => {
                let submission = Submission {
                    base_revision: self.revision,
                    operation: operation.clone(),
                };
                (
                    ClientState::AwaitingAck {
                        outstanding: operation,
                    },
                    Some(submission),
                )
            }
            ClientState::AwaitingAck { outstanding } => (
                ClientState::AwaitingAckWithBuffer {
                    outstanding,
                    buffer: operation,
                },
                None,
            ),
            ClientState::AwaitingAckWithBuffer {
                outstanding,
                buffer,
            } => match buffer.compose(&operation) {
                Ok(buffer) => (
                    ClientState::AwaitingAckWithBuffer {
                        outstanding,
                        buffer,
                    },
                    None,
                ),
                Err(err) => {
                    self.state = ClientState::AwaitingAckWithBuffer {
                        outstanding,
                        buffer,
                    };
                    return Err(err);
                }
            },
        };

        self.document = document;
        self.state = state;
        Ok(submission)
    }

    /// The server confirmed the in-flight operation as `revision`.
    /// Returns the buffered edits to send next, if any.
    pub fn acknowledge(&mut self, revision: u64) -> SyncResult<Option<Submission>> {
        self.expect_next(revision)?;

        let (state, submission) = match std::mem::take(&mut self.state) {
            ClientState::Synchronized => {
                return Err(SyncError::InvalidMessage(
                    "acknowledgement with nothing in flight".to_string(),
                ))
            }
            ClientState::AwaitingAck { .. } => (ClientState::Synchronized, None),
            ClientState::AwaitingAckWithBuffer { buffer, .. } => {
                let submission = Submission {
                    base_revision: revision,
                    operation: buffer.clone(),
                };
                (
                    ClientState::AwaitingAck { outstanding: buffer },
                    Some(submission),
                )
            }
        };

        debug!(revision, "operation acknowledged");
        self.revision = revision;
        self.state = state;
        Ok(submission)
    }

    /// Incorporate an operation another client committed as `revision`.
    /// Returns the operation that was applied to the local document.
    pub fn apply_remote(
        &mut self,
        revision: u64,
        operation: TextOperation,
    ) -> SyncResult<TextOperation> {
        self.expect_next(revision)?;

        let (state, local) = match &self.state {
            ClientState::Synchronized => (ClientState::Synchronized, operation),
            ClientState::AwaitingAck { outstanding } => {
                let (outstanding, local) = transform(outstanding, &operation)?;
                (ClientState::AwaitingAck { outstanding }, local)
            }
            ClientState::AwaitingAckWithBuffer {
                outstanding,
                buffer,
            } => {
                let (outstanding, remote) = transform(outstanding, &operation)?;
                let (buffer, local) = transform(buffer, &remote)?;
                (
                    ClientState::AwaitingAckWithBuffer {
                        outstanding,
                        buffer,
                    },
                    local,
                )
            }
        };

        self.document = local.apply(&self.document)?;
        self.revision = revision;
        self.state = state;
        Ok(local)
    }

    /// Drop all pending edits and reload from a server snapshot
    pub fn resync(&mut self, snapshot: Snapshot) {
        if self.has_pending() {
            debug!(
                revision = snapshot.revision,
                "discarding unacknowledged edits on resync"
            );
        }
        *self = Self::new(snapshot);
    }

    fn expect_next(&self, revision: u64) -> SyncResult<()> {
        if revision != self.revision + 1 {
            return Err(SyncError::InvalidMessage(format!(
                "expected revision {}, got {}",
                self.revision + 1,
                revision
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(document: &str, revision: u64) -> ClientSync {
        ClientSync::new(Snapshot {
            document: document.to_string(),
            revision,
        })
    }

    fn insert_at(position: usize, text: &str, doc_len: usize) -> TextOperation {
        let mut op = TextOperation::new();
        op.retain(position).insert(text).retain(doc_len - position);
        op
    }

    #[test]
    fn test_local_edit_is_sent_when_synchronized() {
        let mut c = client("abc", 4);
        let submission = c.apply_local(insert_at(3, "d", 3)).unwrap().unwrap();

        assert_eq!(submission.base_revision, 4);
        assert_eq!(c.document(), "abcd");
        assert!(matches!(c.state(), ClientState::AwaitingAck { .. }));
    }

    #[test]
    fn test_edits_while_awaiting_are_buffered() {
        let mut c = client("", 0);
        assert!(c.apply_local(insert_at(0, "a", 0)).unwrap().is_some());
        assert!(c.apply_local(insert_at(1, "b", 1)).unwrap().is_none());
        assert!(c.apply_local(insert_at(2, "c", 2)).unwrap().is_none());

        match c.state() {
            ClientState::AwaitingAckWithBuffer { buffer, .. } => {
                assert_eq!(buffer.apply("a").unwrap(), "abc");
            }
            other => panic!("Expected buffered state, got {other:?}"),
        }
        assert_eq!(c.document(), "abc");
    }

    #[test]
    fn test_ack_flushes_buffer() {
        let mut c = client("", 0);
        c.apply_local(insert_at(0, "a", 0)).unwrap();
        c.apply_local(insert_at(1, "b", 1)).unwrap();

        let next = c.acknowledge(1).unwrap().unwrap();
        assert_eq!(next.base_revision, 1);
        assert_eq!(next.operation, insert_at(1, "b", 1));
        assert!(matches!(c.state(), ClientState::AwaitingAck { .. }));

        assert!(c.acknowledge(2).unwrap().is_none());
        assert_eq!(c.state(), &ClientState::Synchronized);
        assert_eq!(c.revision(), 2);
    }

    #[test]
    fn test_unexpected_ack_is_rejected() {
        let mut c = client("x", 0);
        assert!(matches!(c.acknowledge(1), Err(SyncError::InvalidMessage(_))));
        assert_eq!(c.revision(), 0);
    }

    #[test]
    fn test_remote_when_synchronized() {
        let mut c = client("hello", 2);
        let applied = c.apply_remote(3, insert_at(5, "!", 5)).unwrap();
        assert_eq!(applied, insert_at(5, "!", 5));
        assert_eq!(c.document(), "hello!");
        assert_eq!(c.revision(), 3);
    }

    #[test]
    fn test_remote_is_transformed_against_outstanding() {
        let mut c = client("ab", 0);
        c.apply_local(insert_at(1, "X", 2)).unwrap();

        // Another client inserted at the same spot first
        c.apply_remote(1, insert_at(1, "Y", 2)).unwrap();
        assert_eq!(c.document(), "aXYb");

        // The in-flight op now sits on top of revision 1
        match c.state() {
            ClientState::AwaitingAck { outstanding } => {
                assert_eq!(outstanding.apply("aYb").unwrap(), "aXYb");
            }
            other => panic!("Expected AwaitingAck, got {other:?}"),
        }
    }

    #[test]
    fn test_remote_is_transformed_against_buffer() {
        let mut c = client("123", 0);
        c.apply_local(insert_at(0, "a", 3)).unwrap();
        c.apply_local(insert_at(4, "z", 4)).unwrap();
        assert_eq!(c.document(), "a123z");

        let mut remote = TextOperation::new();
        remote.retain(1).delete(1).retain(1);
        c.apply_remote(1, remote).unwrap();
        assert_eq!(c.document(), "a13z");

        // Buffered edit is rebased onto the server's view once the ack arrives
        let next = c.acknowledge(2).unwrap().unwrap();
        assert_eq!(next.base_revision, 2);
        assert_eq!(next.operation.apply("a13").unwrap(), "a13z");
    }

    #[test]
    fn test_out_of_order_remote_is_rejected() {
        let mut c = client("abc", 5);
        let err = c.apply_remote(7, TextOperation::identity(3)).unwrap_err();
        assert!(matches!(err, SyncError::InvalidMessage(_)));
        assert_eq!(c.document(), "abc");
    }

    #[test]
    fn test_invalid_local_edit_leaves_state_untouched() {
        let mut c = client("abc", 0);
        assert!(c.apply_local(TextOperation::identity(9)).is_err());
        assert_eq!(c.state(), &ClientState::Synchronized);
        assert_eq!(c.document(), "abc");
    }

    #[test]
    fn test_resync_discards_pending() {
        let mut c = client("abc", 0);
        c.apply_local(insert_at(0, "x", 3)).unwrap();
        c.resync(Snapshot {
            document: "server".to_string(),
            revision: 9,
        });

        assert!(!c.has_pending());
        assert_eq!(c.document(), "server");
        assert_eq!(c.revision(), 9);
    }
}
