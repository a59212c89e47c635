//! Authoritative per-channel document state.
//!
//! The log owns the canonical text, the revision counter and the ordered
//! history of applied operations. History is indexed by revision number:
//! the operation that produced revision `r + 1` lives at `r - history_start`.
//! Older entries may be compacted away once no member can still submit
//! against them.

use serde::{Deserialize, Serialize};

use super::{SyncError, SyncResult};
use crate::ot::{transform, TextOperation};

/// A consistent `{document, revision}` pair read under one lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub document: String,
    pub revision: u64,
}

/// An operation that was rebased, applied and appended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    /// Revision reached after applying the operation
    pub revision: u64,
    /// The operation as applied to the canonical text
    pub operation: TextOperation,
}

/// Canonical text, revision counter and retained history of one channel
#[derive(Debug, Clone, Default)]
pub struct RevisionLog {
    text: String,
    /// Cached char count of `text`
    text_chars: usize,
    revision: u64,
    /// Revision the first retained history entry was applied to
    history_start: u64,
    history: Vec<TextOperation>,
}

impl RevisionLog {
    /// Create an empty log at revision 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from a persisted snapshot. No history is available before it.
    pub fn restore(snapshot: Snapshot) -> Self {
        Self {
            text_chars: snapshot.document.chars().count(),
            text: snapshot.document,
            revision: snapshot.revision,
            history_start: snapshot.revision,
            history: Vec::new(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn text_chars(&self) -> usize {
        self.text_chars
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Oldest revision a client may still submit against
    pub fn history_start(&self) -> u64 {
        self.history_start
    }

    /// Number of operations currently retained
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            document: self.text.clone(),
            revision: self.revision,
        }
    }

    /// Operations applied since `revision`, oldest first
    pub fn operations_since(&self, revision: u64) -> SyncResult<&[TextOperation]> {
        if revision > self.revision {
            return Err(SyncError::RevisionAhead {
                base: revision,
                current: self.revision,
            });
        }
        if revision < self.history_start {
            return Err(SyncError::RevisionTooOld {
                base: revision,
                oldest: self.history_start,
            });
        }
        let index = (revision - self.history_start) as usize;
        Ok(&self.history[index..])
    }

    /// Express `operation`, built against `base_revision`, in terms of the
    /// current text by transforming it past every operation the client has
    /// not seen. Only the client side of each transform is kept.
    pub fn rebase(&self, operation: TextOperation, base_revision: u64) -> SyncResult<TextOperation> {
        self.operations_since(base_revision)?
            .iter()
            .try_fold(operation, |op, concurrent| {
                transform(&op, concurrent).map(|(op_prime, _)| op_prime)
            })
            .map_err(SyncError::from)
    }

    /// Apply an already-rebased operation and append it.
    ///
    /// The operation is applied to a scratch copy first; text, revision and
    /// history are only replaced once it succeeded.
    pub fn commit(&mut self, operation: TextOperation) -> SyncResult<Committed> {
        let text = operation.apply(&self.text)?;

        self.text = text;
        self.text_chars = operation.target_len();
        self.revision += 1;
        self.history.push(operation.clone());

        Ok(Committed {
            revision: self.revision,
            operation,
        })
    }

    /// Rebase then commit
    pub fn submit(&mut self, operation: TextOperation, base_revision: u64) -> SyncResult<Committed> {
        let rebased = self.rebase(operation, base_revision)?;
        self.commit(rebased)
    }

    /// Drop history entries applied before `revision`, keeping at least
    /// `min_retained` entries. Returns the number of entries dropped.
    pub fn compact(&mut self, revision: u64, min_retained: usize) -> usize {
        let target = revision.min(self.revision);
        if target <= self.history_start {
            return 0;
        }

        let reachable = (target - self.history_start) as usize;
        let droppable = self.history.len().saturating_sub(min_retained);
        let dropped = reachable.min(droppable);
        if dropped == 0 {
            return 0;
        }

        self.history.drain(..dropped);
        self.history_start += dropped as u64;
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::OtError;

    fn insert_at(position: usize, text: &str, doc_len: usize) -> TextOperation {
        let mut op = TextOperation::new();
        op.retain(position).insert(text).retain(doc_len - position);
        op
    }

    #[test]
    fn test_new_log_is_empty() {
        let log = RevisionLog::new();
        assert_eq!(log.text(), "");
        assert_eq!(log.revision(), 0);
        assert_eq!(log.history_len(), 0);
    }

    #[test]
    fn test_commit_advances_revision() {
        let mut log = RevisionLog::new();
        let committed = log.submit(insert_at(0, "hello", 0), 0).unwrap();

        assert_eq!(committed.revision, 1);
        assert_eq!(log.text(), "hello");
        assert_eq!(log.text_chars(), 5);
        assert_eq!(log.revision(), 1);
    }

    #[test]
    fn test_rebase_against_unseen_operation() {
        let mut log = RevisionLog::new();
        log.submit(insert_at(0, "ac", 0), 0).unwrap();

        // Two clients both at revision 1
        let op1 = insert_at(1, "b", 2);
        let op2 = insert_at(2, "d", 2);

        log.submit(op1.clone(), 1).unwrap();
        assert_eq!(log.revision(), 2);

        let committed = log.submit(op2.clone(), 1).unwrap();
        assert_eq!(committed.revision, 3);
        assert_eq!(log.text(), "abcd");

        // Same result as applying op1 then the rebased op2 locally
        let local = committed.operation.apply(&op1.apply("ac").unwrap()).unwrap();
        assert_eq!(local, log.text());
    }

    #[test]
    fn test_text_is_fold_of_history() {
        let mut log = RevisionLog::new();
        log.submit(insert_at(0, "hello", 0), 0).unwrap();
        log.submit(insert_at(5, " world", 5), 1).unwrap();
        log.submit(insert_at(0, ">> ", 5), 1).unwrap();

        let folded = log
            .operations_since(0)
            .unwrap()
            .iter()
            .try_fold(String::new(), |text, op| op.apply(&text))
            .unwrap();
        assert_eq!(folded, log.text());
        assert_eq!(log.text(), ">> hello world");
    }

    #[test]
    fn test_failed_submit_leaves_log_untouched() {
        let mut log = RevisionLog::new();
        log.submit(insert_at(0, "abc", 0), 0).unwrap();

        // Built against a 10-char document that never existed
        let bogus = TextOperation::identity(10);
        let err = log.submit(bogus, 1).unwrap_err();
        assert!(matches!(err, SyncError::Transform(OtError::LengthMismatch { .. })));

        let stale = TextOperation::identity(7);
        let err = log.submit(stale, 0).unwrap_err();
        assert!(matches!(err, SyncError::Transform(OtError::IncompatibleBase { .. })));

        assert_eq!(log.text(), "abc");
        assert_eq!(log.revision(), 1);
        assert_eq!(log.history_len(), 1);
    }

    #[test]
    fn test_revision_ahead_is_rejected() {
        let log = RevisionLog::new();
        let err = log.rebase(TextOperation::new(), 3).unwrap_err();
        assert!(matches!(err, SyncError::RevisionAhead { base: 3, current: 0 }));
    }

    #[test]
    fn test_compact_respects_min_retained() {
        let mut log = RevisionLog::new();
        for i in 0..10 {
            log.submit(insert_at(i, "x", i), i as u64).unwrap();
        }

        assert_eq!(log.compact(8, 4), 6);
        assert_eq!(log.history_start(), 6);
        assert_eq!(log.history_len(), 4);

        // Nothing left to drop below revision 8 without breaking min_retained
        assert_eq!(log.compact(8, 4), 0);

        let err = log.rebase(TextOperation::identity(3), 5).unwrap_err();
        assert!(matches!(err, SyncError::RevisionTooOld { base: 5, oldest: 6 }));

        // Still rebases from a retained revision
        assert!(log.rebase(TextOperation::identity(7), 7).is_ok());
    }

    #[test]
    fn test_restore_starts_history_at_snapshot() {
        let log = RevisionLog::restore(Snapshot {
            document: "persisted".to_string(),
            revision: 42,
        });
        assert_eq!(log.revision(), 42);
        assert_eq!(log.history_start(), 42);
        assert!(log.operations_since(42).unwrap().is_empty());
        assert!(log.operations_since(41).is_err());
    }
}
