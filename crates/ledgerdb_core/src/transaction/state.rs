//! Transaction state.

use std::collections::{HashMap, HashSet};

use crate::error::{EngineError, EngineResult};
use crate::transaction::isolation::IsolationLevel;
use crate::types::{Key, SequenceNumber, TransactionId};

/// State of a transaction.
///
/// `Active` is the only state that permits operations; `Committed` and
/// `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// The transaction can read, write, commit, or abort.
    Active,
    /// The transaction committed; terminal.
    Committed,
    /// The transaction aborted; terminal.
    Aborted,
}

/// A transaction owned by the transaction manager.
///
/// Tracks the isolation level, begin-time snapshot, the ordered write
/// set, and the read set used for serializable validation.
#[derive(Debug)]
pub(crate) struct Transaction {
    id: TransactionId,
    isolation: IsolationLevel,
    snapshot: SequenceNumber,
    state: TransactionState,
    /// Distinct written keys in first-write order; versions are
    /// committed in exactly this order.
    write_order: Vec<Key>,
    written: HashSet<Key>,
    /// Keys read outside the write set, with the observed commit
    /// sequence (`None` when the key was absent).
    reads: HashMap<Key, Option<SequenceNumber>>,
    /// Commit sequence, set when the transaction commits.
    commit_seq: Option<SequenceNumber>,
}

impl Transaction {
    /// Creates a new active transaction.
    pub(crate) fn new(
        id: TransactionId,
        isolation: IsolationLevel,
        snapshot: SequenceNumber,
    ) -> Self {
        Self {
            id,
            isolation,
            snapshot,
            state: TransactionState::Active,
            write_order: Vec::new(),
            written: HashSet::new(),
            reads: HashMap::new(),
            commit_seq: None,
        }
    }

    pub(crate) fn id(&self) -> TransactionId {
        self.id
    }

    pub(crate) fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub(crate) fn snapshot(&self) -> SequenceNumber {
        self.snapshot
    }

    pub(crate) fn state(&self) -> TransactionState {
        self.state
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    pub(crate) fn commit_seq(&self) -> Option<SequenceNumber> {
        self.commit_seq
    }

    /// Records a written key, preserving first-write order.
    pub(crate) fn record_write(&mut self, key: &Key) {
        if self.written.insert(key.clone()) {
            self.write_order.push(key.clone());
        }
        // A write supersedes any earlier read of the same key.
        self.reads.remove(key);
    }

    /// Whether this transaction has staged a write for `key`.
    pub(crate) fn has_written(&self, key: &Key) -> bool {
        self.written.contains(key)
    }

    /// The written keys in first-write order.
    pub(crate) fn write_set(&self) -> &[Key] {
        &self.write_order
    }

    /// Records a read for conflict detection.
    ///
    /// Reads of self-written keys are not recorded: the transaction is
    /// observing itself, not the committed state.
    pub(crate) fn record_read(&mut self, key: &Key, observed: Option<SequenceNumber>) {
        if !self.written.contains(key) {
            self.reads.insert(key.clone(), observed);
        }
    }

    /// Keys in the read set.
    pub(crate) fn read_set(&self) -> impl Iterator<Item = &Key> {
        self.reads.keys()
    }

    pub(crate) fn mark_committed(&mut self, seq: SequenceNumber) {
        self.state = TransactionState::Committed;
        self.commit_seq = Some(seq);
    }

    pub(crate) fn mark_aborted(&mut self) {
        self.state = TransactionState::Aborted;
    }

    /// Errors unless the transaction is active.
    pub(crate) fn ensure_active(&self) -> EngineResult<()> {
        match self.state {
            TransactionState::Active => Ok(()),
            TransactionState::Committed => Err(EngineError::invalid_operation(format!(
                "{} already committed",
                self.id
            ))),
            TransactionState::Aborted => Err(EngineError::invalid_operation(format!(
                "{} already aborted",
                self.id
            ))),
        }
    }
}
