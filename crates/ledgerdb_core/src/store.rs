//! Versioned record store.
//!
//! Keys map to append-only version chains. A version is either committed
//! (stamped with the commit sequence of the transaction that wrote it) or
//! uncommitted (staged by an in-flight transaction). Readers select the
//! newest committed version at or below their snapshot sequence; staged
//! versions are visible only to their writer.
//!
//! Invariant: a key has at most one uncommitted version at a time. The
//! lock manager's exclusive locks guarantee this at the protocol level;
//! the store rejects a second stager as a backstop.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{EngineError, EngineResult};
use crate::types::{Key, SequenceNumber, TransactionId};

/// One entry in a key's version chain.
#[derive(Debug, Clone)]
struct Version {
    value: Vec<u8>,
    writer: TransactionId,
    commit_seq: SequenceNumber,
    committed: bool,
}

/// In-memory mapping of keys to version chains.
///
/// All mutation goes through the staged/commit/discard operations; no
/// caller touches a version chain directly.
#[derive(Debug, Default)]
pub struct RecordStore {
    records: RwLock<HashMap<Key, Vec<Version>>>,
}

impl RecordStore {
    /// Creates an empty record store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the newest committed version visible at `snapshot`.
    ///
    /// Returns `None` if the key is absent or every committed version is
    /// newer than the snapshot.
    #[must_use]
    pub fn read(&self, key: &Key, snapshot: SequenceNumber) -> Option<Vec<u8>> {
        let records = self.records.read();
        let chain = records.get(key)?;
        chain
            .iter()
            .rev()
            .find(|v| v.committed && v.commit_seq <= snapshot)
            .map(|v| v.value.clone())
    }

    /// Reads the uncommitted version staged by `txn`, if any.
    #[must_use]
    pub fn read_own(&self, key: &Key, txn: TransactionId) -> Option<Vec<u8>> {
        let records = self.records.read();
        let chain = records.get(key)?;
        chain
            .iter()
            .rev()
            .find(|v| !v.committed && v.writer == txn)
            .map(|v| v.value.clone())
    }

    /// Returns the commit sequence of the newest committed version.
    #[must_use]
    pub fn latest_commit_seq(&self, key: &Key) -> Option<SequenceNumber> {
        let records = self.records.read();
        let chain = records.get(key)?;
        chain
            .iter()
            .rev()
            .find(|v| v.committed)
            .map(|v| v.commit_seq)
    }

    /// Stages an uncommitted version for `txn`.
    ///
    /// The caller must hold an exclusive lock on `key`. Staging again
    /// replaces the transaction's own staged value in place.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::LockNotHeld`] if another transaction already
    /// has an uncommitted version here — possible only when the locking
    /// protocol was bypassed.
    pub fn stage(&self, key: &Key, value: Vec<u8>, txn: TransactionId) -> EngineResult<()> {
        let mut records = self.records.write();
        let chain = records.entry(key.clone()).or_default();

        if let Some(existing) = chain.iter_mut().find(|v| !v.committed) {
            if existing.writer != txn {
                return Err(EngineError::LockNotHeld {
                    txn,
                    key: key.clone(),
                });
            }
            existing.value = value;
            return Ok(());
        }

        chain.push(Version {
            value,
            writer: txn,
            commit_seq: SequenceNumber::ZERO,
            committed: false,
        });
        Ok(())
    }

    /// Marks `txn`'s staged version on `key` committed at `commit_seq`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction has no staged version here.
    pub fn commit_version(
        &self,
        key: &Key,
        txn: TransactionId,
        commit_seq: SequenceNumber,
    ) -> EngineResult<()> {
        let mut records = self.records.write();
        let version = records
            .get_mut(key)
            .and_then(|chain| chain.iter_mut().find(|v| !v.committed && v.writer == txn))
            .ok_or_else(|| {
                EngineError::invalid_operation(format!("{txn} has no staged version for {key}"))
            })?;

        version.commit_seq = commit_seq;
        version.committed = true;
        Ok(())
    }

    /// Removes `txn`'s staged version on `key`, if any.
    ///
    /// A no-op when nothing is staged, so abort paths can call it
    /// unconditionally for every key the transaction touched.
    pub fn discard_version(&self, key: &Key, txn: TransactionId) {
        let mut records = self.records.write();
        if let Some(chain) = records.get_mut(key) {
            chain.retain(|v| v.committed || v.writer != txn);
            if chain.is_empty() {
                records.remove(key);
            }
        }
    }

    /// Appends an already-committed version, bypassing staging.
    ///
    /// Used by WAL replay, which reconstructs committed versions only.
    pub fn insert_committed(
        &self,
        key: &Key,
        value: Vec<u8>,
        writer: TransactionId,
        commit_seq: SequenceNumber,
    ) {
        let mut records = self.records.write();
        records.entry(key.clone()).or_default().push(Version {
            value,
            writer,
            commit_seq,
            committed: true,
        });
    }

    /// Number of keys with at least one version.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.records.read().len()
    }
}
