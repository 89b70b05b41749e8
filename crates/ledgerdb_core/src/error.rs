//! Error types for LedgerDB core.

use std::io;
use thiserror::Error;

use crate::types::{Key, TransactionId};

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur in engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] ledgerdb_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The key has no visible committed version.
    #[error("key not found: {key}")]
    NotFound {
        /// The key that was looked up.
        key: Key,
    },

    /// A write was attempted without the required exclusive lock.
    ///
    /// This is a protocol violation, not a transient condition: the
    /// offending transaction should be aborted.
    #[error("{txn} does not hold an exclusive lock on key {key}")]
    LockNotHeld {
        /// The transaction that attempted the write.
        txn: TransactionId,
        /// The key it tried to write.
        key: Key,
    },

    /// A lock request waited past the configured timeout.
    ///
    /// The transaction has been aborted; retry with a fresh one.
    #[error("{txn} timed out waiting for a lock on key {key}")]
    LockTimeout {
        /// The waiting transaction.
        txn: TransactionId,
        /// The contended key.
        key: Key,
    },

    /// The transaction's lock request closed a cycle in the wait-for
    /// graph and it was chosen as the deadlock victim.
    ///
    /// The transaction has been aborted; retry with a fresh one.
    #[error("{txn} aborted to break a deadlock")]
    DeadlockAborted {
        /// The aborted transaction.
        txn: TransactionId,
    },

    /// Commit-time validation found a conflicting concurrent commit.
    ///
    /// Raised under Serializable isolation when a key this transaction
    /// read or wrote was committed by another transaction after this
    /// one's snapshot. The transaction has been aborted; retry with a
    /// fresh one.
    #[error("{txn} could not be serialized: key {key} was committed concurrently")]
    SerializationFailure {
        /// The losing transaction.
        txn: TransactionId,
        /// The first read-set key that conflicted.
        key: Key,
    },

    /// No transaction with this ID is known to the engine.
    #[error("unknown transaction: {0}")]
    UnknownTransaction(TransactionId),

    /// WAL contents are corrupted.
    #[error("WAL corruption: {message}")]
    WalCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// A WAL record's checksum did not match.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl EngineError {
    /// Creates a WAL corruption error.
    pub fn wal_corruption(message: impl Into<String>) -> Self {
        Self::WalCorruption {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Whether retrying the work in a fresh transaction can succeed.
    ///
    /// Deadlock victims, lock timeouts, and serialization failures are
    /// transient: the engine aborted the transaction and the caller owns
    /// the retry. Everything else is a caller or environment error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. }
                | Self::DeadlockAborted { .. }
                | Self::SerializationFailure { .. }
        )
    }
}
