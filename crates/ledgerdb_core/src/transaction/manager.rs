//! Transaction manager.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::lock::{LockManager, LockMode};
use crate::store::RecordStore;
use crate::transaction::isolation::{validate_commit, IsolationLevel};
use crate::transaction::state::{Transaction, TransactionState};
use crate::types::{Key, SequenceNumber, TransactionId};
use crate::wal::{WalManager, WalRecord};

/// Coordinates transactions over the record store, lock manager, and WAL.
///
/// The manager provides:
/// - monotonic transaction ID and commit sequence allocation
/// - snapshot assignment at begin
/// - isolation-level policy enforcement on reads and at commit
/// - commit serialization: sequence assignment, WAL append, and version
///   publication happen under one mutex, so visible commit order equals
///   WAL order
///
/// Transactions are owned here and addressed by ID. Finalized entries
/// are retained for audit until [`TransactionManager::gc`] prunes them.
pub struct TransactionManager {
    /// Versioned record space.
    store: Arc<RecordStore>,
    /// Row locks.
    locks: Arc<LockManager>,
    /// Durability log.
    wal: Arc<WalManager>,
    /// Upper bound on lock waits.
    lock_wait_timeout: Duration,
    /// Next transaction ID.
    next_txid: AtomicU64,
    /// Next commit sequence.
    next_seq: AtomicU64,
    /// Highest published commit sequence (the current snapshot point).
    committed_seq: AtomicU64,
    /// Owned transactions, active and finalized.
    txns: RwLock<HashMap<TransactionId, Arc<Mutex<Transaction>>>>,
    /// Serializes commits.
    commit_lock: Mutex<()>,
}

impl TransactionManager {
    /// Creates a transaction manager over empty state.
    pub fn new(
        store: Arc<RecordStore>,
        locks: Arc<LockManager>,
        wal: Arc<WalManager>,
        lock_wait_timeout: Duration,
    ) -> Self {
        Self::with_state(store, locks, wal, lock_wait_timeout, 1, 1, 0)
    }

    /// Creates a transaction manager initialized from recovered state.
    pub fn with_state(
        store: Arc<RecordStore>,
        locks: Arc<LockManager>,
        wal: Arc<WalManager>,
        lock_wait_timeout: Duration,
        next_txid: u64,
        next_seq: u64,
        committed_seq: u64,
    ) -> Self {
        Self {
            store,
            locks,
            wal,
            lock_wait_timeout,
            next_txid: AtomicU64::new(next_txid),
            next_seq: AtomicU64::new(next_seq),
            committed_seq: AtomicU64::new(committed_seq),
            txns: RwLock::new(HashMap::new()),
            commit_lock: Mutex::new(()),
        }
    }

    /// Begins a new transaction at the given isolation level.
    ///
    /// Allocates a strictly increasing ID and captures the current
    /// committed sequence as the snapshot. Read Committed transactions
    /// carry the snapshot too but read past it.
    pub fn begin(&self, isolation: IsolationLevel) -> TransactionId {
        let txid = TransactionId::new(self.next_txid.fetch_add(1, Ordering::SeqCst));
        let snapshot = self.committed_seq();
        let txn = Transaction::new(txid, isolation, snapshot);

        self.txns.write().insert(txid, Arc::new(Mutex::new(txn)));
        debug!(%txid, %isolation, %snapshot, "transaction begun");
        txid
    }

    /// Reads `key` within a transaction.
    ///
    /// The transaction's own staged write is returned first; otherwise
    /// visibility follows the isolation level. Never blocks.
    ///
    /// # Errors
    ///
    /// - [`EngineError::NotFound`] if no visible version exists
    /// - [`EngineError::UnknownTransaction`] / invalid-operation errors
    ///   for bad transaction handles
    pub fn read(&self, txid: TransactionId, key: &Key) -> EngineResult<Vec<u8>> {
        let handle = self.handle(txid)?;
        let mut txn = handle.lock();
        txn.ensure_active()?;

        if txn.has_written(key) {
            if let Some(value) = self.store.read_own(key, txid) {
                return Ok(value);
            }
        }

        let seq = txn
            .isolation()
            .read_sequence(txn.snapshot(), self.committed_seq());
        let observed = self.store.latest_commit_seq(key).filter(|s| *s <= seq);
        txn.record_read(key, observed);

        self.store
            .read(key, seq)
            .ok_or_else(|| EngineError::NotFound { key: key.clone() })
    }

    /// Reads `key` under an exclusive lock (a locking read).
    ///
    /// Acquires the exclusive lock first — blocking like a write — then
    /// returns the latest committed value regardless of isolation level,
    /// which is what a balance check before an update needs. The lock is
    /// held until the transaction finalizes.
    ///
    /// # Errors
    ///
    /// Lock failures abort the transaction before surfacing
    /// ([`EngineError::DeadlockAborted`], [`EngineError::LockTimeout`]);
    /// [`EngineError::NotFound`] if the key has no committed version.
    pub fn read_for_update(&self, txid: TransactionId, key: &Key) -> EngineResult<Vec<u8>> {
        let handle = self.handle(txid)?;
        let mut txn = handle.lock();
        txn.ensure_active()?;

        self.acquire_or_abort(&mut txn, key)?;

        if txn.has_written(key) {
            if let Some(value) = self.store.read_own(key, txid) {
                return Ok(value);
            }
        }

        let seq = self.committed_seq();
        let observed = self.store.latest_commit_seq(key).filter(|s| *s <= seq);
        txn.record_read(key, observed);

        self.store
            .read(key, seq)
            .ok_or_else(|| EngineError::NotFound { key: key.clone() })
    }

    /// Writes `key = value` within a transaction.
    ///
    /// Acquires the exclusive lock (the engine's only blocking point),
    /// then stages an uncommitted version visible only to this
    /// transaction.
    ///
    /// # Errors
    ///
    /// Lock failures abort the transaction before surfacing
    /// ([`EngineError::DeadlockAborted`], [`EngineError::LockTimeout`]).
    pub fn write(&self, txid: TransactionId, key: Key, value: Vec<u8>) -> EngineResult<()> {
        let handle = self.handle(txid)?;
        let mut txn = handle.lock();
        txn.ensure_active()?;

        self.acquire_or_abort(&mut txn, &key)?;

        self.store.stage(&key, value, txid)?;
        txn.record_write(&key);
        Ok(())
    }

    /// Commits a transaction.
    ///
    /// Runs the isolation policy's conflict check, then — under the
    /// commit mutex — allocates the commit sequence, appends the
    /// write-set to the WAL followed by the commit marker, flushes,
    /// publishes the versions in write order, and releases locks. Once
    /// the WAL append has begun the commit cannot be cancelled.
    ///
    /// # Errors
    ///
    /// [`EngineError::SerializationFailure`] aborts the transaction and
    /// surfaces to the caller for retry. Terminal transactions yield an
    /// invalid-operation error.
    pub fn commit(&self, txid: TransactionId) -> EngineResult<SequenceNumber> {
        let handle = self.handle(txid)?;
        let mut txn = handle.lock();
        txn.ensure_active()?;

        let guard = self.commit_lock.lock();

        // Conflict check happens under the commit mutex so it races with
        // no other committer.
        if let Err(conflict) = validate_commit(&txn, &self.store) {
            drop(guard);
            self.finalize_abort(&mut txn);
            warn!(%txid, "commit failed validation: {conflict}");
            return Err(conflict);
        }

        let seq = SequenceNumber::new(self.next_seq.fetch_add(1, Ordering::SeqCst));

        for key in txn.write_set() {
            let value = self.store.read_own(key, txid).ok_or_else(|| {
                EngineError::invalid_operation(format!("{txid} lost its staged version for {key}"))
            })?;
            self.wal.append(&WalRecord::Write {
                sequence: seq,
                txid,
                key: key.clone(),
                value,
            })?;
        }
        self.wal.append(&WalRecord::Commit {
            sequence: seq,
            txid,
        })?;
        self.wal.flush()?;

        for key in txn.write_set() {
            self.store.commit_version(key, txid, seq)?;
        }
        self.committed_seq.store(seq.as_u64(), Ordering::SeqCst);

        self.locks.release_all(txid);
        txn.mark_committed(seq);
        debug!(%txid, %seq, writes = txn.write_set().len(), "transaction committed");
        Ok(seq)
    }

    /// Aborts a transaction: staged versions are discarded, locks
    /// released, state set to `Aborted`.
    ///
    /// Safe to call at any point before commit. On an already-finalized
    /// transaction this is an idempotent no-op.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownTransaction`] if the ID was never issued or
    /// has been garbage-collected.
    pub fn abort(&self, txid: TransactionId) -> EngineResult<()> {
        let handle = self.handle(txid)?;
        let mut txn = handle.lock();
        if !txn.is_active() {
            return Ok(());
        }
        self.finalize_abort(&mut txn);
        Ok(())
    }

    /// Returns the state of a transaction, if still retained.
    #[must_use]
    pub fn state_of(&self, txid: TransactionId) -> Option<TransactionState> {
        let txns = self.txns.read();
        txns.get(&txid).map(|h| h.lock().state())
    }

    /// The highest published commit sequence.
    #[must_use]
    pub fn committed_seq(&self) -> SequenceNumber {
        SequenceNumber::new(self.committed_seq.load(Ordering::SeqCst))
    }

    /// Number of active transactions.
    #[must_use]
    pub fn active_count(&self) -> usize {
        let txns = self.txns.read();
        txns.values().filter(|h| h.lock().is_active()).count()
    }

    /// Prunes finalized transaction entries no longer referenced by any
    /// active snapshot, returning how many were removed.
    ///
    /// A committed entry is kept while an active transaction began
    /// before its commit (such a transaction can still conflict with
    /// it); aborted entries are always prunable.
    pub fn gc(&self) -> usize {
        let mut txns = self.txns.write();
        let horizon = txns
            .values()
            .filter_map(|h| {
                let txn = h.lock();
                txn.is_active().then(|| txn.snapshot())
            })
            .min();

        let before = txns.len();
        txns.retain(|_, handle| {
            let txn = handle.lock();
            match txn.state() {
                TransactionState::Active => true,
                TransactionState::Aborted => false,
                TransactionState::Committed => match (txn.commit_seq(), horizon) {
                    (Some(seq), Some(min_snapshot)) => seq > min_snapshot,
                    _ => false,
                },
            }
        });
        before - txns.len()
    }

    fn handle(&self, txid: TransactionId) -> EngineResult<Arc<Mutex<Transaction>>> {
        let txns = self.txns.read();
        txns.get(&txid)
            .cloned()
            .ok_or(EngineError::UnknownTransaction(txid))
    }

    /// Acquires an exclusive lock, aborting the transaction on deadlock
    /// or timeout before surfacing the error.
    fn acquire_or_abort(&self, txn: &mut Transaction, key: &Key) -> EngineResult<()> {
        match self
            .locks
            .acquire(txn.id(), key, LockMode::Exclusive, self.lock_wait_timeout)
        {
            Ok(()) => Ok(()),
            Err(e) => {
                self.finalize_abort(txn);
                Err(e)
            }
        }
    }

    /// Discards staged versions, releases locks (exactly once), and
    /// marks the transaction aborted.
    fn finalize_abort(&self, txn: &mut Transaction) {
        for key in txn.write_set() {
            self.store.discard_version(key, txn.id());
        }
        self.locks.release_all(txn.id());
        txn.mark_aborted();
        debug!(txid = %txn.id(), "transaction aborted");
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("committed_seq", &self.committed_seq())
            .field("active_count", &self.active_count())
            .finish_non_exhaustive()
    }
}
