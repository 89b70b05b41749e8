//! Engine facade and recovery.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use ledgerdb_storage::{InMemoryBackend, StorageBackend};

use crate::config::Config;
use crate::error::EngineResult;
use crate::lock::LockManager;
use crate::store::RecordStore;
use crate::transaction::{IsolationLevel, TransactionManager, TransactionState};
use crate::types::{Key, SequenceNumber, TransactionId};
use crate::wal::{WalManager, WalRecord};

/// The engine handle.
///
/// An `Engine` owns the record store, lock manager, WAL, and transaction
/// manager. There is no process-wide singleton: construct one and pass
/// the handle around (it is `Send + Sync`; wrap in `Arc` to share across
/// threads).
///
/// # Example
///
/// ```rust
/// use ledgerdb_core::{Engine, IsolationLevel, Key};
///
/// let engine = Engine::open_in_memory().unwrap();
/// let txn = engine.begin(IsolationLevel::Serializable).unwrap();
/// engine.write(txn, Key::new("alice"), b"100".to_vec()).unwrap();
/// engine.commit(txn).unwrap();
/// ```
pub struct Engine {
    config: Config,
    store: Arc<RecordStore>,
    wal: Arc<WalManager>,
    txns: TransactionManager,
}

impl Engine {
    /// Opens an engine over the given WAL backend, replaying any
    /// existing log into the record store.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is corrupted (bad CRC, bad magic) or
    /// the backend fails. A truncated trailing record is not an error;
    /// it is treated as the end of durable history.
    pub fn open_with_backends(
        config: Config,
        wal_backend: Box<dyn StorageBackend>,
    ) -> EngineResult<Self> {
        let store = Arc::new(RecordStore::new());
        let locks = Arc::new(LockManager::new());
        let wal = Arc::new(WalManager::new(wal_backend, config.sync_on_commit));

        let (next_txid, next_seq, committed_seq) = Self::recover(&wal, &store)?;
        debug!(next_txid, next_seq, committed_seq, "engine recovered");

        let txns = TransactionManager::with_state(
            Arc::clone(&store),
            locks,
            Arc::clone(&wal),
            config.lock_wait_timeout,
            next_txid,
            next_seq,
            committed_seq,
        );

        Ok(Self {
            config,
            store,
            wal,
            txns,
        })
    }

    /// Opens a fresh in-memory engine.
    ///
    /// Nothing survives the handle being dropped; intended for tests and
    /// ephemeral use.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the signature matches the other
    /// constructors.
    pub fn open_in_memory() -> EngineResult<Self> {
        Self::open_with_backends(Config::default(), Box::new(InMemoryBackend::new()))
    }

    /// Replays the WAL, reconstructing committed versions only.
    ///
    /// Returns `(next_txid, next_seq, committed_seq)`.
    fn recover(wal: &WalManager, store: &RecordStore) -> EngineResult<(u64, u64, u64)> {
        let mut pending: HashMap<TransactionId, Vec<(Key, Vec<u8>)>> = HashMap::new();
        let mut max_txid = 0u64;
        let mut max_seq = 0u64;

        for result in wal.iter()? {
            let (_, record) = result?;
            max_txid = max_txid.max(record.txid().as_u64());

            match record {
                WalRecord::Write {
                    txid, key, value, ..
                } => {
                    pending.entry(txid).or_default().push((key, value));
                }
                WalRecord::Commit { sequence, txid } => {
                    for (key, value) in pending.remove(&txid).unwrap_or_default() {
                        store.insert_committed(&key, value, txid, sequence);
                    }
                    max_seq = max_seq.max(sequence.as_u64());
                }
            }
        }

        if !pending.is_empty() {
            // Writes with no commit marker: a crash interrupted the
            // commit before its marker was durable.
            warn!(
                transactions = pending.len(),
                "discarding unterminated writes at WAL tail"
            );
        }

        Ok((max_txid + 1, max_seq + 1, max_seq))
    }

    /// Begins a transaction at the given isolation level.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the signature leaves room for admission
    /// control.
    pub fn begin(&self, isolation: IsolationLevel) -> EngineResult<TransactionId> {
        Ok(self.txns.begin(isolation))
    }

    /// Reads a key within a transaction.
    ///
    /// # Errors
    ///
    /// See [`TransactionManager::read`].
    pub fn read(&self, txn: TransactionId, key: &Key) -> EngineResult<Vec<u8>> {
        self.txns.read(txn, key)
    }

    /// Reads a key under an exclusive lock (`SELECT ... FOR UPDATE`).
    ///
    /// # Errors
    ///
    /// See [`TransactionManager::read_for_update`].
    pub fn read_for_update(&self, txn: TransactionId, key: &Key) -> EngineResult<Vec<u8>> {
        self.txns.read_for_update(txn, key)
    }

    /// Writes a key within a transaction.
    ///
    /// # Errors
    ///
    /// See [`TransactionManager::write`].
    pub fn write(&self, txn: TransactionId, key: Key, value: Vec<u8>) -> EngineResult<()> {
        self.txns.write(txn, key, value)
    }

    /// Commits a transaction.
    ///
    /// # Errors
    ///
    /// See [`TransactionManager::commit`].
    pub fn commit(&self, txn: TransactionId) -> EngineResult<SequenceNumber> {
        self.txns.commit(txn)
    }

    /// Aborts a transaction. Idempotent on finalized transactions.
    ///
    /// # Errors
    ///
    /// See [`TransactionManager::abort`].
    pub fn abort(&self, txn: TransactionId) -> EngineResult<()> {
        self.txns.abort(txn)
    }

    /// Returns the state of a transaction, if still retained.
    #[must_use]
    pub fn state_of(&self, txn: TransactionId) -> Option<TransactionState> {
        self.txns.state_of(txn)
    }

    /// The highest published commit sequence.
    #[must_use]
    pub fn committed_seq(&self) -> SequenceNumber {
        self.txns.committed_seq()
    }

    /// Number of active transactions.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.txns.active_count()
    }

    /// Prunes finalized transaction entries; see [`TransactionManager::gc`].
    pub fn gc(&self) -> usize {
        self.txns.gc()
    }

    /// Flushes the WAL to durable storage.
    ///
    /// Commits already flush before acknowledging; this is an extra
    /// sync point for callers shutting the engine down.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend flush fails.
    pub fn flush(&self) -> EngineResult<()> {
        self.wal.flush()
    }

    /// The engine's configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[cfg(test)]
    pub(crate) fn wal_bytes(&self) -> EngineResult<Vec<u8>> {
        self.wal.raw_bytes()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("committed_seq", &self.committed_seq())
            .field("active_count", &self.active_count())
            .field("keys", &self.store.key_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use proptest::prelude::*;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn key(name: &str) -> Key {
        Key::new(name)
    }

    fn balance(amount: i64) -> Vec<u8> {
        amount.to_be_bytes().to_vec()
    }

    fn parse_balance(bytes: &[u8]) -> i64 {
        i64::from_be_bytes(bytes.try_into().expect("balance is 8 bytes"))
    }

    /// Seeds the classic two-account ledger: Alice = Bob = 100.
    fn seed_accounts(engine: &Engine) {
        let txn = engine.begin(IsolationLevel::ReadCommitted).unwrap();
        engine.write(txn, key("alice"), balance(100)).unwrap();
        engine.write(txn, key("bob"), balance(100)).unwrap();
        engine.commit(txn).unwrap();
    }

    fn read_committed_balance(engine: &Engine, name: &str) -> i64 {
        let txn = engine.begin(IsolationLevel::ReadCommitted).unwrap();
        let value = engine.read(txn, &key(name)).unwrap();
        engine.abort(txn).unwrap();
        parse_balance(&value)
    }

    #[derive(Debug)]
    enum TransferError {
        InsufficientFunds,
        Engine(EngineError),
    }

    impl From<EngineError> for TransferError {
        fn from(e: EngineError) -> Self {
            TransferError::Engine(e)
        }
    }

    /// Transfers between accounts the way the engine's callers do: lock
    /// the sender's row, check funds before touching anything, then
    /// apply both sides and commit.
    fn transfer(engine: &Engine, from: &str, to: &str, amount: i64) -> Result<(), TransferError> {
        let txn = engine.begin(IsolationLevel::ReadCommitted)?;

        let from_balance = parse_balance(&engine.read_for_update(txn, &key(from))?);
        if from_balance < amount {
            engine.abort(txn)?;
            return Err(TransferError::InsufficientFunds);
        }
        let to_balance = parse_balance(&engine.read_for_update(txn, &key(to))?);

        engine.write(txn, key(from), balance(from_balance - amount))?;
        engine.write(txn, key(to), balance(to_balance + amount))?;
        engine.commit(txn)?;
        Ok(())
    }

    #[test]
    fn write_commit_read_round_trip() {
        let engine = Engine::open_in_memory().unwrap();

        let txn = engine.begin(IsolationLevel::ReadCommitted).unwrap();
        engine.write(txn, key("alice"), balance(100)).unwrap();
        assert_eq!(parse_balance(&engine.read(txn, &key("alice")).unwrap()), 100);
        engine.commit(txn).unwrap();

        assert_eq!(read_committed_balance(&engine, "alice"), 100);
    }

    #[test]
    fn missing_key_surfaces_not_found() {
        let engine = Engine::open_in_memory().unwrap();
        let txn = engine.begin(IsolationLevel::Serializable).unwrap();
        assert!(matches!(
            engine.read(txn, &key("nobody")),
            Err(EngineError::NotFound { .. })
        ));
        engine.abort(txn).unwrap();
    }

    #[test]
    fn abort_twice_is_a_noop() {
        let engine = Engine::open_in_memory().unwrap();
        let txn = engine.begin(IsolationLevel::ReadCommitted).unwrap();
        engine.write(txn, key("alice"), balance(1)).unwrap();

        engine.abort(txn).unwrap();
        engine.abort(txn).unwrap();
        assert_eq!(engine.state_of(txn), Some(TransactionState::Aborted));
    }

    #[test]
    fn transfer_checks_funds_before_any_write() {
        let engine = Engine::open_in_memory().unwrap();
        seed_accounts(&engine);

        // 50 Alice -> Bob succeeds.
        transfer(&engine, "alice", "bob", 50).unwrap();

        // 200 Bob -> Alice fails before touching either balance.
        let result = transfer(&engine, "bob", "alice", 200);
        assert!(matches!(result, Err(TransferError::InsufficientFunds)));

        assert_eq!(read_committed_balance(&engine, "alice"), 50);
        assert_eq!(read_committed_balance(&engine, "bob"), 150);
    }

    #[test]
    fn concurrent_transfers_preserve_the_total() {
        let engine = Arc::new(Engine::open_in_memory().unwrap());
        seed_accounts(&engine);

        let gate = Arc::new(Barrier::new(2));
        let forward = {
            let engine = Arc::clone(&engine);
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                gate.wait();
                transfer(&engine, "alice", "bob", 30)
            })
        };
        let backward = {
            let engine = Arc::clone(&engine);
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                gate.wait();
                transfer(&engine, "bob", "alice", 10)
            })
        };

        // Crossed lock orders mean one side may be picked as a deadlock
        // victim; money must never be created or destroyed either way.
        let _ = forward.join().unwrap();
        let _ = backward.join().unwrap();

        let total = read_committed_balance(&engine, "alice")
            + read_committed_balance(&engine, "bob");
        assert_eq!(total, 200);
    }

    #[test]
    fn read_committed_permits_non_repeatable_reads() {
        let engine = Arc::new(Engine::open_in_memory().unwrap());
        seed_accounts(&engine);

        let before_write = Arc::new(Barrier::new(2));
        let after_commit = Arc::new(Barrier::new(2));

        let writer = {
            let engine = Arc::clone(&engine);
            let before_write = Arc::clone(&before_write);
            let after_commit = Arc::clone(&after_commit);
            thread::spawn(move || {
                let txn = engine.begin(IsolationLevel::ReadCommitted).unwrap();
                let current =
                    parse_balance(&engine.read_for_update(txn, &key("alice")).unwrap());
                assert_eq!(current, 100);

                before_write.wait(); // reader has taken its first look
                engine.write(txn, key("alice"), balance(current - 50)).unwrap();
                engine.commit(txn).unwrap();
                after_commit.wait();
            })
        };

        let reader = engine.begin(IsolationLevel::ReadCommitted).unwrap();
        let first = parse_balance(&engine.read(reader, &key("alice")).unwrap());
        before_write.wait();
        after_commit.wait(); // writer has committed
        let second = parse_balance(&engine.read(reader, &key("alice")).unwrap());
        engine.commit(reader).unwrap();
        writer.join().unwrap();

        assert_eq!(first, 100);
        assert_eq!(second, 50);
    }

    #[test]
    fn serializable_race_has_exactly_one_winner() {
        let engine = Engine::open_in_memory().unwrap();
        seed_accounts(&engine);

        let t1 = engine.begin(IsolationLevel::Serializable).unwrap();
        let t2 = engine.begin(IsolationLevel::Serializable).unwrap();

        // Both observe the same balance before either writes.
        let b1 = parse_balance(&engine.read(t1, &key("alice")).unwrap());
        let b2 = parse_balance(&engine.read(t2, &key("alice")).unwrap());
        assert_eq!(b1, 100);
        assert_eq!(b2, 100);

        engine.write(t1, key("alice"), balance(b1 - 30)).unwrap();
        engine.commit(t1).unwrap();

        engine.write(t2, key("alice"), balance(b2 - 20)).unwrap();
        let loser = engine.commit(t2);
        assert!(matches!(
            loser,
            Err(EngineError::SerializationFailure { .. })
        ));

        // Only the winner's deduction is applied.
        assert_eq!(read_committed_balance(&engine, "alice"), 70);
    }

    #[test]
    fn symmetric_serializable_race_across_threads() {
        let engine = Arc::new(Engine::open_in_memory().unwrap());
        seed_accounts(&engine);

        let reads_done = Arc::new(Barrier::new(2));
        let deduct = |amount: i64| {
            let engine = Arc::clone(&engine);
            let reads_done = Arc::clone(&reads_done);
            thread::spawn(move || -> Result<(), EngineError> {
                let txn = engine.begin(IsolationLevel::Serializable)?;
                let current = parse_balance(&engine.read(txn, &key("alice"))?);
                reads_done.wait(); // both transactions hold the same view
                engine.write(txn, key("alice"), balance(current - amount))?;
                engine.commit(txn)?;
                Ok(())
            })
        };

        let first = deduct(30);
        let second = deduct(20);
        let results = [first.join().unwrap(), second.join().unwrap()];

        let failures = results
            .iter()
            .filter(|r| matches!(r, Err(EngineError::SerializationFailure { .. })))
            .count();
        assert_eq!(failures, 1, "exactly one transaction loses the race");
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);

        let final_balance = read_committed_balance(&engine, "alice");
        assert!(final_balance == 70 || final_balance == 80);
    }

    #[test]
    fn crossed_lock_orders_abort_exactly_one() {
        let engine = Arc::new(Engine::open_in_memory().unwrap());
        seed_accounts(&engine);

        let first_writes_done = Arc::new(Barrier::new(2));

        let run = |first: &'static str, second: &'static str, tag: i64| {
            let engine = Arc::clone(&engine);
            let first_writes_done = Arc::clone(&first_writes_done);
            thread::spawn(move || -> Result<(), EngineError> {
                let txn = engine.begin(IsolationLevel::ReadCommitted)?;
                engine.write(txn, key(first), balance(tag))?;
                first_writes_done.wait(); // both now hold one lock each
                engine.write(txn, key(second), balance(tag))?;
                engine.commit(txn)?;
                Ok(())
            })
        };

        let forward = run("alice", "bob", 1);
        let backward = run("bob", "alice", 2);
        let results = [forward.join().unwrap(), backward.join().unwrap()];

        let deadlocked = results
            .iter()
            .filter(|r| matches!(r, Err(EngineError::DeadlockAborted { .. })))
            .count();
        assert_eq!(deadlocked, 1, "exactly one transaction is the victim");
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);

        // The winner wrote its tag to both keys.
        let alice = read_committed_balance(&engine, "alice");
        let bob = read_committed_balance(&engine, "bob");
        assert_eq!(alice, bob, "only the winner's writes survive");
    }

    #[test]
    fn replay_reconstructs_committed_state() {
        let engine = Engine::open_in_memory().unwrap();
        seed_accounts(&engine);
        transfer(&engine, "alice", "bob", 25).unwrap();

        // An aborted transaction must leave no trace in the log.
        let doomed = engine.begin(IsolationLevel::ReadCommitted).unwrap();
        engine.write(doomed, key("alice"), balance(0)).unwrap();
        engine.abort(doomed).unwrap();

        let bytes = engine.wal_bytes().unwrap();
        let reopened = Engine::open_with_backends(
            Config::default(),
            Box::new(ledgerdb_storage::InMemoryBackend::with_data(bytes)),
        )
        .unwrap();

        assert_eq!(read_committed_balance(&reopened, "alice"), 75);
        assert_eq!(read_committed_balance(&reopened, "bob"), 125);
        assert_eq!(reopened.committed_seq(), engine.committed_seq());
    }

    #[test]
    fn torn_commit_at_tail_is_rolled_back() {
        let engine = Engine::open_in_memory().unwrap();
        seed_accounts(&engine);
        let intact_len = engine.wal_bytes().unwrap().len();

        transfer(&engine, "alice", "bob", 40).unwrap();
        let bytes = engine.wal_bytes().unwrap();

        // Cut into the second commit's records: its marker never became
        // durable, so the whole transfer must vanish on replay.
        let torn = bytes[..intact_len + 5].to_vec();
        let reopened = Engine::open_with_backends(
            Config::default(),
            Box::new(ledgerdb_storage::InMemoryBackend::with_data(torn)),
        )
        .unwrap();

        assert_eq!(read_committed_balance(&reopened, "alice"), 100);
        assert_eq!(read_committed_balance(&reopened, "bob"), 100);
    }

    #[test]
    fn recovered_engine_continues_the_sequence() {
        let engine = Engine::open_in_memory().unwrap();
        seed_accounts(&engine);
        let seq_before = engine.committed_seq();
        let bytes = engine.wal_bytes().unwrap();

        let reopened = Engine::open_with_backends(
            Config::default(),
            Box::new(ledgerdb_storage::InMemoryBackend::with_data(bytes)),
        )
        .unwrap();

        let txn = reopened.begin(IsolationLevel::ReadCommitted).unwrap();
        reopened.write(txn, key("carol"), balance(10)).unwrap();
        let seq_after = reopened.commit(txn).unwrap();
        assert!(seq_after > seq_before);
    }

    #[test]
    fn file_backed_engine_survives_reopen() {
        use ledgerdb_storage::FileBackend;

        let dir = tempfile::tempdir().unwrap();
        let wal_path = dir.path().join("ledger.wal");

        {
            let backend = FileBackend::open(&wal_path).unwrap();
            let engine =
                Engine::open_with_backends(Config::default(), Box::new(backend)).unwrap();
            seed_accounts(&engine);
            transfer(&engine, "alice", "bob", 60).unwrap();
        }

        let backend = FileBackend::open(&wal_path).unwrap();
        let engine = Engine::open_with_backends(Config::default(), Box::new(backend)).unwrap();
        assert_eq!(read_committed_balance(&engine, "alice"), 40);
        assert_eq!(read_committed_balance(&engine, "bob"), 160);
    }

    #[test]
    fn lock_timeout_lets_the_caller_retry() {
        let config = Config::default().lock_wait_timeout(Duration::from_millis(20));
        let engine = Engine::open_with_backends(
            config,
            Box::new(ledgerdb_storage::InMemoryBackend::new()),
        )
        .unwrap();
        seed_accounts(&engine);

        let holder = engine.begin(IsolationLevel::ReadCommitted).unwrap();
        engine.write(holder, key("alice"), balance(1)).unwrap();

        let waiter = engine.begin(IsolationLevel::ReadCommitted).unwrap();
        let err = engine
            .write(waiter, key("alice"), balance(2))
            .unwrap_err();
        assert!(matches!(err, EngineError::LockTimeout { .. }));
        assert!(err.is_retryable());

        // After the holder finishes, a fresh transaction succeeds.
        engine.commit(holder).unwrap();
        let retry = engine.begin(IsolationLevel::ReadCommitted).unwrap();
        engine.write(retry, key("alice"), balance(2)).unwrap();
        engine.commit(retry).unwrap();
    }

    proptest! {
        /// Replaying the WAL from empty state reproduces the exact
        /// committed contents, whatever the commit history was.
        #[test]
        fn wal_replay_matches_live_state(
            ops in proptest::collection::vec((0usize..4, any::<u16>()), 1..40)
        ) {
            let keys = ["alice", "bob", "carol", "dave"];
            let engine = Engine::open_in_memory().unwrap();

            for (key_index, amount) in ops {
                let txn = engine.begin(IsolationLevel::ReadCommitted).unwrap();
                engine
                    .write(txn, key(keys[key_index]), balance(i64::from(amount)))
                    .unwrap();
                engine.commit(txn).unwrap();
            }

            let bytes = engine.wal_bytes().unwrap();
            let reopened = Engine::open_with_backends(
                Config::default(),
                Box::new(ledgerdb_storage::InMemoryBackend::with_data(bytes)),
            )
            .unwrap();

            for name in keys {
                let txn = engine.begin(IsolationLevel::ReadCommitted).unwrap();
                let live = engine.read(txn, &key(name)).ok();
                engine.abort(txn).unwrap();

                let txn = reopened.begin(IsolationLevel::ReadCommitted).unwrap();
                let replayed = reopened.read(txn, &key(name)).ok();
                reopened.abort(txn).unwrap();

                prop_assert_eq!(live, replayed);
            }
        }
    }
}
