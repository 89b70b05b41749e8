//! Row-level lock manager.
//!
//! Locks are keyed by record key and come in two modes: shared (readers
//! may coexist) and exclusive (sole access). `acquire` blocks the calling
//! thread until the lock is granted, the request times out, or the
//! request would close a cycle in the wait-for graph — in which case the
//! requester is the deadlock victim. The victim rule is deterministic:
//! the transaction whose edge completes the cycle aborts, never the
//! transactions already waiting.
//!
//! Lock acquisition is the engine's only blocking point.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use crate::error::{EngineError, EngineResult};
use crate::types::{Key, TransactionId};

/// Lock modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared access; coexists with other shared holders.
    Shared,
    /// Exclusive access; excludes every other lock.
    Exclusive,
}

#[derive(Debug)]
struct LockEntry {
    mode: LockMode,
    holders: HashSet<TransactionId>,
}

#[derive(Debug, Default)]
struct LockState {
    /// Granted locks by key.
    table: HashMap<Key, LockEntry>,
    /// Wait-for edges: blocked transaction -> transactions it waits on.
    wait_for: HashMap<TransactionId, HashSet<TransactionId>>,
}

enum Grant {
    Granted,
    Blocked(HashSet<TransactionId>),
}

/// Shared/exclusive lock table with deadlock detection.
///
/// The lock manager references transactions by ID only; it never owns
/// transaction state.
#[derive(Debug, Default)]
pub struct LockManager {
    state: Mutex<LockState>,
    released: Condvar,
}

impl LockManager {
    /// Creates an empty lock manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires a lock on `key` for `txn`, blocking while incompatible
    /// locks are held.
    ///
    /// Re-acquiring a lock already held (or a shared lock while holding
    /// exclusive) is a no-op. A shared holder requesting exclusive is
    /// upgraded in place when it is the sole holder; otherwise the
    /// request waits like a fresh exclusive request.
    ///
    /// # Errors
    ///
    /// - [`EngineError::DeadlockAborted`] if this request would close a
    ///   wait-for cycle
    /// - [`EngineError::LockTimeout`] if `timeout` elapses while waiting
    pub fn acquire(
        &self,
        txn: TransactionId,
        key: &Key,
        mode: LockMode,
        timeout: Duration,
    ) -> EngineResult<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        loop {
            match Self::try_grant(&mut state, txn, key, mode) {
                Grant::Granted => {
                    state.wait_for.remove(&txn);
                    trace!(%txn, %key, ?mode, "lock granted");
                    return Ok(());
                }
                Grant::Blocked(holders) => {
                    if holders
                        .iter()
                        .any(|h| Self::reaches(&state.wait_for, *h, txn))
                    {
                        state.wait_for.remove(&txn);
                        warn!(%txn, %key, "lock request closes wait-for cycle, aborting requester");
                        return Err(EngineError::DeadlockAborted { txn });
                    }

                    state.wait_for.insert(txn, holders);
                    let result = self.released.wait_until(&mut state, deadline);
                    if result.timed_out() {
                        state.wait_for.remove(&txn);
                        return Err(EngineError::LockTimeout {
                            txn,
                            key: key.clone(),
                        });
                    }
                }
            }
        }
    }

    /// Releases every lock held by `txn` and wakes all waiters.
    ///
    /// Called exactly once, at transaction finalization.
    pub fn release_all(&self, txn: TransactionId) {
        let mut state = self.state.lock();
        state.table.retain(|_, entry| {
            entry.holders.remove(&txn);
            !entry.holders.is_empty()
        });
        // Drop the transaction's own edges and any edges pointing at it,
        // so waiters never chase a finalized holder.
        state.wait_for.remove(&txn);
        for holders in state.wait_for.values_mut() {
            holders.remove(&txn);
        }
        drop(state);
        trace!(%txn, "released all locks");
        self.released.notify_all();
    }

    /// Whether `txn` holds an exclusive lock on `key`.
    #[must_use]
    pub fn holds_exclusive(&self, txn: TransactionId, key: &Key) -> bool {
        let state = self.state.lock();
        state
            .table
            .get(key)
            .is_some_and(|e| e.mode == LockMode::Exclusive && e.holders.contains(&txn))
    }

    /// Number of keys on which `txn` holds a lock.
    #[must_use]
    pub fn held_count(&self, txn: TransactionId) -> usize {
        let state = self.state.lock();
        state
            .table
            .values()
            .filter(|e| e.holders.contains(&txn))
            .count()
    }

    fn try_grant(state: &mut LockState, txn: TransactionId, key: &Key, mode: LockMode) -> Grant {
        let Some(entry) = state.table.get_mut(key) else {
            state.table.insert(
                key.clone(),
                LockEntry {
                    mode,
                    holders: HashSet::from([txn]),
                },
            );
            return Grant::Granted;
        };

        if entry.holders.contains(&txn) {
            return match (entry.mode, mode) {
                // Holding exclusive satisfies anything; a repeated shared
                // request is a no-op.
                (_, LockMode::Shared) | (LockMode::Exclusive, LockMode::Exclusive) => {
                    Grant::Granted
                }
                (LockMode::Shared, LockMode::Exclusive) => {
                    if entry.holders.len() == 1 {
                        entry.mode = LockMode::Exclusive;
                        Grant::Granted
                    } else {
                        let others = entry.holders.iter().copied().filter(|h| *h != txn).collect();
                        Grant::Blocked(others)
                    }
                }
            };
        }

        match (entry.mode, mode) {
            (LockMode::Shared, LockMode::Shared) => {
                entry.holders.insert(txn);
                Grant::Granted
            }
            _ => Grant::Blocked(entry.holders.clone()),
        }
    }

    /// Whether `from` transitively waits on `target` in the wait-for graph.
    fn reaches(
        wait_for: &HashMap<TransactionId, HashSet<TransactionId>>,
        from: TransactionId,
        target: TransactionId,
    ) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![from];
        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(next) = wait_for.get(&current) {
                stack.extend(next.iter().copied());
            }
        }
        false
    }
}
