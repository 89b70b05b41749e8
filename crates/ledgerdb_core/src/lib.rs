//! # LedgerDB Core
//!
//! A transactional key-value engine with pluggable isolation levels,
//! row-level locking, and snapshot-based conflict detection.
//!
//! The engine is built from four cooperating components:
//!
//! - **Record store**: versioned in-memory key space with append-only
//!   version chains
//! - **Write-ahead log**: durable, ordered record of committed operations,
//!   replayed on open
//! - **Lock manager**: shared/exclusive row locks with wait-for-graph
//!   deadlock detection
//! - **Transaction manager**: begin/commit/abort lifecycle, snapshot
//!   assignment, and isolation-level policy enforcement
//!
//! # Example
//!
//! ```rust
//! use ledgerdb_core::{Engine, IsolationLevel, Key};
//!
//! let engine = Engine::open_in_memory().unwrap();
//!
//! let txn = engine.begin(IsolationLevel::ReadCommitted).unwrap();
//! engine.write(txn, Key::new("alice"), b"100".to_vec()).unwrap();
//! engine.commit(txn).unwrap();
//!
//! let reader = engine.begin(IsolationLevel::Serializable).unwrap();
//! assert_eq!(engine.read(reader, &Key::new("alice")).unwrap(), b"100");
//! engine.abort(reader).unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod engine;
mod error;
mod lock;
mod store;
mod transaction;
mod types;
mod wal;

pub use config::Config;
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use lock::{LockManager, LockMode};
pub use store::RecordStore;
pub use transaction::{IsolationLevel, TransactionManager, TransactionState};
pub use types::{Key, SequenceNumber, TransactionId};
pub use wal::{WalManager, WalRecord};
