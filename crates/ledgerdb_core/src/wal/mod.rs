//! Write-ahead log for durability and crash recovery.
//!
//! The WAL records **committed operations only**. A commit appends one
//! `Write` record per key in the transaction's write set (all stamped
//! with the commit sequence, in write order) followed by a `Commit`
//! marker, and flushes before any version becomes visible. Aborted and
//! in-flight transactions leave no trace.
//!
//! ## Record format
//!
//! ```text
//! | magic (4) | version (2) | type (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! ## Recovery policy
//!
//! Replay applies a commit's writes only when its `Commit` marker is
//! present, so a crash mid-commit rolls the whole commit back.
//!
//! Tolerated conditions, treated as a clean end of durable history:
//!
//! - truncated header (fewer than 11 bytes at the tail)
//! - truncated payload (record length exceeds remaining bytes)
//!
//! Fatal conditions, which fail the open:
//!
//! - CRC mismatch
//! - invalid magic bytes
//! - unknown record type or unsupported format version
//!
//! ## Invariants
//!
//! - append-only; records are never modified
//! - flushed before a commit is acknowledged
//! - visible commit order equals WAL order (both assigned under the
//!   commit mutex)
//! - replay is idempotent over the same bytes

mod iterator;
mod record;
mod writer;

pub use iterator::WalRecordIterator;
pub use record::{compute_crc32, WalRecord, WalRecordType};
pub use writer::WalManager;
