//! # LedgerDB Storage
//!
//! Storage backend trait and implementations for LedgerDB.
//!
//! This crate is the lowest layer of the engine: backends are **opaque
//! append-only byte stores**. They do not know what a WAL record or a
//! committed version is; the core crate owns all format interpretation.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - for tests and ephemeral engines
//! - [`FileBackend`] - persistent storage over OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use ledgerdb_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"ledger entry").unwrap();
//! assert_eq!(backend.read_at(offset, 12).unwrap(), b"ledger entry");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
