//! Transaction management.
//!
//! The [`TransactionManager`] is the engine's coordination point. It
//! allocates transaction IDs and snapshots, routes reads and writes
//! through the record store and lock manager according to the active
//! isolation level, and serializes commits so that visible commit order
//! matches WAL order.
//!
//! Transactions are owned by the manager and addressed by ID; callers
//! never hold the transaction object itself. Finalized transactions are
//! retained for audit until garbage-collected.

mod isolation;
mod manager;
mod state;

pub use isolation::IsolationLevel;
pub use manager::TransactionManager;
pub use state::TransactionState;
