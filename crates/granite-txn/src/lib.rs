//! # Granite Transactions
//!
//! Transaction management for Granite providing:
//! - Nested transactions (one level deep) in an arena keyed by id
//! - Snapshot-based visibility over multi-version storage
//! - Read-only to writable elevation along the parent chain
//! - Two-phase (XA) commit entry points
//! - An active-transaction index for online schema changes

pub mod snapshot;
pub mod store;
pub mod txn;

// Re-export key types for convenience
pub use snapshot::Snapshot;
pub use store::{TxnStats, TxnStore};
pub use txn::{Txn, TxnKind, TxnState, XaVote};
