//! Snapshot-based visibility.
//!
//! A snapshot captures which transactions had committed at a point in time.
//! [`Snapshot::is_visible`] answers the snapshot-relative half of the
//! visibility question; it assumes the writer eventually committed. Callers
//! that must also exclude rolled-back writers combine it with
//! [`TxnStore::write_visible_to`](crate::store::TxnStore::write_visible_to),
//! which consults the transaction arena.

use granite_common::prelude::*;
use std::collections::HashSet;

/// Snapshot for transaction visibility.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Transaction ID that created this snapshot
    pub txn_id: TxnId,
    /// Minimum active transaction ID when the snapshot was created
    pub xmin: TxnId,
    /// Maximum transaction ID when the snapshot was created (exclusive)
    pub xmax: TxnId,
    /// Active transaction IDs when the snapshot was created
    pub active_txns: HashSet<TxnId>,
    /// This transaction's id plus all ancestor ids. Writes by any member of
    /// the lineage are visible even while uncommitted, so a nested child
    /// observes its parent's in-flight work.
    pub lineage: HashSet<TxnId>,
}

impl Snapshot {
    /// Create a new snapshot.
    pub fn new(
        txn_id: TxnId,
        xmin: TxnId,
        xmax: TxnId,
        active_txns: HashSet<TxnId>,
        lineage: HashSet<TxnId>,
    ) -> Self {
        Self {
            txn_id,
            xmin,
            xmax,
            active_txns,
            lineage,
        }
    }

    /// Check if a transaction's changes are visible to this snapshot.
    pub fn is_visible(&self, other_txn_id: TxnId) -> bool {
        // Own chain is visible, even though ancestors sit in the active set
        if self.lineage.contains(&other_txn_id) {
            return true;
        }

        // Transactions started after this snapshot are not visible
        if other_txn_id >= self.xmax {
            return false;
        }

        // Transactions that were active when the snapshot was taken are not visible
        if self.active_txns.contains(&other_txn_id) {
            return false;
        }

        // All committed transactions before xmax are visible
        true
    }
}
