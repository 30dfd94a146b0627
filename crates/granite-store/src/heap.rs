//! Versioned row heaps.
//!
//! Each conglomerate is backed by one in-memory heap ordered by the
//! declared key. Rows carry version chains stamped with the writing and
//! deleting transaction ids; visibility composes the reader's snapshot
//! with the transaction arena's recorded states, so a rolled-back
//! writer's versions simply stay invisible until vacuum reclaims them.
//!
//! Savepoint rollback is the only path that physically removes a live
//! transaction's writes. Every write takes a sequence number from a
//! store-wide counter, and undo discards whatever came after the mark.

use crate::conglomerate::ConglomerateDescriptor;
use granite_common::prelude::*;
use granite_txn::{Snapshot, TxnState, TxnStore};
use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One key component with its declared direction baked into the ordering,
/// so the heap's natural order is the conglomerate's logical order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPart {
    pub value: Value,
    descending: bool,
}

impl KeyPart {
    fn new(value: Value, order: SortOrder) -> Self {
        Self {
            value,
            descending: order == SortOrder::Descending,
        }
    }
}

impl Ord for KeyPart {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        let ord = self.value.cmp(&other.value);
        if self.descending {
            ord.reverse()
        } else {
            ord
        }
    }
}

impl PartialOrd for KeyPart {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Stable address of a stored row: its key values plus a row id that
/// disambiguates duplicate keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RecordKey {
    pub parts: Vec<KeyPart>,
    pub row_id: RowId,
}

impl RecordKey {
    fn parts_from(values: Vec<Value>, orders: &[SortOrder]) -> Vec<KeyPart> {
        values
            .into_iter()
            .enumerate()
            .map(|(i, v)| KeyPart::new(v, orders.get(i).copied().unwrap_or_default()))
            .collect()
    }

    /// Lowest possible address carrying these leading key values.
    pub fn floor(values: Vec<Value>, orders: &[SortOrder]) -> Self {
        Self {
            parts: Self::parts_from(values, orders),
            row_id: RowId(0),
        }
    }

    /// Compare this key's leading columns against supplied values, in the
    /// conglomerate's declared order. Missing trailing columns compare as
    /// equal, so partial keys address whole prefix runs.
    pub fn prefix_cmp(&self, values: &[Value], orders: &[SortOrder]) -> CmpOrdering {
        for (i, value) in values.iter().enumerate() {
            let order = orders.get(i).copied().unwrap_or_default();
            let ord = match self.parts.get(i) {
                Some(part) => order.apply(part.value.cmp(value)),
                None => return CmpOrdering::Less,
            };
            if ord != CmpOrdering::Equal {
                return ord;
            }
        }
        CmpOrdering::Equal
    }

    /// The key values, direction stripped.
    pub fn values(&self) -> Vec<Value> {
        self.parts.iter().map(|p| p.value.clone()).collect()
    }
}

/// One stored row version.
#[derive(Debug, Clone)]
struct Version {
    xmin: TxnId,
    xmax: Option<TxnId>,
    seq: u64,
    delete_seq: Option<u64>,
    row: Row,
}

/// Heap statistics.
#[derive(Debug, Clone, Default)]
pub struct HeapStats {
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub writes_undone: u64,
}

/// Statistics from a vacuum pass.
#[derive(Debug, Clone, Default)]
pub struct VacuumStats {
    pub versions_removed: u64,
    pub chains_removed: u64,
    pub deletes_cleared: u64,
}

/// In-memory versioned heap for one conglomerate.
pub struct VersionedHeap {
    id: ConglomId,
    key_columns: Vec<usize>,
    sort_orders: Vec<SortOrder>,
    /// Version chains keyed by record address, in logical key order
    rows: RwLock<BTreeMap<RecordKey, Vec<Version>>>,
    /// Next row id within this heap
    next_row_id: AtomicU64,
    /// Store-wide write sequence, shared across heaps for savepoint marks
    write_seq: Arc<AtomicU64>,
    /// Statistics
    stats: Mutex<HeapStats>,
}

impl VersionedHeap {
    pub fn new(descriptor: &ConglomerateDescriptor, write_seq: Arc<AtomicU64>) -> Self {
        Self {
            id: descriptor.id,
            key_columns: descriptor.key_columns().to_vec(),
            sort_orders: descriptor.sort_orders().to_vec(),
            rows: RwLock::new(BTreeMap::new()),
            next_row_id: AtomicU64::new(1),
            write_seq,
            stats: Mutex::new(HeapStats::default()),
        }
    }

    pub fn id(&self) -> ConglomId {
        self.id
    }

    pub fn sort_orders(&self) -> &[SortOrder] {
        &self.sort_orders
    }

    fn key_values(&self, row: &Row) -> Result<Vec<Value>> {
        self.key_columns
            .iter()
            .map(|&pos| {
                row.values
                    .get(pos)
                    .cloned()
                    .ok_or_else(|| StoreError::ColumnOutOfRange(pos).into())
            })
            .collect()
    }

    fn next_seq(&self) -> u64 {
        self.write_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Whether a version is visible: its writer's chain is visible and no
    /// visible deleter has claimed it.
    fn version_visible(store: &TxnStore, snapshot: &Snapshot, v: &Version) -> bool {
        if !store.write_visible_to(snapshot, v.xmin) {
            return false;
        }
        match v.xmax {
            Some(deleter) => !store.write_visible_to(snapshot, deleter),
            None => true,
        }
    }

    /// Whether a delete stamp still counts. A rolled-back deleter leaves a
    /// stale stamp that a later writer may overwrite.
    fn delete_live(store: &TxnStore, v: &Version) -> bool {
        match v.xmax {
            // Absent from the arena means gc reclaimed a committed record.
            Some(deleter) => store.state(deleter) != Some(TxnState::RolledBack),
            None => false,
        }
    }

    /// Insert a row, returning its address.
    pub fn insert(&self, txn: TxnId, row: Row) -> Result<RecordKey> {
        let values = self.key_values(&row)?;
        let row_id = RowId(self.next_row_id.fetch_add(1, Ordering::SeqCst));
        let key = RecordKey {
            parts: RecordKey::parts_from(values, &self.sort_orders),
            row_id,
        };
        let version = Version {
            xmin: txn,
            xmax: None,
            seq: self.next_seq(),
            delete_seq: None,
            row,
        };
        self.rows.write().entry(key.clone()).or_default().push(version);
        self.stats.lock().inserts += 1;
        Ok(key)
    }

    /// Fetch the version of a row visible to `snapshot`, if any.
    pub fn visible_row(
        &self,
        store: &TxnStore,
        snapshot: &Snapshot,
        key: &RecordKey,
    ) -> Option<Row> {
        let rows = self.rows.read();
        let chain = rows.get(key)?;
        chain
            .iter()
            .rev()
            .find(|v| Self::version_visible(store, snapshot, v))
            .map(|v| v.row.clone())
    }

    /// Delete the visible version of a row by stamping it with `txn`.
    pub fn delete(
        &self,
        store: &TxnStore,
        txn: TxnId,
        snapshot: &Snapshot,
        key: &RecordKey,
    ) -> Result<()> {
        let mut rows = self.rows.write();
        let chain = rows.get_mut(key).ok_or(StoreError::RecordNotFound)?;
        let target = chain
            .iter_mut()
            .rev()
            .find(|v| Self::version_visible(store, snapshot, v) && !Self::delete_live(store, v))
            .ok_or(StoreError::RecordNotFound)?;
        target.xmax = Some(txn);
        target.delete_seq = Some(self.next_seq());
        self.stats.lock().deletes += 1;
        Ok(())
    }

    /// Replace the visible version of a row. A change to non-key columns
    /// extends the version chain in place; a key change deletes the old
    /// address and inserts at the new one.
    pub fn update(
        &self,
        store: &TxnStore,
        txn: TxnId,
        snapshot: &Snapshot,
        key: &RecordKey,
        new_row: Row,
    ) -> Result<RecordKey> {
        let new_values = self.key_values(&new_row)?;
        let new_parts = RecordKey::parts_from(new_values, &self.sort_orders);

        if new_parts == key.parts {
            let mut rows = self.rows.write();
            let chain = rows.get_mut(key).ok_or(StoreError::RecordNotFound)?;
            let target = chain
                .iter_mut()
                .rev()
                .find(|v| Self::version_visible(store, snapshot, v) && !Self::delete_live(store, v))
                .ok_or(StoreError::RecordNotFound)?;
            target.xmax = Some(txn);
            target.delete_seq = Some(self.next_seq());
            chain.push(Version {
                xmin: txn,
                xmax: None,
                seq: self.next_seq(),
                delete_seq: None,
                row: new_row,
            });
            self.stats.lock().updates += 1;
            Ok(key.clone())
        } else {
            self.delete(store, txn, snapshot, key)?;
            let new_key = self.insert(txn, new_row)?;
            let mut stats = self.stats.lock();
            stats.updates += 1;
            // Rebalance the counters bumped by the two halves.
            stats.inserts -= 1;
            stats.deletes -= 1;
            Ok(new_key)
        }
    }

    /// First row at or after `lower` with a version visible to `snapshot`.
    pub fn next_visible(
        &self,
        store: &TxnStore,
        snapshot: &Snapshot,
        lower: Bound<&RecordKey>,
    ) -> Option<(RecordKey, Row)> {
        let rows = self.rows.read();
        for (key, chain) in rows.range((lower, Bound::Unbounded)) {
            if let Some(v) = chain
                .iter()
                .rev()
                .find(|v| Self::version_visible(store, snapshot, v))
            {
                return Some((key.clone(), v.row.clone()));
            }
        }
        None
    }

    /// Discard writes made by `txn` with a sequence number at or after
    /// `since`. Returns the number of effects undone. The mark is the
    /// counter value captured before the writes being undone, so the
    /// comparison is inclusive.
    pub fn undo_writes(&self, txn: TxnId, since: u64) -> usize {
        let mut rows = self.rows.write();
        let mut undone = 0;

        for chain in rows.values_mut() {
            chain.retain(|v| {
                let drop_it = v.xmin == txn && v.seq >= since;
                if drop_it {
                    undone += 1;
                }
                !drop_it
            });
            for v in chain.iter_mut() {
                if v.xmax == Some(txn) && v.delete_seq.map_or(false, |s| s >= since) {
                    v.xmax = None;
                    v.delete_seq = None;
                    undone += 1;
                }
            }
        }
        rows.retain(|_, chain| !chain.is_empty());

        self.stats.lock().writes_undone += undone as u64;
        undone
    }

    /// Reclaim versions no active transaction can see: versions whose
    /// writer rolled back, and versions deleted by a transaction that
    /// committed before the oldest active one. Stale delete stamps from
    /// rolled-back transactions are cleared.
    pub fn vacuum(&self, store: &TxnStore, oldest_active: TxnId) -> VacuumStats {
        let mut stats = VacuumStats::default();
        let mut rows = self.rows.write();

        for chain in rows.values_mut() {
            for v in chain.iter_mut() {
                if let Some(deleter) = v.xmax {
                    if store.state(deleter) == Some(TxnState::RolledBack) {
                        v.xmax = None;
                        v.delete_seq = None;
                        stats.deletes_cleared += 1;
                    }
                }
            }
            chain.retain(|v| {
                let dead = match store.state(v.xmin) {
                    Some(TxnState::RolledBack) => true,
                    _ => match v.xmax {
                        Some(deleter) => {
                            deleter < oldest_active
                                && store.state(deleter) != Some(TxnState::RolledBack)
                                && !store.is_active(deleter)
                        }
                        None => false,
                    },
                };
                if dead {
                    stats.versions_removed += 1;
                }
                !dead
            });
        }

        let before = rows.len();
        rows.retain(|_, chain| !chain.is_empty());
        stats.chains_removed += (before - rows.len()) as u64;
        stats
    }

    /// Number of row addresses with at least one version.
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Count rows visible to a snapshot.
    pub fn count_visible(&self, store: &TxnStore, snapshot: &Snapshot) -> usize {
        let rows = self.rows.read();
        rows.values()
            .filter(|chain| {
                chain
                    .iter()
                    .any(|v| Self::version_visible(store, snapshot, v))
            })
            .count()
    }

    pub fn stats(&self) -> HeapStats {
        self.stats.lock().clone()
    }
}
