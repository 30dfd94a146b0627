//! Session-scoped access layer.
//!
//! An [`AccessManager`] owns the transaction arena, the conglomerate
//! registry, the row heaps and the lock table. A session drives one
//! [`TransactionController`] at a time: it opens conglomerate and scan
//! handles, marks savepoints, creates temporary conglomerates and
//! changes structure, and the controller tracks all of it so commit and
//! abort can settle the bookkeeping in one place.
//!
//! Handles are reference counted. Commit closes the handles not opened
//! with hold; abort closes every one. A handle the caller still owns
//! after its controller finished refuses further work.

use crate::conglomerate::ConglomerateDescriptor;
use crate::heap::{RecordKey, VacuumStats, VersionedHeap};
use crate::lock::{LockMode, LockTable};
use crate::registry::ConglomerateRegistry;
use crate::scan::{ScanController, ScanSpec};
use dashmap::DashMap;
use granite_common::config::TxnConfig;
use granite_common::prelude::*;
use granite_common::types::ColumnDef;
use granite_txn::{Txn, TxnState, TxnStore, XaVote};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// ============================================================================
// Access manager
// ============================================================================

/// Shared entry point to the storage layer. One per process.
pub struct AccessManager {
    store: Arc<TxnStore>,
    registry: Arc<ConglomerateRegistry>,
    heaps: DashMap<ConglomId, Arc<VersionedHeap>>,
    locks: Arc<LockTable>,
    /// Write sequence shared by every heap, so one savepoint mark covers
    /// them all
    write_seq: Arc<AtomicU64>,
}

impl AccessManager {
    pub fn new(config: TxnConfig) -> Self {
        let lock_timeout = config.lock_timeout;
        Self {
            store: Arc::new(TxnStore::new(config)),
            registry: Arc::new(ConglomerateRegistry::new()),
            heaps: DashMap::new(),
            locks: Arc::new(LockTable::new(lock_timeout)),
            write_seq: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn txn_store(&self) -> &Arc<TxnStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ConglomerateRegistry> {
        &self.registry
    }

    pub fn lock_table(&self) -> &Arc<LockTable> {
        &self.locks
    }

    /// Heap backing a shared conglomerate.
    pub fn heap(&self, id: ConglomId) -> Result<Arc<VersionedHeap>> {
        self.heaps
            .get(&id)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| StoreError::ConglomerateNotFound(id.0).into())
    }

    /// Begin a root transaction at the configured default isolation.
    pub fn begin_default(self: &Arc<Self>) -> Result<TransactionController> {
        let txn = self.store.begin_default()?;
        Ok(TransactionController::attach(Arc::clone(self), txn, false))
    }

    /// Begin a root transaction.
    pub fn begin(self: &Arc<Self>, isolation: IsolationLevel) -> Result<TransactionController> {
        let txn = self.store.begin(isolation)?;
        Ok(TransactionController::attach(Arc::clone(self), txn, false))
    }

    /// Adopt an externally produced transaction record as a read-only
    /// view. The controller can read under the record's visibility but
    /// never write, elevate or mark savepoints.
    pub fn adopt_view(self: &Arc<Self>, record: Txn) -> Result<TransactionController> {
        let txn = self.store.register_view(record)?;
        Ok(TransactionController::attach(Arc::clone(self), txn, true))
    }

    /// Reclaim dead row versions across every heap, then let the arena
    /// forget the terminal transactions nothing references anymore. The
    /// heaps must go first: version reclamation still consults the
    /// outcome of each writer.
    pub fn vacuum(&self) -> VacuumStats {
        let oldest = self.store.oldest_active_txn();
        let mut total = VacuumStats::default();
        for entry in self.heaps.iter() {
            let stats = entry.value().vacuum(&self.store, oldest);
            total.versions_removed += stats.versions_removed;
            total.chains_removed += stats.chains_removed;
            total.deletes_cleared += stats.deletes_cleared;
        }
        self.store.gc(oldest);
        info!(
            versions = total.versions_removed,
            chains = total.chains_removed,
            "vacuum pass complete"
        );
        total
    }
}

// ============================================================================
// Conglomerate controller
// ============================================================================

/// Row-level handle on one conglomerate, bound to one transaction.
pub struct ConglomerateController {
    heap: Arc<VersionedHeap>,
    store: Arc<TxnStore>,
    descriptor: ConglomerateDescriptor,
    txn: TxnId,
    for_update: bool,
    closed: bool,
}

impl ConglomerateController {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(StoreError::ControllerClosed.into());
        }
        Ok(())
    }

    fn ensure_updatable(&self) -> Result<()> {
        self.ensure_open()?;
        if !self.for_update {
            return Err(StoreError::NotOpenForUpdate(self.descriptor.id.0).into());
        }
        Ok(())
    }

    /// Spread a visible-width row across the storage layout.
    fn to_storage(&self, row: Row) -> Result<Row> {
        if row.values.len() != self.descriptor.column_count() {
            return Err(Error::invalid_argument(format!(
                "row with {} values does not fit {} ({} columns)",
                row.values.len(),
                self.descriptor.name,
                self.descriptor.column_count()
            )));
        }
        let mut storage = vec![Value::Null; self.descriptor.storage_width()];
        for (i, v) in row.values.into_iter().enumerate() {
            let pos = self
                .descriptor
                .position_of(i)
                .ok_or(StoreError::ColumnOutOfRange(i))?;
            storage[pos] = v;
        }
        Ok(Row::new(storage))
    }

    /// Collapse a storage row back to the visible columns.
    fn to_logical(&self, row: &Row) -> Row {
        let values = (0..self.descriptor.column_count())
            .map(|i| {
                match self
                    .descriptor
                    .position_of(i)
                    .and_then(|pos| row.values.get(pos))
                {
                    Some(v) => v.clone(),
                    None => self.descriptor.default_for(i),
                }
            })
            .collect();
        Row::new(values)
    }

    pub fn descriptor(&self) -> &ConglomerateDescriptor {
        &self.descriptor
    }

    pub fn insert(&mut self, row: Row) -> Result<RecordKey> {
        self.ensure_updatable()?;
        let storage = self.to_storage(row)?;
        self.heap.insert(self.txn, storage)
    }

    /// Fetch the row at `key` as this transaction currently sees it.
    pub fn fetch(&self, key: &RecordKey) -> Result<Option<Row>> {
        self.ensure_open()?;
        let view = self.store.current_view(self.txn)?;
        Ok(self
            .heap
            .visible_row(&self.store, &view, key)
            .map(|row| self.to_logical(&row)))
    }

    pub fn update(&mut self, key: &RecordKey, row: Row) -> Result<RecordKey> {
        self.ensure_updatable()?;
        let storage = self.to_storage(row)?;
        let view = self.store.current_view(self.txn)?;
        self.heap.update(&self.store, self.txn, &view, key, storage)
    }

    pub fn delete(&mut self, key: &RecordKey) -> Result<()> {
        self.ensure_updatable()?;
        let view = self.store.current_view(self.txn)?;
        self.heap.delete(&self.store, self.txn, &view, key)
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

// ============================================================================
// Transaction controller
// ============================================================================

struct OpenTable {
    handle: Arc<Mutex<ConglomerateController>>,
    hold: bool,
}

struct OpenScan {
    handle: Arc<Mutex<ScanController>>,
    hold: bool,
}

struct Savepoint {
    name: String,
    mark: u64,
}

/// Session facade over one transaction.
pub struct TransactionController {
    mgr: Arc<AccessManager>,
    txn: TxnId,
    /// Root of this transaction tree; locks are scoped to it
    root: TxnId,
    is_view: bool,
    tables: Vec<OpenTable>,
    scans: Vec<OpenScan>,
    /// Session-owned temporary conglomerates, keyed by negative id
    temp: HashMap<ConglomId, (ConglomerateDescriptor, Arc<VersionedHeap>)>,
    /// Shared conglomerates created under this transaction
    created: Vec<ConglomId>,
    /// Heaps detached by a drop, kept for abort recovery
    dropped: Vec<(ConglomId, Arc<VersionedHeap>)>,
    /// Shared conglomerates this transaction accessed, scoping undo
    touched: HashSet<ConglomId>,
    savepoints: Vec<Savepoint>,
    structure_changed: bool,
    finished: bool,
}

impl TransactionController {
    fn attach(mgr: Arc<AccessManager>, txn: TxnId, is_view: bool) -> Self {
        let root = mgr.store.absolute_root(txn).unwrap_or(txn);
        Self {
            mgr,
            txn,
            root,
            is_view,
            tables: Vec::new(),
            scans: Vec::new(),
            temp: HashMap::new(),
            created: Vec::new(),
            dropped: Vec::new(),
            touched: HashSet::new(),
            savepoints: Vec::new(),
            structure_changed: false,
            finished: false,
        }
    }

    pub fn id(&self) -> TxnId {
        self.txn
    }

    pub fn tree_root(&self) -> TxnId {
        self.root
    }

    pub fn is_view(&self) -> bool {
        self.is_view
    }

    pub fn is_writable(&self) -> Result<bool> {
        self.mgr.store.is_writable(self.txn)
    }

    /// Whether this transaction changed structure that a commit or abort
    /// has not yet settled.
    pub fn structure_changed(&self) -> bool {
        self.structure_changed
    }

    /// Request write permission for this transaction and its chain.
    pub fn elevate(&self, label: &str) -> Result<()> {
        self.mgr.store.elevate(self.txn, label)
    }

    fn resolve(&self, id: ConglomId) -> Result<(ConglomerateDescriptor, Arc<VersionedHeap>)> {
        if id.is_temporary() {
            return self
                .temp
                .get(&id)
                .map(|(d, h)| (d.clone(), Arc::clone(h)))
                .ok_or_else(|| StoreError::ConglomerateNotFound(id.0).into());
        }
        let descriptor = self
            .mgr
            .registry
            .get(id)
            .ok_or(StoreError::ConglomerateNotFound(id.0))?;
        let heap = self.mgr.heap(id)?;
        Ok((descriptor, heap))
    }

    /// Register row access against the shared object, for the online
    /// schema change drain. Temporaries are invisible to other sessions
    /// and stay out of the index.
    fn note_access(&mut self, id: ConglomId) -> Result<()> {
        if !id.is_temporary() {
            self.mgr
                .locks
                .acquire(self.root, self.txn, id, LockMode::Shared)?;
            self.mgr.store.touch(self.txn, id.object())?;
            self.touched.insert(id);
        }
        Ok(())
    }

    /// Open a row-level handle. `for_update` elevates the transaction and
    /// permits writes through the handle; `hold` keeps it open across
    /// commit. Temporaries never elevate: their rows die with the session,
    /// so the transaction can stay a read-only voter.
    pub fn open_conglomerate(
        &mut self,
        id: ConglomId,
        for_update: bool,
        hold: bool,
    ) -> Result<Arc<Mutex<ConglomerateController>>> {
        self.ensure_unfinished()?;
        if for_update && !id.is_temporary() {
            self.elevate("open for update")?;
        }
        let (descriptor, heap) = self.resolve(id)?;
        self.note_access(id)?;

        let handle = Arc::new(Mutex::new(ConglomerateController {
            heap,
            store: Arc::clone(&self.mgr.store),
            descriptor,
            txn: self.txn,
            for_update,
            closed: false,
        }));
        self.tables.push(OpenTable {
            handle: Arc::clone(&handle),
            hold,
        });
        Ok(handle)
    }

    /// Open a cursor over a conglomerate. The scan fixes its snapshot and
    /// its view of the structure at open time.
    pub fn open_scan(
        &mut self,
        id: ConglomId,
        spec: ScanSpec,
        hold: bool,
    ) -> Result<Arc<Mutex<ScanController>>> {
        self.ensure_unfinished()?;
        let (descriptor, heap) = self.resolve(id)?;
        self.note_access(id)?;
        let snapshot = self.mgr.store.current_view(self.txn)?;

        let handle = Arc::new(Mutex::new(ScanController::new(
            heap,
            Arc::clone(&self.mgr.store),
            descriptor,
            self.txn,
            snapshot,
            spec,
        )));
        self.scans.push(OpenScan {
            handle: Arc::clone(&handle),
            hold,
        });
        Ok(handle)
    }

    /// Open a cursor intended for batched delivery. Identical contract to
    /// [`open_scan`](Self::open_scan); rows come out through
    /// `fetch_next_group`.
    pub fn open_group_fetch_scan(
        &mut self,
        id: ConglomId,
        spec: ScanSpec,
        hold: bool,
    ) -> Result<Arc<Mutex<ScanController>>> {
        self.open_scan(id, spec, hold)
    }

    // ------------------------------------------------------------------
    // Conglomerate lifecycle
    // ------------------------------------------------------------------

    /// Create a conglomerate. Temporary ones live in this session only
    /// and draw ids from the negative space; shared ones go through the
    /// registry and are visible to everyone immediately.
    pub fn create_conglomerate(
        &mut self,
        mut descriptor: ConglomerateDescriptor,
        temporary: bool,
    ) -> Result<ConglomId> {
        self.ensure_unfinished()?;
        if temporary {
            descriptor.id = self.mgr.registry.allocate_temp_id();
            descriptor.validate()?;
            let heap = Arc::new(VersionedHeap::new(
                &descriptor,
                Arc::clone(&self.mgr.write_seq),
            ));
            let id = descriptor.id;
            self.temp.insert(id, (descriptor, heap));
            debug!(conglomerate = %id, txn = %self.txn, "created temporary conglomerate");
            return Ok(id);
        }

        self.elevate("create conglomerate")?;
        let id = self.mgr.registry.create(descriptor)?;
        let descriptor = self
            .mgr
            .registry
            .get(id)
            .ok_or_else(|| Error::internal("created conglomerate vanished"))?;
        let heap = Arc::new(VersionedHeap::new(
            &descriptor,
            Arc::clone(&self.mgr.write_seq),
        ));
        self.mgr.heaps.insert(id, heap);
        self.created.push(id);
        Ok(id)
    }

    /// Async creation for callers on a runtime worker. Registration is
    /// in-memory today, so this delegates after yielding once; a durable
    /// substrate would move its I/O here.
    pub async fn create_conglomerate_async(
        &mut self,
        descriptor: ConglomerateDescriptor,
        temporary: bool,
    ) -> Result<ConglomId> {
        tokio::task::yield_now().await;
        self.create_conglomerate(descriptor, temporary)
    }

    /// Drop a conglomerate. Shared drops take the exclusive lock and can
    /// be undone by abort; temporary drops are immediate.
    pub fn drop_conglomerate(&mut self, id: ConglomId) -> Result<()> {
        self.ensure_unfinished()?;
        if id.is_temporary() {
            self.temp
                .remove(&id)
                .ok_or(StoreError::ConglomerateNotFound(id.0))?;
            return Ok(());
        }

        self.elevate("drop conglomerate")?;
        self.mgr
            .locks
            .acquire(self.root, self.txn, id, LockMode::Exclusive)?;
        self.mgr.registry.drop_conglomerate(self.txn, id)?;
        if let Some((_, heap)) = self.mgr.heaps.remove(&id) {
            self.dropped.push((id, heap));
        }
        self.structure_changed = true;
        Ok(())
    }

    /// Add a column to a conglomerate. The new column occupies a fresh
    /// storage position; existing rows surface its default.
    pub fn add_column(&mut self, id: ConglomId, column: ColumnDef) -> Result<()> {
        self.alter(id, |descriptor| {
            descriptor.add_column(column);
            Ok(())
        })
    }

    /// Drop a visible column. Stored rows keep their layout; the column
    /// simply stops being addressable.
    pub fn drop_column(&mut self, id: ConglomId, index: usize) -> Result<()> {
        self.alter(id, |descriptor| descriptor.drop_column(index))
    }

    fn alter(
        &mut self,
        id: ConglomId,
        change: impl FnOnce(&mut ConglomerateDescriptor) -> Result<()>,
    ) -> Result<()> {
        self.ensure_unfinished()?;
        if id.is_temporary() {
            let (descriptor, _) = self
                .temp
                .get_mut(&id)
                .ok_or(StoreError::ConglomerateNotFound(id.0))?;
            return change(descriptor);
        }

        self.elevate("alter conglomerate")?;
        self.mgr
            .locks
            .acquire(self.root, self.txn, id, LockMode::Exclusive)?;
        let mut descriptor = self
            .mgr
            .registry
            .get(id)
            .ok_or(StoreError::ConglomerateNotFound(id.0))?;
        change(&mut descriptor)?;
        self.mgr.registry.swap(self.txn, descriptor)?;
        self.structure_changed = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Savepoints
    // ------------------------------------------------------------------

    /// Mark a savepoint. Later savepoints may shadow the name; rollback
    /// and release resolve to the newest match.
    pub fn set_savepoint(&mut self, name: impl Into<String>) -> Result<()> {
        self.ensure_unfinished()?;
        if self.is_view {
            return Err(TxnError::NotElevatable(self.txn.0).into());
        }
        self.savepoints.push(Savepoint {
            name: name.into(),
            mark: self.mgr.write_seq.load(Ordering::SeqCst),
        });
        Ok(())
    }

    fn savepoint_index(&self, name: &str) -> Result<usize> {
        self.savepoints
            .iter()
            .rposition(|sp| sp.name == name)
            .ok_or_else(|| TxnError::SavepointNotFound(name.to_string()).into())
    }

    /// Forget a savepoint and every one set after it.
    pub fn release_savepoint(&mut self, name: &str) -> Result<()> {
        self.ensure_unfinished()?;
        let idx = self.savepoint_index(name)?;
        self.savepoints.truncate(idx);
        Ok(())
    }

    /// Undo this transaction's row effects back to a savepoint without
    /// terminating the transaction. The savepoint survives, so the caller
    /// can roll back to it again. Optionally force-closes every open
    /// handle first, as cursors positioned on undone rows are stale.
    pub fn rollback_to_savepoint(&mut self, name: &str, close_controllers: bool) -> Result<usize> {
        self.ensure_unfinished()?;
        let idx = self.savepoint_index(name)?;
        let mark = self.savepoints[idx].mark;

        if close_controllers {
            self.close_handles(true);
        }

        let mut undone = 0;
        for id in &self.touched {
            if let Some(heap) = self.mgr.heaps.get(id) {
                undone += heap.undo_writes(self.txn, mark);
            }
        }
        for (_, heap) in self.temp.values() {
            undone += heap.undo_writes(self.txn, mark);
        }
        for (_, heap) in &self.dropped {
            undone += heap.undo_writes(self.txn, mark);
        }

        self.savepoints.truncate(idx + 1);
        debug!(txn = %self.txn, savepoint = name, undone, "rolled back to savepoint");
        Ok(undone)
    }

    // ------------------------------------------------------------------
    // Nesting
    // ------------------------------------------------------------------

    /// Begin a nested transaction on behalf of the user. Rolling the
    /// child back leaves this transaction running.
    pub fn start_nested_user(&self, read_only: bool) -> Result<TransactionController> {
        self.ensure_unfinished()?;
        let child = self.mgr.store.begin_nested_user(self.txn, read_only)?;
        Ok(TransactionController::attach(
            Arc::clone(&self.mgr),
            child,
            false,
        ))
    }

    /// Begin an engine-internal nested transaction, optionally pinned to
    /// the conglomerate it works on. Rolling the child back takes this
    /// transaction down with it.
    pub fn start_nested_internal(
        &self,
        read_only: bool,
        target: Option<ConglomId>,
        in_memory: bool,
    ) -> Result<TransactionController> {
        self.ensure_unfinished()?;
        let child = self.mgr.store.begin_nested_internal(
            self.txn,
            read_only,
            target.map(|id| id.object()),
            in_memory,
        )?;
        Ok(TransactionController::attach(
            Arc::clone(&self.mgr),
            child,
            false,
        ))
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    fn ensure_unfinished(&self) -> Result<()> {
        if self.finished {
            return Err(StoreError::ControllerClosed.into());
        }
        Ok(())
    }

    fn close_handles(&mut self, include_held: bool) {
        for scan in &self.scans {
            if include_held || !scan.hold {
                scan.handle.lock().close();
            }
        }
        for table in &self.tables {
            if include_held || !table.hold {
                table.handle.lock().close();
            }
        }
        self.scans.retain(|s| s.hold && !include_held);
        self.tables.retain(|t| t.hold && !include_held);
    }

    fn settle_commit(&mut self) {
        self.close_handles(false);
        self.mgr.registry.forget_parked(self.txn);
        self.dropped.clear();
        self.created.clear();
        self.savepoints.clear();
        self.structure_changed = false;
        self.release_locks();
        self.finished = true;
    }

    fn settle_abort(&mut self) {
        self.close_handles(true);
        self.mgr.registry.restore_parked(self.txn);
        for (id, heap) in self.dropped.drain(..) {
            self.mgr.heaps.insert(id, heap);
        }
        for id in self.created.drain(..) {
            self.mgr.registry.remove(id);
            self.mgr.heaps.remove(&id);
        }
        self.savepoints.clear();
        self.structure_changed = false;
        self.release_locks();
        self.finished = true;
    }

    /// A finishing root frees the whole tree's locks. A finishing child
    /// hands back only its own stakes; locks the parent also holds stay
    /// granted so its work continues undisturbed.
    fn release_locks(&self) {
        if self.txn == self.root {
            self.mgr.locks.release_all(self.root);
        } else {
            self.mgr.locks.release_owned(self.root, self.txn);
        }
    }

    /// Commit. Returns the commit ordering token. Handles opened with
    /// hold stay usable; everything else closes.
    pub fn commit(mut self) -> Result<TxnId> {
        self.ensure_unfinished()?;
        let commit_ts = self.mgr.store.commit(self.txn)?;
        self.settle_commit();
        Ok(commit_ts)
    }

    /// Roll back. Every handle closes, structural changes revert, row
    /// effects disappear behind visibility.
    pub fn abort(mut self) -> Result<()> {
        self.ensure_unfinished()?;
        self.mgr.store.rollback(self.txn)?;
        self.settle_abort();
        Ok(())
    }

    /// First phase of a two-phase commit. A read-only vote finishes the
    /// transaction on the spot.
    pub fn xa_prepare(&mut self) -> Result<XaVote> {
        self.ensure_unfinished()?;
        let vote = self.mgr.store.xa_prepare(self.txn)?;
        if vote == XaVote::ReadOnly {
            self.settle_commit();
        }
        Ok(vote)
    }

    /// Decision phase commit. With `one_phase` the prepare is folded in.
    pub fn xa_commit(mut self, one_phase: bool) -> Result<TxnId> {
        self.ensure_unfinished()?;
        let commit_ts = self.mgr.store.xa_commit(self.txn, one_phase)?;
        self.settle_commit();
        Ok(commit_ts)
    }

    /// Decision phase rollback, valid before or after a prepare.
    pub fn xa_rollback(mut self) -> Result<()> {
        self.ensure_unfinished()?;
        self.mgr.store.xa_rollback(self.txn)?;
        self.settle_abort();
        Ok(())
    }
}

impl Drop for TransactionController {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if self.mgr.store.is_active(self.txn) {
            warn!(txn = %self.txn, "transaction controller dropped while active; rolling back");
            if self.mgr.store.rollback(self.txn).is_ok() {
                self.settle_abort();
            }
            return;
        }
        // Terminal-stated from elsewhere, e.g. an internal child's abort
        // cascading into this transaction. The record is settled but the
        // local bookkeeping (locks, parked descriptors) is not.
        match self.mgr.store.state(self.txn) {
            Some(TxnState::Committed) => self.settle_commit(),
            _ => self.settle_abort(),
        }
    }
}
