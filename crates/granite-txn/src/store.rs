//! The transaction arena.
//!
//! [`TxnStore`] owns every transaction record in the process. Records are
//! kept in an arena keyed by id; parents and children reference each other
//! by id only, so ancestry walks are lookups and records stay serializable.
//!
//! The store also maintains the active-transaction index that the online
//! schema change protocol queries: which transactions below a given id are
//! still running against a storage object.

use crate::snapshot::Snapshot;
use crate::txn::{Txn, TxnKind, TxnState, XaVote};
use dashmap::{DashMap, DashSet};
use granite_common::error::TxnError;
use granite_common::prelude::*;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// Transaction arena statistics.
#[derive(Debug, Clone, Default)]
pub struct TxnStats {
    pub txns_started: u64,
    pub txns_committed: u64,
    pub txns_rolled_back: u64,
    pub nested_started: u64,
    pub elevations: u64,
    pub views_registered: u64,
    pub xa_prepares: u64,
}

/// Arena slot pairing a record with its current read view.
struct TxnSlot {
    txn: Txn,
    snapshot: Snapshot,
}

/// Process-wide transaction arena and active-transaction index.
pub struct TxnStore {
    /// Configuration
    config: TxnConfig,
    /// Next transaction id; also the source of commit ordering tokens
    next_txn_id: AtomicU64,
    /// All transaction slots, active and recently terminal
    txns: DashMap<TxnId, RwLock<TxnSlot>>,
    /// Ids currently in the Active or Prepared state (locally begun only)
    active: DashSet<TxnId>,
    /// Active-transaction index: storage object -> transactions touching it
    object_txns: DashMap<ObjectId, HashSet<TxnId>>,
    /// Statistics
    stats: Mutex<TxnStats>,
}

impl TxnStore {
    /// Create a new transaction store.
    pub fn new(config: TxnConfig) -> Self {
        Self {
            config,
            next_txn_id: AtomicU64::new(1),
            txns: DashMap::new(),
            active: DashSet::new(),
            object_txns: DashMap::new(),
            stats: Mutex::new(TxnStats::default()),
        }
    }

    /// Set the starting transaction id after recovery so ids are never reused.
    pub fn set_next_txn_id(&self, txn_id: u64) {
        self.next_txn_id.store(txn_id, Ordering::SeqCst);
    }

    fn allocate_id(&self) -> TxnId {
        TxnId(self.next_txn_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Build a snapshot for a new transaction or a view refresh.
    fn create_snapshot(&self, txn_id: TxnId, lineage: HashSet<TxnId>) -> Snapshot {
        let active: HashSet<TxnId> = self.active.iter().map(|e| *e.key()).collect();

        let xmin = active.iter().min().copied().unwrap_or(txn_id);
        let xmax = TxnId(self.next_txn_id.load(Ordering::SeqCst));

        Snapshot::new(txn_id, xmin, xmax, active, lineage)
    }

    fn get_slot(
        &self,
        txn_id: TxnId,
    ) -> Result<dashmap::mapref::one::Ref<'_, TxnId, RwLock<TxnSlot>>> {
        self.txns
            .get(&txn_id)
            .ok_or_else(|| TxnError::NotFound(txn_id.0).into())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Begin a root transaction at the configured default isolation level.
    pub fn begin_default(&self) -> Result<TxnId> {
        self.begin(self.config.default_isolation)
    }

    /// Begin a root transaction. New transactions start read-only; write
    /// permission is granted by [`elevate`](Self::elevate).
    pub fn begin(&self, isolation: IsolationLevel) -> Result<TxnId> {
        if self.active.len() >= self.config.max_active_txns {
            return Err(TxnError::TooManyActive.into());
        }

        let id = self.allocate_id();
        let mut lineage = HashSet::new();
        lineage.insert(id);
        let snapshot = self.create_snapshot(id, lineage);
        let txn = Txn::new(id, isolation);

        self.txns.insert(id, RwLock::new(TxnSlot { txn, snapshot }));
        self.active.insert(id);
        self.stats.lock().txns_started += 1;
        trace!(txn = %id, %isolation, "began transaction");
        Ok(id)
    }

    /// Begin a nested transaction on behalf of the user. The child inherits
    /// the parent's isolation level. Rolling it back leaves the parent
    /// active.
    pub fn begin_nested_user(&self, parent: TxnId, read_only: bool) -> Result<TxnId> {
        self.begin_nested(parent, TxnKind::NestedUser, None, read_only, None, false)
    }

    /// Begin a nested transaction for engine-internal work such as schema
    /// change barriers and index builds. Internal children always run at
    /// snapshot isolation; rolling one back forces the parent down too.
    pub fn begin_nested_internal(
        &self,
        parent: TxnId,
        read_only: bool,
        target: Option<ObjectId>,
        in_memory: bool,
    ) -> Result<TxnId> {
        self.begin_nested(
            parent,
            TxnKind::NestedInternal,
            Some(IsolationLevel::Snapshot),
            read_only,
            target,
            in_memory,
        )
    }

    fn begin_nested(
        &self,
        parent: TxnId,
        kind: TxnKind,
        isolation: Option<IsolationLevel>,
        read_only: bool,
        target: Option<ObjectId>,
        in_memory: bool,
    ) -> Result<TxnId> {
        if self.active.len() >= self.config.max_active_txns {
            return Err(TxnError::TooManyActive.into());
        }

        // Validate the parent and capture what the child inherits.
        let (parent_isolation, parent_lineage) = {
            let slot_ref = self.get_slot(parent)?;
            let slot = slot_ref.read();
            if slot.txn.parent.is_some() {
                return Err(TxnError::NestingDepth(parent.0).into());
            }
            match slot.txn.state {
                TxnState::Active => {}
                TxnState::Prepared => return Err(TxnError::AlreadyPrepared(parent.0).into()),
                TxnState::Committed => return Err(TxnError::AlreadyCommitted(parent.0).into()),
                TxnState::RolledBack => return Err(TxnError::AlreadyRolledBack(parent.0).into()),
            }
            (slot.txn.isolation, slot.snapshot.lineage.clone())
        };

        let id = self.allocate_id();
        let mut lineage = parent_lineage;
        lineage.insert(id);
        let snapshot = self.create_snapshot(id, lineage);

        let mut txn = Txn::nested(id, parent, kind, isolation.unwrap_or(parent_isolation));
        txn.in_memory = in_memory;

        // Attach to the parent before publishing the child; a parent that
        // went terminal in the meantime must reject the attach.
        {
            let slot_ref = self.get_slot(parent)?;
            let mut slot = slot_ref.write();
            if !slot.txn.is_active() {
                return Err(TxnError::NotActive(parent.0).into());
            }
            slot.txn.children.push(id);
        }

        self.txns.insert(id, RwLock::new(TxnSlot { txn, snapshot }));
        self.active.insert(id);
        {
            let mut stats = self.stats.lock();
            stats.txns_started += 1;
            stats.nested_started += 1;
        }

        if let Some(object) = target {
            self.touch(id, object)?;
        }
        if !read_only {
            self.elevate(id, "nested begin")?;
        }

        debug!(parent = %parent, child = %id, ?kind, "started nested transaction");
        Ok(id)
    }

    /// Grant write permission to a transaction and its whole parent chain.
    ///
    /// Idempotent. Fails on a read-only view, which is a caller contract
    /// violation rather than a runtime condition.
    pub fn elevate(&self, txn_id: TxnId, label: &str) -> Result<()> {
        let mut cur = Some(txn_id);
        let mut elevated_any = false;
        while let Some(id) = cur {
            let slot_ref = self.get_slot(id)?;
            let mut slot = slot_ref.write();
            if slot.txn.view {
                return Err(TxnError::NotElevatable(id.0).into());
            }
            if slot.txn.is_terminal() {
                return Err(TxnError::NotActive(id.0).into());
            }
            if !slot.txn.writable {
                slot.txn.writable = true;
                elevated_any = true;
                debug!(txn = %id, label, "elevated to writable");
            }
            cur = slot.txn.parent;
        }
        if elevated_any {
            self.stats.lock().elevations += 1;
        }
        Ok(())
    }

    /// Register a read-only view of a transaction record received from
    /// elsewhere. Views never join the local active set, so they cannot
    /// block schema changes on this node, and they can never be elevated.
    pub fn register_view(&self, mut record: Txn) -> Result<TxnId> {
        let id = record.id;
        record.view = true;
        record.writable = false;
        record.children.clear();

        let mut lineage = HashSet::new();
        lineage.insert(id);
        if let Some(parent) = record.parent {
            lineage.insert(parent);
        }
        let snapshot = self.create_snapshot(id, lineage);

        match self.txns.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(Error::already_exists("Transaction", id.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(RwLock::new(TxnSlot {
                    txn: record,
                    snapshot,
                }));
                self.stats.lock().views_registered += 1;
                debug!(txn = %id, "registered read-only transaction view");
                Ok(id)
            }
        }
    }

    /// Commit a transaction. Still-active children are committed first, so
    /// committing a wrapper finalizes its whole chain.
    pub fn commit(&self, txn_id: TxnId) -> Result<TxnId> {
        {
            let slot_ref = self.get_slot(txn_id)?;
            let slot = slot_ref.read();
            match slot.txn.state {
                TxnState::Active => {}
                TxnState::Prepared => return Err(TxnError::AlreadyPrepared(txn_id.0).into()),
                TxnState::Committed => return Err(TxnError::AlreadyCommitted(txn_id.0).into()),
                TxnState::RolledBack => return Err(TxnError::AlreadyRolledBack(txn_id.0).into()),
            }
        }
        self.finalize_commit(txn_id)
    }

    fn finalize_commit(&self, txn_id: TxnId) -> Result<TxnId> {
        let children = {
            let slot_ref = self.get_slot(txn_id)?;
            let children = slot_ref.read().txn.children.clone();
            children
        };
        for child in children {
            if self.active.contains(&child) {
                self.finalize_commit(child)?;
            }
        }

        let commit_ts = self.allocate_id();
        let touched = {
            let slot_ref = self.get_slot(txn_id)?;
            let mut slot = slot_ref.write();
            slot.txn.state = TxnState::Committed;
            slot.txn.commit_ts = Some(commit_ts);
            slot.txn.touched.iter().copied().collect::<Vec<_>>()
        };
        self.active.remove(&txn_id);
        self.purge_from_index(txn_id, &touched);
        self.stats.lock().txns_committed += 1;
        debug!(txn = %txn_id, commit_ts = %commit_ts, "committed");
        Ok(commit_ts)
    }

    /// Roll back a transaction and any still-active children.
    ///
    /// Rolling back an internal nested child also rolls back its parent;
    /// a user nested child leaves the parent active.
    pub fn rollback(&self, txn_id: TxnId) -> Result<()> {
        let (kind, parent) = {
            let slot_ref = self.get_slot(txn_id)?;
            let slot = slot_ref.read();
            match slot.txn.state {
                TxnState::Active | TxnState::Prepared => {}
                TxnState::Committed => return Err(TxnError::AlreadyCommitted(txn_id.0).into()),
                TxnState::RolledBack => return Err(TxnError::AlreadyRolledBack(txn_id.0).into()),
            }
            (slot.txn.kind, slot.txn.parent)
        };

        self.finalize_rollback(txn_id)?;

        if kind == TxnKind::NestedInternal {
            if let Some(parent) = parent {
                if self.is_active(parent) {
                    warn!(
                        child = %txn_id,
                        parent = %parent,
                        "internal nested rollback forces parent rollback"
                    );
                    self.rollback(parent)?;
                }
            }
        }
        Ok(())
    }

    fn finalize_rollback(&self, txn_id: TxnId) -> Result<()> {
        let children = {
            let slot_ref = self.get_slot(txn_id)?;
            let children = slot_ref.read().txn.children.clone();
            children
        };
        for child in children {
            if self.active.contains(&child) {
                self.finalize_rollback(child)?;
            }
        }

        let touched = {
            let slot_ref = self.get_slot(txn_id)?;
            let mut slot = slot_ref.write();
            slot.txn.state = TxnState::RolledBack;
            slot.txn.touched.iter().copied().collect::<Vec<_>>()
        };
        self.active.remove(&txn_id);
        self.purge_from_index(txn_id, &touched);
        self.stats.lock().txns_rolled_back += 1;
        debug!(txn = %txn_id, "rolled back");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Two-phase commit
    // ------------------------------------------------------------------

    /// First phase of a two-phase commit.
    ///
    /// A transaction that never wrote votes [`XaVote::ReadOnly`] and is
    /// complete immediately; there is nothing for the decision phase to do.
    /// A writable transaction votes [`XaVote::Ok`] and moves to `Prepared`.
    pub fn xa_prepare(&self, txn_id: TxnId) -> Result<XaVote> {
        let vote = {
            let slot_ref = self.get_slot(txn_id)?;
            let mut slot = slot_ref.write();
            if slot.txn.kind != TxnKind::Root {
                return Err(Error::invalid_argument(format!(
                    "two-phase commit applies to root transactions, {} is nested",
                    txn_id
                )));
            }
            match slot.txn.state {
                TxnState::Active => {}
                TxnState::Prepared => return Err(TxnError::AlreadyPrepared(txn_id.0).into()),
                TxnState::Committed => return Err(TxnError::AlreadyCommitted(txn_id.0).into()),
                TxnState::RolledBack => return Err(TxnError::AlreadyRolledBack(txn_id.0).into()),
            }
            if slot.txn.writable {
                slot.txn.state = TxnState::Prepared;
                XaVote::Ok
            } else {
                XaVote::ReadOnly
            }
        };

        match vote {
            XaVote::ReadOnly => {
                self.finalize_commit(txn_id)?;
            }
            XaVote::Ok => {
                self.stats.lock().xa_prepares += 1;
                debug!(txn = %txn_id, "prepared");
            }
        }
        Ok(vote)
    }

    /// Second phase of a two-phase commit.
    ///
    /// `one_phase` commits an unprepared transaction directly. A two-phase
    /// commit without a recorded vote is refused; a missing vote surfaces
    /// as an error and the coordinator must roll back, never silently
    /// commit.
    pub fn xa_commit(&self, txn_id: TxnId, one_phase: bool) -> Result<TxnId> {
        let state = self
            .state(txn_id)
            .ok_or(TxnError::NotFound(txn_id.0))?;
        match (one_phase, state) {
            (true, TxnState::Active) => self.finalize_commit(txn_id),
            (true, TxnState::Prepared) => Err(TxnError::AlreadyPrepared(txn_id.0).into()),
            (false, TxnState::Prepared) => self.finalize_commit(txn_id),
            (false, TxnState::Active) => Err(TxnError::NotPrepared(txn_id.0).into()),
            (_, TxnState::Committed) => Err(TxnError::AlreadyCommitted(txn_id.0).into()),
            (_, TxnState::RolledBack) => Err(TxnError::AlreadyRolledBack(txn_id.0).into()),
        }
    }

    /// Roll back from either the active or the prepared state.
    pub fn xa_rollback(&self, txn_id: TxnId) -> Result<()> {
        self.rollback(txn_id)
    }

    // ------------------------------------------------------------------
    // Active-transaction index
    // ------------------------------------------------------------------

    /// Record that a transaction has touched a storage object.
    pub fn touch(&self, txn_id: TxnId, object: ObjectId) -> Result<()> {
        {
            let slot_ref = self.get_slot(txn_id)?;
            let mut slot = slot_ref.write();
            if slot.txn.is_terminal() {
                return Err(TxnError::NotActive(txn_id.0).into());
            }
            slot.txn.touched.insert(object);
        }
        self.object_txns.entry(object).or_default().insert(txn_id);
        Ok(())
    }

    /// Enumerate transactions still active against `object` with an id below
    /// `below`, sorted ascending. Prepared transactions count as active.
    pub fn active_txns_touching(&self, object: ObjectId, below: TxnId) -> Vec<TxnId> {
        let mut ids: Vec<TxnId> = match self.object_txns.get(&object) {
            Some(set) => set
                .iter()
                .copied()
                .filter(|id| *id < below && self.active.contains(id))
                .collect(),
            None => Vec::new(),
        };
        ids.sort_unstable();
        ids
    }

    fn purge_from_index(&self, txn_id: TxnId, touched: &[ObjectId]) {
        for object in touched {
            if let Some(mut set) = self.object_txns.get_mut(object) {
                set.remove(&txn_id);
            }
        }
    }

    // ------------------------------------------------------------------
    // Ancestry
    // ------------------------------------------------------------------

    pub fn parent_of(&self, txn: TxnId) -> Option<TxnId> {
        self.txns.get(&txn).and_then(|slot| slot.read().txn.parent)
    }

    /// Whether `txn` is `ancestor` itself or sits below it in the tree.
    pub fn descends_from(&self, txn: TxnId, ancestor: TxnId) -> bool {
        let mut cur = txn;
        loop {
            if cur == ancestor {
                return true;
            }
            match self.parent_of(cur) {
                Some(parent) => cur = parent,
                None => return false,
            }
        }
    }

    /// Walk parent links to the topmost ancestor.
    pub fn absolute_root(&self, txn: TxnId) -> Result<TxnId> {
        let mut cur = txn;
        loop {
            let parent = {
                let slot_ref = self.get_slot(cur)?;
                let slot = slot_ref.read();
                slot.txn.parent
            };
            match parent {
                Some(p) => cur = p,
                None => return Ok(cur),
            }
        }
    }

    // ------------------------------------------------------------------
    // Visibility
    // ------------------------------------------------------------------

    /// Get the current read view for a transaction. Read-committed scopes
    /// refresh their view on every call; everything else keeps the view
    /// taken at begin.
    pub fn current_view(&self, txn_id: TxnId) -> Result<Snapshot> {
        let slot_ref = self.get_slot(txn_id)?;
        let needs_refresh = {
            let slot = slot_ref.read();
            if slot.txn.is_terminal() {
                return Err(TxnError::NotActive(txn_id.0).into());
            }
            slot.txn.isolation == IsolationLevel::ReadCommitted && !slot.txn.view
        };
        if needs_refresh {
            let lineage = slot_ref.read().snapshot.lineage.clone();
            let fresh = self.create_snapshot(txn_id, lineage);
            let mut slot = slot_ref.write();
            slot.snapshot = fresh.clone();
            Ok(fresh)
        } else {
            Ok(slot_ref.read().snapshot.clone())
        }
    }

    /// Full visibility check for a row version written by `writer`.
    ///
    /// Walks the writer's parent chain first: a write committed into a
    /// still-open ancestor scope is visible exactly to readers inside that
    /// scope, regardless of snapshot bounds, so a parent sees what its
    /// committed children did. Only a fully committed chain falls through
    /// to the ordinary snapshot test.
    pub fn write_visible_to(&self, snapshot: &Snapshot, writer: TxnId) -> bool {
        if snapshot.lineage.contains(&writer) {
            return true;
        }
        let mut cur = writer;
        loop {
            let state = match self.state(cur) {
                // Gone from the arena: old enough that gc reclaimed it,
                // which only happens to vacuumed, committed chains.
                None => break,
                Some(state) => state,
            };
            if state != TxnState::Committed {
                return state != TxnState::RolledBack && snapshot.lineage.contains(&cur);
            }
            match self.parent_of(cur) {
                Some(parent) => cur = parent,
                None => break,
            }
        }
        snapshot.is_visible(writer)
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn state(&self, txn_id: TxnId) -> Option<TxnState> {
        self.txns.get(&txn_id).map(|slot| slot.read().txn.state)
    }

    pub fn is_active(&self, txn_id: TxnId) -> bool {
        self.txns
            .get(&txn_id)
            .map(|slot| !slot.read().txn.is_terminal())
            .unwrap_or(false)
    }

    pub fn is_committed(&self, txn_id: TxnId) -> bool {
        matches!(self.state(txn_id), Some(TxnState::Committed))
    }

    pub fn is_writable(&self, txn_id: TxnId) -> Result<bool> {
        Ok(self.get_slot(txn_id)?.read().txn.writable)
    }

    /// Commit ordering token, if the transaction committed.
    pub fn commit_ts(&self, txn_id: TxnId) -> Option<TxnId> {
        self.txns
            .get(&txn_id)
            .and_then(|slot| slot.read().txn.commit_ts)
    }

    /// Clone the serializable record, e.g. to ship to another node.
    pub fn record(&self, txn_id: TxnId) -> Result<Txn> {
        Ok(self.get_slot(txn_id)?.read().txn.clone())
    }

    /// The oldest transaction still active, used to decide which dead row
    /// versions are safe to vacuum. Returns `TxnId(u64::MAX)` when idle.
    pub fn oldest_active_txn(&self) -> TxnId {
        self.active
            .iter()
            .map(|e| *e.key())
            .min()
            .unwrap_or(TxnId(u64::MAX))
    }

    pub fn active_txn_count(&self) -> usize {
        self.active.len()
    }

    pub fn active_transaction_ids(&self) -> Vec<TxnId> {
        self.active.iter().map(|e| *e.key()).collect()
    }

    pub fn stats(&self) -> TxnStats {
        self.stats.lock().clone()
    }

    /// Drop terminal records with ids below `before`.
    ///
    /// Callers must vacuum row versions written by rolled-back transactions
    /// first; once a record is gone the arena reports its writes as
    /// committed.
    pub fn gc(&self, before: TxnId) {
        self.txns
            .retain(|id, slot| *id >= before || !slot.read().txn.is_terminal());
        self.object_txns.retain(|_, set| !set.is_empty());
    }
}
