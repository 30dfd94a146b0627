//! Data dictionary cache and its collaborators
//!
//! Process-wide shared state mutated by the DDL path: the schema cache
//! (objects by id and by `(database, name)`), the permission cache, and the
//! compiled-statement cache. The dispatcher evicts from all three before the
//! owning transaction commits, so a reader of committed state never sees a
//! stale entry; a reader racing a mid-flight change may, and that is fine.
//!
//! Also here: the [`DependencyManager`] seam the dispatcher uses to drop
//! compiled plans (a trait, so the plan cache can live in a higher layer
//! without a circular dependency), and the [`SessionContextRegistry`] that
//! the control-state change kinds broadcast through.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use granite_common::prelude::*;

use crate::change::ReplicationRole;

// ============================================================================
// Catalog objects
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CatalogObjectKind {
    Table,
    Index,
    View,
    Schema,
    Database,
    Trigger,
}

/// Cached dictionary entry for one schema object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogObject {
    pub id: ObjectId,
    pub database: String,
    pub name: String,
    pub kind: CatalogObjectKind,
    /// Backing storage structure, when the object has one.
    pub conglomerate: Option<ConglomId>,
}

impl CatalogObject {
    pub fn new(
        id: ObjectId,
        database: impl Into<String>,
        name: impl Into<String>,
        kind: CatalogObjectKind,
    ) -> Self {
        Self {
            id,
            database: database.into(),
            name: name.into(),
            kind,
            conglomerate: None,
        }
    }

    pub fn with_conglomerate(mut self, conglom: ConglomId) -> Self {
        self.conglomerate = Some(conglom);
        self
    }
}

/// Cached privileges on one object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionEntry {
    pub owner: String,
    /// (grantee, privilege) pairs.
    pub grants: Vec<(String, String)>,
}

/// A compiled statement held in the statement cache.
#[derive(Debug, Clone)]
pub struct CachedStatement {
    pub sql: String,
    /// Objects the compiled plan reads or writes.
    pub referenced: Vec<ObjectId>,
}

// ============================================================================
// Dictionary cache
// ============================================================================

/// What one eviction removed, for logging and assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DictionaryEviction {
    pub schema: bool,
    pub permissions: bool,
    pub statements: usize,
}

impl DictionaryEviction {
    pub fn removed_anything(&self) -> bool {
        self.schema || self.permissions || self.statements > 0
    }
}

/// Dictionary cache counters
#[derive(Debug, Clone, Default)]
pub struct DictionaryStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub statements_evicted: u64,
}

/// Shared cache of schema metadata keyed by object id.
///
/// Lookups are cheap and lock-free; eviction is keyed by id and also clears
/// the `(database, name)` index entry for the evicted object.
pub struct DataDictionaryCache {
    by_id: DashMap<ObjectId, Arc<CatalogObject>>,
    by_name: DashMap<(String, String), ObjectId>,
    permissions: DashMap<ObjectId, Arc<PermissionEntry>>,
    statements: DashMap<u64, Arc<CachedStatement>>,
    stats: Mutex<DictionaryStats>,
}

impl DataDictionaryCache {
    pub fn new() -> Self {
        Self {
            by_id: DashMap::new(),
            by_name: DashMap::new(),
            permissions: DashMap::new(),
            statements: DashMap::new(),
            stats: Mutex::new(DictionaryStats::default()),
        }
    }

    /// Insert or replace a dictionary entry, indexing it by id and name.
    pub fn define(&self, object: CatalogObject) -> Arc<CatalogObject> {
        let entry = Arc::new(object);
        self.by_name
            .insert((entry.database.clone(), entry.name.clone()), entry.id);
        self.by_id.insert(entry.id, Arc::clone(&entry));
        trace!(object = %entry.id, name = %entry.name, "defined dictionary entry");
        entry
    }

    pub fn lookup(&self, id: ObjectId) -> Option<Arc<CatalogObject>> {
        let found = self.by_id.get(&id).map(|e| Arc::clone(e.value()));
        let mut stats = self.stats.lock();
        match found {
            Some(obj) => {
                stats.hits += 1;
                Some(obj)
            }
            None => {
                stats.misses += 1;
                None
            }
        }
    }

    pub fn lookup_named(&self, database: &str, name: &str) -> Option<Arc<CatalogObject>> {
        let id = self
            .by_name
            .get(&(database.to_string(), name.to_string()))
            .map(|e| *e.value())?;
        self.lookup(id)
    }

    pub fn cache_permissions(&self, id: ObjectId, entry: PermissionEntry) {
        self.permissions.insert(id, Arc::new(entry));
    }

    pub fn permissions(&self, id: ObjectId) -> Option<Arc<PermissionEntry>> {
        self.permissions.get(&id).map(|e| Arc::clone(e.value()))
    }

    pub fn cache_statement(&self, statement_id: u64, statement: CachedStatement) {
        self.statements.insert(statement_id, Arc::new(statement));
    }

    pub fn statement(&self, statement_id: u64) -> Option<Arc<CachedStatement>> {
        self.statements.get(&statement_id).map(|e| Arc::clone(e.value()))
    }

    /// Evict everything cached under `id`: the schema entry (and its name
    /// index slot), the permission entry, and every compiled statement whose
    /// plan references the object.
    pub fn evict(&self, id: ObjectId) -> DictionaryEviction {
        let mut outcome = DictionaryEviction::default();

        if let Some((_, object)) = self.by_id.remove(&id) {
            self.by_name
                .remove(&(object.database.clone(), object.name.clone()));
            outcome.schema = true;
        }
        outcome.permissions = self.permissions.remove(&id).is_some();

        let stale: Vec<u64> = self
            .statements
            .iter()
            .filter(|e| e.value().referenced.contains(&id))
            .map(|e| *e.key())
            .collect();
        for statement_id in &stale {
            self.statements.remove(statement_id);
        }
        outcome.statements = stale.len();

        {
            let mut stats = self.stats.lock();
            stats.evictions += 1;
            stats.statements_evicted += outcome.statements as u64;
        }
        debug!(
            object = %id,
            schema = outcome.schema,
            permissions = outcome.permissions,
            statements = outcome.statements,
            "evicted dictionary state"
        );
        outcome
    }

    /// Drop every cached entry of every kind.
    pub fn clear(&self) {
        self.by_id.clear();
        self.by_name.clear();
        self.permissions.clear();
        self.statements.clear();
    }

    pub fn object_count(&self) -> usize {
        self.by_id.len()
    }

    pub fn statement_count(&self) -> usize {
        self.statements.len()
    }

    pub fn stats(&self) -> DictionaryStats {
        self.stats.lock().clone()
    }
}

impl Default for DataDictionaryCache {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Plan dependency invalidation
// ============================================================================

/// Why a dependent compiled plan is being invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvalidationReason {
    Drop,
    Rename,
    Alter,
    IndexAdded,
    IndexDropped,
    Truncate,
    TriggerChanged,
    PrivilegeChanged,
}

impl fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InvalidationReason::Drop => "drop",
            InvalidationReason::Rename => "rename",
            InvalidationReason::Alter => "alter",
            InvalidationReason::IndexAdded => "index added",
            InvalidationReason::IndexDropped => "index dropped",
            InvalidationReason::Truncate => "truncate",
            InvalidationReason::TriggerChanged => "trigger changed",
            InvalidationReason::PrivilegeChanged => "privilege changed",
        };
        write!(f, "{}", s)
    }
}

/// Sink for compiled-plan invalidation.
///
/// Implemented by the plan cache in the execution layer; a trait here keeps
/// the dependency pointing downward. Implementations must tolerate objects
/// they have never seen.
pub trait DependencyManager: Send + Sync {
    fn invalidate_for(&self, object: ObjectId, reason: InvalidationReason);
}

/// In-process dependency tracker for single-node deployments and tests.
///
/// Maps each object to the set of plan ids compiled against it and drops the
/// whole set on invalidation.
pub struct PlanDependencyTracker {
    dependents: DashMap<ObjectId, HashSet<u64>>,
    invalidations: Mutex<Vec<(ObjectId, InvalidationReason)>>,
}

impl PlanDependencyTracker {
    pub fn new() -> Self {
        Self {
            dependents: DashMap::new(),
            invalidations: Mutex::new(Vec::new()),
        }
    }

    /// Record that `plan` was compiled against `object`.
    pub fn record_dependency(&self, plan: u64, object: ObjectId) {
        self.dependents.entry(object).or_default().insert(plan);
    }

    pub fn dependent_count(&self, object: ObjectId) -> usize {
        self.dependents.get(&object).map(|s| s.len()).unwrap_or(0)
    }

    /// Every invalidation seen so far, in call order.
    pub fn invalidations(&self) -> Vec<(ObjectId, InvalidationReason)> {
        self.invalidations.lock().clone()
    }
}

impl Default for PlanDependencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DependencyManager for PlanDependencyTracker {
    fn invalidate_for(&self, object: ObjectId, reason: InvalidationReason) {
        let dropped = self
            .dependents
            .remove(&object)
            .map(|(_, plans)| plans.len())
            .unwrap_or(0);
        debug!(%object, %reason, plans = dropped, "invalidated dependent plans");
        self.invalidations.lock().push((object, reason));
    }
}

// ============================================================================
// Session contexts
// ============================================================================

/// Per-session control state the cluster can flip at runtime.
pub struct SessionContext {
    id: SessionId,
    restore_mode: AtomicBool,
    role: Mutex<ReplicationRole>,
}

impl SessionContext {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            restore_mode: AtomicBool::new(false),
            role: Mutex::new(ReplicationRole::Primary),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn in_restore_mode(&self) -> bool {
        self.restore_mode.load(Ordering::SeqCst)
    }

    pub fn replication_role(&self) -> ReplicationRole {
        *self.role.lock()
    }
}

/// The live sessions on this node, targeted by control-state broadcasts.
pub struct SessionContextRegistry {
    sessions: DashMap<SessionId, Arc<SessionContext>>,
}

impl SessionContextRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub fn register(&self, id: SessionId) -> Arc<SessionContext> {
        let ctx = Arc::new(SessionContext::new(id));
        self.sessions.insert(id, Arc::clone(&ctx));
        ctx
    }

    pub fn unregister(&self, id: SessionId) {
        self.sessions.remove(&id);
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<SessionContext>> {
        self.sessions.get(&id).map(|e| Arc::clone(e.value()))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Flip restore mode on every live session. Returns how many saw it.
    pub fn broadcast_restore_mode(&self, entering: bool) -> usize {
        let mut reached = 0;
        for ctx in self.sessions.iter() {
            ctx.value().restore_mode.store(entering, Ordering::SeqCst);
            reached += 1;
        }
        info!(entering, sessions = reached, "broadcast restore mode");
        reached
    }

    /// Set the replication role on every live session. Returns how many saw it.
    pub fn broadcast_replication_role(&self, role: ReplicationRole) -> usize {
        let mut reached = 0;
        for ctx in self.sessions.iter() {
            *ctx.value().role.lock() = role;
            reached += 1;
        }
        info!(%role, sessions = reached, "broadcast replication role");
        reached
    }
}

impl Default for SessionContextRegistry {
    fn default() -> Self {
        Self::new()
    }
}
