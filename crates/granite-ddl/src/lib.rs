//! # Granite DDL
//!
//! Online schema change coordination for Granite:
//! - A barrier/drain protocol that bounds how long a schema change waits
//!   for pre-existing transactions, with exponential backoff and
//!   cancellation, and never proceeds past a live conflicter
//! - A tentative transaction chain (barrier child, writable populate child)
//!   under the issuing wrapper transaction
//! - An exhaustive dispatcher from change kinds to cache invalidation and
//!   plan re-compilation pre-actions
//! - Cluster-wide change notification with per-node acknowledgement
//!
//! The dispatcher always runs before the owning transaction commits, so no
//! reader of committed state ever observes a stale dictionary entry.

pub mod change;
pub mod coordinator;
pub mod dictionary;
pub mod dispatcher;
pub mod notify;

// Re-export key types for convenience
pub use change::{ChangeEnvelope, ChangeKind, MetadataChange, ReplicationRole};
pub use coordinator::{DdlCoordinator, DdlPhase};
pub use dictionary::{
    CachedStatement, CatalogObject, CatalogObjectKind, DataDictionaryCache, DependencyManager,
    DictionaryEviction, DictionaryStats, InvalidationReason, PermissionEntry,
    PlanDependencyTracker, SessionContext, SessionContextRegistry,
};
pub use dispatcher::{ChangeDispatcher, DispatchReport, DispatchStats};
pub use notify::{DdlNotifier, DdlTransport, InMemoryDdlBus, NodeApplier, NotifierStats};
