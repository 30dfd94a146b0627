//! Storage access layer for the Granite transactional core.
//!
//! A conglomerate is the unit of storage: a keyed, versioned heap of
//! rows described by a [`ConglomerateDescriptor`] and reachable through
//! the shared [`ConglomerateRegistry`]. Sessions go through an
//! [`AccessManager`], which hands out one [`TransactionController`] per
//! transaction; the controller opens row handles and scans, marks
//! savepoints and applies structural changes, and settles everything on
//! commit or abort.
//!
//! Row visibility is multi-version: writers append versions stamped
//! with their transaction, readers resolve them against a snapshot, and
//! [`AccessManager::vacuum`] reclaims versions no live snapshot can
//! reach.

pub mod conglomerate;
pub mod heap;
pub mod lock;
pub mod registry;
pub mod scan;
pub mod session;

pub use conglomerate::ConglomerateDescriptor;
pub use heap::{HeapStats, RecordKey, VacuumStats, VersionedHeap};
pub use lock::{LockMode, LockTable, LockTableStats};
pub use registry::{ConglomerateRegistry, RegistryStats};
pub use scan::{CompareOp, Qualifier, RangeOp, ScanController, ScanSpec, ScanStats};
pub use session::{AccessManager, ConglomerateController, TransactionController};
