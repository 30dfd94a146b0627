//! Change dispatch
//!
//! Maps every [`ChangeKind`] to its pre-commit action: look the affected
//! objects up in the dictionary, invalidate dependent compiled plans, evict
//! the cached state. The match is exhaustive over the closed kind set, so a
//! new kind fails compilation until every consequence is spelled out.
//!
//! Dispatch is total. A change naming an object the dictionary has never
//! seen (its creating transaction never committed) invalidates nothing and
//! raises nothing. Control-state kinds skip the catalog entirely and
//! broadcast to live sessions instead.

use std::sync::Arc;

use parking_lot::Mutex;

use granite_common::prelude::*;

use crate::change::{ChangeKind, MetadataChange};
use crate::dictionary::{
    DataDictionaryCache, DependencyManager, InvalidationReason, SessionContextRegistry,
};

/// What one dispatch did, summed across composite sub-changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Objects found in the dictionary and invalidated.
    pub objects_invalidated: usize,
    /// Compiled statements evicted alongside those objects.
    pub statements_evicted: usize,
    /// Objects named by the change but absent from the dictionary.
    pub misses: usize,
    /// Sessions reached by control-state broadcasts.
    pub sessions_updated: usize,
}

/// Dispatcher counters
#[derive(Debug, Clone, Default)]
pub struct DispatchStats {
    pub changes_dispatched: u64,
    pub objects_invalidated: u64,
    pub misses: u64,
    pub control_broadcasts: u64,
}

/// Runs the local pre-commit action for a metadata change.
pub struct ChangeDispatcher {
    dictionary: Arc<DataDictionaryCache>,
    dependencies: Arc<dyn DependencyManager>,
    sessions: Arc<SessionContextRegistry>,
    stats: Mutex<DispatchStats>,
}

impl ChangeDispatcher {
    pub fn new(
        dictionary: Arc<DataDictionaryCache>,
        dependencies: Arc<dyn DependencyManager>,
        sessions: Arc<SessionContextRegistry>,
    ) -> Self {
        Self {
            dictionary,
            dependencies,
            sessions,
            stats: Mutex::new(DispatchStats::default()),
        }
    }

    pub fn dictionary(&self) -> &Arc<DataDictionaryCache> {
        &self.dictionary
    }

    pub fn sessions(&self) -> &Arc<SessionContextRegistry> {
        &self.sessions
    }

    /// Apply the pre-commit action for `change` on this node.
    pub fn dispatch(&self, change: &MetadataChange) -> DispatchReport {
        let mut report = DispatchReport::default();
        self.apply(&change.kind, &mut report);

        {
            let mut stats = self.stats.lock();
            stats.changes_dispatched += 1;
            stats.objects_invalidated += report.objects_invalidated as u64;
            stats.misses += report.misses as u64;
            if change.kind.is_control() {
                stats.control_broadcasts += 1;
            }
        }
        debug!(
            txn = %change.txn,
            kind = %change.kind,
            invalidated = report.objects_invalidated,
            statements = report.statements_evicted,
            "dispatched metadata change"
        );
        report
    }

    fn apply(&self, kind: &ChangeKind, report: &mut DispatchReport) {
        use InvalidationReason as Reason;
        match kind {
            ChangeKind::CreateIndex { index, table } => {
                // Plans on the base table must recompile to consider the
                // index; the index itself is usually uncommitted and misses.
                self.invalidate(*table, Reason::IndexAdded, report);
                self.invalidate(*index, Reason::IndexAdded, report);
            }
            ChangeKind::DropIndex { index, table } => {
                self.invalidate(*index, Reason::IndexDropped, report);
                self.invalidate(*table, Reason::IndexDropped, report);
            }
            ChangeKind::DropTable { table } => {
                self.invalidate(*table, Reason::Drop, report);
            }
            ChangeKind::DropView { view } => {
                self.invalidate(*view, Reason::Drop, report);
            }
            ChangeKind::DropSchema { schema } => {
                self.invalidate(*schema, Reason::Drop, report);
            }
            ChangeKind::DropDatabase { database } => {
                self.invalidate(*database, Reason::Drop, report);
            }
            ChangeKind::RenameTable { table } => {
                self.invalidate(*table, Reason::Rename, report);
            }
            ChangeKind::RenameColumn { table } => {
                self.invalidate(*table, Reason::Rename, report);
            }
            ChangeKind::RenameIndex { index, table } => {
                self.invalidate(*index, Reason::Rename, report);
                self.invalidate(*table, Reason::Rename, report);
            }
            ChangeKind::AlterTable { table } => {
                self.invalidate(*table, Reason::Alter, report);
            }
            ChangeKind::CreateTrigger { trigger, table }
            | ChangeKind::DropTrigger { trigger, table } => {
                self.invalidate(*trigger, Reason::TriggerChanged, report);
                self.invalidate(*table, Reason::TriggerChanged, report);
            }
            ChangeKind::GrantPrivilege { object } | ChangeKind::RevokePrivilege { object } => {
                self.invalidate(*object, Reason::PrivilegeChanged, report);
            }
            ChangeKind::Truncate { table } => {
                self.invalidate(*table, Reason::Truncate, report);
            }
            ChangeKind::EnterRestoreMode => {
                report.sessions_updated += self.sessions.broadcast_restore_mode(true);
            }
            ChangeKind::ExitRestoreMode => {
                report.sessions_updated += self.sessions.broadcast_restore_mode(false);
            }
            ChangeKind::SetReplicationRole { role } => {
                report.sessions_updated += self.sessions.broadcast_replication_role(*role);
            }
            ChangeKind::Composite(subs) => {
                for sub in subs {
                    self.apply(sub, report);
                }
            }
        }
    }

    fn invalidate(
        &self,
        object: ObjectId,
        reason: InvalidationReason,
        report: &mut DispatchReport,
    ) {
        if self.dictionary.lookup(object).is_none() {
            trace!(%object, %reason, "change target unknown to dictionary; nothing to invalidate");
            report.misses += 1;
            return;
        }
        self.dependencies.invalidate_for(object, reason);
        let eviction = self.dictionary.evict(object);
        report.objects_invalidated += 1;
        report.statements_evicted += eviction.statements;
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats.lock().clone()
    }
}
