//! Metadata change records
//!
//! A schema change is described by a [`MetadataChange`]: the issuing
//! transaction plus a [`ChangeKind`] naming the affected objects. The kind
//! set is closed; the dispatcher matches it exhaustively, so adding a kind
//! forces every consumer to handle it at compile time.
//!
//! Records cross node boundaries, so everything here serializes with serde
//! and ships as bincode on the wire.

use granite_common::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Replication role a node can be switched into at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationRole {
    Primary,
    Replica,
}

impl fmt::Display for ReplicationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationRole::Primary => write!(f, "PRIMARY"),
            ReplicationRole::Replica => write!(f, "REPLICA"),
        }
    }
}

/// The closed set of schema change kinds.
///
/// Catalog kinds carry the ids of the objects whose cached state must be
/// invalidated before the owning transaction commits. The three control
/// kinds (`EnterRestoreMode`, `ExitRestoreMode`, `SetReplicationRole`)
/// touch no catalog rows; they are broadcast to live sessions instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    CreateIndex { index: ObjectId, table: ObjectId },
    DropIndex { index: ObjectId, table: ObjectId },
    DropTable { table: ObjectId },
    DropView { view: ObjectId },
    DropSchema { schema: ObjectId },
    DropDatabase { database: ObjectId },
    RenameTable { table: ObjectId },
    RenameColumn { table: ObjectId },
    RenameIndex { index: ObjectId, table: ObjectId },
    AlterTable { table: ObjectId },
    CreateTrigger { trigger: ObjectId, table: ObjectId },
    DropTrigger { trigger: ObjectId, table: ObjectId },
    GrantPrivilege { object: ObjectId },
    RevokePrivilege { object: ObjectId },
    Truncate { table: ObjectId },
    EnterRestoreMode,
    ExitRestoreMode,
    SetReplicationRole { role: ReplicationRole },
    /// Sub-changes applied as one unit, dispatched in a single pass.
    Composite(Vec<ChangeKind>),
}

impl ChangeKind {
    /// Stable name for logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            ChangeKind::CreateIndex { .. } => "CREATE_INDEX",
            ChangeKind::DropIndex { .. } => "DROP_INDEX",
            ChangeKind::DropTable { .. } => "DROP_TABLE",
            ChangeKind::DropView { .. } => "DROP_VIEW",
            ChangeKind::DropSchema { .. } => "DROP_SCHEMA",
            ChangeKind::DropDatabase { .. } => "DROP_DATABASE",
            ChangeKind::RenameTable { .. } => "RENAME_TABLE",
            ChangeKind::RenameColumn { .. } => "RENAME_COLUMN",
            ChangeKind::RenameIndex { .. } => "RENAME_INDEX",
            ChangeKind::AlterTable { .. } => "ALTER_TABLE",
            ChangeKind::CreateTrigger { .. } => "CREATE_TRIGGER",
            ChangeKind::DropTrigger { .. } => "DROP_TRIGGER",
            ChangeKind::GrantPrivilege { .. } => "GRANT_PRIVILEGE",
            ChangeKind::RevokePrivilege { .. } => "REVOKE_PRIVILEGE",
            ChangeKind::Truncate { .. } => "TRUNCATE",
            ChangeKind::EnterRestoreMode => "ENTER_RESTORE_MODE",
            ChangeKind::ExitRestoreMode => "EXIT_RESTORE_MODE",
            ChangeKind::SetReplicationRole { .. } => "SET_REPLICATION_ROLE",
            ChangeKind::Composite(_) => "COMPOSITE",
        }
    }

    /// Whether this kind mutates control state rather than catalog rows.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            ChangeKind::EnterRestoreMode
                | ChangeKind::ExitRestoreMode
                | ChangeKind::SetReplicationRole { .. }
        )
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A schema change as issued by one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataChange {
    /// Transaction performing the change; its commit publishes the new state.
    pub txn: TxnId,
    pub kind: ChangeKind,
}

impl MetadataChange {
    pub fn new(txn: TxnId, kind: ChangeKind) -> Self {
        Self { txn, kind }
    }
}

/// A change stamped with its cluster-wide id and origin, as broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEnvelope {
    pub id: ChangeId,
    pub origin: NodeId,
    pub change: MetadataChange,
}

impl ChangeEnvelope {
    /// Serialize for wire transports.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from wire bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| Error::Serialization(e.to_string()))
    }
}
