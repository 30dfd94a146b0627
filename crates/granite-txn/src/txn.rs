//! Transaction records.
//!
//! A [`Txn`] is the serializable record of one transaction: identity,
//! ancestry, isolation, write permission and terminal state. Records live in
//! the [`TxnStore`](crate::store::TxnStore) arena and reference each other by
//! id only, so a record can be shipped to another node as-is.

use granite_common::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::SystemTime;

/// How a transaction was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnKind {
    /// Top-level transaction owned by a session
    Root,
    /// Nested transaction begun on behalf of the user
    NestedUser,
    /// Nested transaction begun by the engine itself (barriers, index builds)
    NestedInternal,
}

/// Lifecycle state of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnState {
    /// Running; may read, and write once elevated
    Active,
    /// Voted in a two-phase commit, awaiting the decision
    Prepared,
    /// Terminal: all effects are permanent once the root chain commits
    Committed,
    /// Terminal: all effects are discarded
    RolledBack,
}

impl TxnState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxnState::Committed | TxnState::RolledBack)
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnState::Active => write!(f, "ACTIVE"),
            TxnState::Prepared => write!(f, "PREPARED"),
            TxnState::Committed => write!(f, "COMMITTED"),
            TxnState::RolledBack => write!(f, "ROLLED_BACK"),
        }
    }
}

/// Vote returned by the first phase of a two-phase commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum XaVote {
    /// The transaction never wrote; it is complete after the vote
    ReadOnly,
    /// The transaction wrote and is ready for the decision phase
    Ok,
}

/// A transaction record.
///
/// `writable` flips false to true exactly once (elevation) and never
/// reverts. `state` moves from `Active` through an optional `Prepared` to a
/// terminal state and then never changes again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Txn {
    pub id: TxnId,
    /// Parent transaction id; `None` for roots. Forms a tree, never a graph.
    pub parent: Option<TxnId>,
    pub kind: TxnKind,
    pub isolation: IsolationLevel,
    pub writable: bool,
    pub state: TxnState,
    pub begin_ts: SystemTime,
    /// Ordering token assigned at commit, from the same counter as ids
    pub commit_ts: Option<TxnId>,
    /// Directly nested children, in creation order
    pub children: Vec<TxnId>,
    /// Storage objects this transaction has touched
    pub touched: HashSet<ObjectId>,
    /// True for records reconstructed from a serialized form. Views are
    /// permanently read-only and can never be elevated.
    pub view: bool,
    /// Internal transactions may opt out of durable logging
    pub in_memory: bool,
}

impl Txn {
    /// Create a root transaction record
    pub fn new(id: TxnId, isolation: IsolationLevel) -> Self {
        Self {
            id,
            parent: None,
            kind: TxnKind::Root,
            isolation,
            writable: false,
            state: TxnState::Active,
            begin_ts: SystemTime::now(),
            commit_ts: None,
            children: Vec::new(),
            touched: HashSet::new(),
            view: false,
            in_memory: false,
        }
    }

    /// Create a nested transaction record
    pub fn nested(id: TxnId, parent: TxnId, kind: TxnKind, isolation: IsolationLevel) -> Self {
        Self {
            id,
            parent: Some(parent),
            kind,
            isolation,
            writable: false,
            state: TxnState::Active,
            begin_ts: SystemTime::now(),
            commit_ts: None,
            children: Vec::new(),
            touched: HashSet::new(),
            view: false,
            in_memory: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == TxnState::Active
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether this record may ever gain write permission
    pub fn can_elevate(&self) -> bool {
        !self.view && !self.is_terminal()
    }
}
