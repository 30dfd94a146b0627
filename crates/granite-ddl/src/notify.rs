//! Cluster metadata change notification
//!
//! A schema change is not allowed to finish until every node has run the
//! local pre-action for it (dispatched the change against its own caches)
//! and acknowledged. The notifier splits that into the two halves the
//! statement layer wants: `notify_metadata_change` broadcasts and returns
//! immediately, `finish_metadata_change` blocks on the acknowledgements
//! with a configured timeout. A statement that cannot collect every ack
//! must not report the DDL as complete.
//!
//! [`DdlTransport`] is the wire seam. [`InMemoryDdlBus`] implements it for
//! tests and single-process deployments by invoking each registered node's
//! applier directly; a networked implementation ships
//! [`ChangeEnvelope::encode`] bytes instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use granite_common::prelude::*;

use crate::change::{ChangeEnvelope, MetadataChange};
use crate::dispatcher::ChangeDispatcher;

// ============================================================================
// Transport seam
// ============================================================================

/// Delivers change envelopes to the rest of the cluster.
#[async_trait]
pub trait DdlTransport: Send + Sync {
    /// Deliver `envelope` to every peer and collect per-node ack results.
    /// The origin node is not a peer; its pre-action runs in the notifier.
    async fn broadcast(&self, envelope: &ChangeEnvelope) -> Vec<(NodeId, Result<()>)>;

    /// Peers currently reachable, for diagnostics.
    fn peer_count(&self) -> usize;
}

/// Applies remotely-issued changes on one node.
pub struct NodeApplier {
    node: NodeId,
    dispatcher: Arc<ChangeDispatcher>,
}

impl NodeApplier {
    pub fn new(node: NodeId, dispatcher: Arc<ChangeDispatcher>) -> Self {
        Self { node, dispatcher }
    }

    fn apply(&self, envelope: &ChangeEnvelope) -> Result<()> {
        let report = self.dispatcher.dispatch(&envelope.change);
        trace!(
            node = %self.node,
            change = %envelope.id,
            invalidated = report.objects_invalidated,
            "applied remote metadata change"
        );
        Ok(())
    }
}

/// In-process transport: registered nodes are applied to synchronously
/// during broadcast, which makes acknowledgement deterministic in tests.
pub struct InMemoryDdlBus {
    nodes: DashMap<NodeId, Arc<NodeApplier>>,
}

impl InMemoryDdlBus {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
        }
    }

    pub fn register(&self, node: NodeId, dispatcher: Arc<ChangeDispatcher>) {
        self.nodes.insert(node, Arc::new(NodeApplier::new(node, dispatcher)));
    }

    pub fn unregister(&self, node: NodeId) {
        self.nodes.remove(&node);
    }
}

impl Default for InMemoryDdlBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DdlTransport for InMemoryDdlBus {
    async fn broadcast(&self, envelope: &ChangeEnvelope) -> Vec<(NodeId, Result<()>)> {
        let mut acks = Vec::new();
        for entry in self.nodes.iter() {
            let node = *entry.key();
            if node == envelope.origin {
                continue;
            }
            acks.push((node, entry.value().apply(envelope)));
        }
        acks
    }

    fn peer_count(&self) -> usize {
        self.nodes.len()
    }
}

// ============================================================================
// Notifier
// ============================================================================

/// Notifier counters
#[derive(Debug, Clone, Default)]
pub struct NotifierStats {
    pub changes_notified: u64,
    pub changes_finished: u64,
    pub failures: u64,
}

/// Issues metadata change notifications and collects acknowledgements.
pub struct DdlNotifier {
    node: NodeId,
    config: DdlConfig,
    dispatcher: Arc<ChangeDispatcher>,
    transport: Arc<dyn DdlTransport>,
    next_change: AtomicU64,
    pending: DashMap<ChangeId, oneshot::Receiver<Result<()>>>,
    stats: Mutex<NotifierStats>,
}

impl DdlNotifier {
    pub fn new(
        node: NodeId,
        config: DdlConfig,
        dispatcher: Arc<ChangeDispatcher>,
        transport: Arc<dyn DdlTransport>,
    ) -> Self {
        Self {
            node,
            config,
            dispatcher,
            transport,
            next_change: AtomicU64::new(1),
            pending: DashMap::new(),
            stats: Mutex::new(NotifierStats::default()),
        }
    }

    /// Start a cluster-wide metadata change and return its id immediately.
    ///
    /// The local pre-action and the broadcast run on a spawned task, so this
    /// must be called from within the runtime. Collect the outcome with
    /// [`finish_metadata_change`](Self::finish_metadata_change).
    pub fn notify_metadata_change(&self, change: MetadataChange) -> ChangeId {
        let id = ChangeId(self.next_change.fetch_add(1, Ordering::SeqCst));
        let envelope = ChangeEnvelope {
            id,
            origin: self.node,
            change,
        };

        let (done, outcome) = oneshot::channel();
        self.pending.insert(id, outcome);
        self.stats.lock().changes_notified += 1;
        debug!(change = %id, kind = %envelope.change.kind, "metadata change notification started");

        let dispatcher = Arc::clone(&self.dispatcher);
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            let report = dispatcher.dispatch(&envelope.change);
            trace!(
                change = %envelope.id,
                invalidated = report.objects_invalidated,
                "local pre-action applied"
            );

            let mut failed: Vec<String> = Vec::new();
            for (node, ack) in transport.broadcast(&envelope).await {
                if let Err(e) = ack {
                    warn!(
                        change = %envelope.id,
                        %node,
                        error = %e,
                        "node failed to acknowledge metadata change"
                    );
                    failed.push(format!("{}: {}", node, e));
                }
            }

            let outcome = if failed.is_empty() {
                Ok(())
            } else {
                Err(DdlError::NotifyFailed(failed.join("; ")).into())
            };
            if done.send(outcome).is_err() {
                trace!(change = %envelope.id, "nobody waited for notification outcome");
            }
        });

        id
    }

    /// Block until every node has acknowledged change `id`.
    ///
    /// Times out after `notify_timeout` with [`DdlError::Unacknowledged`];
    /// a nack from any node surfaces as [`DdlError::NotifyFailed`]. Either
    /// way the caller must treat the DDL as not complete.
    pub async fn finish_metadata_change(&self, id: ChangeId) -> Result<()> {
        let (_, outcome) = self
            .pending
            .remove(&id)
            .ok_or(DdlError::UnknownChange(id.0))?;

        let result = match tokio::time::timeout(self.config.notify_timeout, outcome).await {
            Err(_) => {
                warn!(change = %id, timeout = ?self.config.notify_timeout, "metadata change acknowledgement timed out");
                Err(DdlError::Unacknowledged(id.0).into())
            }
            Ok(Err(_)) => Err(DdlError::NotifyFailed("notification task dropped".to_string()).into()),
            Ok(Ok(outcome)) => outcome,
        };

        let mut stats = self.stats.lock();
        match &result {
            Ok(()) => stats.changes_finished += 1,
            Err(_) => stats.failures += 1,
        }
        result
    }

    /// Broadcast and wait for full acknowledgement in one call.
    pub async fn notify_metadata_change_and_wait(&self, change: MetadataChange) -> Result<ChangeId> {
        let id = self.notify_metadata_change(change);
        self.finish_metadata_change(id).await?;
        Ok(id)
    }

    pub fn stats(&self) -> NotifierStats {
        self.stats.lock().clone()
    }
}
