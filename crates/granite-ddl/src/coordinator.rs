//! Online schema change coordination
//!
//! A schema change that builds a new storage structure (an index, a
//! rewritten table) must not wait behind every open transaction, and must
//! not miss writes from transactions that predate it. The coordinator
//! resolves this with a tentative transaction chain under the issuing
//! wrapper transaction:
//!
//! 1. `wait_txn`, a nested internal child begun without write permission.
//!    Its id is a temporal cutoff: anything that began later is guaranteed
//!    by snapshot versioning to observe the new schema and never needs to
//!    be waited on.
//! 2. A bounded drain loop that retries with doubled backoff until every
//!    older transaction touching the target has finished, the budget runs
//!    out, or the caller cancels.
//! 3. `index_txn`, a second child begun with write permission, used
//!    exclusively to populate the new structure.
//!
//! Committing the wrapper finalizes both children. Giving up never trades
//! correctness: budget exhaustion surfaces the blocking transaction and the
//! whole change aborts.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use granite_common::prelude::*;
use granite_txn::TxnStore;

/// Where a schema change stands in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DdlPhase {
    Initiated,
    BarrierCreated,
    WaitingForDrain,
    Populating,
    Finished,
}

/// Drives one schema change through the barrier, drain and populate steps.
///
/// One coordinator per DDL statement. The wrapper transaction is the
/// statement's own root transaction; the coordinator chains children under
/// it and leaves commit and abort of the wrapper to the statement.
pub struct DdlCoordinator {
    store: Arc<TxnStore>,
    config: DdlConfig,
    wrapper: TxnId,
    target: ObjectId,
    phase: DdlPhase,
    wait_txn: Option<TxnId>,
    index_txn: Option<TxnId>,
}

impl DdlCoordinator {
    pub fn new(store: Arc<TxnStore>, config: DdlConfig, wrapper: TxnId, target: ObjectId) -> Self {
        Self {
            store,
            config,
            wrapper,
            target,
            phase: DdlPhase::Initiated,
            wait_txn: None,
            index_txn: None,
        }
    }

    pub fn phase(&self) -> DdlPhase {
        self.phase
    }

    /// The barrier transaction id, once created. Doubles as the drain
    /// threshold: only transactions with a smaller id are ever waited on.
    pub fn barrier(&self) -> Option<TxnId> {
        self.wait_txn
    }

    /// The writable population transaction, once chained.
    pub fn populate_txn(&self) -> Option<TxnId> {
        self.index_txn
    }

    /// Chain the barrier child under the wrapper. It carries no writes and
    /// is never elevated; it exists to pin the drain threshold and to mark
    /// the target in the active-transaction index.
    pub fn create_barrier(&mut self) -> Result<TxnId> {
        self.expect_phase(DdlPhase::Initiated, "create barrier")?;
        let wait_txn = self
            .store
            .begin_nested_internal(self.wrapper, true, Some(self.target), true)?;
        self.wait_txn = Some(wait_txn);
        self.phase = DdlPhase::BarrierCreated;
        info!(
            wrapper = %self.wrapper,
            barrier = %wait_txn,
            target = %self.target,
            "schema change barrier created"
        );
        Ok(wait_txn)
    }

    /// Transactions that must finish before population may start: active
    /// against the target, older than the barrier, and not part of the
    /// wrapper's own tree. Sorted ascending by id.
    pub fn blocking_txns(&self) -> Result<Vec<TxnId>> {
        let threshold = self.barrier_id()?;
        let root = self.store.absolute_root(self.wrapper)?;
        Ok(self
            .store
            .active_txns_touching(self.target, threshold)
            .into_iter()
            .filter(|id| !self.store.descends_from(*id, root))
            .collect())
    }

    /// Wait for every pre-barrier conflicter to finish.
    ///
    /// Sleeps `drain_initial_backoff` and doubles on every retry, each sleep
    /// jittered and capped by what remains of `drain_max_wait`. Exhausting
    /// the budget with a conflicter still active fails with
    /// [`DdlError::ActiveTransactions`] naming the oldest one; cancelling
    /// the token fails with [`DdlError::DrainCancelled`]. Neither outcome
    /// ever lets the change proceed past a live conflicter.
    pub async fn wait_for_drain(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.expect_phase(DdlPhase::BarrierCreated, "wait for drain")?;
        let threshold = self.barrier_id()?;
        self.phase = DdlPhase::WaitingForDrain;

        let deadline = Instant::now() + self.config.drain_max_wait;
        let mut backoff = self.config.drain_initial_backoff;
        let mut attempt = 0u32;

        loop {
            let blockers = self.blocking_txns()?;
            if blockers.is_empty() {
                debug!(barrier = %threshold, attempts = attempt, "drain clear");
                return Ok(());
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let blocking = blockers[0];
                warn!(
                    barrier = %threshold,
                    %blocking,
                    still_active = blockers.len(),
                    "drain budget exhausted"
                );
                return Err(DdlError::ActiveTransactions { blocking: blocking.0 }.into());
            }

            let jitter = Duration::from_millis(rand::random::<u64>() % 50);
            let sleep = (backoff + jitter).min(remaining);
            trace!(
                barrier = %threshold,
                blockers = blockers.len(),
                attempt,
                ?sleep,
                "conflicting transactions still active"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(barrier = %threshold, "drain cancelled");
                    return Err(DdlError::DrainCancelled.into());
                }
                _ = tokio::time::sleep(sleep) => {}
            }

            attempt += 1;
            backoff = backoff.saturating_mul(2);
        }
    }

    /// Chain the writable population child under the wrapper. Elevation
    /// runs up the parent chain, so the wrapper becomes writable too.
    pub fn begin_population(&mut self) -> Result<TxnId> {
        self.expect_phase(DdlPhase::WaitingForDrain, "begin population")?;
        let index_txn = self
            .store
            .begin_nested_internal(self.wrapper, false, Some(self.target), false)?;
        self.index_txn = Some(index_txn);
        self.phase = DdlPhase::Populating;
        info!(
            wrapper = %self.wrapper,
            populate = %index_txn,
            "population transaction chained"
        );
        Ok(index_txn)
    }

    /// Close the machine once population and cache invalidation are done.
    /// The wrapper's commit, issued by the caller, finalizes both children.
    pub fn finish(&mut self) -> Result<()> {
        self.expect_phase(DdlPhase::Populating, "finish")?;
        self.phase = DdlPhase::Finished;
        debug!(wrapper = %self.wrapper, target = %self.target, "schema change coordination finished");
        Ok(())
    }

    /// Barrier, drain and populate in one call; hands back the writable
    /// population transaction.
    pub async fn prepare(&mut self, cancel: &CancellationToken) -> Result<TxnId> {
        self.create_barrier()?;
        self.wait_for_drain(cancel).await?;
        self.begin_population()
    }

    fn barrier_id(&self) -> Result<TxnId> {
        self.wait_txn
            .ok_or_else(|| Error::internal("schema change barrier not created"))
    }

    fn expect_phase(&self, want: DdlPhase, op: &str) -> Result<()> {
        if self.phase != want {
            return Err(Error::internal(format!(
                "cannot {} in phase {:?}",
                op, self.phase
            )));
        }
        Ok(())
    }
}
