//! The conglomerate registry.
//!
//! Process-wide map from conglomerate id to descriptor. Shared ids are
//! assigned from a monotonic counter; session-temporary ids come from a
//! separate negative counter so they can never collide with shared ids.
//!
//! Structural changes swap the registry entry atomically and park the
//! prior descriptor under the mutating transaction, so an abort can put
//! the old structure back.

use crate::conglomerate::ConglomerateDescriptor;
use dashmap::DashMap;
use granite_common::prelude::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

/// Registry statistics.
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    pub created: u64,
    pub dropped: u64,
    pub swaps: u64,
    pub restores: u64,
}

/// Shared conglomerate id-to-descriptor map.
pub struct ConglomerateRegistry {
    /// Shared descriptors keyed by id
    shared: DashMap<ConglomId, ConglomerateDescriptor>,
    /// Prior descriptors parked by structural changes, per transaction
    parked: DashMap<TxnId, Vec<ConglomerateDescriptor>>,
    /// Next shared id
    next_shared: AtomicI64,
    /// Next temporary id, counting down
    next_temp: AtomicI64,
    /// Statistics
    stats: Mutex<RegistryStats>,
}

impl ConglomerateRegistry {
    pub fn new() -> Self {
        Self {
            shared: DashMap::new(),
            parked: DashMap::new(),
            next_shared: AtomicI64::new(1),
            next_temp: AtomicI64::new(-1),
            stats: Mutex::new(RegistryStats::default()),
        }
    }

    /// Hand out a fresh session-temporary id. The descriptor itself lives
    /// in the owning session, never in this registry.
    pub fn allocate_temp_id(&self) -> ConglomId {
        ConglomId(self.next_temp.fetch_sub(1, Ordering::SeqCst))
    }

    /// Register a shared conglomerate, assigning an id if none is set.
    pub fn create(&self, mut descriptor: ConglomerateDescriptor) -> Result<ConglomId> {
        descriptor.validate()?;
        if descriptor.id.0 == 0 {
            descriptor.id = ConglomId(self.next_shared.fetch_add(1, Ordering::SeqCst));
        }
        if descriptor.id.is_temporary() {
            return Err(Error::invalid_argument(format!(
                "temporary conglomerate {} cannot be registered as shared",
                descriptor.id
            )));
        }

        let id = descriptor.id;
        match self.shared.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(Error::already_exists("Conglomerate", id.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(descriptor);
                self.stats.lock().created += 1;
                debug!(conglomerate = %id, "registered conglomerate");
                Ok(id)
            }
        }
    }

    pub fn get(&self, id: ConglomId) -> Option<ConglomerateDescriptor> {
        self.shared.get(&id).map(|r| r.clone())
    }

    pub fn contains(&self, id: ConglomId) -> bool {
        self.shared.contains_key(&id)
    }

    /// Atomically replace a descriptor, parking the prior version under
    /// `txn` for abort recovery.
    pub fn swap(&self, txn: TxnId, descriptor: ConglomerateDescriptor) -> Result<()> {
        let id = descriptor.id;
        let prior = match self.shared.get_mut(&id) {
            Some(mut entry) => std::mem::replace(entry.value_mut(), descriptor),
            None => return Err(StoreError::ConglomerateNotFound(id.0).into()),
        };
        self.parked.entry(txn).or_default().push(prior);
        self.stats.lock().swaps += 1;
        debug!(conglomerate = %id, txn = %txn, "swapped conglomerate descriptor");
        Ok(())
    }

    /// Remove a shared conglomerate, parking the removed descriptor under
    /// `txn` so an abort can reinstate it.
    pub fn drop_conglomerate(&self, txn: TxnId, id: ConglomId) -> Result<()> {
        let (_, descriptor) = self
            .shared
            .remove(&id)
            .ok_or(StoreError::ConglomerateNotFound(id.0))?;
        self.parked.entry(txn).or_default().push(descriptor);
        self.stats.lock().dropped += 1;
        debug!(conglomerate = %id, txn = %txn, "dropped conglomerate");
        Ok(())
    }

    /// Undo structural changes made by `txn`, newest first. Returns the
    /// number of descriptors reinstated.
    pub fn restore_parked(&self, txn: TxnId) -> usize {
        let Some((_, mut priors)) = self.parked.remove(&txn) else {
            return 0;
        };
        let n = priors.len();
        while let Some(prior) = priors.pop() {
            self.shared.insert(prior.id, prior);
        }
        self.stats.lock().restores += n as u64;
        n
    }

    /// Discard parked descriptors once `txn` committed.
    pub fn forget_parked(&self, txn: TxnId) {
        self.parked.remove(&txn);
    }

    /// Hard-remove a descriptor without parking it, for backing out a
    /// create whose transaction aborted.
    pub fn remove(&self, id: ConglomId) -> bool {
        self.shared.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.is_empty()
    }

    pub fn ids(&self) -> Vec<ConglomId> {
        self.shared.iter().map(|e| *e.key()).collect()
    }

    pub fn stats(&self) -> RegistryStats {
        self.stats.lock().clone()
    }
}

impl Default for ConglomerateRegistry {
    fn default() -> Self {
        Self::new()
    }
}
