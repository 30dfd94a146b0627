//! Conglomerate lock table.
//!
//! Locking is table-granular: a transaction tree takes a shared lock to
//! read or write rows and an exclusive lock to change structure. Grants
//! are keyed by the tree's absolute root, so a nested transaction never
//! conflicts with its own parent — but each grant also tracks which
//! transactions inside the tree asked for it, so a nested child hands
//! back only its own stake when it finishes while the parent's survives.
//!
//! Waiters park on a condition variable with a deadline and a wait-for
//! graph catches cycles before a request starts waiting.

use dashmap::DashMap;
use granite_common::prelude::*;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lock modes. Structure changes take `Exclusive`, everything else
/// `Shared`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Allows concurrent readers and row writers
    Shared,
    /// No concurrent access
    Exclusive,
}

impl LockMode {
    /// Whether two trees can hold their locks simultaneously.
    pub fn is_compatible(&self, other: &LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }

    /// Whether a grant in `self` satisfies a request for `wanted`.
    fn covers(&self, wanted: &LockMode) -> bool {
        self == wanted || *self == LockMode::Exclusive
    }
}

/// A queued lock request.
#[derive(Debug, Clone)]
struct LockRequest {
    root: TxnId,
    owner: TxnId,
    mode: LockMode,
}

/// One tree's grant on a conglomerate. `mode` is what the tree holds
/// against other trees; `stakes` records the strongest mode each member
/// transaction asked for, so releasing one member can downgrade or free
/// the grant.
#[derive(Debug)]
struct Grant {
    mode: LockMode,
    stakes: HashMap<TxnId, LockMode>,
}

impl Grant {
    fn strongest(&self) -> LockMode {
        if self.stakes.values().any(|m| *m == LockMode::Exclusive) {
            LockMode::Exclusive
        } else {
            LockMode::Shared
        }
    }
}

/// Outcome of returning one member's stake.
enum StakeRelease {
    /// Last stake gone; the tree no longer holds the lock
    Released,
    /// Other members still hold it (possibly at a weaker mode now)
    Retained,
    /// The member held no stake here
    NotHeld,
}

/// State of one conglomerate's lock.
#[derive(Debug)]
struct LockState {
    /// Granted locks keyed by transaction tree root
    holders: HashMap<TxnId, Grant>,
    /// Requests waiting for a grant, in arrival order
    wait_queue: VecDeque<LockRequest>,
    /// Condition variable for waiters
    condvar: Arc<Condvar>,
}

impl LockState {
    fn new() -> Self {
        Self {
            holders: HashMap::new(),
            wait_queue: VecDeque::new(),
            condvar: Arc::new(Condvar::new()),
        }
    }

    /// Whether a request is compatible with every other tree's grant.
    fn is_compatible(&self, root: TxnId, mode: LockMode) -> bool {
        self.holders
            .iter()
            .all(|(&holder, grant)| holder == root || mode.is_compatible(&grant.mode))
    }

    fn granted_mode(&self, root: TxnId) -> Option<LockMode> {
        self.holders.get(&root).map(|grant| grant.mode)
    }

    fn grant(&mut self, root: TxnId, owner: TxnId, mode: LockMode) {
        let grant = self.holders.entry(root).or_insert_with(|| Grant {
            mode,
            stakes: HashMap::new(),
        });
        if mode == LockMode::Exclusive {
            grant.mode = LockMode::Exclusive;
        }
        let stake = grant.stakes.entry(owner).or_insert(mode);
        if mode == LockMode::Exclusive {
            *stake = LockMode::Exclusive;
        }
    }

    /// Release the whole tree's grant. Returns the members that held
    /// stakes, for bookkeeping cleanup.
    fn release(&mut self, root: TxnId) -> Option<Vec<TxnId>> {
        self.holders
            .remove(&root)
            .map(|grant| grant.stakes.into_keys().collect())
    }

    /// Return one member's stake, downgrading or freeing the grant.
    fn release_stake(&mut self, root: TxnId, owner: TxnId) -> StakeRelease {
        let Some(grant) = self.holders.get_mut(&root) else {
            return StakeRelease::NotHeld;
        };
        if grant.stakes.remove(&owner).is_none() {
            return StakeRelease::NotHeld;
        }
        if grant.stakes.is_empty() {
            self.holders.remove(&root);
            StakeRelease::Released
        } else {
            grant.mode = grant.strongest();
            StakeRelease::Retained
        }
    }

    fn dequeue(&mut self, owner: TxnId) {
        self.wait_queue.retain(|r| r.owner != owner);
    }

    /// Grant whatever the front of the queue allows. Returns the roots
    /// that got their lock.
    fn process_wait_queue(&mut self) -> Vec<TxnId> {
        let mut granted = Vec::new();
        let mut remaining = VecDeque::new();

        while let Some(request) = self.wait_queue.pop_front() {
            if self.is_compatible(request.root, request.mode) {
                self.grant(request.root, request.owner, request.mode);
                granted.push(request.root);
            } else {
                remaining.push_back(request);
            }
        }

        self.wait_queue = remaining;
        granted
    }
}

/// Lock table statistics.
#[derive(Debug, Clone, Default)]
pub struct LockTableStats {
    pub granted: u64,
    pub waited: u64,
    pub released: u64,
    pub timeouts: u64,
    pub deadlocks: u64,
}

/// Table-level lock manager for conglomerates.
pub struct LockTable {
    /// Lock states keyed by conglomerate
    locks: DashMap<ConglomId, Arc<Mutex<LockState>>>,
    /// Conglomerates locked by each tree root, for bulk release
    held: DashMap<TxnId, Vec<ConglomId>>,
    /// Conglomerates each member transaction staked, for child release
    owned: DashMap<TxnId, Vec<ConglomId>>,
    /// Wait-for graph: waiting root to the roots it waits on
    wait_for: DashMap<TxnId, Vec<TxnId>>,
    /// How long a request waits before giving up
    timeout: Duration,
    /// Statistics
    stats: Mutex<LockTableStats>,
}

impl LockTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            held: DashMap::new(),
            owned: DashMap::new(),
            wait_for: DashMap::new(),
            timeout,
            stats: Mutex::new(LockTableStats::default()),
        }
    }

    fn state_for(&self, congl: ConglomId) -> Arc<Mutex<LockState>> {
        self.locks
            .entry(congl)
            .or_insert_with(|| Arc::new(Mutex::new(LockState::new())))
            .clone()
    }

    /// Acquire a lock for `owner`, a member of the tree under `root`,
    /// waiting up to the configured timeout. Requests that would close a
    /// cycle in the wait-for graph fail immediately instead of waiting.
    pub fn acquire(&self, root: TxnId, owner: TxnId, congl: ConglomId, mode: LockMode) -> Result<()> {
        let lock_state = self.state_for(congl);
        let mut state = lock_state.lock();

        if let Some(held) = state.granted_mode(root) {
            if held.covers(&mode) {
                state.grant(root, owner, mode);
                self.record_owned(owner, congl);
                return Ok(());
            }
            // Upgrade from shared to exclusive.
            if state.is_compatible(root, mode) {
                state.grant(root, owner, mode);
                self.record_owned(owner, congl);
                self.stats.lock().granted += 1;
                return Ok(());
            }
        } else if state.is_compatible(root, mode) && state.wait_queue.is_empty() {
            state.grant(root, owner, mode);
            self.record_grant(root, congl);
            self.record_owned(owner, congl);
            self.stats.lock().granted += 1;
            return Ok(());
        }

        let newly_held = state.granted_mode(root).is_none();
        state.wait_queue.push_back(LockRequest { root, owner, mode });

        let blockers: Vec<TxnId> = state
            .holders
            .keys()
            .copied()
            .filter(|holder| *holder != root)
            .collect();
        self.wait_for.insert(root, blockers);

        if self.has_cycle(root) {
            state.dequeue(owner);
            self.wait_for.remove(&root);
            self.stats.lock().deadlocks += 1;
            warn!(root = root.0, conglomerate = congl.0, "deadlock detected");
            return Err(StoreError::Deadlock(congl.0).into());
        }

        self.stats.lock().waited += 1;
        let condvar = state.condvar.clone();
        let deadline = Instant::now() + self.timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                state.dequeue(owner);
                self.wait_for.remove(&root);
                self.stats.lock().timeouts += 1;
                return Err(StoreError::LockTimeout(congl.0).into());
            }

            let result = condvar.wait_for(&mut state, remaining);

            if state.granted_mode(root).is_some_and(|held| held.covers(&mode)) {
                state.dequeue(owner);
                state.grant(root, owner, mode);
                self.wait_for.remove(&root);
                if newly_held {
                    self.record_grant(root, congl);
                }
                self.record_owned(owner, congl);
                self.stats.lock().granted += 1;
                return Ok(());
            }

            if result.timed_out() {
                state.dequeue(owner);
                self.wait_for.remove(&root);
                self.stats.lock().timeouts += 1;
                return Err(StoreError::LockTimeout(congl.0).into());
            }
        }
    }

    /// Acquire without waiting. Returns false if the lock is unavailable.
    pub fn try_acquire(&self, root: TxnId, owner: TxnId, congl: ConglomId, mode: LockMode) -> bool {
        let lock_state = self.state_for(congl);
        let mut state = lock_state.lock();

        if let Some(held) = state.granted_mode(root) {
            if held.covers(&mode) {
                state.grant(root, owner, mode);
                self.record_owned(owner, congl);
                return true;
            }
            if state.is_compatible(root, mode) {
                state.grant(root, owner, mode);
                self.record_owned(owner, congl);
                self.stats.lock().granted += 1;
                return true;
            }
            return false;
        }

        if state.is_compatible(root, mode) && state.wait_queue.is_empty() {
            state.grant(root, owner, mode);
            self.record_grant(root, congl);
            self.record_owned(owner, congl);
            self.stats.lock().granted += 1;
            true
        } else {
            false
        }
    }

    /// Release one lock for the whole tree. Returns whether the tree
    /// held it.
    pub fn release(&self, root: TxnId, congl: ConglomId) -> bool {
        let Some(lock_state) = self.locks.get(&congl) else {
            return false;
        };
        let lock_state = lock_state.clone();
        let mut state = lock_state.lock();

        let Some(owners) = state.release(root) else {
            return false;
        };
        if let Some(mut held) = self.held.get_mut(&root) {
            held.retain(|c| *c != congl);
        }
        for owner in owners {
            if let Some(mut owned) = self.owned.get_mut(&owner) {
                owned.retain(|c| *c != congl);
            }
        }
        self.stats.lock().released += 1;

        if !state.process_wait_queue().is_empty() {
            state.condvar.notify_all();
        }
        true
    }

    /// Return one member transaction's stakes, freeing each lock whose
    /// only stake it was. Locks other members of the tree also staked
    /// stay granted (downgraded if the exclusive stake was the leaver's).
    /// This is what a nested child's completion calls.
    pub fn release_owned(&self, root: TxnId, owner: TxnId) -> usize {
        let conglomerates: Vec<ConglomId> = self
            .owned
            .remove(&owner)
            .map(|(_, v)| v)
            .unwrap_or_default();
        let mut freed = 0;

        for congl in conglomerates {
            let Some(lock_state) = self.locks.get(&congl) else {
                continue;
            };
            let lock_state = lock_state.clone();
            let mut state = lock_state.lock();
            match state.release_stake(root, owner) {
                StakeRelease::Released => {
                    freed += 1;
                    if let Some(mut held) = self.held.get_mut(&root) {
                        held.retain(|c| *c != congl);
                    }
                    self.stats.lock().released += 1;
                    if !state.process_wait_queue().is_empty() {
                        state.condvar.notify_all();
                    }
                }
                StakeRelease::Retained => {
                    // A downgrade may admit shared waiters.
                    if !state.process_wait_queue().is_empty() {
                        state.condvar.notify_all();
                    }
                }
                StakeRelease::NotHeld => {}
            }
        }
        freed
    }

    /// Release every lock held by a transaction tree.
    pub fn release_all(&self, root: TxnId) -> usize {
        let conglomerates: Vec<ConglomId> = self
            .held
            .remove(&root)
            .map(|(_, v)| v)
            .unwrap_or_default();
        let count = conglomerates.len();

        for congl in conglomerates {
            if let Some(lock_state) = self.locks.get(&congl) {
                let lock_state = lock_state.clone();
                let mut state = lock_state.lock();
                if let Some(owners) = state.release(root) {
                    for owner in owners {
                        if let Some(mut owned) = self.owned.get_mut(&owner) {
                            owned.retain(|c| *c != congl);
                        }
                    }
                    self.stats.lock().released += 1;
                    if !state.process_wait_queue().is_empty() {
                        state.condvar.notify_all();
                    }
                }
            }
        }

        self.wait_for.remove(&root);
        count
    }

    /// Mode currently granted to a tree on a conglomerate.
    pub fn granted_mode(&self, root: TxnId, congl: ConglomId) -> Option<LockMode> {
        self.locks
            .get(&congl)
            .and_then(|lock_state| lock_state.lock().granted_mode(root))
    }

    pub fn stats(&self) -> LockTableStats {
        self.stats.lock().clone()
    }

    fn record_grant(&self, root: TxnId, congl: ConglomId) {
        let mut held = self.held.entry(root).or_default();
        if !held.contains(&congl) {
            held.push(congl);
        }
    }

    fn record_owned(&self, owner: TxnId, congl: ConglomId) {
        let mut owned = self.owned.entry(owner).or_default();
        if !owned.contains(&congl) {
            owned.push(congl);
        }
    }

    /// Depth-first search for a cycle through `start` in the wait-for
    /// graph.
    fn has_cycle(&self, start: TxnId) -> bool {
        let mut visited = std::collections::HashSet::new();
        let mut stack = vec![start];

        while let Some(txn) = stack.pop() {
            if !visited.insert(txn) {
                continue;
            }
            if let Some(blockers) = self.wait_for.get(&txn) {
                for &blocker in blockers.value() {
                    if blocker == start {
                        return true;
                    }
                    if !visited.contains(&blocker) {
                        stack.push(blocker);
                    }
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn table() -> LockTable {
        LockTable::new(Duration::from_secs(5))
    }

    #[test]
    fn test_mode_compatibility() {
        use LockMode::*;
        assert!(Shared.is_compatible(&Shared));
        assert!(!Shared.is_compatible(&Exclusive));
        assert!(!Exclusive.is_compatible(&Shared));
        assert!(!Exclusive.is_compatible(&Exclusive));
    }

    #[test]
    fn test_acquire_release() {
        let lt = table();
        let root = TxnId(1);
        let congl = ConglomId(10);

        lt.acquire(root, root, congl, LockMode::Exclusive).unwrap();
        assert_eq!(lt.granted_mode(root, congl), Some(LockMode::Exclusive));

        assert!(lt.release(root, congl));
        assert_eq!(lt.granted_mode(root, congl), None);
    }

    #[test]
    fn test_shared_locks_coexist() {
        let lt = table();
        let congl = ConglomId(10);

        lt.acquire(TxnId(1), TxnId(1), congl, LockMode::Shared).unwrap();
        lt.acquire(TxnId(2), TxnId(2), congl, LockMode::Shared).unwrap();
        assert_eq!(lt.granted_mode(TxnId(1), congl), Some(LockMode::Shared));
        assert_eq!(lt.granted_mode(TxnId(2), congl), Some(LockMode::Shared));
    }

    #[test]
    fn test_exclusive_blocks_other_tree() {
        let lt = table();
        let congl = ConglomId(10);

        lt.acquire(TxnId(1), TxnId(1), congl, LockMode::Exclusive)
            .unwrap();
        assert!(!lt.try_acquire(TxnId(2), TxnId(2), congl, LockMode::Shared));
        assert!(!lt.try_acquire(TxnId(2), TxnId(2), congl, LockMode::Exclusive));
    }

    #[test]
    fn test_same_root_reacquire_is_noop() {
        let lt = table();
        let congl = ConglomId(10);
        let root = TxnId(1);

        lt.acquire(root, root, congl, LockMode::Exclusive).unwrap();
        // A nested transaction resolves to the same root and sails through.
        lt.acquire(root, TxnId(2), congl, LockMode::Shared).unwrap();
        lt.acquire(root, TxnId(2), congl, LockMode::Exclusive).unwrap();
        assert_eq!(lt.granted_mode(root, congl), Some(LockMode::Exclusive));
    }

    #[test]
    fn test_upgrade_shared_to_exclusive() {
        let lt = table();
        let congl = ConglomId(10);
        let root = TxnId(1);

        lt.acquire(root, root, congl, LockMode::Shared).unwrap();
        lt.acquire(root, root, congl, LockMode::Exclusive).unwrap();
        assert_eq!(lt.granted_mode(root, congl), Some(LockMode::Exclusive));
    }

    #[test]
    fn test_child_stake_release_frees_child_only_lock() {
        let lt = table();
        let congl = ConglomId(10);
        let root = TxnId(1);
        let child = TxnId(2);

        lt.acquire(root, child, congl, LockMode::Shared).unwrap();
        assert_eq!(lt.release_owned(root, child), 1);
        assert_eq!(lt.granted_mode(root, congl), None);
        assert!(lt.try_acquire(TxnId(9), TxnId(9), congl, LockMode::Exclusive));
    }

    #[test]
    fn test_child_stake_release_keeps_parent_stake() {
        let lt = table();
        let congl = ConglomId(10);
        let root = TxnId(1);
        let child = TxnId(2);

        lt.acquire(root, root, congl, LockMode::Shared).unwrap();
        lt.acquire(root, child, congl, LockMode::Shared).unwrap();

        assert_eq!(lt.release_owned(root, child), 0);
        assert_eq!(lt.granted_mode(root, congl), Some(LockMode::Shared));
        assert!(!lt.try_acquire(TxnId(9), TxnId(9), congl, LockMode::Exclusive));

        lt.release_all(root);
        assert!(lt.try_acquire(TxnId(9), TxnId(9), congl, LockMode::Exclusive));
    }

    #[test]
    fn test_child_exclusive_downgrades_on_stake_release() {
        let lt = table();
        let congl = ConglomId(10);
        let root = TxnId(1);
        let child = TxnId(2);

        lt.acquire(root, root, congl, LockMode::Shared).unwrap();
        lt.acquire(root, child, congl, LockMode::Exclusive).unwrap();
        assert_eq!(lt.granted_mode(root, congl), Some(LockMode::Exclusive));

        // The child leaves; the parent's shared stake remains and other
        // trees can read again.
        lt.release_owned(root, child);
        assert_eq!(lt.granted_mode(root, congl), Some(LockMode::Shared));
        assert!(lt.try_acquire(TxnId(9), TxnId(9), congl, LockMode::Shared));
    }

    #[test]
    fn test_timeout_expires() {
        let lt = LockTable::new(Duration::from_millis(50));
        let congl = ConglomId(10);

        lt.acquire(TxnId(1), TxnId(1), congl, LockMode::Exclusive)
            .unwrap();
        let err = lt
            .acquire(TxnId(2), TxnId(2), congl, LockMode::Shared)
            .unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::LockTimeout(10))));
        assert_eq!(lt.stats().timeouts, 1);
    }

    #[test]
    fn test_waiter_granted_on_release() {
        let lt = Arc::new(table());
        let congl = ConglomId(10);

        lt.acquire(TxnId(1), TxnId(1), congl, LockMode::Exclusive)
            .unwrap();

        let lt2 = Arc::clone(&lt);
        let waiter =
            thread::spawn(move || lt2.acquire(TxnId(2), TxnId(2), congl, LockMode::Exclusive));

        thread::sleep(Duration::from_millis(50));
        assert!(lt.release(TxnId(1), congl));

        waiter.join().unwrap().unwrap();
        assert_eq!(lt.granted_mode(TxnId(2), congl), Some(LockMode::Exclusive));
    }

    #[test]
    fn test_stake_release_unblocks_waiter() {
        let lt = Arc::new(table());
        let congl = ConglomId(10);
        let root = TxnId(1);
        let child = TxnId(2);

        lt.acquire(root, child, congl, LockMode::Exclusive).unwrap();

        let lt2 = Arc::clone(&lt);
        let waiter =
            thread::spawn(move || lt2.acquire(TxnId(9), TxnId(9), congl, LockMode::Shared));

        thread::sleep(Duration::from_millis(50));
        assert_eq!(lt.release_owned(root, child), 1);

        waiter.join().unwrap().unwrap();
        assert_eq!(lt.granted_mode(TxnId(9), congl), Some(LockMode::Shared));
    }

    #[test]
    fn test_release_all_unblocks_waiters() {
        let lt = Arc::new(table());
        let a = ConglomId(10);
        let b = ConglomId(11);

        lt.acquire(TxnId(1), TxnId(1), a, LockMode::Exclusive).unwrap();
        lt.acquire(TxnId(1), TxnId(1), b, LockMode::Exclusive).unwrap();

        let lt2 = Arc::clone(&lt);
        let waiter = thread::spawn(move || {
            lt2.acquire(TxnId(2), TxnId(2), a, LockMode::Shared)?;
            lt2.acquire(TxnId(2), TxnId(2), b, LockMode::Shared)
        });

        thread::sleep(Duration::from_millis(50));
        assert_eq!(lt.release_all(TxnId(1)), 2);

        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn test_deadlock_detected() {
        let lt = Arc::new(table());
        let a = ConglomId(10);
        let b = ConglomId(11);

        lt.acquire(TxnId(1), TxnId(1), a, LockMode::Exclusive).unwrap();
        lt.acquire(TxnId(2), TxnId(2), b, LockMode::Exclusive).unwrap();

        let lt2 = Arc::clone(&lt);
        let blocked = thread::spawn(move || lt2.acquire(TxnId(1), TxnId(1), b, LockMode::Exclusive));

        // Give the first waiter time to publish its wait-for edge.
        thread::sleep(Duration::from_millis(100));

        let err = lt
            .acquire(TxnId(2), TxnId(2), a, LockMode::Exclusive)
            .unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::Deadlock(10))));
        assert_eq!(lt.stats().deadlocks, 1);

        // Backing out the loser lets the other waiter through.
        lt.release_all(TxnId(2));
        blocked.join().unwrap().unwrap();
    }
}
