//! Transactional storage integration tests.
//!
//! These exercise the access layer end to end:
//! - **Atomicity**: a transaction's row and structure effects land together or not at all
//! - **Isolation**: snapshots stay stable and nested work is scoped to its tree
//! - **Savepoints**: partial rollback restores exactly the marked state
//! - **Structure**: online column changes and their abort paths

use granite_common::prelude::*;
use granite_common::types::ColumnDef;
use granite_store::{
    AccessManager, ConglomerateDescriptor, RecordKey, ScanSpec, TransactionController,
};
use granite_txn::TxnState;
use std::sync::Arc;

// ============================================================================
// Test helpers
// ============================================================================

fn manager() -> Arc<AccessManager> {
    Arc::new(AccessManager::new(TxnConfig::default()))
}

fn people_descriptor() -> ConglomerateDescriptor {
    ConglomerateDescriptor::new("people")
        .with_column(ColumnDef::new("id", DataType::Int64).not_null())
        .with_column(ColumnDef::new("name", DataType::String))
        .with_column(ColumnDef::new("age", DataType::Int64))
        .with_key(vec![0], vec![SortOrder::Ascending])
}

fn person(id: i64, name: &str, age: i64) -> Row {
    Row::new(vec![
        Value::Int64(id),
        Value::String(name.into()),
        Value::Int64(age),
    ])
}

fn setup() -> (Arc<AccessManager>, ConglomId) {
    let mgr = manager();
    let mut ctl = mgr.begin(IsolationLevel::Snapshot).unwrap();
    let id = ctl.create_conglomerate(people_descriptor(), false).unwrap();
    ctl.commit().unwrap();
    (mgr, id)
}

fn scan_ids(ctl: &mut TransactionController, id: ConglomId) -> Vec<i64> {
    let scan = ctl.open_scan(id, ScanSpec::new(), false).unwrap();
    let mut scan = scan.lock();
    let mut out = Row::new(vec![Value::Null]);
    let mut ids = Vec::new();
    while scan.fetch_next(&mut out).unwrap() {
        ids.push(out.get_i64(0).unwrap());
    }
    ids
}

// ============================================================================
// Atomicity
// ============================================================================

mod atomicity {
    use super::*;

    /// A committed transaction's inserts are all visible afterwards.
    #[test]
    fn test_commit_lands_everything() {
        let (mgr, id) = setup();

        let mut ctl = mgr.begin(IsolationLevel::Snapshot).unwrap();
        let table = ctl.open_conglomerate(id, true, false).unwrap();
        for i in 1..=5 {
            table.lock().insert(person(i, "p", 30)).unwrap();
        }
        ctl.commit().unwrap();

        let mut reader = mgr.begin(IsolationLevel::Snapshot).unwrap();
        assert_eq!(scan_ids(&mut reader, id), vec![1, 2, 3, 4, 5]);
        reader.abort().unwrap();
    }

    /// An aborted transaction leaves no trace, row or structure.
    #[test]
    fn test_abort_lands_nothing() {
        let (mgr, id) = setup();

        let mut ctl = mgr.begin(IsolationLevel::Snapshot).unwrap();
        let table = ctl.open_conglomerate(id, true, false).unwrap();
        table.lock().insert(person(1, "ada", 36)).unwrap();
        ctl.add_column(id, ColumnDef::new("email", DataType::String))
            .unwrap();
        ctl.abort().unwrap();

        let mut reader = mgr.begin(IsolationLevel::Snapshot).unwrap();
        assert!(scan_ids(&mut reader, id).is_empty());
        assert_eq!(mgr.registry().get(id).unwrap().column_count(), 3);
        reader.abort().unwrap();
    }

    /// A leaked controller rolls its transaction back on drop.
    #[test]
    fn test_leaked_controller_rolls_back() {
        let (mgr, id) = setup();

        let txn = {
            let mut ctl = mgr.begin(IsolationLevel::Snapshot).unwrap();
            let table = ctl.open_conglomerate(id, true, false).unwrap();
            table.lock().insert(person(1, "ada", 36)).unwrap();
            ctl.id()
        };

        assert_eq!(mgr.txn_store().state(txn), Some(TxnState::RolledBack));
        let mut reader = mgr.begin(IsolationLevel::Snapshot).unwrap();
        assert!(scan_ids(&mut reader, id).is_empty());
        reader.abort().unwrap();
    }

    /// A delete committed elsewhere makes the row unkeyable for a snapshot
    /// that still sees it. First committer wins.
    #[test]
    fn test_committed_delete_blocks_stale_writer() {
        let (mgr, id) = setup();

        let mut writer = mgr.begin(IsolationLevel::Snapshot).unwrap();
        let table = writer.open_conglomerate(id, true, false).unwrap();
        let key = table.lock().insert(person(1, "ada", 36)).unwrap();
        writer.commit().unwrap();

        let mut stale = mgr.begin(IsolationLevel::Snapshot).unwrap();
        let stale_table = stale.open_conglomerate(id, true, false).unwrap();

        let mut fresh = mgr.begin(IsolationLevel::Snapshot).unwrap();
        let fresh_table = fresh.open_conglomerate(id, true, false).unwrap();
        fresh_table.lock().delete(&key).unwrap();
        fresh.commit().unwrap();

        // The stale snapshot still reads the row but can no longer stamp it.
        assert!(stale_table.lock().fetch(&key).unwrap().is_some());
        let err = stale_table.lock().delete(&key).unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::RecordNotFound)));
        stale.abort().unwrap();
    }
}

// ============================================================================
// Isolation
// ============================================================================

mod isolation {
    use super::*;

    /// A snapshot reader never sees writes committed after its snapshot.
    #[test]
    fn test_snapshot_reader_stays_stable() {
        let (mgr, id) = setup();

        let mut reader = mgr.begin(IsolationLevel::Snapshot).unwrap();
        // Pin the snapshot before the writer commits.
        assert!(scan_ids(&mut reader, id).is_empty());

        let mut writer = mgr.begin(IsolationLevel::Snapshot).unwrap();
        let table = writer.open_conglomerate(id, true, false).unwrap();
        table.lock().insert(person(1, "ada", 36)).unwrap();
        writer.commit().unwrap();

        assert!(scan_ids(&mut reader, id).is_empty());
        reader.abort().unwrap();

        let mut late = mgr.begin(IsolationLevel::Snapshot).unwrap();
        assert_eq!(scan_ids(&mut late, id), vec![1]);
        late.abort().unwrap();
    }

    /// A read-committed reader picks up commits between statements.
    #[test]
    fn test_read_committed_sees_new_commits() {
        let (mgr, id) = setup();

        let mut reader = mgr.begin(IsolationLevel::ReadCommitted).unwrap();
        assert!(scan_ids(&mut reader, id).is_empty());

        let mut writer = mgr.begin(IsolationLevel::Snapshot).unwrap();
        let table = writer.open_conglomerate(id, true, false).unwrap();
        table.lock().insert(person(1, "ada", 36)).unwrap();
        writer.commit().unwrap();

        assert_eq!(scan_ids(&mut reader, id), vec![1]);
        reader.abort().unwrap();
    }

    /// An update leaves the old image for concurrent snapshots.
    #[test]
    fn test_concurrent_reader_sees_pre_update_image() {
        let (mgr, id) = setup();

        let mut writer = mgr.begin(IsolationLevel::Snapshot).unwrap();
        let table = writer.open_conglomerate(id, true, false).unwrap();
        let key = table.lock().insert(person(1, "ada", 36)).unwrap();
        writer.commit().unwrap();

        let mut reader = mgr.begin(IsolationLevel::Snapshot).unwrap();
        let reader_table = reader.open_conglomerate(id, false, false).unwrap();

        let mut updater = mgr.begin(IsolationLevel::Snapshot).unwrap();
        let upd_table = updater.open_conglomerate(id, true, false).unwrap();
        let key = upd_table.lock().update(&key, person(1, "ada", 37)).unwrap();
        updater.commit().unwrap();

        let seen = reader_table.lock().fetch(&key).unwrap().unwrap();
        assert_eq!(seen.get_i64(2), Some(36));
        reader.abort().unwrap();

        let mut late = mgr.begin(IsolationLevel::Snapshot).unwrap();
        let late_table = late.open_conglomerate(id, false, false).unwrap();
        let seen = late_table.lock().fetch(&key).unwrap().unwrap();
        assert_eq!(seen.get_i64(2), Some(37));
        late.abort().unwrap();
    }

    /// Writes stay invisible to outsiders while their writer is active.
    #[test]
    fn test_uncommitted_writes_stay_private() {
        let (mgr, id) = setup();

        let mut writer = mgr.begin(IsolationLevel::Snapshot).unwrap();
        let table = writer.open_conglomerate(id, true, false).unwrap();
        table.lock().insert(person(1, "ada", 36)).unwrap();
        assert_eq!(scan_ids(&mut writer, id), vec![1]);

        let mut other = mgr.begin(IsolationLevel::ReadCommitted).unwrap();
        assert!(scan_ids(&mut other, id).is_empty());
        other.abort().unwrap();
        writer.abort().unwrap();
    }
}

// ============================================================================
// Nesting
// ============================================================================

mod nesting {
    use super::*;

    /// A nested child reads the parent's uncommitted rows; outsiders do not.
    #[test]
    fn test_child_reads_parent_writes() {
        let (mgr, id) = setup();

        let mut parent = mgr.begin(IsolationLevel::Snapshot).unwrap();
        let table = parent.open_conglomerate(id, true, false).unwrap();
        table.lock().insert(person(1, "ada", 36)).unwrap();

        let mut child = parent.start_nested_user(true).unwrap();
        assert_eq!(scan_ids(&mut child, id), vec![1]);
        child.commit().unwrap();
        parent.abort().unwrap();
    }

    /// Rolling back a user-level child leaves the parent untouched.
    #[test]
    fn test_user_child_abort_is_contained() {
        let (mgr, id) = setup();

        let mut parent = mgr.begin(IsolationLevel::Snapshot).unwrap();
        let table = parent.open_conglomerate(id, true, false).unwrap();
        table.lock().insert(person(1, "ada", 36)).unwrap();

        let mut child = parent.start_nested_user(false).unwrap();
        let child_table = child.open_conglomerate(id, true, false).unwrap();
        child_table.lock().insert(person(2, "grace", 45)).unwrap();
        child.abort().unwrap();

        assert_eq!(scan_ids(&mut parent, id), vec![1]);
        parent.commit().unwrap();

        let mut reader = mgr.begin(IsolationLevel::Snapshot).unwrap();
        assert_eq!(scan_ids(&mut reader, id), vec![1]);
        reader.abort().unwrap();
    }

    /// Rolling back an internal child takes the whole tree down.
    #[test]
    fn test_internal_child_abort_cascades() {
        let (mgr, id) = setup();

        let mut parent = mgr.begin(IsolationLevel::Snapshot).unwrap();
        let parent_id = parent.id();
        let table = parent.open_conglomerate(id, true, false).unwrap();
        table.lock().insert(person(1, "ada", 36)).unwrap();

        let child = parent
            .start_nested_internal(false, Some(id), false)
            .unwrap();
        child.abort().unwrap();

        assert_eq!(mgr.txn_store().state(parent_id), Some(TxnState::RolledBack));
        drop(parent);

        let mut reader = mgr.begin(IsolationLevel::Snapshot).unwrap();
        assert!(scan_ids(&mut reader, id).is_empty());
        reader.abort().unwrap();
    }

    /// Children merge into the parent on commit; the tree publishes as one
    /// unit when the root commits.
    #[test]
    fn test_tree_publishes_atomically() {
        let (mgr, id) = setup();

        let mut parent = mgr.begin(IsolationLevel::Snapshot).unwrap();
        let mut child = parent.start_nested_user(false).unwrap();
        let child_table = child.open_conglomerate(id, true, false).unwrap();
        child_table.lock().insert(person(1, "ada", 36)).unwrap();
        child.commit().unwrap();

        // Committed child, active root: still invisible outside the tree.
        let mut other = mgr.begin(IsolationLevel::ReadCommitted).unwrap();
        assert!(scan_ids(&mut other, id).is_empty());
        other.abort().unwrap();

        assert_eq!(scan_ids(&mut parent, id), vec![1]);
        parent.commit().unwrap();

        let mut reader = mgr.begin(IsolationLevel::Snapshot).unwrap();
        assert_eq!(scan_ids(&mut reader, id), vec![1]);
        reader.abort().unwrap();
    }
}

// ============================================================================
// Structure changes
// ============================================================================

mod structure {
    use super::*;

    /// Old rows surface an added column's default; new rows store it.
    #[test]
    fn test_add_column_old_and_new_rows() {
        let (mgr, id) = setup();

        let mut writer = mgr.begin(IsolationLevel::Snapshot).unwrap();
        let table = writer.open_conglomerate(id, true, false).unwrap();
        table.lock().insert(person(1, "ada", 36)).unwrap();
        writer.commit().unwrap();

        let mut alterer = mgr.begin(IsolationLevel::Snapshot).unwrap();
        alterer
            .add_column(
                id,
                ColumnDef::new("active", DataType::Boolean).with_default(Value::Boolean(true)),
            )
            .unwrap();
        alterer.commit().unwrap();

        let mut writer = mgr.begin(IsolationLevel::Snapshot).unwrap();
        let table = writer.open_conglomerate(id, true, false).unwrap();
        table
            .lock()
            .insert(Row::new(vec![
                Value::Int64(2),
                Value::String("grace".into()),
                Value::Int64(45),
                Value::Boolean(false),
            ]))
            .unwrap();
        writer.commit().unwrap();

        let mut reader = mgr.begin(IsolationLevel::Snapshot).unwrap();
        let scan = reader.open_scan(id, ScanSpec::new(), false).unwrap();
        let mut scan = scan.lock();
        let mut out = Row::new(vec![Value::Null; 4]);
        assert!(scan.fetch_next(&mut out).unwrap());
        assert_eq!(out.get_bool(3), Some(true));
        assert!(scan.fetch_next(&mut out).unwrap());
        assert_eq!(out.get_bool(3), Some(false));
        drop(scan);
        reader.abort().unwrap();
    }

    /// Dropping a column narrows the visible row without rewriting storage.
    #[test]
    fn test_drop_column_narrows_rows() {
        let (mgr, id) = setup();

        let mut writer = mgr.begin(IsolationLevel::Snapshot).unwrap();
        let table = writer.open_conglomerate(id, true, false).unwrap();
        let key = table.lock().insert(person(1, "ada", 36)).unwrap();
        writer.commit().unwrap();

        let mut alterer = mgr.begin(IsolationLevel::Snapshot).unwrap();
        alterer.drop_column(id, 1).unwrap();
        alterer.commit().unwrap();

        let mut reader = mgr.begin(IsolationLevel::Snapshot).unwrap();
        let table = reader.open_conglomerate(id, false, false).unwrap();
        let row = table.lock().fetch(&key).unwrap().unwrap();
        assert_eq!(row.values, vec![Value::Int64(1), Value::Int64(36)]);
        reader.abort().unwrap();
    }

    /// A dropped conglomerate comes back whole when the dropper aborts.
    #[test]
    fn test_drop_conglomerate_abort_restores() {
        let (mgr, id) = setup();

        let mut writer = mgr.begin(IsolationLevel::Snapshot).unwrap();
        let table = writer.open_conglomerate(id, true, false).unwrap();
        table.lock().insert(person(1, "ada", 36)).unwrap();
        writer.commit().unwrap();

        let mut dropper = mgr.begin(IsolationLevel::Snapshot).unwrap();
        dropper.drop_conglomerate(id).unwrap();
        assert!(!mgr.registry().contains(id));
        dropper.abort().unwrap();

        assert!(mgr.registry().contains(id));
        let mut reader = mgr.begin(IsolationLevel::Snapshot).unwrap();
        assert_eq!(scan_ids(&mut reader, id), vec![1]);
        reader.abort().unwrap();
    }

    /// Stacked structural changes unwind together on abort.
    #[test]
    fn test_stacked_alters_unwind_in_order() {
        let (mgr, id) = setup();

        let mut alterer = mgr.begin(IsolationLevel::Snapshot).unwrap();
        alterer
            .add_column(id, ColumnDef::new("email", DataType::String))
            .unwrap();
        alterer
            .add_column(id, ColumnDef::new("phone", DataType::String))
            .unwrap();
        alterer.drop_column(id, 1).unwrap();
        assert_eq!(mgr.registry().get(id).unwrap().column_count(), 4);
        alterer.abort().unwrap();

        let restored = mgr.registry().get(id).unwrap();
        assert_eq!(restored.column_count(), 3);
        assert_eq!(restored.column_named("name"), Some(1));
        assert_eq!(restored.column_named("email"), None);
    }
}

// ============================================================================
// Concurrency
// ============================================================================

mod concurrency {
    use super::*;
    use std::thread;

    /// Parallel writers on disjoint keys all land.
    #[test]
    fn test_parallel_writers_all_land() {
        let (mgr, id) = setup();

        let mut handles = Vec::new();
        for t in 0..4 {
            let mgr = Arc::clone(&mgr);
            handles.push(thread::spawn(move || {
                let mut ctl = mgr.begin(IsolationLevel::Snapshot).unwrap();
                let table = ctl.open_conglomerate(id, true, false).unwrap();
                for i in 0..25 {
                    table
                        .lock()
                        .insert(person(t * 100 + i, "worker", 30))
                        .unwrap();
                }
                ctl.commit().unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let mut reader = mgr.begin(IsolationLevel::Snapshot).unwrap();
        assert_eq!(scan_ids(&mut reader, id).len(), 100);
        reader.abort().unwrap();
    }

    /// Vacuum after churn reclaims dead versions without hurting readers.
    #[test]
    fn test_vacuum_after_churn() {
        let (mgr, id) = setup();

        let mut writer = mgr.begin(IsolationLevel::Snapshot).unwrap();
        let table = writer.open_conglomerate(id, true, false).unwrap();
        let mut keys = Vec::new();
        for i in 0..20 {
            keys.push(table.lock().insert(person(i, "p", 30)).unwrap());
        }
        writer.commit().unwrap();

        let mut deleter = mgr.begin(IsolationLevel::Snapshot).unwrap();
        let table = deleter.open_conglomerate(id, true, false).unwrap();
        for key in keys.iter().take(10) {
            table.lock().delete(key).unwrap();
        }
        deleter.commit().unwrap();

        let stats = mgr.vacuum();
        assert!(stats.versions_removed >= 10);

        let mut reader = mgr.begin(IsolationLevel::Snapshot).unwrap();
        assert_eq!(scan_ids(&mut reader, id).len(), 10);
        reader.abort().unwrap();
    }
}

// ============================================================================
// Savepoint model check
// ============================================================================

mod savepoints {
    use super::*;
    use proptest::prelude::*;
    use std::collections::{BTreeSet, HashMap};

    #[derive(Debug, Clone)]
    enum Op {
        Insert(i64),
        Delete(i64),
        Mark,
        Rewind,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            5 => (0_i64..40).prop_map(Op::Insert),
            3 => (0_i64..40).prop_map(Op::Delete),
            1 => Just(Op::Mark),
            1 => Just(Op::Rewind),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(40))]

        /// Random insert/delete/savepoint traffic against a model set. The
        /// heap after any sequence of savepoint rewinds must match the model.
        #[test]
        fn savepoint_rewind_matches_model(ops in prop::collection::vec(op_strategy(), 1..60)) {
            let (mgr, id) = setup();
            let mut ctl = mgr.begin(IsolationLevel::Snapshot).unwrap();
            let table = ctl.open_conglomerate(id, true, false).unwrap();

            let mut model: BTreeSet<i64> = BTreeSet::new();
            let mut keys: HashMap<i64, RecordKey> = HashMap::new();
            let mut marks: Vec<(BTreeSet<i64>, HashMap<i64, RecordKey>)> = Vec::new();

            for op in ops {
                match op {
                    Op::Insert(v) => {
                        if !model.contains(&v) {
                            let key = table.lock().insert(person(v, "p", 30)).unwrap();
                            keys.insert(v, key);
                            model.insert(v);
                        }
                    }
                    Op::Delete(v) => {
                        if model.remove(&v) {
                            let key = keys.remove(&v).unwrap();
                            table.lock().delete(&key).unwrap();
                        }
                    }
                    Op::Mark => {
                        let name = format!("sp{}", marks.len());
                        ctl.set_savepoint(name).unwrap();
                        marks.push((model.clone(), keys.clone()));
                    }
                    Op::Rewind => {
                        if let Some((m, k)) = marks.pop() {
                            let name = format!("sp{}", marks.len());
                            ctl.rollback_to_savepoint(&name, false).unwrap();
                            ctl.release_savepoint(&name).unwrap();
                            model = m;
                            keys = k;
                        }
                    }
                }
            }

            let expected: Vec<i64> = model.iter().copied().collect();
            prop_assert_eq!(scan_ids(&mut ctl, id), expected);
            ctl.abort().unwrap();
        }
    }
}
