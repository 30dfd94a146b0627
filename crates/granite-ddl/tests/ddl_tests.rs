//! End-to-end online schema change tests
//!
//! Exercises the full DDL path against real storage:
//! - **Barrier and drain**: an index build waits for a conflicting writer,
//!   then populates from a view that includes the writer's commit
//! - **Isolation**: index rows stay invisible until the wrapper commits
//! - **Atomicity**: an aborted change leaves no trace of the new structure
//! - **Invalidation**: no reader of committed state sees the stale
//!   dictionary entry after the change finishes

use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use granite_common::prelude::*;
use granite_common::types::{ColumnDef, DataType};
use granite_ddl::change::{ChangeKind, MetadataChange};
use granite_ddl::coordinator::{DdlCoordinator, DdlPhase};
use granite_ddl::dictionary::{
    CachedStatement, CatalogObject, CatalogObjectKind, DataDictionaryCache, DependencyManager,
    InvalidationReason, PlanDependencyTracker, SessionContextRegistry,
};
use granite_ddl::dispatcher::ChangeDispatcher;
use granite_ddl::notify::{DdlNotifier, DdlTransport, InMemoryDdlBus};
use granite_store::{AccessManager, ConglomerateDescriptor, RecordKey, ScanSpec, VersionedHeap};
use granite_txn::TxnStore;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn manager() -> Arc<AccessManager> {
    Arc::new(AccessManager::new(TxnConfig::default()))
}

fn fast_ddl_config() -> DdlConfig {
    DdlConfig {
        drain_initial_backoff: Duration::from_millis(5),
        drain_max_wait: Duration::from_secs(2),
        notify_timeout: Duration::from_millis(500),
    }
}

fn accounts_descriptor() -> ConglomerateDescriptor {
    ConglomerateDescriptor::new("accounts")
        .with_column(ColumnDef::new("id", DataType::Int64).not_null())
        .with_column(ColumnDef::new("owner", DataType::String))
        .with_column(ColumnDef::new("balance", DataType::Int64))
        .with_key(vec![0], vec![SortOrder::Ascending])
}

fn balance_index_descriptor() -> ConglomerateDescriptor {
    ConglomerateDescriptor::new("accounts_by_balance")
        .with_column(ColumnDef::new("balance", DataType::Int64))
        .with_column(ColumnDef::new("id", DataType::Int64).not_null())
        .with_key(vec![0, 1], vec![SortOrder::Ascending, SortOrder::Ascending])
}

fn account(id: i64, owner: &str, balance: i64) -> Row {
    Row::new(vec![
        Value::Int64(id),
        Value::String(owner.to_string()),
        Value::Int64(balance),
    ])
}

/// Seed the base table with three committed accounts.
fn seeded_table(mgr: &Arc<AccessManager>) -> ConglomId {
    let mut ctl = mgr.begin_default().unwrap();
    let table = ctl.create_conglomerate(accounts_descriptor(), false).unwrap();
    {
        let handle = ctl.open_conglomerate(table, true, false).unwrap();
        let mut handle = handle.lock();
        handle.insert(account(1, "alice", 120)).unwrap();
        handle.insert(account(2, "bob", 40)).unwrap();
        handle.insert(account(3, "carol", 300)).unwrap();
    }
    ctl.commit().unwrap();
    table
}

/// Copy every base row visible to `index_txn` into the index heap as
/// `(balance, id)`. Returns how many entries were written.
fn populate_index(
    store: &Arc<TxnStore>,
    base: &Arc<VersionedHeap>,
    index: &Arc<VersionedHeap>,
    index_txn: TxnId,
) -> Result<usize> {
    let view = store.current_view(index_txn)?;
    let mut built = 0;
    let mut position: Option<RecordKey> = None;
    loop {
        let lower = match &position {
            None => Bound::Unbounded,
            Some(key) => Bound::Excluded(key),
        };
        let (key, row) = match base.next_visible(store, &view, lower) {
            Some(pair) => pair,
            None => break,
        };
        let entry = Row::new(vec![row.values[2].clone(), row.values[0].clone()]);
        index.insert(index_txn, entry)?;
        built += 1;
        position = Some(key);
    }
    Ok(built)
}

/// Read the whole index through a fresh transaction as `(balance, id)`.
fn scan_index(mgr: &Arc<AccessManager>, index: ConglomId) -> Vec<(i64, i64)> {
    let mut reader = mgr.begin_default().unwrap();
    let scan = reader
        .open_scan(index, ScanSpec::new().project(vec![0, 1]), false)
        .unwrap();
    let mut out = Vec::new();
    {
        let mut scan = scan.lock();
        let mut row = Row::new(vec![Value::Null, Value::Null]);
        while scan.next().unwrap() {
            scan.fetch(&mut row).unwrap();
            out.push((row.get_i64(0).unwrap(), row.get_i64(1).unwrap()));
        }
    }
    reader.abort().unwrap();
    out
}

struct DdlStack {
    dictionary: Arc<DataDictionaryCache>,
    dependencies: Arc<PlanDependencyTracker>,
    notifier: DdlNotifier,
}

/// Dictionary, dispatcher and notifier wired to an in-process bus.
fn ddl_stack() -> DdlStack {
    let dictionary = Arc::new(DataDictionaryCache::new());
    let dependencies = Arc::new(PlanDependencyTracker::new());
    let dispatcher = Arc::new(ChangeDispatcher::new(
        Arc::clone(&dictionary),
        Arc::clone(&dependencies) as Arc<dyn DependencyManager>,
        Arc::new(SessionContextRegistry::new()),
    ));
    let bus = Arc::new(InMemoryDdlBus::new());
    bus.register(NodeId(1), Arc::clone(&dispatcher));
    let notifier = DdlNotifier::new(
        NodeId(1),
        fast_ddl_config(),
        dispatcher,
        bus as Arc<dyn DdlTransport>,
    );
    DdlStack {
        dictionary,
        dependencies,
        notifier,
    }
}

/// The full online index build: a writer holds the table while the change
/// starts, the drain waits it out, and the finished index contains the
/// writer's row even though it committed after the change began.
#[tokio::test(flavor = "multi_thread")]
async fn test_index_build_waits_for_conflicting_writer() {
    init_tracing();
    let mgr = manager();
    let table = seeded_table(&mgr);
    let store = Arc::clone(mgr.txn_store());

    // A writer from before the schema change, still open.
    let mut writer = mgr.begin_default().unwrap();
    {
        let handle = writer.open_conglomerate(table, true, false).unwrap();
        handle.lock().insert(account(4, "dave", 75)).unwrap();
    }

    // The schema change begins and creates the index structure.
    let mut wrapper = mgr.begin_default().unwrap();
    let index = wrapper
        .create_conglomerate(balance_index_descriptor(), false)
        .unwrap();

    let mut ddl = DdlCoordinator::new(
        Arc::clone(&store),
        fast_ddl_config(),
        wrapper.id(),
        table.object(),
    );
    ddl.create_barrier().unwrap();
    assert_eq!(ddl.blocking_txns().unwrap(), vec![writer.id()]);

    let handle = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(40)).await;
        writer.commit().unwrap();
    });

    ddl.wait_for_drain(&CancellationToken::new()).await.unwrap();
    handle.await.unwrap();
    let index_txn = ddl.begin_population().unwrap();
    assert_eq!(ddl.phase(), DdlPhase::Populating);

    let built = populate_index(
        &store,
        &mgr.heap(table).unwrap(),
        &mgr.heap(index).unwrap(),
        index_txn,
    )
    .unwrap();
    assert_eq!(built, 4);

    // Uncommitted index contents are invisible to other transactions.
    assert!(scan_index(&mgr, index).is_empty());

    ddl.finish().unwrap();
    wrapper.commit().unwrap();

    assert_eq!(
        scan_index(&mgr, index),
        vec![(40, 2), (75, 4), (120, 1), (300, 3)]
    );
}

/// A writer that never finishes exhausts the drain budget; aborting the
/// wrapper then removes the half-built index structure entirely.
#[tokio::test(flavor = "multi_thread")]
async fn test_exhausted_drain_aborts_the_whole_change() {
    init_tracing();
    let mgr = manager();
    let table = seeded_table(&mgr);
    let store = Arc::clone(mgr.txn_store());

    let mut writer = mgr.begin_default().unwrap();
    {
        let handle = writer.open_conglomerate(table, true, false).unwrap();
        handle.lock().insert(account(4, "dave", 75)).unwrap();
    }

    let mut wrapper = mgr.begin_default().unwrap();
    let index = wrapper
        .create_conglomerate(balance_index_descriptor(), false)
        .unwrap();

    let config = DdlConfig {
        drain_initial_backoff: Duration::from_millis(5),
        drain_max_wait: Duration::from_millis(60),
        notify_timeout: Duration::from_millis(500),
    };
    let mut ddl = DdlCoordinator::new(Arc::clone(&store), config, wrapper.id(), table.object());

    let err = ddl.prepare(&CancellationToken::new()).await.unwrap_err();
    match err {
        Error::Ddl(DdlError::ActiveTransactions { blocking }) => {
            assert_eq!(blocking, writer.id().0);
        }
        other => panic!("expected ActiveTransactions, got {other:?}"),
    }

    wrapper.abort().unwrap();
    assert!(mgr.heap(index).is_err());

    // The blocker was never disturbed and finishes normally.
    writer.commit().unwrap();
}

/// Finishing the change invalidates the dictionary before the wrapper
/// commits, so nobody reading committed state sees the old entry.
#[tokio::test(flavor = "multi_thread")]
async fn test_finished_change_invalidates_dictionary() {
    init_tracing();
    let mgr = manager();
    let table = seeded_table(&mgr);
    let store = Arc::clone(mgr.txn_store());

    let stack = ddl_stack();
    stack.dictionary.define(
        CatalogObject::new(table.object(), "app", "accounts", CatalogObjectKind::Table)
            .with_conglomerate(table),
    );
    stack.dictionary.cache_statement(
        1,
        CachedStatement {
            sql: "SELECT * FROM accounts".into(),
            referenced: vec![table.object()],
        },
    );
    stack.dependencies.record_dependency(1, table.object());

    let mut wrapper = mgr.begin_default().unwrap();
    let index = wrapper
        .create_conglomerate(balance_index_descriptor(), false)
        .unwrap();

    let mut ddl = DdlCoordinator::new(
        Arc::clone(&store),
        fast_ddl_config(),
        wrapper.id(),
        table.object(),
    );
    let index_txn = ddl.prepare(&CancellationToken::new()).await.unwrap();
    populate_index(
        &store,
        &mgr.heap(table).unwrap(),
        &mgr.heap(index).unwrap(),
        index_txn,
    )
    .unwrap();

    stack
        .notifier
        .notify_metadata_change_and_wait(MetadataChange::new(
            wrapper.id(),
            ChangeKind::CreateIndex {
                index: index.object(),
                table: table.object(),
            },
        ))
        .await
        .unwrap();

    // Invalidation lands before the commit.
    assert!(stack.dictionary.lookup(table.object()).is_none());
    assert!(stack.dictionary.statement(1).is_none());
    assert_eq!(
        stack.dependencies.invalidations(),
        vec![(table.object(), InvalidationReason::IndexAdded)]
    );

    ddl.finish().unwrap();
    wrapper.commit().unwrap();
    assert_eq!(scan_index(&mgr, index).len(), 3);
}
