//! Storage access layer benchmarks
//!
//! Measures transaction lifecycle overhead, row write and point read
//! throughput through conglomerate handles, and scan delivery across
//! populated heaps.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use granite_common::prelude::*;
use granite_common::types::ColumnDef;
use granite_store::{AccessManager, ConglomerateDescriptor, Qualifier, RecordKey, ScanSpec};
use std::sync::Arc;

fn bench_descriptor() -> ConglomerateDescriptor {
    ConglomerateDescriptor::new("bench")
        .with_column(ColumnDef::new("id", DataType::Int64).not_null())
        .with_column(ColumnDef::new("payload", DataType::String))
        .with_column(ColumnDef::new("score", DataType::Int64))
        .with_key(vec![0], vec![SortOrder::Ascending])
}

fn bench_row(i: i64) -> Row {
    Row::new(vec![
        Value::Int64(i),
        Value::String(format!("payload_{i:08}")),
        Value::Int64(i % 100),
    ])
}

fn populated(n: i64) -> (Arc<AccessManager>, ConglomId, Vec<RecordKey>) {
    let mgr = Arc::new(AccessManager::new(TxnConfig::default()));
    let mut ctl = mgr.begin(IsolationLevel::Snapshot).unwrap();
    let id = ctl.create_conglomerate(bench_descriptor(), false).unwrap();
    let table = ctl.open_conglomerate(id, true, false).unwrap();
    let mut keys = Vec::with_capacity(n as usize);
    for i in 0..n {
        keys.push(table.lock().insert(bench_row(i)).unwrap());
    }
    ctl.commit().unwrap();
    (mgr, id, keys)
}

fn txn_lifecycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("txn_lifecycle");

    group.bench_function("begin_abort", |b| {
        let mgr = Arc::new(AccessManager::new(TxnConfig::default()));
        b.iter(|| {
            let ctl = mgr.begin(IsolationLevel::Snapshot).unwrap();
            ctl.abort().unwrap();
        })
    });

    group.bench_function("begin_insert_commit", |b| {
        let (mgr, id, _) = populated(0);
        let mut next = 0_i64;
        b.iter(|| {
            let mut ctl = mgr.begin(IsolationLevel::Snapshot).unwrap();
            let table = ctl.open_conglomerate(id, true, false).unwrap();
            table.lock().insert(bench_row(next)).unwrap();
            next += 1;
            ctl.commit().unwrap();
        })
    });

    group.finish();
}

fn row_access(c: &mut Criterion) {
    let mut group = c.benchmark_group("row_access");

    for batch in [10_i64, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("insert", batch), &batch, |b, &batch| {
            b.iter(|| {
                let mgr = Arc::new(AccessManager::new(TxnConfig::default()));
                let mut ctl = mgr.begin(IsolationLevel::Snapshot).unwrap();
                let id = ctl.create_conglomerate(bench_descriptor(), false).unwrap();
                let table = ctl.open_conglomerate(id, true, false).unwrap();
                for i in 0..batch {
                    table.lock().insert(bench_row(i)).unwrap();
                }
                ctl.commit().unwrap();
            })
        });
    }

    group.bench_function("point_fetch", |b| {
        let (mgr, id, keys) = populated(1000);
        let mut ctl = mgr.begin(IsolationLevel::Snapshot).unwrap();
        let table = ctl.open_conglomerate(id, false, false).unwrap();
        let mut i = 0;
        b.iter(|| {
            let key = &keys[i % keys.len()];
            i += 1;
            criterion::black_box(table.lock().fetch(key).unwrap());
        })
    });

    group.finish();
}

fn scan_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan");

    for n in [100_i64, 1000, 10000] {
        let (mgr, id, _) = populated(n);
        group.bench_with_input(BenchmarkId::new("full", n), &n, |b, _| {
            b.iter(|| {
                let mut ctl = mgr.begin(IsolationLevel::Snapshot).unwrap();
                let scan = ctl.open_scan(id, ScanSpec::new(), false).unwrap();
                let mut scan = scan.lock();
                let mut out = Row::new(vec![Value::Null; 3]);
                let mut count = 0;
                while scan.fetch_next(&mut out).unwrap() {
                    count += 1;
                }
                drop(scan);
                ctl.abort().unwrap();
                criterion::black_box(count)
            })
        });
    }

    group.bench_function("qualified_1000", |b| {
        let (mgr, id, _) = populated(1000);
        b.iter(|| {
            let mut ctl = mgr.begin(IsolationLevel::Snapshot).unwrap();
            let spec = ScanSpec::new().filter(vec![Qualifier::ge(2, Value::Int64(90))]);
            let scan = ctl.open_scan(id, spec, false).unwrap();
            let mut scan = scan.lock();
            let mut out = Row::new(vec![Value::Null; 3]);
            let mut count = 0;
            while scan.fetch_next(&mut out).unwrap() {
                count += 1;
            }
            drop(scan);
            ctl.abort().unwrap();
            criterion::black_box(count)
        })
    });

    group.bench_function("group_fetch_1000", |b| {
        let (mgr, id, _) = populated(1000);
        b.iter(|| {
            let mut ctl = mgr.begin(IsolationLevel::Snapshot).unwrap();
            let scan = ctl
                .open_group_fetch_scan(id, ScanSpec::new(), false)
                .unwrap();
            let mut scan = scan.lock();
            let mut slots = Vec::new();
            let mut total = 0;
            loop {
                let n = scan.fetch_next_group(&mut slots, 64).unwrap();
                if n == 0 {
                    break;
                }
                total += n;
            }
            drop(scan);
            ctl.abort().unwrap();
            criterion::black_box(total)
        })
    });

    group.finish();
}

criterion_group!(benches, txn_lifecycle, row_access, scan_throughput);
criterion_main!(benches);
