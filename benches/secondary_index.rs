//! Secondary lookup benchmarks across both index layouts, against a
//! no-index baseline that scans every record through the primary path and
//! re-parses its JSON in application code.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use jotdb::{Config, Store};

const RECORDS: u64 = 10_000;

fn record(id: u64) -> Vec<u8> {
    format!(
        r#"{{"id":{id},"age":{},"name":"User{id}"}}"#,
        id % 50 + 10
    )
    .into_bytes()
}

fn populated_store(dir: &std::path::Path, interval_tree: bool) -> Store {
    let mut config = Config::new(dir).primary_key("id").secondary_key("age");
    if interval_tree {
        config = config.interval_tree_file_name("interval.str");
    }
    let store = Store::open(config).unwrap();
    for i in 0..RECORDS {
        store.put(&record(i)).unwrap();
    }
    store.flush().unwrap();
    store
}

fn bench_sget(c: &mut Criterion) {
    let mut group = c.benchmark_group("sget");
    for (name, interval_tree) in [("interval-block", false), ("interval-tree", true)] {
        let dir = tempfile::tempdir().unwrap();
        let store = populated_store(dir.path(), interval_tree);
        group.bench_function(BenchmarkId::new(name, "age=30/top100"), |b| {
            b.iter(|| {
                let hits = store.sget("30", 100).unwrap();
                assert!(!hits.is_empty());
            })
        });
    }
    group.finish();
}

fn bench_srange(c: &mut Criterion) {
    let mut group = c.benchmark_group("srange");
    for (name, interval_tree) in [("interval-block", false), ("interval-tree", true)] {
        let dir = tempfile::tempdir().unwrap();
        let store = populated_store(dir.path(), interval_tree);
        group.bench_function(BenchmarkId::new(name, "age=30..35/top100"), |b| {
            b.iter(|| {
                let hits = store.srange("30", "35", 100).unwrap();
                assert!(!hits.is_empty());
            })
        });
    }
    group.finish();
}

/// The baseline `sget` is up against: visit every live record through the
/// primary read path, parse the payload, and filter on the secondary
/// attribute by hand. No secondary structure is consulted.
fn bench_full_scan(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = populated_store(dir.path(), false);
    c.bench_function("full_scan/age=30", |b| {
        b.iter(|| {
            let mut found = 0u64;
            for id in 0..RECORDS {
                let Ok(payload) = store.get(&id.to_string()) else {
                    continue;
                };
                let Ok(doc) = serde_json::from_slice::<serde_json::Value>(&payload) else {
                    continue;
                };
                if doc.get("age").and_then(|age| age.as_i64()) == Some(30) {
                    found += 1;
                }
            }
            assert!(found > 0);
        })
    });
}

fn bench_insert(c: &mut Criterion) {
    c.bench_function("put/indexed", |b| {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path()).primary_key("id").secondary_key("age");
        let store = Store::open(config).unwrap();
        let mut id = 0u64;
        b.iter(|| {
            store.put(&record(id)).unwrap();
            id += 1;
        })
    });
}

criterion_group!(benches, bench_sget, bench_srange, bench_full_scan, bench_insert);
criterion_main!(benches);
