//! End-to-end secondary index behavior, exercised in both layouts:
//! interval tree mode and interval-block mode.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use jotdb::{Config, Error, QueryOptions, Store};

fn record(id: u64, age: u64) -> Vec<u8> {
    format!(r#"{{"id":{id},"age":{age}}}"#).into_bytes()
}

fn open_store(dir: &std::path::Path, interval_tree: bool) -> Store {
    let mut config = Config::new(dir)
        .primary_key("id")
        .secondary_key("age")
        .block_size(256);
    if interval_tree {
        config = config.interval_tree_file_name("interval.str");
    }
    Store::open(config).unwrap()
}

/// Runs a scenario against both modes, in memory and again after a flush.
fn in_both_modes(test: impl Fn(&Store)) {
    for interval_tree in [false, true] {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), interval_tree);
        test(&store);
    }
}

#[test]
fn test_point_lookup_top_k_ordering() {
    in_both_modes(|store| {
        for i in 0..50u64 {
            store.put(&record(i, i % 10)).unwrap();
        }

        // Newest three records with age 5, in descending sequence order.
        let expect = [b"45".to_vec(), b"35".to_vec(), b"25".to_vec()];
        let hits = store.sget("5", 3).unwrap();
        let keys: Vec<_> = hits.iter().map(|h| h.primary_key.clone()).collect();
        assert_eq!(keys, expect);

        // The same records survive a flush to disk.
        store.flush().unwrap();
        let hits = store.sget("5", 3).unwrap();
        let keys: Vec<_> = hits.iter().map(|h| h.primary_key.clone()).collect();
        assert_eq!(keys, expect);
    });
}

#[test]
fn test_range_lookup_inclusive_bounds() {
    in_both_modes(|store| {
        for i in 0..50u64 {
            store.put(&record(i, i % 10)).unwrap();
        }
        store.flush().unwrap();

        let hits = store.srange("3", "5", 100).unwrap();
        assert_eq!(hits.len(), 15);

        // Strictly descending sequence numbers.
        let sequences: Vec<u64> = hits.iter().map(|h| h.sequence()).collect();
        assert!(sequences.windows(2).all(|w| w[0] > w[1]));

        // Exactly the records with age in {3, 4, 5}.
        for hit in &hits {
            let id: u64 = String::from_utf8_lossy(&hit.primary_key).parse().unwrap();
            assert!((3..=5).contains(&(id % 10)), "id {id} out of range");
        }
    });
}

#[test]
fn test_overwrite_hides_stale_secondary_value() {
    in_both_modes(|store| {
        store
            .put(br#"{"id":7, "age":"red"}"#)
            .unwrap();
        store
            .put(br#"{"id":7, "age":"blue"}"#)
            .unwrap();

        assert!(store.sget("red", 5).unwrap().is_empty());
        let hits = store.sget("blue", 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].sequence(), 2);

        // Both versions now live in one SSTable; re-extraction still hides
        // the stale one.
        store.flush().unwrap();
        assert!(store.sget("red", 5).unwrap().is_empty());
        assert_eq!(store.sget("blue", 5).unwrap().len(), 1);
    });
}

#[test]
fn test_flushed_and_fresh_copies_dedup() {
    in_both_modes(|store| {
        for i in 0..20u64 {
            store.put(&record(i, i % 10)).unwrap();
        }
        store.flush().unwrap();

        // Overwrite every id, shifting each record's age by one.
        for i in 0..20u64 {
            store.put(&record(i, (i + 1) % 10)).unwrap();
        }

        // Fresh matches for age 5 are the ids where (i + 1) % 10 == 5; the
        // table copies with age 5 (ids 5 and 15) are stale and must not
        // surface.
        let hits = store.sget("5", 100).unwrap();
        let mut keys: Vec<_> = hits.iter().map(|h| h.primary_key.clone()).collect();
        keys.sort();
        assert_eq!(keys, vec![b"14".to_vec(), b"4".to_vec()]);
        assert!(hits.iter().all(|h| h.sequence() > 20));
    });
}

#[test]
fn test_deletion_hides_record_across_sources() {
    in_both_modes(|store| {
        for i in 0..10u64 {
            store.put(&record(i, 5)).unwrap();
        }
        store.flush().unwrap();
        store.delete("3").unwrap();

        let hits = store.sget("5", 100).unwrap();
        assert_eq!(hits.len(), 9);
        assert!(hits.iter().all(|h| h.primary_key != b"3"));

        // Same once the tombstone itself is flushed.
        store.flush().unwrap();
        let hits = store.sget("5", 100).unwrap();
        assert_eq!(hits.len(), 9);
        assert!(hits.iter().all(|h| h.primary_key != b"3"));
    });
}

#[test]
fn test_duplicate_values_yield_newer_only() {
    in_both_modes(|store| {
        store.put(&record(7, 5)).unwrap();
        store.flush().unwrap();
        store.put(&record(7, 5)).unwrap();

        let hits = store.sget("5", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].sequence(), 2);
    });
}

#[test]
fn test_secondary_disabled_rejects_queries() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::new(dir.path()).primary_key("id");
    let store = Store::open(config).unwrap();

    store.put(&record(1, 5)).unwrap();
    assert!(matches!(store.sget("5", 3), Err(Error::InvalidArgument(_))));
    assert!(matches!(
        store.srange("3", "5", 3),
        Err(Error::InvalidArgument(_))
    ));
    // The primary path is unaffected.
    assert_eq!(store.get("1").unwrap(), record(1, 5));
    assert!(matches!(store.get("no-such-id"), Err(Error::NotFound)));
}

#[test]
fn test_invalid_bounds_rejected() {
    in_both_modes(|store| {
        assert!(matches!(
            store.srange("9", "3", 10),
            Err(Error::InvalidArgument(_))
        ));
    });
}

#[test]
fn test_primary_key_derivation_failure() {
    in_both_modes(|store| {
        assert!(matches!(
            store.put(br#"{"name":"no id here"}"#),
            Err(Error::InvalidArgument(_))
        ));
        // A record without the secondary attribute is stored primary-only.
        store.put(br#"{"id":42}"#).unwrap();
        assert!(store.get("42").is_ok());
        assert!(store.sget("42", 5).unwrap().is_empty());
    });
}

#[test]
fn test_reopen_rebuilds_after_checkpoint_loss() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = dir.path().join("interval.str");

    let expect_keys = {
        let store = {
            let config = Config::new(dir.path())
                .primary_key("id")
                .secondary_key("age")
                .block_size(256)
                .interval_tree_file_name("interval.str")
                .sync_threshold(2);
            Store::open(config).unwrap()
        };
        for i in 0..50u64 {
            store.put(&record(i, i % 10)).unwrap();
        }
        store.flush().unwrap();
        assert!(checkpoint.exists());

        let hits = store.sget("5", 3).unwrap();
        hits.iter().map(|h| h.primary_key.clone()).collect::<Vec<_>>()
    };

    // Losing the checkpoint costs a rebuild at open, not wrong answers.
    std::fs::remove_file(&checkpoint).unwrap();
    let config = Config::new(dir.path())
        .primary_key("id")
        .secondary_key("age")
        .block_size(256)
        .interval_tree_file_name("interval.str")
        .sync_threshold(2);
    let store = Store::open(config).unwrap();
    assert!(!store.interval_tree().unwrap().is_empty());

    let hits = store.sget("5", 3).unwrap();
    let keys: Vec<_> = hits.iter().map(|h| h.primary_key.clone()).collect();
    assert_eq!(keys, expect_keys);
}

#[test]
fn test_mutation_interrupts_live_iterator() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), true);
    for i in 0..50u64 {
        store.put(&record(i, i % 10)).unwrap();
    }
    store.flush().unwrap();

    let itree = Arc::clone(store.interval_tree().unwrap());
    let mut iter = itree.top_k_iter("0", "9").unwrap();
    assert!(iter.next().unwrap().is_some());

    // While the iterator is live, a query cannot claim it: retry signal.
    assert!(matches!(store.sget("5", 3), Err(Error::QueryInterrupted)));

    // A flush inserts new intervals, cancelling the iterator.
    for i in 50..60u64 {
        store.put(&record(i, 5)).unwrap();
    }
    store.flush().unwrap();
    assert!(matches!(iter.next(), Err(Error::QueryInterrupted)));
    drop(iter);

    // The retry succeeds and sees the new records.
    let hits = store.sget("5", 3).unwrap();
    let keys: Vec<_> = hits.iter().map(|h| h.primary_key.clone()).collect();
    assert_eq!(keys, vec![b"59".to_vec(), b"58".to_vec(), b"57".to_vec()]);
}

#[test]
fn test_concurrent_queries_and_writes() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(open_store(dir.path(), true));
    for i in 0..100u64 {
        store.put(&record(i, i % 10)).unwrap();
    }
    store.flush().unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let reader = {
        let store = Arc::clone(&store);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            let mut completed = 0u32;
            let mut interrupted = 0u32;
            while !stop.load(Ordering::Relaxed) {
                match store.sget("5", 5) {
                    Ok(hits) => {
                        assert!(!hits.is_empty());
                        let sequences: Vec<u64> = hits.iter().map(|h| h.sequence()).collect();
                        assert!(sequences.windows(2).all(|w| w[0] > w[1]));
                        completed += 1;
                    }
                    // A concurrent flush mutated the tree mid-query.
                    Err(Error::QueryInterrupted) => interrupted += 1,
                    Err(e) => panic!("unexpected query error: {e}"),
                }
            }
            (completed, interrupted)
        })
    };

    for batch in 0..10u64 {
        for i in 0..20u64 {
            let id = 1000 + batch * 20 + i;
            store.put(&record(id, i % 10)).unwrap();
        }
        store.flush().unwrap();
    }
    // A quiet window so the reader gets uncontended queries in before the
    // shutdown flag.
    std::thread::sleep(std::time::Duration::from_millis(100));
    stop.store(true, Ordering::Relaxed);
    let (completed, _interrupted) = reader.join().unwrap();
    assert!(completed > 0, "no query ever completed");

    // After the dust settles a query sees the final state.
    let hits = store.sget("5", 3).unwrap();
    assert!(hits.iter().all(|h| h.sequence() > 100));
}

#[test]
fn test_cancellation_observed() {
    in_both_modes(|store| {
        for i in 0..20u64 {
            store.put(&record(i, i % 10)).unwrap();
        }
        let cancel = Arc::new(AtomicBool::new(true));
        let opts = QueryOptions {
            snapshot: None,
            cancel: Some(cancel),
        };
        assert!(matches!(
            store.sget_opt("5", 3, &opts),
            Err(Error::Cancelled)
        ));
    });
}

#[test]
fn test_snapshot_bounds_visibility() {
    in_both_modes(|store| {
        for i in 0..10u64 {
            store.put(&record(i, 5)).unwrap();
        }
        let snapshot = store.last_sequence();
        for i in 10..20u64 {
            store.put(&record(i, 5)).unwrap();
        }

        let opts = QueryOptions {
            snapshot: Some(snapshot),
            cancel: None,
        };
        let hits = store.sget_opt("5", 100, &opts).unwrap();
        assert_eq!(hits.len(), 10);
        assert!(hits.iter().all(|h| h.sequence() <= snapshot));
    });
}

#[test]
fn test_remove_table_drops_intervals() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), true);
    for i in 0..30u64 {
        store.put(&record(i, i % 10)).unwrap();
    }
    store.flush().unwrap();

    let itree = Arc::clone(store.interval_tree().unwrap());
    assert!(itree.contains_prefix("1"));
    assert!(store.remove_table(1).unwrap());
    assert!(!itree.contains_prefix("1"));
    assert!(!store.remove_table(1).unwrap());

    // The table's records are gone from query results.
    assert!(store.sget("5", 10).unwrap().is_empty());
}

#[test]
fn test_many_buffers_and_tables() {
    in_both_modes(|store| {
        // Three generations of the same key space across three tables plus
        // the live buffer.
        for generation in 0..4u64 {
            for i in 0..15u64 {
                store.put(&record(i, (i + generation) % 10)).unwrap();
            }
            if generation < 3 {
                store.flush().unwrap();
            }
        }
        assert_eq!(store.num_tables(), 3);

        // Every id surfaces exactly once, with its newest age.
        let mut seen = std::collections::HashSet::new();
        for age in 0..10u64 {
            for hit in store.sget(&age.to_string(), 100).unwrap() {
                let id: u64 = String::from_utf8_lossy(&hit.primary_key).parse().unwrap();
                assert_eq!((id + 3) % 10, age, "id {id} surfaced with stale age");
                assert!(seen.insert(id), "id {id} surfaced twice");
            }
        }
        assert_eq!(seen.len(), 15);
    });
}
