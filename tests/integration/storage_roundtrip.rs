#![allow(missing_docs)]

use std::sync::Arc;

use serde_json::json;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use spectre::config::StorageConfig;
use spectre::model::{Event, EventKind, ResourceRef, TimeRange, NANOS_PER_SECOND};
use spectre::storage::{EventQuery, EventStore, FileReader, QueryExecutor, QueryFilters};

const BASE: i64 = 1_700_000_000 * NANOS_PER_SECOND;

fn event(id: u32, ts: i64, kind: &str, ns: &str) -> Event {
    Event {
        id: format!("e{id}"),
        timestamp: ts,
        kind: EventKind::Create,
        resource: ResourceRef {
            group: if kind == "Deployment" { "apps".into() } else { String::new() },
            version: "v1".into(),
            kind: kind.into(),
            namespace: ns.into(),
            name: format!("res-{id}"),
            uid: format!("uid-{id}"),
        },
        payload: json!({"metadata": {"name": format!("res-{id}"), "namespace": ns}}),
        raw_size: 128,
        involved_uid: None,
    }
}

fn store_in(dir: &std::path::Path, block_target: usize) -> Arc<EventStore> {
    let config = StorageConfig {
        data_dir: dir.to_path_buf(),
        block_target_size: block_target,
        ..StorageConfig::default()
    };
    Arc::new(EventStore::open(config).unwrap())
}

#[test]
fn file_round_trip_returns_every_event_in_order() {
    let dir = tempdir().unwrap();
    let store = store_in(dir.path(), 2048);
    for i in 0..500 {
        store
            .write_event(event(i, BASE + i64::from(i) * 1_000_000, "Pod", "prod"))
            .unwrap();
    }
    store.finalize_open().unwrap();

    let executor = QueryExecutor::new(store);
    let cancel = CancellationToken::new();
    let outcome = executor
        .query(
            &cancel,
            &EventQuery {
                range: TimeRange::new(BASE, BASE + 3600 * NANOS_PER_SECOND).unwrap(),
                filters: QueryFilters::default(),
                limit: None,
                descending: false,
            },
        )
        .unwrap();
    assert_eq!(outcome.events.len(), 500);
    for (i, e) in outcome.events.iter().enumerate() {
        assert_eq!(e.id, format!("e{i}"));
    }
    assert!(outcome
        .events
        .windows(2)
        .all(|w| w[0].timestamp <= w[1].timestamp));
    assert!(outcome.stats.warnings.is_empty());
}

#[test]
fn equal_timestamps_keep_insertion_order() {
    let dir = tempdir().unwrap();
    let store = store_in(dir.path(), 512);
    for i in 0..50 {
        // Every event shares one timestamp.
        store.write_event(event(i, BASE, "Pod", "prod")).unwrap();
    }
    store.finalize_open().unwrap();
    let executor = QueryExecutor::new(store);
    let outcome = executor
        .query(
            &CancellationToken::new(),
            &EventQuery {
                range: TimeRange::new(BASE, BASE + 1).unwrap(),
                filters: QueryFilters::default(),
                limit: None,
                descending: false,
            },
        )
        .unwrap();
    let ids: Vec<&str> = outcome.events.iter().map(|e| e.id.as_str()).collect();
    let expected: Vec<String> = (0..50).map(|i| format!("e{i}")).collect();
    assert_eq!(ids, expected.iter().map(String::as_str).collect::<Vec<_>>());
}

#[test]
fn import_produces_files_identical_to_live_capture() {
    let dir = tempdir().unwrap();
    let store = store_in(dir.path(), 1024);
    let mut events: Vec<Event> = (0..100)
        .map(|i| event(i, BASE + i64::from(i) * 1_000, "Service", "dev"))
        .collect();
    // Import tolerates unsorted input.
    events.reverse();
    assert_eq!(store.import(events).unwrap(), 100);

    let files = store.list_files().unwrap();
    assert_eq!(files.len(), 1);
    let reader = FileReader::open(&files[0].1).unwrap();
    assert!(!reader.index_less);
    let total: u32 = reader.index.blocks.iter().map(|b| b.event_count).sum();
    assert_eq!(total, 100);
}

#[test]
fn corrupt_block_is_skipped_with_a_warning() {
    let dir = tempdir().unwrap();
    let store = store_in(dir.path(), 512);
    for i in 0..100 {
        store
            .write_event(event(i, BASE + i64::from(i) * 1_000, "Pod", "prod"))
            .unwrap();
    }
    store.finalize_open().unwrap();
    let path = store.list_files().unwrap()[0].1.clone();

    // Smash the middle of the first block's compressed payload.
    let reader = FileReader::open(&path).unwrap();
    assert!(reader.index.blocks.len() >= 2, "need several blocks");
    let first = &reader.index.blocks[0];
    let victim = first.offset + 32 + u64::from(first.compressed_len) / 2;
    let mut bytes = std::fs::read(&path).unwrap();
    for b in &mut bytes[victim as usize..victim as usize + 8] {
        *b ^= 0xff;
    }
    std::fs::write(&path, &bytes).unwrap();

    let executor = QueryExecutor::new(store);
    let outcome = executor
        .query(
            &CancellationToken::new(),
            &EventQuery {
                range: TimeRange::new(BASE, BASE + 3600 * NANOS_PER_SECOND).unwrap(),
                filters: QueryFilters::default(),
                limit: None,
                descending: false,
            },
        )
        .unwrap();
    assert!(outcome.stats.blocks_skipped >= 1);
    assert!(!outcome.stats.warnings.is_empty());
    assert!(outcome.events.len() < 100);
    assert!(!outcome.events.is_empty());
}
