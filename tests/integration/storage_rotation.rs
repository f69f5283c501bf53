#![allow(missing_docs)]

use std::sync::Arc;

use serde_json::json;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use spectre::config::StorageConfig;
use spectre::model::{Event, EventKind, ResourceRef, TimeRange, NANOS_PER_SECOND};
use spectre::storage::file::hour_epoch_for;
use spectre::storage::{EventQuery, EventStore, FileReader, QueryExecutor, QueryFilters};

fn event(id: &str, ts: i64, name: &str) -> Event {
    Event {
        id: id.to_string(),
        timestamp: ts,
        kind: EventKind::Create,
        resource: ResourceRef {
            group: String::new(),
            version: "v1".into(),
            kind: "Pod".into(),
            namespace: "prod".into(),
            name: name.into(),
            uid: format!("uid-{name}"),
        },
        payload: json!({"metadata": {"name": name, "namespace": "prod"}}),
        raw_size: 64,
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

/// Scenario: fill hour H, roll into H+1, crash without finalizing,
/// restart, and query across the boundary. Everything written must come
/// back, and the H+1 file must carry H's final states.
#[test]
fn rotation_crash_and_restart_preserve_every_event() {
    let dir = tempdir().unwrap();
    // Target size 1: every event seals its own block, so the simulated
    // crash can only lose the footer, never data.
    let store = store_in(dir.path(), 1);
    let offset = store.tz_offset();
    let hour0 = hour_epoch_for(1_700_000_000 * NANOS_PER_SECOND, offset);
    let h0 = hour0 * NANOS_PER_SECOND;
    let h1 = (hour0 + 3600) * NANOS_PER_SECOND;

    for i in 0..1_000 {
        store
            .write_event(event(
                &format!("h0-{i}"),
                h0 + i64::from(i) * 1_000_000,
                &format!("pod-{i}"),
            ))
            .unwrap();
    }
    // First write of the new hour triggers rotation.
    for i in 0..100 {
        store
            .write_event(event(
                &format!("h1-{i}"),
                h1 + i64::from(i) * 1_000_000,
                &format!("pod-{i}"),
            ))
            .unwrap();
    }

    // Simulate a crash: the open H+1 file never gets its footer.
    std::mem::forget(store);

    let store = store_in(dir.path(), 1);
    // Appending after restart restores the open hour from disk.
    store
        .write_event(event("h1-extra", h1 + 200 * 1_000_000, "pod-extra"))
        .unwrap();
    store.finalize_open().unwrap();

    let executor = QueryExecutor::new(Arc::clone(&store));
    let outcome = executor
        .query(
            &CancellationToken::new(),
            &EventQuery {
                range: TimeRange::new(h0, h1 + 3600 * NANOS_PER_SECOND).unwrap(),
                filters: QueryFilters::default(),
                limit: None,
                descending: false,
            },
        )
        .unwrap();
    assert_eq!(outcome.events.len(), 1_101);

    // The H+1 file carries over every resource H touched.
    let files = store.list_files().unwrap();
    assert_eq!(files.len(), 2);
    let h1_reader = FileReader::open(&files[1].1).unwrap();
    assert!(h1_reader.index.final_states.len() >= 1_000);
    assert!(h1_reader
        .index
        .final_states
        .contains_key("prod/Pod/pod-999"));
}

/// The rotated H file must be sealed (footer in place) before the new
/// hour accepts writes.
#[test]
fn rotation_seals_the_previous_file() {
    let dir = tempdir().unwrap();
    let store = store_in(dir.path(), 4096);
    let offset = store.tz_offset();
    let hour0 = hour_epoch_for(1_700_000_000 * NANOS_PER_SECOND, offset);
    let h0 = hour0 * NANOS_PER_SECOND;
    let h1 = (hour0 + 3600) * NANOS_PER_SECOND;

    store.write_event(event("a", h0, "pod-a")).unwrap();
    store.write_event(event("b", h1, "pod-b")).unwrap();

    let files = store.list_files().unwrap();
    let h0_reader = FileReader::open(&files[0].1).unwrap();
    assert!(!h0_reader.index_less, "rotated file must have its footer");
    assert_eq!(h0_reader.index.final_states.len(), 1);
}

/// Restart mid-hour with an unsealed (footer-less) file: the writer
/// re-reads complete blocks, truncates the tail, and keeps appending.
#[test]
fn mid_hour_restart_recovers_sealed_blocks() {
    let dir = tempdir().unwrap();
    let hour0;
    {
        let store = store_in(dir.path(), 4096);
        hour0 = hour_epoch_for(1_700_000_000 * NANOS_PER_SECOND, store.tz_offset());
        let h0 = hour0 * NANOS_PER_SECOND;
        for i in 0..200 {
            store
                .write_event(event(&format!("e{i}"), h0 + i64::from(i), &format!("p{i}")))
                .unwrap();
        }
        std::mem::forget(store);
    }

    let store = store_in(dir.path(), 4096);
    let h0 = hour0 * NANOS_PER_SECOND;
    store.write_event(event("late", h0 + 10_000, "late-pod")).unwrap();
    store.finalize_open().unwrap();

    let executor = QueryExecutor::new(store);
    let outcome = executor
        .query(
            &CancellationToken::new(),
            &EventQuery {
                range: TimeRange::new(h0, h0 + 3600 * NANOS_PER_SECOND).unwrap(),
                filters: QueryFilters::default(),
                limit: None,
                descending: false,
            },
        )
        .unwrap();
    // Sealed blocks survive; only the unsealed in-memory tail is lost.
    assert!(outcome.events.iter().any(|e| e.id == "late"));
    assert!(outcome.events.len() > 100);
}
