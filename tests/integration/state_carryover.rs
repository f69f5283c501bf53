#![allow(missing_docs)]

use std::sync::Arc;

use serde_json::json;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use spectre::config::StorageConfig;
use spectre::model::{Event, EventKind, ResourceRef, NANOS_PER_SECOND};
use spectre::storage::file::hour_epoch_for;
use spectre::storage::{EventStore, QueryExecutor, QueryFilters};

fn event(id: &str, ts: i64, kind: &str, name: &str, event_kind: EventKind) -> Event {
    Event {
        id: id.to_string(),
        timestamp: ts,
        kind: event_kind,
        resource: ResourceRef {
            group: String::new(),
            version: "v1".into(),
            kind: kind.into(),
            namespace: "prod".into(),
            name: name.into(),
            uid: format!("uid-{name}"),
        },
        payload: if event_kind == EventKind::Delete {
            serde_json::Value::Null
        } else {
            json!({"metadata": {"name": name, "namespace": "prod"}, "status": {"phase": "Running"}})
        },
        raw_size: 64,
        involved_uid: None,
    }
}

fn store_in(dir: &std::path::Path) -> Arc<EventStore> {
    let config = StorageConfig {
        data_dir: dir.to_path_buf(),
        block_target_size: 1024,
        ..StorageConfig::default()
    };
    Arc::new(EventStore::open(config).unwrap())
}

/// A resource created in hour H and untouched in H+1 must appear in a
/// point-in-time query inside H+1, served from the carried-over
/// final-state map.
#[test]
fn untouched_resource_survives_into_the_next_hour() {
    let dir = tempdir().unwrap();
    let store = store_in(dir.path());
    let hour0 = hour_epoch_for(1_700_000_000 * NANOS_PER_SECOND, store.tz_offset());
    let h0 = hour0 * NANOS_PER_SECOND;
    let h1 = (hour0 + 3600) * NANOS_PER_SECOND;

    store
        .write_event(event("e1", h0 + 60 * NANOS_PER_SECOND, "Pod", "stable", EventKind::Create))
        .unwrap();
    // Unrelated traffic in H+1 forces the rotation.
    store
        .write_event(event("e2", h1 + 60 * NANOS_PER_SECOND, "Pod", "other", EventKind::Create))
        .unwrap();

    let executor = QueryExecutor::new(Arc::clone(&store));
    let at = h1 + 10 * 60 * NANOS_PER_SECOND;
    let snapshot = executor
        .snapshot_at(&CancellationToken::new(), at, &QueryFilters::default())
        .unwrap();
    let stable = snapshot
        .resources
        .get("prod/Pod/stable")
        .expect("carried-over resource visible mid-window");
    assert_eq!(stable.uid, "uid-stable");
    assert_eq!(stable.event_kind, EventKind::Create);
    assert!(snapshot.resources.contains_key("prod/Pod/other"));
}

/// Deletions recorded in H remove the resource from point-in-time views
/// in H+1.
#[test]
fn deleted_resource_is_absent_after_rotation() {
    let dir = tempdir().unwrap();
    let store = store_in(dir.path());
    let hour0 = hour_epoch_for(1_700_000_000 * NANOS_PER_SECOND, store.tz_offset());
    let h0 = hour0 * NANOS_PER_SECOND;
    let h1 = (hour0 + 3600) * NANOS_PER_SECOND;

    store
        .write_event(event("e1", h0 + 10, "ConfigMap", "doomed", EventKind::Create))
        .unwrap();
    store
        .write_event(event("e2", h0 + 20, "ConfigMap", "doomed", EventKind::Delete))
        .unwrap();
    store
        .write_event(event("e3", h1 + 10, "Pod", "other", EventKind::Create))
        .unwrap();

    let executor = QueryExecutor::new(store);
    let snapshot = executor
        .snapshot_at(
            &CancellationToken::new(),
            h1 + 60 * NANOS_PER_SECOND,
            &QueryFilters::default(),
        )
        .unwrap();
    assert!(!snapshot.resources.contains_key("prod/ConfigMap/doomed"));
    assert!(snapshot.resources.contains_key("prod/Pod/other"));
}

/// A snapshot taken inside the open hour overlays its own events on top
/// of the seed and honors the instant: later events stay invisible.
#[test]
fn snapshot_respects_the_instant() {
    let dir = tempdir().unwrap();
    let store = store_in(dir.path());
    let hour0 = hour_epoch_for(1_700_000_000 * NANOS_PER_SECOND, store.tz_offset());
    let h0 = hour0 * NANOS_PER_SECOND;

    store
        .write_event(event("e1", h0 + 10, "Pod", "early", EventKind::Create))
        .unwrap();
    store
        .write_event(event("e2", h0 + 1_000, "Pod", "late", EventKind::Create))
        .unwrap();

    let executor = QueryExecutor::new(store);
    let snapshot = executor
        .snapshot_at(&CancellationToken::new(), h0 + 500, &QueryFilters::default())
        .unwrap();
    assert!(snapshot.resources.contains_key("prod/Pod/early"));
    assert!(!snapshot.resources.contains_key("prod/Pod/late"));
}
