#![allow(missing_docs)]

use std::sync::Arc;

use serde_json::json;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use spectre::config::StorageConfig;
use spectre::model::{Event, EventKind, ResourceRef, TimeRange, NANOS_PER_SECOND};
use spectre::storage::{EventQuery, EventStore, FileReader, QueryExecutor, QueryFilters};

const BASE: i64 = 1_700_000_000 * NANOS_PER_SECOND;

fn event(id: u32, ts: i64, kind: &str, ns: &str, group: &str) -> Event {
    Event {
        id: format!("e{id}"),
        timestamp: ts,
        kind: EventKind::Create,
        resource: ResourceRef {
            group: group.into(),
            version: "v1".into(),
            kind: kind.into(),
            namespace: ns.into(),
            name: format!("res-{id}"),
            uid: format!("uid-{id}"),
        },
        payload: json!({"metadata": {"name": format!("res-{id}")}}),
        raw_size: 64,
        involved_uid: None,
    }
}

/// The inverted index contains a block id for a value exactly when the
/// block's value set contains that value, and the Bloom filters never
/// produce a false negative.
#[test]
fn inverted_index_matches_value_sets_exactly() {
    let dir = tempdir().unwrap();
    let config = StorageConfig {
        data_dir: dir.path().to_path_buf(),
        block_target_size: 1024,
        ..StorageConfig::default()
    };
    let store = Arc::new(EventStore::open(config).unwrap());
    let kinds = ["Pod", "Service", "Deployment", "ConfigMap"];
    let namespaces = ["prod", "dev", "staging"];
    let groups = ["", "apps", "batch"];
    for i in 0..400u32 {
        store
            .write_event(event(
                i,
                BASE + i64::from(i) * 1_000,
                kinds[(i % 4) as usize],
                namespaces[(i % 3) as usize],
                groups[(i % 3) as usize],
            ))
            .unwrap();
    }
    store.finalize_open().unwrap();

    let path = store.list_files().unwrap()[0].1.clone();
    let reader = FileReader::open(&path).unwrap();
    let index = &reader.index;
    assert!(index.blocks.len() > 3, "want several blocks");

    for block in &index.blocks {
        // Soundness and completeness of the inverted indexes.
        for (values, inverted) in [
            (&block.kinds, &index.kind_to_blocks),
            (&block.namespaces, &index.namespace_to_blocks),
            (&block.groups, &index.group_to_blocks),
        ] {
            for (value, ids) in inverted {
                let listed = ids.contains(&block.id);
                assert_eq!(
                    listed,
                    values.contains(value),
                    "block {} / value {value:?}",
                    block.id
                );
            }
            for value in values.iter() {
                assert!(inverted.get(value).is_some_and(|ids| ids.contains(&block.id)));
            }
        }
        // No Bloom false negatives.
        for kind in &block.kinds {
            assert!(block.may_match(Some(kind), None, None));
        }
        for ns in &block.namespaces {
            assert!(block.may_match(None, Some(ns), None));
        }
        for group in &block.groups {
            assert!(block.may_match(None, None, Some(group)));
        }
    }
}

/// Scaled-down version of the Bloom false-positive bound: a file where
/// every block holds exactly one unique kind, queried for an absent
/// kind, must return nothing while decompressing only a small fraction
/// of the blocks.
#[test]
fn absent_kind_query_decompresses_few_blocks() {
    let dir = tempdir().unwrap();
    let config = StorageConfig {
        data_dir: dir.path().to_path_buf(),
        // Seal after every event: one block per kind.
        block_target_size: 1,
        ..StorageConfig::default()
    };
    let store = Arc::new(EventStore::open(config).unwrap());
    let blocks = 300u32;
    for i in 0..blocks {
        store
            .write_event(event(
                i,
                BASE + i64::from(i) * 1_000,
                &format!("Kind{i}"),
                "prod",
                "",
            ))
            .unwrap();
    }
    store.finalize_open().unwrap();

    let executor = QueryExecutor::new(store);
    let outcome = executor
        .query(
            &CancellationToken::new(),
            &EventQuery {
                range: TimeRange::new(BASE, BASE + 3600 * NANOS_PER_SECOND).unwrap(),
                filters: QueryFilters {
                    kind: Some("NoSuchKind".into()),
                    ..QueryFilters::default()
                },
                limit: None,
                descending: false,
            },
        )
        .unwrap();
    assert!(outcome.events.is_empty());
    // The inverted index alone removes every block (the kind is in no
    // value set), so nothing should be decompressed at all.
    assert_eq!(outcome.stats.blocks_scanned, 0);
}

/// Combined Bloom false-positive bound: 300 blocks, one unique kind
/// each, probed with an absent kind. The combined three-filter rate is
/// bounded by 1-(1-p)^3 ≈ 14.3% at p=5%, so at most ⌈0.143·300⌉ = 43
/// blocks may pass the filters.
#[test]
fn bloom_false_positive_rate_is_bounded() {
    use spectre::storage::BlockBuilder;
    let mut metas = Vec::new();
    for i in 0..300u32 {
        let mut builder = BlockBuilder::new();
        for j in 0..8u32 {
            builder
                .push(event(
                    i * 10 + j,
                    BASE + i64::from(i),
                    &format!("Kind{i}"),
                    "prod",
                    "",
                ))
                .unwrap();
        }
        let (sealed, _) = builder.seal(i, 0).unwrap();
        metas.push(sealed.meta);
    }
    let passed = metas
        .iter()
        .filter(|meta| meta.may_match(Some("NoSuchKind"), Some("prod"), None))
        .count();
    assert!(passed <= 43, "{passed} of 300 blocks passed the filters");
    // And never a false negative for the value each block holds.
    for (i, meta) in metas.iter().enumerate() {
        assert!(meta.may_match(Some(&format!("Kind{i}")), Some("prod"), None));
    }
}

/// A file whose footer is lost is still fully queryable through the
/// forward scan, with the degradation surfaced in the stats.
#[test]
fn footer_loss_degrades_to_scan_without_losing_events() {
    let dir = tempdir().unwrap();
    let config = StorageConfig {
        data_dir: dir.path().to_path_buf(),
        block_target_size: 1024,
        ..StorageConfig::default()
    };
    let store = Arc::new(EventStore::open(config).unwrap());
    for i in 0..120u32 {
        store
            .write_event(event(i, BASE + i64::from(i) * 1_000, "Pod", "prod", ""))
            .unwrap();
    }
    store.finalize_open().unwrap();

    let path = store.list_files().unwrap()[0].1.clone();
    let len = std::fs::metadata(&path).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len - 7).unwrap();

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
    assert_eq!(outcome.stats.index_less_files, 1);
    assert!(!outcome.stats.warnings.is_empty());
    assert_eq!(outcome.events.len(), 120);
}
