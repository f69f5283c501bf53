#![allow(missing_docs)]

use tempfile::tempdir;

use spectre::config::TemplateConfig;
use spectre::logs::{template_id, TemplateStore};

fn config_in(dir: &std::path::Path) -> TemplateConfig {
    TemplateConfig {
        snapshot_path: dir.join("templates.json"),
        ..TemplateConfig::default()
    }
}

/// A mixed stream of plain and JSON lines clusters per namespace, masks
/// variables in the rendered patterns, and survives a snapshot restart.
#[test]
fn clustering_masking_and_persistence() {
    let dir = tempdir().unwrap();
    let config = config_in(dir.path());
    {
        let store = TemplateStore::new(config.clone());
        for i in 0..50 {
            store.ingest(
                "prod",
                &format!("GET /api/users/{i} returned status=200 in {} ms", i * 3),
                i,
            );
            store.ingest(
                "prod",
                &format!(r#"{{"msg": "cache miss for key user-{i}"}}"#),
                i,
            );
            store.ingest("dev", &format!("worker {i} finished"), i);
        }
        assert_eq!(store.search(Some("prod"), None).len(), 2);
        assert_eq!(store.search(Some("dev"), None).len(), 1);

        // Masking runs on the rendered pattern: the status code stays,
        // the latency does not.
        let api = store
            .search(Some("prod"), Some("status=200"))
            .into_iter()
            .next()
            .expect("api template");
        assert!(api.pattern.contains("status=200"));
        assert!(!api.pattern.contains(" 42 "));
        assert_eq!(api.count, 50);

        store.persist().unwrap();
    }

    let restored = TemplateStore::open(config);
    assert_eq!(restored.template_count(), 3);
    let api = restored
        .search(Some("prod"), Some("status=200"))
        .into_iter()
        .next()
        .expect("restored api template");
    assert_eq!(api.count, 50);
}

/// Template ids are stable hashes of `(namespace, pattern)`.
#[test]
fn ids_are_content_derived() {
    assert_eq!(
        template_id("prod", "connection to <*> refused"),
        template_id("prod", "connection to <*> refused"),
    );
    assert_ne!(
        template_id("prod", "connection to <*> refused"),
        template_id("dev", "connection to <*> refused"),
    );
}

/// The rebalancer prunes below the count threshold and merges highly
/// similar patterns, combining their counts.
#[test]
fn rebalancer_converges_the_template_set() {
    let dir = tempdir().unwrap();
    let mut config = config_in(dir.path());
    config.prune_threshold = 3;
    config.cluster_similarity = 0.9;
    let store = TemplateStore::new(config);

    for _ in 0..5 {
        store.ingest("prod", "shard alpha flushed segment to disk", 1);
        store.ingest("prod", "shard bravo flushed segment to disk", 2);
    }
    store.ingest("prod", "one off line that will vanish soon", 3);
    assert_eq!(store.template_count(), 3);

    let (pruned, merged) = store.rebalance();
    assert_eq!(pruned, 1);
    assert_eq!(merged, 1);
    let remaining = store.search(Some("prod"), None);
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].count, 10);
    assert_eq!(remaining[0].pattern, "shard <*> flushed segment to disk");
}
