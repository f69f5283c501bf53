#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use spectre::config::{GraphConfig, StorageConfig};
use spectre::graph::cache::{CachedGraphClient, LookupCache};
use spectre::graph::memory::MemoryGraphStore;
use spectre::graph::store::GraphStore;
use spectre::graph::{queries, GraphNode};
use spectre::model::{ChangeRecord, EventKind};
use spectre::service::MetadataService;
use spectre::storage::{EventStore, QueryExecutor};

fn client_with(config: GraphConfig) -> (Arc<MemoryGraphStore>, CachedGraphClient) {
    let store = Arc::new(MemoryGraphStore::new());
    let client = CachedGraphClient::new(store.clone(), &config);
    (store, client)
}

/// Queries containing CREATE/MERGE/DELETE/SET/REMOVE as whole tokens
/// are never served from the cache, and never stored into it.
#[tokio::test]
async fn write_queries_always_reach_the_store() {
    let (store, client) = client_with(GraphConfig::default());
    let record = ChangeRecord {
        event_id: "e1".into(),
        timestamp: 1,
        event_type: EventKind::Update,
        config_changed: true,
        status_changed: false,
        diff: Vec::new(),
        snapshot: None,
    };
    let write = queries::record_change_event("u1", &record).unwrap();
    for _ in 0..3 {
        client.execute(write.clone()).await.unwrap();
    }
    let (hits, misses, _) = client.counters.snapshot();
    assert_eq!((hits, misses), (0, 0), "write queries bypass entirely");

    // The write actually landed each time (replaced by event id).
    let stats = store.get_graph_stats().await.unwrap();
    assert_eq!(stats.change_event_count, 1);
}

/// Read results are snapshots with a TTL: repeated reads hit, and
/// expiry forces a refresh.
#[tokio::test]
async fn read_cache_hits_expire_after_ttl() {
    let config = GraphConfig {
        query_cache_ttl_secs: 1,
        ..GraphConfig::default()
    };
    let (store, client) = client_with(config);
    store
        .create_node(GraphNode::stub("u1", "Pod", "prod", "web", 1))
        .await
        .unwrap();

    let query = queries::lookup_by_name("prod", "Pod", "web");
    let first = client.execute(query.clone()).await.unwrap();
    assert_eq!(first.rows.len(), 1);
    let _second = client.execute(query.clone()).await.unwrap();
    let (hits, misses, _) = client.counters.snapshot();
    assert_eq!((hits, misses), (1, 1));

    std::thread::sleep(Duration::from_millis(1_100));
    let _third = client.execute(query).await.unwrap();
    let (hits, misses, _) = client.counters.snapshot();
    assert_eq!((hits, misses), (1, 2), "expired entry must refresh");
}

/// The lookup cache drops both addresses on invalidation and counts
/// hits and misses.
#[test]
fn lookup_cache_counters_and_invalidation() {
    let cache = LookupCache::new(8);
    let node = GraphNode::stub("u1", "Pod", "prod", "web", 1);
    let name_key = node.name_key();
    cache.put(node);

    assert!(cache.get_by_uid("u1").is_some());
    assert!(cache.get_by_name(&name_key).is_some());
    assert!(cache.get_by_uid("missing").is_none());
    let (hits, misses, _) = cache.counters.snapshot();
    assert!(hits >= 2);
    assert!(misses >= 1);

    cache.invalidate("u1", &name_key);
    assert!(cache.get_by_uid("u1").is_none());
}

/// The metadata cache is owned by the service and reports the hit flag
/// that backs the `X-Cache` response header.
#[tokio::test]
async fn metadata_service_reports_cache_hits() {
    let dir = tempdir().unwrap();
    let config = StorageConfig {
        data_dir: dir.path().to_path_buf(),
        ..StorageConfig::default()
    };
    let store = Arc::new(EventStore::open(config).unwrap());
    let executor = Arc::new(QueryExecutor::new(store));
    let service = MetadataService::new(executor, Duration::from_secs(30));

    let cancel = CancellationToken::new();
    let start = 1_700_000_000;
    let end = start + 600;
    let (_, hit) = service.metadata(&cancel, start, end).await.unwrap();
    assert!(!hit, "first call misses");
    let (_, hit) = service.metadata(&cancel, start, end).await.unwrap();
    assert!(hit, "second call is served from the cache");
    let (_, hit) = service.metadata(&cancel, start, end + 7200).await.unwrap();
    assert!(!hit, "a different hour pair misses");
}
