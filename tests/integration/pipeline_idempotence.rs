#![allow(missing_docs)]

use std::sync::Arc;

use serde_json::{json, Value};

use spectre::config::GraphConfig;
use spectre::graph::cache::{CachedGraphClient, LookupCache};
use spectre::graph::memory::MemoryGraphStore;
use spectre::graph::pipeline::PipelineWorker;
use spectre::graph::store::GraphStore;
use spectre::graph::{queries, EdgeType};
use spectre::model::{Event, EventKind, ResourceRef};

fn worker_over(store: Arc<MemoryGraphStore>) -> PipelineWorker {
    let config = GraphConfig::default();
    let client = Arc::new(CachedGraphClient::new(store.clone(), &config));
    let lookup = Arc::new(LookupCache::new(config.lookup_cache_capacity));
    PipelineWorker::new(store, client, lookup, &config)
}

fn resource(kind: &str, name: &str, uid: &str) -> ResourceRef {
    ResourceRef {
        group: String::new(),
        version: "v1".into(),
        kind: kind.into(),
        namespace: "prod".into(),
        name: name.into(),
        uid: uid.into(),
    }
}

fn event(id: &str, ts: i64, kind: EventKind, res: ResourceRef, payload: Value) -> Event {
    Event {
        id: id.into(),
        timestamp: ts,
        kind,
        resource: res,
        payload,
        raw_size: 0,
        involved_uid: None,
    }
}

/// Processing the same event sequence twice yields the exact same node
/// and edge set, with evidence deduplicated. This is what makes
/// at-least-once delivery into the pipeline safe.
#[tokio::test]
async fn reprocessing_a_sequence_is_a_no_op() {
    let store = Arc::new(MemoryGraphStore::new());
    let mut worker = worker_over(store.clone());

    let events = vec![
        event(
            "e1",
            100,
            EventKind::Create,
            // Nodes are cluster-scoped.
            ResourceRef {
                group: String::new(),
                version: "v1".into(),
                kind: "Node".into(),
                namespace: String::new(),
                name: "node-1".into(),
                uid: "node-1".into(),
            },
            json!({"metadata": {"name": "node-1"}}),
        ),
        event(
            "e2",
            200,
            EventKind::Create,
            resource("ServiceAccount", "default", "sa-1"),
            json!({"metadata": {"name": "default", "namespace": "prod"}}),
        ),
        event(
            "e3",
            300,
            EventKind::Create,
            resource("Pod", "web-0", "pod-1"),
            json!({
                "metadata": {
                    "name": "web-0",
                    "namespace": "prod",
                    "labels": {"app": "web"},
                    "ownerReferences": [{"uid": "rs-1", "kind": "ReplicaSet", "name": "web-abc"}]
                },
                "spec": {"nodeName": "node-1", "serviceAccountName": "default"}
            }),
        ),
        event(
            "e4",
            400,
            EventKind::Create,
            resource("Service", "web", "svc-1"),
            json!({
                "metadata": {"name": "web", "namespace": "prod"},
                "spec": {"selector": {"app": "web"}}
            }),
        ),
    ];

    for e in &events {
        worker.process_event(e).await;
    }
    let first = store.get_graph_stats().await.unwrap();

    for e in &events {
        worker.process_event(e).await;
    }
    let second = store.get_graph_stats().await.unwrap();
    assert_eq!(first, second, "reprocessing must not grow the graph");

    // The expected relations all exist exactly once.
    let related = store
        .execute_query(queries::related_for(&["pod-1".into()]))
        .await
        .unwrap();
    let mut edge_types: Vec<String> = related
        .rows
        .iter()
        .filter_map(|row| row.get("edge"))
        .filter_map(|v| queries::parse_edge(v).ok())
        .map(|e| e.edge_type.as_str().to_string())
        .collect();
    edge_types.sort();
    assert_eq!(
        edge_types,
        vec!["SCHEDULED_ON", "SELECTS", "USES_SERVICE_ACCOUNT"]
    );
}

/// An unresolvable reference produces no edge and no error; a later
/// event for the same resource resolves it.
#[tokio::test]
async fn unresolved_reference_is_retried_by_a_later_event() {
    let store = Arc::new(MemoryGraphStore::new());
    let mut worker = worker_over(store.clone());

    let pod = event(
        "e1",
        100,
        EventKind::Create,
        resource("Pod", "web-0", "pod-1"),
        json!({
            "metadata": {"name": "web-0", "namespace": "prod"},
            "spec": {
                "volumes": [{"name": "cfg", "configMap": {"name": "app-config"}}],
                "containers": [{"name": "app", "image": "app:1.0"}]
            }
        }),
    );
    worker.process_event(&pod).await;
    // The configmap has not been sighted yet: no edge.
    let before = store
        .execute_query(queries::related_for(&["pod-1".into()]))
        .await
        .unwrap();
    assert!(before.rows.is_empty());

    let cm = event(
        "e2",
        200,
        EventKind::Create,
        resource("ConfigMap", "app-config", "cm-1"),
        json!({"metadata": {"name": "app-config", "namespace": "prod"}}),
    );
    worker.process_event(&cm).await;

    let mut update = pod.clone();
    update.id = "e3".into();
    update.timestamp = 300;
    update.kind = EventKind::Update;
    worker.process_event(&update).await;

    let after = store
        .execute_query(queries::related_for(&["pod-1".into()]))
        .await
        .unwrap();
    assert_eq!(after.rows.len(), 1);
    let edge = queries::parse_edge(after.rows[0].get("edge").unwrap()).unwrap();
    assert_eq!(edge.edge_type, EdgeType::ReferencesSpec);
    assert_eq!(edge.to_uid, "cm-1");
}

/// Deletes mark the identity node rather than removing it.
#[tokio::test]
async fn delete_marks_the_identity_as_deleted() {
    let store = Arc::new(MemoryGraphStore::new());
    let mut worker = worker_over(store.clone());

    let create = event(
        "e1",
        100,
        EventKind::Create,
        resource("ConfigMap", "app-config", "cm-1"),
        json!({"metadata": {"name": "app-config", "namespace": "prod"}}),
    );
    let mut delete = create.clone();
    delete.id = "e2".into();
    delete.timestamp = 200;
    delete.kind = EventKind::Delete;
    delete.payload = Value::Null;

    worker.process_event(&create).await;
    worker.process_event(&delete).await;

    let node = store.get_node("cm-1").await.unwrap().unwrap();
    assert!(node.deleted);
    assert_eq!(node.deleted_at, Some(200));
    assert_eq!(node.first_seen, 100);
}

/// A manager that appears after its managed resources back-fills the
/// MANAGES edges through the reverse extractor.
#[tokio::test]
async fn manager_arriving_late_is_linked_by_the_reverse_extractor() {
    let store = Arc::new(MemoryGraphStore::new());
    let mut worker = worker_over(store.clone());

    let managed = event(
        "e1",
        100,
        EventKind::Create,
        resource("Deployment", "web", "dep-1"),
        json!({
            "metadata": {
                "name": "web",
                "namespace": "prod",
                "labels": {
                    "helm.toolkit.fluxcd.io/name": "web-release",
                    "helm.toolkit.fluxcd.io/namespace": "flux-system"
                }
            },
            "spec": {"replicas": 1}
        }),
    );
    worker.process_event(&managed).await;

    let hr = event(
        "e2",
        200,
        EventKind::Create,
        ResourceRef {
            group: "helm.toolkit.fluxcd.io".into(),
            version: "v2".into(),
            kind: "HelmRelease".into(),
            namespace: "flux-system".into(),
            name: "web-release".into(),
            uid: "hr-1".into(),
        },
        json!({"metadata": {"name": "web-release", "namespace": "flux-system"}}),
    );
    worker.process_event(&hr).await;

    let managers = store
        .execute_query(queries::managers_for(&["dep-1".into()]))
        .await
        .unwrap();
    assert_eq!(managers.rows.len(), 1);
    let manager = queries::parse_node(managers.rows[0].get("manager").unwrap()).unwrap();
    assert_eq!(manager.uid, "hr-1");
}
