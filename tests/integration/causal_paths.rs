#![allow(missing_docs)]

use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use spectre::analyze::{CausalAnalyzer, CausalNodeKind, Symptom};
use spectre::config::{AnalyzerConfig, GraphConfig};
use spectre::error::SpectreError;
use spectre::graph::cache::{CachedGraphClient, LookupCache};
use spectre::graph::memory::MemoryGraphStore;
use spectre::graph::pipeline::PipelineWorker;
use spectre::model::{Event, EventKind, ResourceRef, NANOS_PER_SECOND};

const BASE: i64 = 1_700_000_000 * NANOS_PER_SECOND;

fn at(seconds: i64) -> i64 {
    BASE + seconds * NANOS_PER_SECOND
}

struct Harness {
    worker: PipelineWorker,
    analyzer: CausalAnalyzer,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryGraphStore::new());
    let config = GraphConfig::default();
    let client = Arc::new(CachedGraphClient::new(store.clone(), &config));
    let lookup = Arc::new(LookupCache::new(config.lookup_cache_capacity));
    let worker = PipelineWorker::new(store, client.clone(), lookup, &config);
    let analyzer = CausalAnalyzer::new(client, AnalyzerConfig::default());
    Harness { worker, analyzer }
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

fn resource(kind: &str, name: &str, uid: &str) -> ResourceRef {
    ResourceRef {
        group: if kind == "Pod" { String::new() } else { "apps".into() },
        version: "v1".into(),
        kind: kind.into(),
        namespace: "prod".into(),
        name: name.into(),
        uid: uid.into(),
    }
}

fn deployment_payload(image: &str) -> Value {
    json!({
        "metadata": {"name": "web", "namespace": "prod"},
        "spec": {"template": {"spec": {"containers": [{"name": "app", "image": image}]}}}
    })
}

fn owned_payload(name: &str, owner_uid: &str, owner_kind: &str) -> Value {
    json!({
        "metadata": {
            "name": name,
            "namespace": "prod",
            "ownerReferences": [{"uid": owner_uid, "kind": owner_kind, "name": "web"}]
        }
    })
}

/// Image roll-out scenario: an image change on the Deployment is the
/// root cause of a crash-looping replacement pod. The spine must read
/// Deployment -> ReplicaSet -> Pod with the image change as the
/// Deployment's primary event.
#[tokio::test]
async fn image_rollout_paths_back_to_the_deployment() {
    let mut h = harness();

    h.worker
        .process_event(&event(
            "e1",
            at(0),
            EventKind::Create,
            resource("Deployment", "web", "dep-1"),
            deployment_payload("app:1.0"),
        ))
        .await;
    h.worker
        .process_event(&event(
            "e2",
            at(1),
            EventKind::Create,
            resource("ReplicaSet", "web-1", "rs-1"),
            owned_payload("web-1", "dep-1", "Deployment"),
        ))
        .await;
    h.worker
        .process_event(&event(
            "e3",
            at(1),
            EventKind::Create,
            resource("Pod", "web-1-x", "pod-1"),
            owned_payload("web-1-x", "rs-1", "ReplicaSet"),
        ))
        .await;
    h.worker
        .process_event(&event(
            "e4",
            at(100),
            EventKind::Update,
            resource("Deployment", "web", "dep-1"),
            deployment_payload("app:2.0"),
        ))
        .await;
    h.worker
        .process_event(&event(
            "e5",
            at(101),
            EventKind::Create,
            resource("ReplicaSet", "web-2", "rs-2"),
            owned_payload("web-2", "dep-1", "Deployment"),
        ))
        .await;
    h.worker
        .process_event(&event(
            "e6",
            at(101),
            EventKind::Create,
            resource("Pod", "web-2-x", "pod-2"),
            owned_payload("web-2-x", "rs-2", "ReplicaSet"),
        ))
        .await;
    h.worker
        .process_event(&event(
            "e7",
            at(120),
            EventKind::Update,
            resource("Pod", "web-2-x", "pod-2"),
            json!({
                "metadata": {
                    "name": "web-2-x",
                    "namespace": "prod",
                    "ownerReferences": [{"uid": "rs-2", "kind": "ReplicaSet", "name": "web"}]
                },
                "status": {"containerStatuses": [
                    {"name": "app", "state": {"waiting": {"reason": "CrashLoopBackOff"}}}
                ]}
            }),
        ))
        .await;

    let analysis = h
        .analyzer
        .analyze(
            &CancellationToken::new(),
            &Symptom {
                resource_uid: "pod-2".into(),
                failure_timestamp: at(130),
                lookback_secs: None,
                max_depth: None,
                max_paths: None,
            },
        )
        .await
        .unwrap();

    // Spine: Deployment (step 1) -> ReplicaSet (step 2) -> Pod (step 3).
    let spine: Vec<(&str, u32)> = analysis
        .graph
        .nodes
        .iter()
        .filter(|n| n.kind == CausalNodeKind::Spine)
        .map(|n| (n.resource.uid.as_str(), n.step))
        .collect();
    assert_eq!(spine, vec![("dep-1", 1), ("rs-2", 2), ("pod-2", 3)]);

    // The Deployment's primary event is the image change at t=100.
    let dep_node = analysis
        .graph
        .nodes
        .iter()
        .find(|n| n.resource.uid == "dep-1")
        .unwrap();
    let primary = dep_node.primary_event.as_ref().unwrap();
    assert_eq!(primary.event_id, "e4");
    assert!(primary.config_changed);
    assert!(primary
        .diff
        .iter()
        .any(|c| c.path.ends_with(".image")));

    // A single high-confidence root-to-symptom path.
    assert!(!analysis.paths.is_empty());
    let best = &analysis.paths[0];
    assert_eq!(best.node_ids.len(), 3);
    assert!(best.min_confidence >= 0.8);
    assert!(best.score > 0.0);
}

/// ConfigMap deletion scenario: the deleted configmap shows up as an
/// attachment of the pod that referenced it.
#[tokio::test]
async fn deleted_configmap_appears_as_an_attachment() {
    let mut h = harness();

    h.worker
        .process_event(&event(
            "e1",
            at(0),
            EventKind::Create,
            resource("ConfigMap", "app-config", "cm-1"),
            json!({"metadata": {"name": "app-config", "namespace": "prod"}}),
        ))
        .await;
    h.worker
        .process_event(&event(
            "e2",
            at(1),
            EventKind::Create,
            resource("Pod", "web-0", "pod-1"),
            json!({
                "metadata": {"name": "web-0", "namespace": "prod"},
                "spec": {"volumes": [{"name": "cfg", "configMap": {"name": "app-config"}}]}
            }),
        ))
        .await;
    h.worker
        .process_event(&event(
            "e3",
            at(60),
            EventKind::Delete,
            resource("ConfigMap", "app-config", "cm-1"),
            Value::Null,
        ))
        .await;

    let analysis = h
        .analyzer
        .analyze(
            &CancellationToken::new(),
            &Symptom {
                resource_uid: "pod-1".into(),
                failure_timestamp: at(90),
                lookback_secs: None,
                max_depth: None,
                max_paths: None,
            },
        )
        .await
        .unwrap();

    let side = analysis
        .graph
        .nodes
        .iter()
        .find(|n| n.resource.uid == "cm-1")
        .expect("configmap attachment node");
    assert_eq!(side.kind, CausalNodeKind::Side);
    assert_eq!(side.step, 0);

    let attachment = analysis
        .graph
        .edges
        .iter()
        .find(|e| e.to == side.id)
        .expect("attachment edge");
    assert_eq!(attachment.edge_type, "REFERENCES_SPEC");
}

/// The ownership-chain query is fatal: an unknown symptom aborts.
#[tokio::test]
async fn unknown_symptom_is_not_found() {
    let h = harness();
    let err = h
        .analyzer
        .analyze(
            &CancellationToken::new(),
            &Symptom {
                resource_uid: "ghost".into(),
                failure_timestamp: at(0),
                lookback_secs: None,
                max_depth: None,
                max_paths: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SpectreError::NotFound(_)));
}
