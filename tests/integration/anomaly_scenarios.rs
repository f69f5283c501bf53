#![allow(missing_docs)]

use serde_json::{json, Value};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use spectre::config::Config;
use spectre::model::{
    AnomalyCategory, Event, EventKind, ResourceRef, Severity, TimeRange, NANOS_PER_SECOND,
};
use spectre::Runtime;

const BASE: i64 = 1_700_000_000 * NANOS_PER_SECOND;

fn at(seconds: i64) -> i64 {
    BASE + seconds * NANOS_PER_SECOND
}

async fn runtime_in(dir: &std::path::Path) -> Runtime {
    let mut config = Config::default();
    config.storage.data_dir = dir.join("data");
    config.storage.block_target_size = 4096;
    config.templates.snapshot_path = dir.join("templates.json");
    Runtime::start(config).await.unwrap()
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

fn helmrelease(version: &str) -> Value {
    json!({
        "metadata": {"name": "web-release", "namespace": "prod"},
        "spec": {"chart": {"spec": {"chart": "web", "version": version}}}
    })
}

fn hr_ref() -> ResourceRef {
    ResourceRef {
        group: "helm.toolkit.fluxcd.io".into(),
        version: "v2".into(),
        kind: "HelmRelease".into(),
        namespace: "prod".into(),
        name: "web-release".into(),
        uid: "hr-1".into(),
    }
}

/// HelmRelease rollback scenario: upgrade to 1.4.0 then back to 1.3.0.
/// Exactly two change anomalies: a medium upgrade and a high rollback;
/// nothing for the initial create.
#[tokio::test]
async fn helm_upgrade_then_rollback() {
    let dir = tempdir().unwrap();
    let runtime = runtime_in(dir.path()).await;

    runtime
        .submit_event(event("e1", at(0), EventKind::Create, hr_ref(), helmrelease("1.3.0")))
        .unwrap();
    runtime
        .submit_event(event("e2", at(60), EventKind::Update, hr_ref(), helmrelease("1.4.0")))
        .unwrap();
    runtime
        .submit_event(event("e3", at(180), EventKind::Update, hr_ref(), helmrelease("1.3.0")))
        .unwrap();
    runtime.pipeline.shutdown().await.unwrap();

    let anomalies = runtime
        .state
        .graph
        .detect_anomalies(
            &CancellationToken::new(),
            "hr-1",
            TimeRange::new(at(0), at(300)).unwrap(),
        )
        .await
        .unwrap();

    let change: Vec<_> = anomalies
        .iter()
        .filter(|a| a.category == AnomalyCategory::Change)
        .collect();
    assert_eq!(change.len(), 2, "got {anomalies:?}");
    assert_eq!(change[0].anomaly_type, "HelmUpgrade");
    assert_eq!(change[0].severity, Severity::Medium);
    assert_eq!(change[0].timestamp, at(60));
    assert_eq!(change[1].anomaly_type, "HelmRollback");
    assert_eq!(change[1].severity, Severity::High);
    assert_eq!(change[1].timestamp, at(180));
}

/// A crash-looping pod produces a critical state anomaly, while the
/// ReplicaSet scaling churn next to it stays silent.
#[tokio::test]
async fn crashloop_is_flagged_and_replica_churn_is_not() {
    let dir = tempdir().unwrap();
    let runtime = runtime_in(dir.path()).await;

    let pod = ResourceRef {
        group: String::new(),
        version: "v1".into(),
        kind: "Pod".into(),
        namespace: "prod".into(),
        name: "web-2-x".into(),
        uid: "pod-2".into(),
    };
    let rs = ResourceRef {
        group: "apps".into(),
        version: "v1".into(),
        kind: "ReplicaSet".into(),
        namespace: "prod".into(),
        name: "web-2".into(),
        uid: "rs-2".into(),
    };

    runtime
        .submit_event(event(
            "p1",
            at(1),
            EventKind::Create,
            pod.clone(),
            json!({"metadata": {"name": "web-2-x", "namespace": "prod"}, "status": {"phase": "Running"}}),
        ))
        .unwrap();
    runtime
        .submit_event(event(
            "p2",
            at(120),
            EventKind::Update,
            pod.clone(),
            json!({
                "metadata": {"name": "web-2-x", "namespace": "prod"},
                "status": {"containerStatuses": [
                    {"name": "app", "state": {"waiting": {"reason": "CrashLoopBackOff"}}}
                ]}
            }),
        ))
        .unwrap();
    runtime
        .submit_event(event(
            "r1",
            at(2),
            EventKind::Create,
            rs.clone(),
            json!({
                "metadata": {"name": "web-2", "namespace": "prod",
                              "annotations": {"deployment.kubernetes.io/revision": "2"}},
                "spec": {"replicas": 1},
                "status": {"replicas": 0}
            }),
        ))
        .unwrap();
    runtime
        .submit_event(event(
            "r2",
            at(5),
            EventKind::Update,
            rs.clone(),
            json!({
                "metadata": {"name": "web-2", "namespace": "prod",
                              "annotations": {"deployment.kubernetes.io/revision": "2"}},
                "spec": {"replicas": 3},
                "status": {"replicas": 3}
            }),
        ))
        .unwrap();
    runtime.pipeline.shutdown().await.unwrap();

    let window = TimeRange::new(at(0), at(300)).unwrap();
    let cancel = CancellationToken::new();

    let pod_anomalies = runtime
        .state
        .graph
        .detect_anomalies(&cancel, "pod-2", window)
        .await
        .unwrap();
    assert!(pod_anomalies
        .iter()
        .any(|a| a.anomaly_type == "CrashLoopBackOff" && a.severity == Severity::Critical));

    let rs_anomalies = runtime
        .state
        .graph
        .detect_anomalies(&cancel, "rs-2", window)
        .await
        .unwrap();
    assert!(
        rs_anomalies.is_empty(),
        "replica churn must stay silent, got {rs_anomalies:?}"
    );
}

/// Native Kubernetes events involving the resource feed the network
/// detector.
#[tokio::test]
async fn native_events_surface_connection_failures() {
    let dir = tempdir().unwrap();
    let runtime = runtime_in(dir.path()).await;

    let pod = ResourceRef {
        group: String::new(),
        version: "v1".into(),
        kind: "Pod".into(),
        namespace: "prod".into(),
        name: "web-0".into(),
        uid: "pod-1".into(),
    };
    runtime
        .submit_event(event(
            "p1",
            at(1),
            EventKind::Create,
            pod,
            json!({"metadata": {"name": "web-0", "namespace": "prod"}}),
        ))
        .unwrap();
    runtime
        .submit_event(Event {
            id: "k1".into(),
            timestamp: at(30),
            kind: EventKind::Create,
            resource: ResourceRef {
                group: String::new(),
                version: "v1".into(),
                kind: "Event".into(),
                namespace: "prod".into(),
                name: "web-0.17a2".into(),
                uid: "kev-1".into(),
            },
            payload: json!({
                "reason": "Unhealthy",
                "message": "Readiness probe failed: dial tcp 10.0.0.9:8080: connection refused",
                "count": 4
            }),
            raw_size: 0,
            involved_uid: Some("pod-1".into()),
        })
        .unwrap();
    runtime.pipeline.shutdown().await.unwrap();

    let anomalies = runtime
        .state
        .graph
        .detect_anomalies(
            &CancellationToken::new(),
            "pod-1",
            TimeRange::new(at(0), at(60)).unwrap(),
        )
        .await
        .unwrap();
    assert!(anomalies
        .iter()
        .any(|a| a.category == AnomalyCategory::Network && a.anomaly_type == "ConnectionRefused"));
}
