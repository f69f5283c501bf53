#![allow(missing_docs)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use serde_json::{json, Value};
use tempfile::tempdir;
use tower::ServiceExt;

use spectre::api::router;
use spectre::config::Config;
use spectre::model::{Event, EventKind, ResourceRef, NANOS_PER_SECOND};
use spectre::Runtime;

const BASE: i64 = 1_700_000_000 * NANOS_PER_SECOND;

async fn runtime_in(dir: &std::path::Path) -> Runtime {
    let mut config = Config::default();
    config.storage.data_dir = dir.join("data");
    config.templates.snapshot_path = dir.join("templates.json");
    Runtime::start(config).await.unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn healthz_reports_integrations() {
    let dir = tempdir().unwrap();
    let runtime = runtime_in(dir.path()).await;
    let app = router(Arc::clone(&runtime.state));

    let response = app.oneshot(get("/healthz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert!(body["integrations"].as_array().unwrap().len() >= 2);
}

#[tokio::test]
async fn metadata_sets_the_cache_header() {
    let dir = tempdir().unwrap();
    let runtime = runtime_in(dir.path()).await;
    let app = router(Arc::clone(&runtime.state));

    let uri = "/v1/metadata?start=1700000000&end=1700000600";
    let first = app.clone().oneshot(get(uri)).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers().get("X-Cache").unwrap(), "MISS");

    let second = app.oneshot(get(uri)).await.unwrap();
    assert_eq!(second.headers().get("X-Cache").unwrap(), "HIT");
}

#[tokio::test]
async fn validation_errors_use_the_envelope() {
    let dir = tempdir().unwrap();
    let runtime = runtime_in(dir.path()).await;
    let app = router(Arc::clone(&runtime.state));

    // Timeline without a start parameter.
    let response = app.oneshot(get("/v1/timeline?end=1700000600")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["code"], "validation");
    assert!(body["message"].as_str().unwrap().contains("start"));
}

#[tokio::test]
async fn unknown_symptom_maps_to_not_found() {
    let dir = tempdir().unwrap();
    let runtime = runtime_in(dir.path()).await;
    let app = router(Arc::clone(&runtime.state));

    let response = app
        .oneshot(get("/v1/causal-paths?uid=ghost&failure_ts=1700000000"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn import_then_search_round_trips() {
    let dir = tempdir().unwrap();
    let runtime = runtime_in(dir.path()).await;
    let app = router(Arc::clone(&runtime.state));

    let events: Vec<Event> = (0..20)
        .map(|i| Event {
            id: format!("e{i}"),
            timestamp: BASE + i64::from(i) * NANOS_PER_SECOND,
            kind: EventKind::Create,
            resource: ResourceRef {
                group: String::new(),
                version: "v1".into(),
                kind: "Pod".into(),
                namespace: "prod".into(),
                name: format!("pod-{i}"),
                uid: format!("uid-{i}"),
            },
            payload: json!({"metadata": {"name": format!("pod-{i}")}}),
            raw_size: 0,
            involved_uid: None,
        })
        .collect();

    let import = Request::builder()
        .method("POST")
        .uri("/v1/storage/import")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(&events).unwrap()))
        .unwrap();
    let response = app.clone().oneshot(import).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["imported"], 20);

    let search = app
        .clone()
        .oneshot(get(&format!(
            "/v1/search?start={}&end={}&kind=Pod",
            1_700_000_000,
            1_700_000_000 + 60
        )))
        .await
        .unwrap();
    assert_eq!(search.status(), StatusCode::OK);
    let body = body_json(search).await;
    assert_eq!(body["events"].as_array().unwrap().len(), 20);

    let export = app
        .oneshot(get(&format!(
            "/v1/storage/export?start={}&end={}",
            1_700_000_000,
            1_700_000_000 + 60
        )))
        .await
        .unwrap();
    assert_eq!(export.status(), StatusCode::OK);
    let exported = body_json(export).await;
    assert_eq!(exported.as_array().unwrap().len(), 20);
}

#[tokio::test]
async fn timeline_paginates_with_cursors() {
    let dir = tempdir().unwrap();
    let runtime = runtime_in(dir.path()).await;
    for i in 0..30u32 {
        runtime
            .submit_event(Event {
                id: format!("e{i}"),
                timestamp: BASE + i64::from(i) * NANOS_PER_SECOND,
                kind: EventKind::Create,
                resource: ResourceRef {
                    group: String::new(),
                    version: "v1".into(),
                    kind: "Pod".into(),
                    namespace: "prod".into(),
                    name: "web-0".into(),
                    uid: "pod-1".into(),
                },
                payload: json!({"metadata": {"name": "web-0"}}),
                raw_size: 0,
                involved_uid: None,
            })
            .unwrap();
    }
    let app = router(Arc::clone(&runtime.state));

    let uri = format!(
        "/v1/timeline?start={}&end={}&limit=10",
        1_700_000_000,
        1_700_000_000 + 120
    );
    let first = app.clone().oneshot(get(&uri)).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let body = body_json(first).await;
    assert_eq!(body["total_events"], 30);
    let cursor = body["next_cursor"].as_str().unwrap().to_string();
    let events_on_page: usize = body["entries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["events"].as_array().unwrap().len())
        .sum();
    assert_eq!(events_on_page, 10);

    let second = app
        .oneshot(get(&format!("{uri}&cursor={}", urlencode(&cursor))))
        .await
        .unwrap();
    let body = body_json(second).await;
    let events_on_page: usize = body["entries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["events"].as_array().unwrap().len())
        .sum();
    assert_eq!(events_on_page, 10);
}

fn urlencode(raw: &str) -> String {
    raw.replace('+', "%2B").replace('/', "%2F").replace('=', "%3D")
}

/// In-process tools consume the same service instances as the REST
/// handlers, with no HTTP in between.
#[tokio::test]
async fn tool_registry_shares_the_services() {
    let dir = tempdir().unwrap();
    let runtime = runtime_in(dir.path()).await;
    runtime
        .submit_event(Event {
            id: "e1".into(),
            timestamp: BASE,
            kind: EventKind::Create,
            resource: ResourceRef {
                group: String::new(),
                version: "v1".into(),
                kind: "Pod".into(),
                namespace: "prod".into(),
                name: "web-0".into(),
                uid: "pod-1".into(),
            },
            payload: json!({"metadata": {"name": "web-0"}}),
            raw_size: 0,
            involved_uid: None,
        })
        .unwrap();

    let cancel = tokio_util::sync::CancellationToken::new();
    let result = runtime
        .tools
        .call(
            &cancel,
            "search_events",
            json!({"start": 1_700_000_000, "end": 1_700_000_060}),
        )
        .await
        .unwrap();
    assert_eq!(result["events"].as_array().unwrap().len(), 1);

    let err = runtime
        .tools
        .call(&cancel, "no_such_tool", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.kind_code(), "validation");

    // The metadata tool reports the same cache flag the REST handler
    // uses for its X-Cache header.
    let first = runtime
        .tools
        .call(
            &cancel,
            "cluster_metadata",
            json!({"start": 1_700_000_000, "end": 1_700_000_060}),
        )
        .await
        .unwrap();
    assert_eq!(first["cached"], false);
    let second = runtime
        .tools
        .call(
            &cancel,
            "cluster_metadata",
            json!({"start": 1_700_000_000, "end": 1_700_000_060}),
        )
        .await
        .unwrap();
    assert_eq!(second["cached"], true);
}
