//! REST surface. Handlers consume the same service instances as the
//! in-process tool registry; nothing here calls a peer over HTTP.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::analyze::Symptom;
use crate::config::ApiConfig;
use crate::error::{Result, SpectreError};
use crate::integration::IntegrationManager;
use crate::model::{normalize_timestamp, Event, TimeRange};
use crate::service::{
    GraphService, MetadataService, SearchParams, SearchService, TimelineParams, TimelineService,
};
use crate::storage::EventStore;

pub struct AppState {
    pub timeline: Arc<TimelineService>,
    pub graph: Arc<GraphService>,
    pub metadata: Arc<MetadataService>,
    pub search: Arc<SearchService>,
    pub store: Arc<EventStore>,
    pub manager: Arc<IntegrationManager>,
}

type SharedState = Arc<AppState>;

/// Error envelope: every failure is `{code, message}` with the status
/// implied by the error kind. Corruption is special-cased to a 200 so
/// degraded reads are never mistaken for hard failures.
struct ApiError(SpectreError);

impl From<SpectreError> for ApiError {
    fn from(err: SpectreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SpectreError::NotFound(_) => StatusCode::NOT_FOUND,
            SpectreError::Validation(_) => StatusCode::BAD_REQUEST,
            SpectreError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            SpectreError::Corruption(_) => StatusCode::OK,
            SpectreError::Cancelled => StatusCode::BAD_REQUEST,
            SpectreError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            SpectreError::Io(_) | SpectreError::Serialization(_) | SpectreError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(json!({
            "code": self.0.kind_code(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/v1/search", get(search))
        .route("/v1/timeline", get(timeline))
        .route("/v1/metadata", get(metadata))
        .route("/v1/causal-paths", get(causal_paths))
        .route("/v1/anomalies", get(anomalies))
        .route("/v1/namespace-graph", get(namespace_graph))
        .route("/v1/storage/import", post(storage_import))
        .route("/v1/storage/export", get(storage_export))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds and serves until the shutdown token fires.
pub async fn serve(
    state: SharedState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let cors = if config.allow_origins.is_empty() {
        CorsLayer::new()
    } else {
        let origins: Vec<HeaderValue> = config
            .allow_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST])
    };
    let app = router(state).layer(cors);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "api listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn search(
    State(state): State<SharedState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<crate::service::SearchResponse>> {
    let cancel = CancellationToken::new();
    Ok(Json(state.search.search(&cancel, params).await?))
}

async fn timeline(
    State(state): State<SharedState>,
    Query(params): Query<TimelineParams>,
) -> ApiResult<Json<crate::service::TimelineResponse>> {
    let cancel = CancellationToken::new();
    Ok(Json(state.timeline.timeline(&cancel, params).await?))
}

#[derive(Debug, Deserialize)]
struct WindowParams {
    start: Option<i64>,
    end: Option<i64>,
}

fn required<T>(value: Option<T>, name: &str) -> std::result::Result<T, ApiError> {
    value.ok_or_else(|| ApiError(SpectreError::Validation(format!("{name} is required"))))
}

async fn metadata(
    State(state): State<SharedState>,
    Query(params): Query<WindowParams>,
) -> ApiResult<Response> {
    let cancel = CancellationToken::new();
    let start = required(params.start, "start")?;
    let end = required(params.end, "end")?;
    let (response, cache_hit) = state.metadata.metadata(&cancel, start, end).await?;
    let header_value = if cache_hit { "HIT" } else { "MISS" };
    Ok(([("X-Cache", header_value)], Json(response)).into_response())
}

#[derive(Debug, Deserialize)]
struct CausalParams {
    uid: Option<String>,
    failure_ts: Option<i64>,
    lookback_secs: Option<u64>,
    max_depth: Option<u32>,
    max_paths: Option<usize>,
}

async fn causal_paths(
    State(state): State<SharedState>,
    Query(params): Query<CausalParams>,
) -> ApiResult<Json<crate::analyze::CausalAnalysis>> {
    let cancel = CancellationToken::new();
    let symptom = Symptom {
        resource_uid: required(params.uid, "uid")?,
        failure_timestamp: normalize_timestamp(required(params.failure_ts, "failure_ts")?),
        lookback_secs: params.lookback_secs,
        max_depth: params.max_depth,
        max_paths: params.max_paths,
    };
    Ok(Json(state.graph.discover_causal_paths(&cancel, &symptom).await?))
}

#[derive(Debug, Deserialize)]
struct AnomalyParams {
    uid: Option<String>,
    start: Option<i64>,
    end: Option<i64>,
}

async fn anomalies(
    State(state): State<SharedState>,
    Query(params): Query<AnomalyParams>,
) -> ApiResult<Json<Vec<crate::model::Anomaly>>> {
    let cancel = CancellationToken::new();
    let uid = required(params.uid, "uid")?;
    let window = TimeRange::new(
        normalize_timestamp(required(params.start, "start")?),
        normalize_timestamp(required(params.end, "end")?),
    )?;
    Ok(Json(
        state.graph.detect_anomalies(&cancel, &uid, window).await?,
    ))
}

#[derive(Debug, Deserialize)]
struct NamespaceParams {
    namespace: Option<String>,
}

async fn namespace_graph(
    State(state): State<SharedState>,
    Query(params): Query<NamespaceParams>,
) -> ApiResult<Json<crate::service::NamespaceGraph>> {
    let namespace = required(params.namespace, "namespace")?;
    Ok(Json(state.graph.analyze_namespace_graph(&namespace).await?))
}

async fn storage_import(
    State(state): State<SharedState>,
    Json(events): Json<Vec<Event>>,
) -> ApiResult<Json<serde_json::Value>> {
    let store = Arc::clone(&state.store);
    let imported = crate::service::run_storage(move || store.import(events)).await?;
    Ok(Json(json!({"imported": imported})))
}

async fn storage_export(
    State(state): State<SharedState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<Vec<Event>>> {
    let cancel = CancellationToken::new();
    let response = state.search.search(&cancel, params).await?;
    Ok(Json(response.events))
}

async fn healthz(State(state): State<SharedState>) -> ApiResult<Json<serde_json::Value>> {
    let report = state.manager.health_report().await;
    let healthy = report.iter().all(|h| h.healthy);
    Ok(Json(json!({
        "status": if healthy { "ok" } else { "degraded" },
        "integrations": report,
    })))
}
