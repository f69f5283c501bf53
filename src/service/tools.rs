//! In-process tool registry.
//!
//! Agent-style consumers call the services through this registry with
//! JSON arguments. It is injected with the same service instances as
//! the REST router; no tool ever performs an HTTP request to reach a
//! peer.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::analyze::Symptom;
use crate::error::{Result, SpectreError};
use crate::model::{normalize_timestamp, TimeRange};
use crate::service::{
    GraphService, MetadataService, SearchParams, SearchService, TimelineParams, TimelineService,
};

pub struct ToolRegistry {
    timeline: Arc<TimelineService>,
    graph: Arc<GraphService>,
    metadata: Arc<MetadataService>,
    search: Arc<SearchService>,
}

impl ToolRegistry {
    pub fn new(
        timeline: Arc<TimelineService>,
        graph: Arc<GraphService>,
        metadata: Arc<MetadataService>,
        search: Arc<SearchService>,
    ) -> Self {
        Self {
            timeline,
            graph,
            metadata,
            search,
        }
    }

    pub fn tool_names(&self) -> &'static [&'static str] {
        &[
            "resource_timeline",
            "search_events",
            "cluster_metadata",
            "causal_paths",
            "resource_anomalies",
            "namespace_graph",
        ]
    }

    /// Dispatches one tool call. Unknown names and malformed arguments
    /// are validation errors, exactly like their REST counterparts.
    pub async fn call(&self, cancel: &CancellationToken, name: &str, args: Value) -> Result<Value> {
        match name {
            "resource_timeline" => {
                let params: TimelineParams = parse_args(args)?;
                let response = self.timeline.timeline(cancel, params).await?;
                Ok(serde_json::to_value(response)?)
            }
            "search_events" => {
                let params: SearchParams = parse_args(args)?;
                let response = self.search.search(cancel, params).await?;
                Ok(serde_json::to_value(response)?)
            }
            "cluster_metadata" => {
                let start = required_i64(&args, "start")?;
                let end = required_i64(&args, "end")?;
                let (response, cache_hit) = self.metadata.metadata(cancel, start, end).await?;
                Ok(json!({
                    "metadata": response,
                    "cached": cache_hit,
                }))
            }
            "causal_paths" => {
                let symptom = Symptom {
                    resource_uid: required_str(&args, "uid")?,
                    failure_timestamp: normalize_timestamp(required_i64(&args, "failure_ts")?),
                    lookback_secs: args.get("lookback_secs").and_then(Value::as_u64),
                    max_depth: args.get("max_depth").and_then(Value::as_u64).map(|v| v as u32),
                    max_paths: args
                        .get("max_paths")
                        .and_then(Value::as_u64)
                        .map(|v| v as usize),
                };
                let analysis = self.graph.discover_causal_paths(cancel, &symptom).await?;
                Ok(serde_json::to_value(analysis)?)
            }
            "resource_anomalies" => {
                let uid = required_str(&args, "uid")?;
                let window = TimeRange::new(
                    normalize_timestamp(required_i64(&args, "start")?),
                    normalize_timestamp(required_i64(&args, "end")?),
                )?;
                let anomalies = self.graph.detect_anomalies(cancel, &uid, window).await?;
                Ok(serde_json::to_value(anomalies)?)
            }
            "namespace_graph" => {
                let namespace = required_str(&args, "namespace")?;
                let graph = self.graph.analyze_namespace_graph(&namespace).await?;
                Ok(serde_json::to_value(graph)?)
            }
            other => Err(SpectreError::Validation(format!("unknown tool {other}"))),
        }
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(args: Value) -> Result<T> {
    serde_json::from_value(args)
        .map_err(|err| SpectreError::Validation(format!("invalid tool arguments: {err}")))
}

fn required_str(args: &Value, key: &str) -> Result<String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| SpectreError::Validation(format!("missing argument {key}")))
}

fn required_i64(args: &Value, key: &str) -> Result<i64> {
    args.get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| SpectreError::Validation(format!("missing argument {key}")))
}
