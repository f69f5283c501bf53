//! Thin facade over the graph client: causal paths, anomaly detection,
//! and namespace graph snapshots.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::analyze::{CausalAnalysis, CausalAnalyzer, Symptom};
use crate::anomaly::{run_detectors, DetectorInput, KubeEvent, ResourceEvent};
use crate::config::AnomalyConfig;
use crate::error::{Result, SpectreError};
use crate::graph::cache::CachedGraphClient;
use crate::graph::queries;
use crate::graph::store::GraphStats;
use crate::graph::{GraphEdge, GraphNode};
use crate::k8s;
use crate::model::{Anomaly, ChangeRecord, EventKind, TimeRange};
use crate::service::run_storage;
use crate::storage::{EventQuery, QueryExecutor, QueryFilters};

#[derive(Debug, Serialize)]
pub struct NamespaceGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

pub struct GraphService {
    client: Arc<CachedGraphClient>,
    analyzer: CausalAnalyzer,
    executor: Arc<QueryExecutor>,
    anomaly_config: AnomalyConfig,
}

impl GraphService {
    pub fn new(
        client: Arc<CachedGraphClient>,
        analyzer: CausalAnalyzer,
        executor: Arc<QueryExecutor>,
        anomaly_config: AnomalyConfig,
    ) -> Self {
        Self {
            client,
            analyzer,
            executor,
            anomaly_config,
        }
    }

    pub async fn discover_causal_paths(
        &self,
        cancel: &CancellationToken,
        symptom: &Symptom,
    ) -> Result<CausalAnalysis> {
        self.analyzer.analyze(cancel, symptom).await
    }

    /// Gathers the per-resource event slice from storage (payload events
    /// plus native Kubernetes events involving the resource) and runs
    /// every detector over it.
    pub async fn detect_anomalies(
        &self,
        cancel: &CancellationToken,
        uid: &str,
        window: TimeRange,
    ) -> Result<Vec<Anomaly>> {
        let node = self
            .client
            .store()
            .get_node(uid)
            .await?
            .ok_or_else(|| SpectreError::NotFound(format!("resource {uid}")))?;
        let resource = node.resource_ref();

        let events = {
            let executor = Arc::clone(&self.executor);
            let cancel = cancel.clone();
            let filters = QueryFilters {
                kind: Some(resource.kind.clone()),
                namespace: Some(resource.namespace.clone()),
                group: None,
                name: Some(resource.name.clone()),
            };
            run_storage(move || {
                executor.query(
                    &cancel,
                    &EventQuery {
                        range: window,
                        filters,
                        limit: None,
                        descending: false,
                    },
                )
            })
            .await?
        };

        let kube_events = {
            let executor = Arc::clone(&self.executor);
            let cancel = cancel.clone();
            let filters = QueryFilters {
                kind: Some("Event".to_string()),
                namespace: Some(resource.namespace.clone()),
                group: None,
                name: None,
            };
            run_storage(move || {
                executor.query(
                    &cancel,
                    &EventQuery {
                        range: window,
                        filters,
                        limit: None,
                        descending: false,
                    },
                )
            })
            .await?
        };

        let resource_events = enrich_with_changes(&events.events);
        let native: Vec<KubeEvent> = kube_events
            .events
            .iter()
            .filter(|e| e.involved_uid.as_deref() == Some(uid))
            .map(|e| KubeEvent {
                reason: k8s::field_str(&e.payload, "reason").unwrap_or_default().to_string(),
                message: k8s::field_str(&e.payload, "message").unwrap_or_default().to_string(),
                timestamp: e.timestamp,
                count: k8s::field_i64(&e.payload, "count").unwrap_or(1) as u32,
            })
            .collect();

        let input = DetectorInput {
            resource: &resource,
            events: &resource_events,
            k8s_events: &native,
            window,
            config: &self.anomaly_config,
        };
        Ok(run_detectors(&input))
    }

    pub async fn analyze_namespace_graph(&self, namespace: &str) -> Result<NamespaceGraph> {
        let result = self
            .client
            .execute_with_retry(queries::namespace_graph(namespace))
            .await?;
        let Some(row) = result.rows.first() else {
            return Ok(NamespaceGraph {
                nodes: Vec::new(),
                edges: Vec::new(),
            });
        };
        let nodes = row
            .get("nodes")
            .and_then(serde_json::Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| queries::parse_node(v).ok())
                    .collect()
            })
            .unwrap_or_default();
        let edges = row
            .get("edges")
            .and_then(serde_json::Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| queries::parse_edge(v).ok())
                    .collect()
            })
            .unwrap_or_default();
        Ok(NamespaceGraph { nodes, edges })
    }

    pub async fn stats(&self) -> Result<GraphStats> {
        self.client.store().get_graph_stats().await
    }
}

/// Reconstructs change records for a stored event slice by diffing
/// consecutive payload revisions. The first event in the slice has no
/// predecessor and so no diff.
fn enrich_with_changes(events: &[crate::model::Event]) -> Vec<ResourceEvent> {
    let mut out = Vec::with_capacity(events.len());
    let mut previous: Option<&serde_json::Value> = None;
    for event in events {
        let diff = match (event.kind, previous) {
            (EventKind::Update, Some(prev)) => k8s::diff(prev, &event.payload),
            _ => Vec::new(),
        };
        let change = (!diff.is_empty() || event.kind != EventKind::Update).then(|| ChangeRecord {
            event_id: event.id.clone(),
            timestamp: event.timestamp,
            event_type: event.kind,
            config_changed: diff.iter().any(|c| k8s::is_config_path(&c.path)),
            status_changed: diff.iter().any(|c| k8s::is_status_path(&c.path)),
            diff,
            snapshot: None,
        });
        out.push(ResourceEvent {
            event_id: event.id.clone(),
            timestamp: event.timestamp,
            kind: event.kind,
            payload: event.payload.clone(),
            change,
        });
        if event.kind != EventKind::Delete {
            previous = Some(&event.payload);
        }
    }
    out
}
