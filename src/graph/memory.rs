//! Embedded in-memory graph store.
//!
//! Backs single-node deployments and the test suite. Stores nodes by
//! uid and edges by `(type, from, to)`; adjacency is computed on demand
//! so the naturally-cyclic graph never holds ownership of other nodes
//! inside a node. Supports exactly the query shapes the core issues
//! through [`super::queries`]; anything else is rejected.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::{json, Map, Value};

use crate::error::{Result, SpectreError};
use crate::graph::store::{GraphQuery, GraphStats, GraphStore, QueryResult};
use crate::graph::{EdgeType, GraphEdge, GraphNode};
use crate::model::{ChangeRecord, UnixNanos};

const SIDE_TYPES: [EdgeType; 6] = [
    EdgeType::ScheduledOn,
    EdgeType::UsesServiceAccount,
    EdgeType::GrantsTo,
    EdgeType::ReferencesSpec,
    EdgeType::IngressRef,
    EdgeType::Selects,
];

#[derive(Default)]
struct GraphData {
    nodes: FxHashMap<String, GraphNode>,
    by_name: FxHashMap<String, String>,
    edges: FxHashMap<(EdgeType, String, String), GraphEdge>,
    records: FxHashMap<String, Vec<ChangeRecord>>,
}

#[derive(Default)]
pub struct MemoryGraphStore {
    data: RwLock<GraphData>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn chain(&self, uid: &str, depth: u32) -> Vec<(GraphNode, u32)> {
        let data = self.data.read();
        let mut out = Vec::new();
        let Some(start) = data.nodes.get(uid) else {
            return out;
        };
        out.push((start.clone(), 0));
        let mut frontier = vec![uid.to_string()];
        let mut seen: Vec<String> = vec![uid.to_string()];
        for distance in 1..=depth {
            let mut next = Vec::new();
            for current in &frontier {
                for ((edge_type, from, to), _) in data.edges.iter() {
                    if !matches!(edge_type, EdgeType::Owns | EdgeType::Manages) {
                        continue;
                    }
                    if to != current || seen.contains(from) {
                        continue;
                    }
                    if let Some(node) = data.nodes.get(from) {
                        out.push((node.clone(), distance));
                        seen.push(from.clone());
                        next.push(from.clone());
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        out
    }

    fn managers_for(&self, uids: &[String]) -> Vec<Map<String, Value>> {
        let data = self.data.read();
        let mut rows = Vec::new();
        for ((edge_type, from, to), edge) in data.edges.iter() {
            if *edge_type != EdgeType::Manages || !uids.contains(to) {
                continue;
            }
            let Some(manager) = data.nodes.get(from) else {
                continue;
            };
            let mut row = Map::new();
            row.insert("managed".into(), json!(to));
            row.insert("manager".into(), to_value(manager));
            row.insert("edge".into(), to_value(edge));
            rows.push(row);
        }
        rows
    }

    fn related_for(&self, uids: &[String]) -> Vec<Map<String, Value>> {
        let data = self.data.read();
        let mut rows = Vec::new();
        for ((edge_type, from, to), edge) in data.edges.iter() {
            if !SIDE_TYPES.contains(edge_type) {
                continue;
            }
            let origin = if uids.contains(from) {
                Some((from, to))
            } else if uids.contains(to) {
                Some((to, from))
            } else {
                None
            };
            let Some((origin_uid, neighbor_uid)) = origin else {
                continue;
            };
            let Some(neighbor) = data.nodes.get(neighbor_uid) else {
                continue;
            };
            let mut row = Map::new();
            row.insert("origin".into(), json!(origin_uid));
            row.insert("edge".into(), to_value(edge));
            row.insert("neighbor".into(), to_value(neighbor));
            rows.push(row);
        }
        rows
    }

    fn events_for(&self, uids: &[String], start: UnixNanos, end: UnixNanos) -> Vec<Map<String, Value>> {
        let data = self.data.read();
        let mut hits: Vec<(UnixNanos, Map<String, Value>)> = Vec::new();
        for uid in uids {
            if let Some(records) = data.records.get(uid) {
                for record in records {
                    if record.timestamp >= start && record.timestamp <= end {
                        let mut row = Map::new();
                        row.insert("uid".into(), json!(uid));
                        row.insert("event".into(), to_value(record));
                        hits.push((record.timestamp, row));
                    }
                }
            }
        }
        hits.sort_by_key(|(ts, _)| *ts);
        hits.into_iter().map(|(_, row)| row).collect()
    }

    fn record_change(&self, uid: &str, record: ChangeRecord) {
        let mut data = self.data.write();
        let records = data.records.entry(uid.to_string()).or_default();
        match records.iter_mut().find(|r| r.event_id == record.event_id) {
            // Replace rather than duplicate, which keeps event
            // reprocessing idempotent.
            Some(existing) => *existing = record,
            None => records.push(record),
        }
        records.sort_by_key(|r| r.timestamp);
    }

    fn nodes_by_labels(
        &self,
        namespace: Option<&str>,
        kind: Option<&str>,
        selector: &BTreeMap<String, String>,
    ) -> Vec<Map<String, Value>> {
        let data = self.data.read();
        let mut rows = Vec::new();
        for node in data.nodes.values() {
            if let Some(ns) = namespace {
                if node.namespace != ns {
                    continue;
                }
            }
            if let Some(k) = kind {
                if node.kind != k {
                    continue;
                }
            }
            if node.deleted || !crate::k8s::selector_matches(selector, &node.labels) {
                continue;
            }
            let mut row = Map::new();
            row.insert("node".into(), to_value(node));
            rows.push(row);
        }
        rows
    }

    fn namespace_graph(&self, namespace: &str) -> Map<String, Value> {
        let data = self.data.read();
        let nodes: Vec<&GraphNode> = data
            .nodes
            .values()
            .filter(|n| n.namespace == namespace)
            .collect();
        let edges: Vec<&GraphEdge> = data
            .edges
            .values()
            .filter(|e| {
                let both_known = data.nodes.contains_key(&e.from_uid)
                    && data.nodes.contains_key(&e.to_uid);
                both_known
                    && data.nodes[&e.from_uid].namespace == namespace
                    && data.nodes[&e.to_uid].namespace == namespace
            })
            .collect();
        let mut row = Map::new();
        row.insert("nodes".into(), json!(nodes));
        row.insert("edges".into(), json!(edges));
        row
    }

    fn lookup_by_name(&self, namespace: &str, kind: &str, name: &str) -> Option<GraphNode> {
        let data = self.data.read();
        let key = crate::model::ResourceRef::state_key_for(namespace, kind, name);
        data.by_name
            .get(&key)
            .and_then(|uid| data.nodes.get(uid))
            .cloned()
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn param_str<'a>(params: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| SpectreError::Validation(format!("missing string parameter ${key}")))
}

fn param_opt_str<'a>(params: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

fn param_i64(params: &Map<String, Value>, key: &str) -> Result<i64> {
    params
        .get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| SpectreError::Validation(format!("missing integer parameter ${key}")))
}

fn param_string_vec(params: &Map<String, Value>, key: &str) -> Result<Vec<String>> {
    let list = params
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| SpectreError::Validation(format!("missing list parameter ${key}")))?;
    Ok(list
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect())
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn execute_query(&self, query: GraphQuery) -> Result<QueryResult> {
        let text = query.query.as_str();
        let params = &query.parameters;

        let rows = if text.contains("<-[:OWNS|MANAGES*0..") {
            let uid = param_str(params, "uid")?;
            let depth = param_i64(params, "depth").unwrap_or(5) as u32;
            self.chain(uid, depth)
                .into_iter()
                .map(|(node, distance)| {
                    let mut row = Map::new();
                    row.insert("resource".into(), to_value(&node));
                    row.insert("distance".into(), json!(distance));
                    row
                })
                .collect()
        } else if text.contains("[e:MANAGES]->") {
            self.managers_for(&param_string_vec(params, "uids")?)
        } else if text.contains("SCHEDULED_ON|USES_SERVICE_ACCOUNT") {
            self.related_for(&param_string_vec(params, "uids")?)
        } else if text.starts_with("MERGE (ev:ChangeEvent") {
            let uid = param_str(params, "uid")?.to_string();
            let record = params
                .get("record")
                .cloned()
                .ok_or_else(|| SpectreError::Validation("missing $record parameter".into()))?;
            let record: ChangeRecord = serde_json::from_value(record)?;
            self.record_change(&uid, record);
            Vec::new()
        } else if text.contains("(ev:ChangeEvent)") {
            self.events_for(
                &param_string_vec(params, "uids")?,
                param_i64(params, "start")?,
                param_i64(params, "end")?,
            )
        } else if text.contains("keys($selector)") {
            let selector: BTreeMap<String, String> = params
                .get("selector")
                .cloned()
                .map(serde_json::from_value)
                .transpose()?
                .unwrap_or_default();
            self.nodes_by_labels(
                param_opt_str(params, "namespace"),
                param_opt_str(params, "kind"),
                &selector,
            )
        } else if text.contains("collect(DISTINCT r) AS nodes") {
            vec![self.namespace_graph(param_str(params, "namespace")?)]
        } else if text.contains("{namespace: $namespace, kind: $kind, name: $name}") {
            match self.lookup_by_name(
                param_str(params, "namespace")?,
                param_str(params, "kind")?,
                param_str(params, "name")?,
            ) {
                Some(node) => {
                    let mut row = Map::new();
                    row.insert("resource".into(), to_value(&node));
                    vec![row]
                }
                None => Vec::new(),
            }
        } else {
            return Err(SpectreError::Validation(format!(
                "unsupported query shape: {text}"
            )));
        };
        Ok(QueryResult { rows })
    }

    async fn create_node(&self, node: GraphNode) -> Result<()> {
        let mut data = self.data.write();
        let key = node.name_key();
        data.by_name.insert(key, node.uid.clone());
        match data.nodes.get_mut(&node.uid) {
            Some(existing) => existing.merge_from(&node),
            None => {
                data.nodes.insert(node.uid.clone(), node);
            }
        }
        Ok(())
    }

    async fn create_edge(&self, edge: GraphEdge) -> Result<()> {
        let mut data = self.data.write();
        let key = edge.identity_key();
        match data.edges.get_mut(&key) {
            Some(existing) => existing.merge_from(&edge),
            None => {
                data.edges.insert(key, edge);
            }
        }
        Ok(())
    }

    async fn get_node(&self, uid: &str) -> Result<Option<GraphNode>> {
        Ok(self.data.read().nodes.get(uid).cloned())
    }

    async fn delete_nodes_by_timestamp(&self, older_than: UnixNanos) -> Result<u64> {
        let mut data = self.data.write();
        let doomed: Vec<String> = data
            .nodes
            .values()
            .filter(|n| n.deleted && n.last_seen < older_than)
            .map(|n| n.uid.clone())
            .collect();
        for uid in &doomed {
            if let Some(node) = data.nodes.remove(uid) {
                data.by_name.remove(&node.name_key());
            }
            data.records.remove(uid);
        }
        data.edges
            .retain(|(_, from, to), _| !doomed.contains(from) && !doomed.contains(to));
        Ok(doomed.len() as u64)
    }

    async fn get_graph_stats(&self) -> Result<GraphStats> {
        let data = self.data.read();
        Ok(GraphStats {
            node_count: data.nodes.len() as u64,
            edge_count: data.edges.len() as u64,
            change_event_count: data.records.values().map(Vec::len).sum::<usize>() as u64,
        })
    }

    async fn initialize_schema(&self) -> Result<()> {
        Ok(())
    }
}
