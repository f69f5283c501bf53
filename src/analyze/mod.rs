//! Causal analysis: from a symptom to a ranked set of root-cause paths.
//!
//! The analyzer issues a bounded set of graph queries (the ownership
//! chain is fatal on failure, the expansion queries fail fast as a
//! batch), assembles a spine-plus-attachments causal graph, selects a
//! primary event per node, and ranks root-to-symptom paths.

mod rank;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use xxhash_rust::xxh64::xxh64;

use crate::config::AnalyzerConfig;
use crate::error::{Result, SpectreError};
use crate::graph::cache::CachedGraphClient;
use crate::graph::queries::{self, ChainEntry};
use crate::graph::{EdgeType, GraphEdge, GraphNode};
use crate::model::{ChangeRecord, EventKind, ResourceRef, TimeRange, UnixNanos, NANOS_PER_SECOND};

pub use rank::RankedPath;

/// The observed failure the analysis starts from.
#[derive(Debug, Clone, Deserialize)]
pub struct Symptom {
    pub resource_uid: String,
    pub failure_timestamp: UnixNanos,
    pub lookback_secs: Option<u64>,
    pub max_depth: Option<u32>,
    pub max_paths: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CausalNodeKind {
    Spine,
    Side,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CausalNode {
    pub id: String,
    pub resource: ResourceRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_event: Option<ChangeRecord>,
    /// 1-based along the spine, 0 for side nodes.
    pub step: u32,
    pub kind: CausalNodeKind,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CausalEdge {
    pub id: String,
    pub from: String,
    pub to: String,
    /// Edge label as shown to consumers; `INGRESS_REF` is surfaced as
    /// `REFERENCES_SPEC`.
    pub edge_type: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CausalGraph {
    pub nodes: Vec<CausalNode>,
    pub edges: Vec<CausalEdge>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CausalAnalysis {
    pub graph: CausalGraph,
    pub paths: Vec<RankedPath>,
    pub window_start: UnixNanos,
    pub window_end: UnixNanos,
}

/// Content-derived node id so repeated assembly passes are no-ops.
fn node_id(uid: &str) -> String {
    format!("n{:016x}", xxh64(uid.as_bytes(), 0x5eed))
}

fn edge_id(edge_type: &str, from: &str, to: &str) -> String {
    let key = format!("{edge_type}|{from}|{to}");
    format!("e{:016x}", xxh64(key.as_bytes(), 0x5eed))
}

pub struct CausalAnalyzer {
    client: std::sync::Arc<CachedGraphClient>,
    config: AnalyzerConfig,
}

impl CausalAnalyzer {
    pub fn new(client: std::sync::Arc<CachedGraphClient>, config: AnalyzerConfig) -> Self {
        Self { client, config }
    }

    pub async fn analyze(
        &self,
        cancel: &CancellationToken,
        symptom: &Symptom,
    ) -> Result<CausalAnalysis> {
        let lookback = self.config.clamp_lookback(symptom.lookback_secs);
        let depth = self.config.clamp_depth(symptom.max_depth);
        let max_paths = self.config.clamp_paths(symptom.max_paths);
        let lookback_nanos = lookback.as_secs() as i64 * NANOS_PER_SECOND;
        let window = TimeRange::new(
            symptom.failure_timestamp - lookback_nanos,
            symptom.failure_timestamp + lookback_nanos,
        )?;

        if cancel.is_cancelled() {
            return Err(SpectreError::Cancelled);
        }

        // The ownership chain is the foundation: no chain, no analysis.
        let chain_result = self
            .client
            .execute_with_retry(queries::ownership_chain(&symptom.resource_uid, depth))
            .await?;
        let chain = queries::parse_chain(&chain_result.rows)?;
        if chain.is_empty() {
            return Err(SpectreError::NotFound(format!(
                "resource {}",
                symptom.resource_uid
            )));
        }
        let chain_uids: Vec<String> = chain.iter().map(|c| c.node.uid.clone()).collect();

        if cancel.is_cancelled() {
            return Err(SpectreError::Cancelled);
        }

        // Parallel expansion, fail-fast: one failure aborts the batch.
        let (managers_rows, related_rows, events_rows) = tokio::try_join!(
            self.client.execute(queries::managers_for(&chain_uids)),
            self.client.execute(queries::related_for(&chain_uids)),
            self.client
                .execute(queries::events_for(&chain_uids, window.start, window.end)),
        )?;

        let managers = parse_managers(&managers_rows.rows)?;
        let related = parse_related(&related_rows.rows)?;
        let mut events = parse_events(&events_rows.rows)?;

        // Second hop: events for managers and related resources, plus
        // the grant edges that attach to side nodes rather than to the
        // chain itself.
        let mut side_uids: Vec<String> = Vec::new();
        for (_, manager, _) in &managers {
            if !chain_uids.contains(&manager.uid) && !side_uids.contains(&manager.uid) {
                side_uids.push(manager.uid.clone());
            }
        }
        for row in &related {
            if !chain_uids.contains(&row.neighbor.uid) && !side_uids.contains(&row.neighbor.uid) {
                side_uids.push(row.neighbor.uid.clone());
            }
        }
        let mut grant_rows = Vec::new();
        if !side_uids.is_empty() {
            if cancel.is_cancelled() {
                return Err(SpectreError::Cancelled);
            }
            let (side_events, side_related) = tokio::try_join!(
                self.client
                    .execute(queries::events_for(&side_uids, window.start, window.end)),
                self.client.execute(queries::related_for(&side_uids)),
            )?;
            for (uid, records) in parse_events(&side_events.rows)? {
                events.entry(uid).or_default().extend(records);
            }
            grant_rows = parse_related(&side_related.rows)?
                .into_iter()
                .filter(|row| row.edge.edge_type == EdgeType::GrantsTo)
                .collect();
        }

        let graph = assemble(
            &chain,
            &managers,
            &related,
            &grant_rows,
            &events,
            symptom.failure_timestamp,
            window,
        );
        let paths = rank::rank_paths(
            &graph,
            &node_id(&symptom.resource_uid),
            lookback_nanos,
            symptom.failure_timestamp,
            max_paths,
        );
        Ok(CausalAnalysis {
            graph,
            paths,
            window_start: window.start,
            window_end: window.end,
        })
    }
}

struct RelatedRow {
    edge: GraphEdge,
    neighbor: GraphNode,
}

fn parse_managers(
    rows: &[serde_json::Map<String, serde_json::Value>],
) -> Result<Vec<(String, GraphNode, GraphEdge)>> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let managed = row
            .get("managed")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| SpectreError::Serialization("manager row missing managed uid".into()))?;
        let manager = queries::parse_node(row.get("manager").ok_or_else(|| {
            SpectreError::Serialization("manager row missing manager node".into())
        })?)?;
        let edge = queries::parse_edge(row.get("edge").ok_or_else(|| {
            SpectreError::Serialization("manager row missing edge".into())
        })?)?;
        out.push((managed.to_string(), manager, edge));
    }
    Ok(out)
}

fn parse_related(rows: &[serde_json::Map<String, serde_json::Value>]) -> Result<Vec<RelatedRow>> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let edge = queries::parse_edge(
            row.get("edge")
                .ok_or_else(|| SpectreError::Serialization("related row missing edge".into()))?,
        )?;
        let neighbor = queries::parse_node(row.get("neighbor").ok_or_else(|| {
            SpectreError::Serialization("related row missing neighbor".into())
        })?)?;
        out.push(RelatedRow { edge, neighbor });
    }
    Ok(out)
}

fn parse_events(
    rows: &[serde_json::Map<String, serde_json::Value>],
) -> Result<BTreeMap<String, Vec<ChangeRecord>>> {
    let mut out: BTreeMap<String, Vec<ChangeRecord>> = BTreeMap::new();
    for row in rows {
        let uid = row
            .get("uid")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| SpectreError::Serialization("event row missing uid".into()))?;
        let record = queries::parse_change_record(
            row.get("event")
                .ok_or_else(|| SpectreError::Serialization("event row missing event".into()))?,
        )?;
        out.entry(uid.to_string()).or_default().push(record);
    }
    Ok(out)
}

/// Three-pass assembly: spine nodes, spine edges, attachments.
fn assemble(
    chain: &[ChainEntry],
    managers: &[(String, GraphNode, GraphEdge)],
    related: &[RelatedRow],
    grants: &[RelatedRow],
    events: &BTreeMap<String, Vec<ChangeRecord>>,
    failure_ts: UnixNanos,
    window: TimeRange,
) -> CausalGraph {
    let mut nodes: BTreeMap<String, CausalNode> = BTreeMap::new();
    let mut edges: BTreeMap<String, CausalEdge> = BTreeMap::new();
    let mut order: Vec<String> = Vec::new();

    // Pass 1: spine nodes in descending distance order so the root-cause
    // side is step 1, with managers spliced in right after their managed
    // chain member.
    let mut spine: Vec<&GraphNode> = Vec::new();
    let mut by_distance: Vec<&ChainEntry> = chain.iter().collect();
    by_distance.sort_by(|a, b| b.distance.cmp(&a.distance));
    for entry in by_distance {
        if !spine.iter().any(|n| n.uid == entry.node.uid) {
            spine.push(&entry.node);
        }
        if let Some((_, manager, _)) = managers
            .iter()
            .find(|(managed, _, _)| *managed == entry.node.uid)
        {
            if !spine.iter().any(|n| n.uid == manager.uid) {
                spine.push(manager);
            }
        }
    }
    for (i, member) in spine.iter().enumerate() {
        let id = node_id(&member.uid);
        let primary = select_primary_event(events.get(&member.uid), failure_ts, window);
        let reasoning = reasoning_for(member, primary.as_ref());
        if !nodes.contains_key(&id) {
            order.push(id.clone());
        }
        nodes.insert(
            id.clone(),
            CausalNode {
                id,
                resource: member.resource_ref(),
                primary_event: primary,
                step: (i + 1) as u32,
                kind: CausalNodeKind::Spine,
                reasoning,
            },
        );
    }

    // Pass 2: spine edges. Consecutive chain members connect with OWNS
    // unless the pair is a manager relation; MANAGES edges are
    // suppressed when the same pair is already connected by OWNS.
    let mut chain_sorted: Vec<&ChainEntry> = chain.iter().collect();
    chain_sorted.sort_by(|a, b| b.distance.cmp(&a.distance));
    for pair in chain_sorted.windows(2) {
        let (parent, child) = (&pair[0].node, &pair[1].node);
        let is_manager_pair = managers
            .iter()
            .any(|(managed, manager, _)| *managed == child.uid && manager.uid == parent.uid);
        if is_manager_pair {
            continue;
        }
        insert_edge(&mut edges, "OWNS", &parent.uid, &child.uid, 1.0);
    }
    for (managed, manager, edge) in managers {
        let owns_id = edge_id("OWNS", &manager.uid, managed);
        if edges.contains_key(&owns_id) {
            continue;
        }
        insert_edge(&mut edges, "MANAGES", &manager.uid, managed, edge.confidence);
    }

    // Pass 3: attachments. Side nodes carry step 0; direction rules are
    // already encoded in the stored edges (SELECTS points selector →
    // selected, INGRESS_REF points ingress → service).
    for row in related.iter().chain(grants.iter()) {
        let neighbor_id = node_id(&row.neighbor.uid);
        if !nodes.contains_key(&neighbor_id) {
            let primary = select_primary_event(events.get(&row.neighbor.uid), failure_ts, window);
            let reasoning = reasoning_for(&row.neighbor, primary.as_ref());
            order.push(neighbor_id.clone());
            nodes.insert(
                neighbor_id.clone(),
                CausalNode {
                    id: neighbor_id.clone(),
                    resource: row.neighbor.resource_ref(),
                    primary_event: primary,
                    step: 0,
                    kind: CausalNodeKind::Side,
                    reasoning,
                },
            );
        }
        let label = match row.edge.edge_type {
            EdgeType::IngressRef => "REFERENCES_SPEC",
            other => other.as_str(),
        };
        insert_edge(
            &mut edges,
            label,
            &row.edge.from_uid,
            &row.edge.to_uid,
            row.edge.confidence,
        );
    }

    // Drop edges whose endpoints never materialized as nodes.
    let node_ids: Vec<&String> = nodes.keys().collect();
    let edges: Vec<CausalEdge> = edges
        .into_values()
        .filter(|e| node_ids.contains(&&e.from) && node_ids.contains(&&e.to))
        .collect();
    let nodes = order
        .into_iter()
        .filter_map(|id| nodes.get(&id).cloned())
        .collect();
    CausalGraph { nodes, edges }
}

fn insert_edge(
    edges: &mut BTreeMap<String, CausalEdge>,
    label: &str,
    from_uid: &str,
    to_uid: &str,
    confidence: f64,
) {
    let id = edge_id(label, from_uid, to_uid);
    edges.entry(id.clone()).or_insert(CausalEdge {
        id,
        from: node_id(from_uid),
        to: node_id(to_uid),
        edge_type: label.to_string(),
        confidence,
    });
}

/// Priority order: earliest config change, earliest create, the status
/// change closest to the failure, earliest event in the window.
fn select_primary_event(
    records: Option<&Vec<ChangeRecord>>,
    failure_ts: UnixNanos,
    window: TimeRange,
) -> Option<ChangeRecord> {
    let records = records?;
    let in_window: Vec<&ChangeRecord> = records
        .iter()
        .filter(|r| window.contains(r.timestamp))
        .collect();
    if in_window.is_empty() {
        return None;
    }
    if let Some(config) = in_window
        .iter()
        .filter(|r| r.config_changed)
        .min_by_key(|r| r.timestamp)
    {
        return Some((*config).clone());
    }
    if let Some(create) = in_window
        .iter()
        .filter(|r| r.event_type == EventKind::Create)
        .min_by_key(|r| r.timestamp)
    {
        return Some((*create).clone());
    }
    if let Some(status) = in_window
        .iter()
        .filter(|r| r.status_changed)
        .min_by_key(|r| (r.timestamp - failure_ts).abs())
    {
        return Some((*status).clone());
    }
    in_window.iter().min_by_key(|r| r.timestamp).map(|r| (*r).clone())
}

fn reasoning_for(node: &GraphNode, primary: Option<&ChangeRecord>) -> String {
    match primary {
        Some(record) if record.config_changed => format!(
            "{} {} had a configuration change ({} fields) shortly before the failure",
            node.kind,
            node.name,
            record.diff.len()
        ),
        Some(record) if record.event_type == EventKind::Create => {
            format!("{} {} was created inside the failure window", node.kind, node.name)
        }
        Some(record) if record.status_changed => {
            format!("{} {} reported a status transition near the failure", node.kind, node.name)
        }
        Some(_) => format!("{} {} changed inside the failure window", node.kind, node.name),
        None => format!("{} {} had no recorded changes in the window", node.kind, node.name),
    }
}
