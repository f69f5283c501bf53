//! Root-to-symptom path enumeration and scoring over the spine.

use serde::{Deserialize, Serialize};

use crate::analyze::{CausalGraph, CausalNodeKind};
use crate::model::UnixNanos;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedPath {
    /// Causal node ids from root to symptom.
    pub node_ids: Vec<String>,
    pub score: f64,
    /// Smallest edge confidence along the path.
    pub min_confidence: f64,
    pub summary: String,
}

/// Enumerates every spine path ending at the symptom and scores it by
/// `Σ edge.confidence · decay(primary event − failure)` with an
/// exponential decay over the lookback window. Ties break on shorter
/// length, then on larger minimum confidence.
pub fn rank_paths(
    graph: &CausalGraph,
    symptom_node_id: &str,
    lookback_nanos: i64,
    failure_ts: UnixNanos,
    max_paths: usize,
) -> Vec<RankedPath> {
    let spine_ids: Vec<&str> = graph
        .nodes
        .iter()
        .filter(|n| n.kind == CausalNodeKind::Spine)
        .map(|n| n.id.as_str())
        .collect();
    if !spine_ids.contains(&symptom_node_id) {
        return Vec::new();
    }

    // Spine adjacency, parent → children.
    let spine_edges: Vec<(&str, &str, f64)> = graph
        .edges
        .iter()
        .filter(|e| spine_ids.contains(&e.from.as_str()) && spine_ids.contains(&e.to.as_str()))
        .filter(|e| e.edge_type == "OWNS" || e.edge_type == "MANAGES")
        .map(|e| (e.from.as_str(), e.to.as_str(), e.confidence))
        .collect();

    let roots: Vec<&str> = spine_ids
        .iter()
        .copied()
        .filter(|id| !spine_edges.iter().any(|(_, to, _)| to == id))
        .collect();

    let mut paths: Vec<Vec<(String, f64)>> = Vec::new();
    for root in roots {
        let mut stack = vec![(root, vec![(root.to_string(), 1.0f64)])];
        while let Some((current, path)) = stack.pop() {
            if current == symptom_node_id {
                paths.push(path.clone());
                continue;
            }
            for (from, to, confidence) in &spine_edges {
                if *from != current {
                    continue;
                }
                if path.iter().any(|(id, _)| id == to) {
                    continue;
                }
                let mut next = path.clone();
                next.push(((*to).to_string(), *confidence));
                stack.push((*to, next));
            }
        }
    }

    let mut ranked: Vec<RankedPath> = paths
        .into_iter()
        .map(|path| score_path(graph, path, lookback_nanos, failure_ts))
        .collect();
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.node_ids.len().cmp(&b.node_ids.len()))
            .then(
                b.min_confidence
                    .partial_cmp(&a.min_confidence)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
    });
    ranked.truncate(max_paths);
    ranked
}

fn score_path(
    graph: &CausalGraph,
    path: Vec<(String, f64)>,
    lookback_nanos: i64,
    failure_ts: UnixNanos,
) -> RankedPath {
    let mut score = 0.0;
    let mut min_confidence = f64::MAX;
    // The first entry is the root itself and carries no edge.
    for (node_id, confidence) in path.iter().skip(1) {
        min_confidence = min_confidence.min(*confidence);
        let decay = graph
            .nodes
            .iter()
            .find(|n| &n.id == node_id)
            .and_then(|n| n.primary_event.as_ref())
            .map(|event| decay_factor(event.timestamp, failure_ts, lookback_nanos))
            // No recorded change: the step still counts, discounted as
            // if it happened a full lookback away.
            .unwrap_or_else(|| (-1.0f64).exp());
        score += confidence * decay;
    }
    if min_confidence == f64::MAX {
        min_confidence = 0.0;
    }

    let names: Vec<String> = path
        .iter()
        .filter_map(|(id, _)| graph.nodes.iter().find(|n| &n.id == id))
        .map(|n| format!("{}/{}", n.resource.kind, n.resource.name))
        .collect();
    RankedPath {
        node_ids: path.into_iter().map(|(id, _)| id).collect(),
        score,
        min_confidence,
        summary: names.join(" -> "),
    }
}

fn decay_factor(event_ts: UnixNanos, failure_ts: UnixNanos, lookback_nanos: i64) -> f64 {
    if lookback_nanos <= 0 {
        return 1.0;
    }
    let delta = (event_ts - failure_ts).abs() as f64;
    (-(delta / lookback_nanos as f64)).exp()
}
