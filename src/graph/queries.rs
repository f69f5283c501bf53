//! Query builders for every graph access the core performs, plus row
//! parsing back into typed values. Keeping the text here means no other
//! module ever embeds query syntax.

use serde_json::{json, Map, Value};

use crate::error::{Result, SpectreError};
use crate::graph::store::GraphQuery;
use crate::graph::{GraphEdge, GraphNode};
use crate::model::{ChangeRecord, UnixNanos};

/// Ownership chain: symptom plus its `OWNS`/`MANAGES` ancestors, with
/// distance 0 at the symptom itself.
pub fn ownership_chain(uid: &str, depth: u32) -> GraphQuery {
    GraphQuery::new(format!(
        "MATCH path = (r:Resource {{uid: $uid}})<-[:OWNS|MANAGES*0..{depth}]-(anc:Resource) \
         RETURN anc AS resource, length(path) AS distance ORDER BY distance"
    ))
    .param("uid", json!(uid))
    .param("depth", json!(depth))
}

/// `MANAGES` predecessors for a set of uids, with edge properties.
pub fn managers_for(uids: &[String]) -> GraphQuery {
    GraphQuery::new(
        "MATCH (m:Resource)-[e:MANAGES]->(r:Resource) WHERE r.uid IN $uids \
         RETURN r.uid AS managed, m AS manager, e AS edge",
    )
    .param("uids", json!(uids))
}

/// Side-relation neighbors for a set of uids, in either direction.
pub fn related_for(uids: &[String]) -> GraphQuery {
    GraphQuery::new(
        "MATCH (r:Resource)-[e:SCHEDULED_ON|USES_SERVICE_ACCOUNT|GRANTS_TO|REFERENCES_SPEC|INGRESS_REF|SELECTS]-(n:Resource) \
         WHERE r.uid IN $uids RETURN r.uid AS origin, e AS edge, n AS neighbor",
    )
    .param("uids", json!(uids))
}

/// Change records for a set of uids inside a window, ordered by time.
pub fn events_for(uids: &[String], start: UnixNanos, end: UnixNanos) -> GraphQuery {
    GraphQuery::new(
        "MATCH (r:Resource)-[:RECORDED]->(ev:ChangeEvent) \
         WHERE r.uid IN $uids AND ev.timestamp >= $start AND ev.timestamp <= $end \
         RETURN r.uid AS uid, ev AS event ORDER BY ev.timestamp",
    )
    .param("uids", json!(uids))
    .param("start", json!(start))
    .param("end", json!(end))
}

/// Attaches (or replaces, keyed by event id) a change record. This is a
/// write query and must bypass the result cache.
pub fn record_change_event(uid: &str, record: &ChangeRecord) -> Result<GraphQuery> {
    Ok(GraphQuery::new(
        "MERGE (ev:ChangeEvent {eventId: $event_id}) SET ev = $record \
         WITH ev MATCH (r:Resource {uid: $uid}) MERGE (r)-[:RECORDED]->(ev)",
    )
    .param("uid", json!(uid))
    .param("event_id", json!(record.event_id))
    .param("record", serde_json::to_value(record)?))
}

/// Secondary-address lookup when the uid is not known.
pub fn lookup_by_name(namespace: &str, kind: &str, name: &str) -> GraphQuery {
    GraphQuery::new(
        "MATCH (r:Resource {namespace: $namespace, kind: $kind, name: $name}) RETURN r AS resource",
    )
    .param("namespace", json!(namespace))
    .param("kind", json!(kind))
    .param("name", json!(name))
}

/// Label-selector search, optionally restricted to one namespace and
/// one kind. Used for Service selectors and manager back-references.
pub fn nodes_by_labels(
    namespace: Option<&str>,
    kind: Option<&str>,
    selector: &std::collections::BTreeMap<String, String>,
) -> GraphQuery {
    let mut query = GraphQuery::new(
        "MATCH (n:Resource) WHERE ALL(k IN keys($selector) WHERE n.labels[k] = $selector[k]) \
         AND ($namespace IS NULL OR n.namespace = $namespace) \
         AND ($kind IS NULL OR n.kind = $kind) RETURN n AS node",
    )
    .param("selector", json!(selector));
    query = query.param("namespace", namespace.map(|v| json!(v)).unwrap_or(Value::Null));
    query.param("kind", kind.map(|v| json!(v)).unwrap_or(Value::Null))
}

/// Namespace-scoped snapshot: every identity in the namespace plus the
/// edges between them, collected into a single row.
pub fn namespace_graph(namespace: &str) -> GraphQuery {
    GraphQuery::new(
        "MATCH (r:Resource {namespace: $namespace}) \
         OPTIONAL MATCH (r)-[e]->(m:Resource {namespace: $namespace}) \
         RETURN collect(DISTINCT r) AS nodes, collect(DISTINCT e) AS edges",
    )
    .param("namespace", json!(namespace))
}

pub fn parse_node(value: &Value) -> Result<GraphNode> {
    serde_json::from_value(value.clone())
        .map_err(|err| SpectreError::Serialization(format!("graph node row: {err}")))
}

pub fn parse_edge(value: &Value) -> Result<GraphEdge> {
    serde_json::from_value(value.clone())
        .map_err(|err| SpectreError::Serialization(format!("graph edge row: {err}")))
}

pub fn parse_change_record(value: &Value) -> Result<ChangeRecord> {
    serde_json::from_value(value.clone())
        .map_err(|err| SpectreError::Serialization(format!("change record row: {err}")))
}

/// One ownership-chain row.
#[derive(Debug, Clone)]
pub struct ChainEntry {
    pub node: GraphNode,
    pub distance: u32,
}

pub fn parse_chain(rows: &[Map<String, Value>]) -> Result<Vec<ChainEntry>> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let node = parse_node(row.get("resource").ok_or_else(|| {
            SpectreError::Serialization("chain row missing resource column".into())
        })?)?;
        let distance = row
            .get("distance")
            .and_then(Value::as_u64)
            .ok_or_else(|| SpectreError::Serialization("chain row missing distance".into()))?
            as u32;
        out.push(ChainEntry { node, distance });
    }
    out.sort_by_key(|entry| entry.distance);
    Ok(out)
}
