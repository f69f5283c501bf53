//! Relationship graph: entities, the store contract, the embedded
//! in-memory store, the cached client, and the extraction pipeline.

pub mod cache;
pub mod extract;
pub mod memory;
pub mod pipeline;
pub mod queries;
pub mod store;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SpectreError;
use crate::model::{Event, EventKind, ResourceRef, UnixNanos};

pub use cache::{CacheCounters, CachedGraphClient, LookupCache};
pub use memory::MemoryGraphStore;
pub use pipeline::{GraphPipeline, PipelineWorker};
pub use store::{GraphQuery, GraphStats, GraphStore, QueryResult};

/// Typed relations between identity nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeType {
    #[serde(rename = "OWNS")]
    Owns,
    #[serde(rename = "MANAGES")]
    Manages,
    #[serde(rename = "SCHEDULED_ON")]
    ScheduledOn,
    #[serde(rename = "USES_SERVICE_ACCOUNT")]
    UsesServiceAccount,
    #[serde(rename = "GRANTS_TO")]
    GrantsTo,
    #[serde(rename = "REFERENCES_SPEC")]
    ReferencesSpec,
    #[serde(rename = "SELECTS")]
    Selects,
    #[serde(rename = "INGRESS_REF")]
    IngressRef,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::Owns => "OWNS",
            EdgeType::Manages => "MANAGES",
            EdgeType::ScheduledOn => "SCHEDULED_ON",
            EdgeType::UsesServiceAccount => "USES_SERVICE_ACCOUNT",
            EdgeType::GrantsTo => "GRANTS_TO",
            EdgeType::ReferencesSpec => "REFERENCES_SPEC",
            EdgeType::Selects => "SELECTS",
            EdgeType::IngressRef => "INGRESS_REF",
        }
    }
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EdgeType {
    type Err = SpectreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OWNS" => Ok(EdgeType::Owns),
            "MANAGES" => Ok(EdgeType::Manages),
            "SCHEDULED_ON" => Ok(EdgeType::ScheduledOn),
            "USES_SERVICE_ACCOUNT" => Ok(EdgeType::UsesServiceAccount),
            "GRANTS_TO" => Ok(EdgeType::GrantsTo),
            "REFERENCES_SPEC" => Ok(EdgeType::ReferencesSpec),
            "SELECTS" => Ok(EdgeType::Selects),
            "INGRESS_REF" => Ok(EdgeType::IngressRef),
            other => Err(SpectreError::Validation(format!("unknown edge type {other}"))),
        }
    }
}

/// A keyed observation supporting an edge's existence.
///
/// Evidence is append-only; duplicates are collapsed by
/// `(evidence_type, key, match_value)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub evidence_type: String,
    pub value: String,
    pub weight: f64,
    pub timestamp: UnixNanos,
    pub key: String,
    pub match_value: String,
}

impl Evidence {
    fn dedup_key(&self) -> (String, String, String) {
        (
            self.evidence_type.clone(),
            self.key.clone(),
            self.match_value.clone(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationState {
    Pending,
    Valid,
    Stale,
}

/// Resource identity node, keyed by uid and addressable by
/// `{namespace, kind, name}` when the uid is unknown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub uid: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub first_seen: UnixNanos,
    pub last_seen: UnixNanos,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<UnixNanos>,
}

impl GraphNode {
    /// Identity node derived from an event; sets the deleted flag for
    /// delete events.
    pub fn from_event(event: &Event) -> Self {
        Self {
            uid: event.resource.uid.clone(),
            group: event.resource.group.clone(),
            version: event.resource.version.clone(),
            kind: event.resource.kind.clone(),
            namespace: event.resource.namespace.clone(),
            name: event.resource.name.clone(),
            labels: crate::k8s::labels(&event.payload),
            first_seen: event.timestamp,
            last_seen: event.timestamp,
            deleted: event.kind == EventKind::Delete,
            deleted_at: (event.kind == EventKind::Delete).then_some(event.timestamp),
        }
    }

    /// Placeholder for a node referenced before its own event arrived.
    pub fn stub(uid: &str, kind: &str, namespace: &str, name: &str, seen: UnixNanos) -> Self {
        Self {
            uid: uid.to_string(),
            group: String::new(),
            version: String::new(),
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            labels: BTreeMap::new(),
            first_seen: seen,
            last_seen: seen,
            deleted: false,
            deleted_at: None,
        }
    }

    pub fn resource_ref(&self) -> ResourceRef {
        ResourceRef {
            group: self.group.clone(),
            version: self.version.clone(),
            kind: self.kind.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
        }
    }

    pub fn name_key(&self) -> String {
        ResourceRef::state_key_for(&self.namespace, &self.kind, &self.name)
    }

    /// Upsert merge: sightings only ever widen the seen window; labels
    /// follow the latest event; deletion is recorded, not erased.
    pub fn merge_from(&mut self, incoming: &GraphNode) {
        if incoming.first_seen < self.first_seen {
            self.first_seen = incoming.first_seen;
        }
        if incoming.last_seen >= self.last_seen {
            self.last_seen = incoming.last_seen;
            if !incoming.labels.is_empty() {
                self.labels = incoming.labels.clone();
            }
            if !incoming.group.is_empty() {
                self.group = incoming.group.clone();
            }
            if !incoming.version.is_empty() {
                self.version = incoming.version.clone();
            }
        }
        if incoming.deleted {
            self.deleted = true;
            self.deleted_at = incoming.deleted_at.or(self.deleted_at);
        }
    }
}

/// Typed directed relation with evidence and confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub edge_type: EdgeType,
    pub from_uid: String,
    pub to_uid: String,
    pub confidence: f64,
    pub evidence: Vec<Evidence>,
    pub first_observed: UnixNanos,
    pub last_validated: UnixNanos,
    pub state: ValidationState,
}

impl GraphEdge {
    pub fn new(edge_type: EdgeType, from_uid: &str, to_uid: &str, evidence: Evidence) -> Self {
        let confidence = evidence.weight;
        let ts = evidence.timestamp;
        Self {
            edge_type,
            from_uid: from_uid.to_string(),
            to_uid: to_uid.to_string(),
            confidence,
            evidence: vec![evidence],
            first_observed: ts,
            last_validated: ts,
            state: ValidationState::Valid,
        }
    }

    /// Upsert key `(type, from, to)`.
    pub fn identity_key(&self) -> (EdgeType, String, String) {
        (self.edge_type, self.from_uid.clone(), self.to_uid.clone())
    }

    /// Idempotent merge: evidence deduplicated by
    /// `(type, key, match value)`, `last_validated` advances, confidence
    /// is the maximum weight of any current evidence item.
    pub fn merge_from(&mut self, incoming: &GraphEdge) {
        for item in &incoming.evidence {
            let key = item.dedup_key();
            match self.evidence.iter_mut().find(|e| e.dedup_key() == key) {
                Some(existing) => {
                    if item.timestamp > existing.timestamp {
                        existing.timestamp = item.timestamp;
                        existing.value = item.value.clone();
                        existing.weight = item.weight;
                    }
                }
                None => self.evidence.push(item.clone()),
            }
        }
        if incoming.first_observed < self.first_observed {
            self.first_observed = incoming.first_observed;
        }
        if incoming.last_validated > self.last_validated {
            self.last_validated = incoming.last_validated;
        }
        self.state = ValidationState::Valid;
        self.confidence = self
            .evidence
            .iter()
            .map(|e| e.weight)
            .fold(0.0, f64::max)
            .clamp(0.0, 1.0);
    }
}
