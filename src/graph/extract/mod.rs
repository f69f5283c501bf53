//! Extractor families that turn events into graph writes.
//!
//! Extractors are capability sets selected by configuration, never
//! subclassed: `{name, priority, matches, extract}`. Lower priority
//! runs first. An extractor that cannot resolve a referenced target
//! returns no output and no error; a later event is expected to
//! re-resolve it.

mod identity;
mod manager;
mod owner;
mod pod;
mod rbac;
mod service;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use smallvec::SmallVec;

use crate::error::Result;
use crate::graph::cache::{CachedGraphClient, LookupCache};
use crate::graph::{queries, GraphEdge, GraphNode};
use crate::model::Event;

pub use identity::IdentityExtractor;
pub use manager::{ManagedResourceExtractor, ManagerReverseExtractor};
pub use owner::OwnerReferencesExtractor;
pub use pod::PodExtractor;
pub use rbac::RbacExtractor;
pub use service::{IngressExtractor, ServiceSelectorExtractor};

/// Node and edge upserts produced for one event by one extractor.
#[derive(Debug, Default)]
pub struct ExtractorOutput {
    pub nodes: SmallVec<[GraphNode; 2]>,
    pub edges: SmallVec<[GraphEdge; 4]>,
}

impl ExtractorOutput {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }
}

/// Reference resolution shared by extractors: lookup cache first, then
/// the graph store.
pub struct Resolver {
    client: Arc<CachedGraphClient>,
    lookup: Arc<LookupCache>,
}

impl Resolver {
    pub fn new(client: Arc<CachedGraphClient>, lookup: Arc<LookupCache>) -> Self {
        Self { client, lookup }
    }

    pub fn lookup_cache(&self) -> &Arc<LookupCache> {
        &self.lookup
    }

    /// Resolves `{namespace, kind, name}` to an identity node, if that
    /// resource has been sighted already.
    ///
    /// The lookup cache is the only caching layer here; the query-result
    /// cache is bypassed because a cached negative would stop a later
    /// event from re-resolving the reference.
    pub async fn resolve_by_name(
        &self,
        namespace: &str,
        kind: &str,
        name: &str,
    ) -> Result<Option<GraphNode>> {
        let key = crate::model::ResourceRef::state_key_for(namespace, kind, name);
        if let Some(node) = self.lookup.get_by_name(&key) {
            return Ok(Some(node));
        }
        let result = self
            .client
            .store()
            .execute_query(queries::lookup_by_name(namespace, kind, name))
            .await?;
        let Some(row) = result.rows.first() else {
            return Ok(None);
        };
        let Some(value) = row.get("resource") else {
            return Ok(None);
        };
        let node = queries::parse_node(value)?;
        self.lookup.put(node.clone());
        Ok(Some(node))
    }

    /// Label-selector search, always against the current identity nodes.
    pub async fn nodes_by_labels(
        &self,
        namespace: Option<&str>,
        kind: Option<&str>,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<GraphNode>> {
        let result = self
            .client
            .store()
            .execute_query(queries::nodes_by_labels(namespace, kind, selector))
            .await?;
        let mut nodes = Vec::with_capacity(result.rows.len());
        for row in &result.rows {
            if let Some(value) = row.get("node") {
                nodes.push(queries::parse_node(value)?);
            }
        }
        Ok(nodes)
    }
}

#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lower runs first.
    fn priority(&self) -> i32;

    fn matches(&self, event: &Event) -> bool;

    async fn extract(&self, event: &Event, resolver: &Resolver) -> Result<ExtractorOutput>;
}

/// The standard extractor set, in priority order.
pub fn default_extractors() -> Vec<Box<dyn Extractor>> {
    let mut extractors: Vec<Box<dyn Extractor>> = vec![
        Box::new(IdentityExtractor),
        Box::new(OwnerReferencesExtractor),
        Box::new(PodExtractor),
        Box::new(RbacExtractor),
        Box::new(ServiceSelectorExtractor),
        Box::new(IngressExtractor),
        Box::new(ManagedResourceExtractor),
        Box::new(ManagerReverseExtractor),
    ];
    extractors.sort_by_key(|e| e.priority());
    extractors
}

/// Standard evidence weights by how direct the observation is.
pub(crate) mod weights {
    /// An explicit uid reference in the payload.
    pub const UID_REFERENCE: f64 = 1.0;
    /// A name reference resolved against current identities.
    pub const NAME_REFERENCE: f64 = 0.9;
    /// A label-selector match.
    pub const LABEL_MATCH: f64 = 0.8;
}

pub(crate) fn evidence(
    evidence_type: &str,
    key: &str,
    value: &str,
    match_value: &str,
    weight: f64,
    timestamp: crate::model::UnixNanos,
) -> crate::graph::Evidence {
    crate::graph::Evidence {
        evidence_type: evidence_type.to_string(),
        value: value.to_string(),
        weight,
        timestamp,
        key: key.to_string(),
        match_value: match_value.to_string(),
    }
}
