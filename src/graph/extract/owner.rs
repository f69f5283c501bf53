use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::graph::extract::{evidence, weights, Extractor, ExtractorOutput, Resolver};
use crate::graph::{EdgeType, GraphEdge, GraphNode};
use crate::k8s;
use crate::model::Event;

/// Emits `OWNS` edges from each `metadata.ownerReferences[*].uid` to the
/// event's resource. Owner references carry uid, kind, and name, so no
/// resolution is needed; a stub node stands in for owners not yet seen.
pub struct OwnerReferencesExtractor;

#[async_trait]
impl Extractor for OwnerReferencesExtractor {
    fn name(&self) -> &'static str {
        "owner-references"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn matches(&self, event: &Event) -> bool {
        k8s::field(&event.payload, "metadata.ownerReferences")
            .and_then(Value::as_array)
            .is_some_and(|refs| !refs.is_empty())
    }

    async fn extract(&self, event: &Event, _resolver: &Resolver) -> Result<ExtractorOutput> {
        let mut output = ExtractorOutput::default();
        let Some(refs) = k8s::field(&event.payload, "metadata.ownerReferences").and_then(Value::as_array)
        else {
            return Ok(output);
        };
        for owner_ref in refs {
            let Some(owner_uid) = owner_ref.get("uid").and_then(Value::as_str) else {
                continue;
            };
            let owner_kind = owner_ref.get("kind").and_then(Value::as_str).unwrap_or("");
            let owner_name = owner_ref.get("name").and_then(Value::as_str).unwrap_or("");
            output.nodes.push(GraphNode::stub(
                owner_uid,
                owner_kind,
                &event.resource.namespace,
                owner_name,
                event.timestamp,
            ));
            output.edges.push(GraphEdge::new(
                EdgeType::Owns,
                owner_uid,
                &event.resource.uid,
                evidence(
                    "ownerReference",
                    "metadata.ownerReferences",
                    owner_name,
                    owner_uid,
                    weights::UID_REFERENCE,
                    event.timestamp,
                ),
            ));
        }
        Ok(output)
    }
}
