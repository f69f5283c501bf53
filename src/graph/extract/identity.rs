use async_trait::async_trait;
use smallvec::smallvec;

use crate::error::Result;
use crate::graph::extract::{Extractor, ExtractorOutput, Resolver};
use crate::graph::GraphNode;
use crate::model::{Event, EventKind};

/// Upserts the event's own resource identity. Runs before every other
/// extractor so reference resolution can find the freshest state.
pub struct IdentityExtractor;

#[async_trait]
impl Extractor for IdentityExtractor {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn priority(&self) -> i32 {
        0
    }

    fn matches(&self, _event: &Event) -> bool {
        true
    }

    async fn extract(&self, event: &Event, resolver: &Resolver) -> Result<ExtractorOutput> {
        let node = GraphNode::from_event(event);
        if event.kind == EventKind::Delete {
            resolver
                .lookup_cache()
                .invalidate(&node.uid, &node.name_key());
        } else {
            resolver.lookup_cache().put(node.clone());
        }
        Ok(ExtractorOutput {
            nodes: smallvec![node],
            edges: smallvec![],
        })
    }
}
