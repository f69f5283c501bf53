use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::graph::extract::{evidence, weights, Extractor, ExtractorOutput, Resolver};
use crate::graph::{EdgeType, GraphEdge, GraphNode};
use crate::k8s;
use crate::model::{Event, EventKind};

/// RoleBinding / ClusterRoleBinding subjects produce `GRANTS_TO` edges
/// from the binding to each referenced serviceaccount or user. Users
/// have no cluster uid, so they get a synthetic `user:` identity.
pub struct RbacExtractor;

#[async_trait]
impl Extractor for RbacExtractor {
    fn name(&self) -> &'static str {
        "rbac-bindings"
    }

    fn priority(&self) -> i32 {
        30
    }

    fn matches(&self, event: &Event) -> bool {
        matches!(event.resource.kind.as_str(), "RoleBinding" | "ClusterRoleBinding")
            && event.kind != EventKind::Delete
    }

    async fn extract(&self, event: &Event, resolver: &Resolver) -> Result<ExtractorOutput> {
        let mut output = ExtractorOutput::default();
        let Some(subjects) = k8s::field(&event.payload, "subjects").and_then(Value::as_array) else {
            return Ok(output);
        };
        for (i, subject) in subjects.iter().enumerate() {
            let kind = subject.get("kind").and_then(Value::as_str).unwrap_or("");
            let Some(name) = subject.get("name").and_then(Value::as_str) else {
                continue;
            };
            let key = format!("subjects.{i}");
            match kind {
                "ServiceAccount" => {
                    let ns = subject
                        .get("namespace")
                        .and_then(Value::as_str)
                        .unwrap_or(&event.resource.namespace);
                    if let Some(sa) = resolver.resolve_by_name(ns, "ServiceAccount", name).await? {
                        output.edges.push(GraphEdge::new(
                            EdgeType::GrantsTo,
                            &event.resource.uid,
                            &sa.uid,
                            evidence(
                                "subjectRef",
                                &key,
                                name,
                                &sa.uid,
                                weights::NAME_REFERENCE,
                                event.timestamp,
                            ),
                        ));
                    }
                }
                "User" => {
                    let user_uid = format!("user:{name}");
                    output.nodes.push(GraphNode::stub(
                        &user_uid,
                        "User",
                        "",
                        name,
                        event.timestamp,
                    ));
                    output.edges.push(GraphEdge::new(
                        EdgeType::GrantsTo,
                        &event.resource.uid,
                        &user_uid,
                        evidence(
                            "subjectRef",
                            &key,
                            name,
                            &user_uid,
                            weights::NAME_REFERENCE,
                            event.timestamp,
                        ),
                    ));
                }
                _ => {}
            }
        }
        Ok(output)
    }
}
