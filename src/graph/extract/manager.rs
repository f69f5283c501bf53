use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::graph::extract::{evidence, weights, Extractor, ExtractorOutput, Resolver};
use crate::graph::{EdgeType, GraphEdge, GraphNode};
use crate::model::{Event, EventKind};

const HELM_NAME_LABEL: &str = "helm.toolkit.fluxcd.io/name";
const HELM_NAMESPACE_LABEL: &str = "helm.toolkit.fluxcd.io/namespace";
const KUSTOMIZE_NAME_LABEL: &str = "kustomize.toolkit.fluxcd.io/name";
const KUSTOMIZE_NAMESPACE_LABEL: &str = "kustomize.toolkit.fluxcd.io/namespace";

/// Declared manager identity extracted from a managed resource's labels.
fn declared_manager(event: &Event) -> Option<(&'static str, String, String, &'static str)> {
    let labels = crate::k8s::labels(&event.payload);
    if let (Some(name), Some(ns)) = (labels.get(HELM_NAME_LABEL), labels.get(HELM_NAMESPACE_LABEL)) {
        return Some(("HelmRelease", ns.clone(), name.clone(), HELM_NAME_LABEL));
    }
    if let (Some(name), Some(ns)) = (
        labels.get(KUSTOMIZE_NAME_LABEL),
        labels.get(KUSTOMIZE_NAMESPACE_LABEL),
    ) {
        return Some(("Kustomization", ns.clone(), name.clone(), KUSTOMIZE_NAME_LABEL));
    }
    None
}

/// Resources carrying manager labels (Flux HelmRelease / Kustomization)
/// produce a `MANAGES` edge from the manager to the managed resource.
/// An unresolved manager yields nothing; the reverse extractor covers
/// the manager-arrives-later ordering.
pub struct ManagedResourceExtractor;

#[async_trait]
impl Extractor for ManagedResourceExtractor {
    fn name(&self) -> &'static str {
        "managed-resource"
    }

    fn priority(&self) -> i32 {
        50
    }

    fn matches(&self, event: &Event) -> bool {
        event.kind != EventKind::Delete && declared_manager(event).is_some()
    }

    async fn extract(&self, event: &Event, resolver: &Resolver) -> Result<ExtractorOutput> {
        let mut output = ExtractorOutput::default();
        let Some((manager_kind, manager_ns, manager_name, label_key)) = declared_manager(event)
        else {
            return Ok(output);
        };
        let Some(manager) = resolver
            .resolve_by_name(&manager_ns, manager_kind, &manager_name)
            .await?
        else {
            return Ok(output);
        };
        output.edges.push(manages_edge(
            &manager,
            &event.resource.uid,
            label_key,
            &manager_name,
            event.timestamp,
        ));
        Ok(output)
    }
}

/// The reverse ordering: when a manager itself appears (or updates),
/// re-attach every resource that declares it through labels. Priority is
/// strictly greater than the forward extractor.
pub struct ManagerReverseExtractor;

#[async_trait]
impl Extractor for ManagerReverseExtractor {
    fn name(&self) -> &'static str {
        "manager-reverse"
    }

    fn priority(&self) -> i32 {
        60
    }

    fn matches(&self, event: &Event) -> bool {
        matches!(event.resource.kind.as_str(), "HelmRelease" | "Kustomization")
            && event.kind != EventKind::Delete
    }

    async fn extract(&self, event: &Event, resolver: &Resolver) -> Result<ExtractorOutput> {
        let mut output = ExtractorOutput::default();
        let (name_label, ns_label) = match event.resource.kind.as_str() {
            "HelmRelease" => (HELM_NAME_LABEL, HELM_NAMESPACE_LABEL),
            "Kustomization" => (KUSTOMIZE_NAME_LABEL, KUSTOMIZE_NAMESPACE_LABEL),
            _ => return Ok(output),
        };
        let mut selector = BTreeMap::new();
        selector.insert(name_label.to_string(), event.resource.name.clone());
        selector.insert(ns_label.to_string(), event.resource.namespace.clone());

        let manager = GraphNode::from_event(event);
        for managed in resolver.nodes_by_labels(None, None, &selector).await? {
            if managed.uid == manager.uid {
                continue;
            }
            output.edges.push(manages_edge(
                &manager,
                &managed.uid,
                name_label,
                &event.resource.name,
                event.timestamp,
            ));
        }
        Ok(output)
    }
}

fn manages_edge(
    manager: &GraphNode,
    managed_uid: &str,
    label_key: &str,
    manager_name: &str,
    timestamp: crate::model::UnixNanos,
) -> GraphEdge {
    GraphEdge::new(
        EdgeType::Manages,
        &manager.uid,
        managed_uid,
        evidence(
            "managerLabel",
            label_key,
            manager_name,
            managed_uid,
            weights::LABEL_MATCH,
            timestamp,
        ),
    )
}
