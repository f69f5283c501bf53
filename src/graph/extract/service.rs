use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::graph::extract::{evidence, weights, Extractor, ExtractorOutput, Resolver};
use crate::graph::{EdgeType, GraphEdge};
use crate::k8s;
use crate::model::{Event, EventKind};

/// Service `spec.selector` resolved against current pod identities,
/// producing `SELECTS` edges from the service to each matched pod.
pub struct ServiceSelectorExtractor;

#[async_trait]
impl Extractor for ServiceSelectorExtractor {
    fn name(&self) -> &'static str {
        "service-selector"
    }

    fn priority(&self) -> i32 {
        40
    }

    fn matches(&self, event: &Event) -> bool {
        event.resource.kind == "Service"
            && event.kind != EventKind::Delete
            && k8s::field(&event.payload, "spec.selector")
                .and_then(Value::as_object)
                .is_some_and(|m| !m.is_empty())
    }

    async fn extract(&self, event: &Event, resolver: &Resolver) -> Result<ExtractorOutput> {
        let mut output = ExtractorOutput::default();
        let mut selector = BTreeMap::new();
        if let Some(map) = k8s::field(&event.payload, "spec.selector").and_then(Value::as_object) {
            for (k, v) in map {
                if let Some(s) = v.as_str() {
                    selector.insert(k.clone(), s.to_string());
                }
            }
        }
        if selector.is_empty() {
            return Ok(output);
        }
        let selector_text = selector
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");

        let pods = resolver
            .nodes_by_labels(Some(&event.resource.namespace), Some("Pod"), &selector)
            .await?;
        for pod in pods {
            output.edges.push(GraphEdge::new(
                EdgeType::Selects,
                &event.resource.uid,
                &pod.uid,
                evidence(
                    "labelSelector",
                    "spec.selector",
                    &selector_text,
                    &pod.uid,
                    weights::LABEL_MATCH,
                    event.timestamp,
                ),
            ));
        }
        Ok(output)
    }
}

/// Ingress backend references: `spec.rules[*].http.paths[*].backend.service`
/// and `spec.defaultBackend.service` produce `INGRESS_REF` edges from the
/// ingress to the referenced service.
pub struct IngressExtractor;

#[async_trait]
impl Extractor for IngressExtractor {
    fn name(&self) -> &'static str {
        "ingress-backends"
    }

    fn priority(&self) -> i32 {
        45
    }

    fn matches(&self, event: &Event) -> bool {
        event.resource.kind == "Ingress" && event.kind != EventKind::Delete
    }

    async fn extract(&self, event: &Event, resolver: &Resolver) -> Result<ExtractorOutput> {
        let mut output = ExtractorOutput::default();
        let ns = event.resource.namespace.as_str();

        let mut backends: Vec<(String, String)> = Vec::new();
        if let Some(name) = k8s::field_str(&event.payload, "spec.defaultBackend.service.name") {
            backends.push(("spec.defaultBackend.service.name".to_string(), name.to_string()));
        }
        if let Some(rules) = k8s::field(&event.payload, "spec.rules").and_then(Value::as_array) {
            for (ri, rule) in rules.iter().enumerate() {
                let Some(paths) = k8s::field(rule, "http.paths").and_then(Value::as_array) else {
                    continue;
                };
                for (pi, path) in paths.iter().enumerate() {
                    if let Some(name) = k8s::field_str(path, "backend.service.name") {
                        backends.push((
                            format!("spec.rules.{ri}.http.paths.{pi}.backend.service.name"),
                            name.to_string(),
                        ));
                    }
                }
            }
        }
        backends.sort_by(|a, b| a.1.cmp(&b.1));
        backends.dedup_by(|a, b| a.1 == b.1);

        for (key, name) in backends {
            if let Some(service) = resolver.resolve_by_name(ns, "Service", &name).await? {
                output.edges.push(GraphEdge::new(
                    EdgeType::IngressRef,
                    &event.resource.uid,
                    &service.uid,
                    evidence(
                        "backendRef",
                        &key,
                        &name,
                        &service.uid,
                        weights::NAME_REFERENCE,
                        event.timestamp,
                    ),
                ));
            }
        }
        Ok(output)
    }
}
