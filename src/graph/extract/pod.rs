use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::graph::extract::{evidence, weights, Extractor, ExtractorOutput, Resolver};
use crate::graph::{EdgeType, GraphEdge};
use crate::k8s;
use crate::model::{Event, EventKind};

/// Pod scheduling relations: `SCHEDULED_ON` for the assigned node,
/// `USES_SERVICE_ACCOUNT`, and `REFERENCES_SPEC` for every configmap or
/// secret reachable from volumes, envFrom, or env valueFrom.
///
/// Targets are resolved by name against current identities; anything
/// still unknown produces no edge and is picked up by a later event.
pub struct PodExtractor;

#[async_trait]
impl Extractor for PodExtractor {
    fn name(&self) -> &'static str {
        "pod-scheduling"
    }

    fn priority(&self) -> i32 {
        20
    }

    fn matches(&self, event: &Event) -> bool {
        event.resource.kind == "Pod" && event.kind != EventKind::Delete
    }

    async fn extract(&self, event: &Event, resolver: &Resolver) -> Result<ExtractorOutput> {
        let mut output = ExtractorOutput::default();
        let pod_uid = event.resource.uid.as_str();
        let ns = event.resource.namespace.as_str();
        let ts = event.timestamp;

        if let Some(node_name) = k8s::field_str(&event.payload, "spec.nodeName") {
            if let Some(node) = resolver.resolve_by_name("", "Node", node_name).await? {
                output.edges.push(GraphEdge::new(
                    EdgeType::ScheduledOn,
                    pod_uid,
                    &node.uid,
                    evidence(
                        "specField",
                        "spec.nodeName",
                        node_name,
                        &node.uid,
                        weights::NAME_REFERENCE,
                        ts,
                    ),
                ));
            }
        }

        if let Some(sa_name) = k8s::field_str(&event.payload, "spec.serviceAccountName") {
            if let Some(sa) = resolver.resolve_by_name(ns, "ServiceAccount", sa_name).await? {
                output.edges.push(GraphEdge::new(
                    EdgeType::UsesServiceAccount,
                    pod_uid,
                    &sa.uid,
                    evidence(
                        "specField",
                        "spec.serviceAccountName",
                        sa_name,
                        &sa.uid,
                        weights::NAME_REFERENCE,
                        ts,
                    ),
                ));
            }
        }

        for (kind, key, name) in spec_references(&event.payload) {
            if let Some(target) = resolver.resolve_by_name(ns, kind, &name).await? {
                output.edges.push(GraphEdge::new(
                    EdgeType::ReferencesSpec,
                    pod_uid,
                    &target.uid,
                    evidence("specField", &key, &name, &target.uid, weights::NAME_REFERENCE, ts),
                ));
            }
        }
        Ok(output)
    }
}

/// Collects every `(kind, spec path, name)` configmap/secret reference
/// in a pod spec: volume sources, container envFrom, and env valueFrom.
fn spec_references(payload: &Value) -> Vec<(&'static str, String, String)> {
    let mut out = Vec::new();

    if let Some(volumes) = k8s::field(payload, "spec.volumes").and_then(Value::as_array) {
        for (i, volume) in volumes.iter().enumerate() {
            if let Some(name) = k8s::field_str(volume, "configMap.name") {
                out.push((
                    "ConfigMap",
                    format!("spec.volumes.{i}.configMap.name"),
                    name.to_string(),
                ));
            }
            if let Some(name) = k8s::field_str(volume, "secret.secretName") {
                out.push((
                    "Secret",
                    format!("spec.volumes.{i}.secret.secretName"),
                    name.to_string(),
                ));
            }
        }
    }

    for (containers_path, containers) in [
        ("spec.containers", k8s::field(payload, "spec.containers")),
        ("spec.initContainers", k8s::field(payload, "spec.initContainers")),
    ] {
        let Some(containers) = containers.and_then(Value::as_array) else {
            continue;
        };
        for (ci, container) in containers.iter().enumerate() {
            if let Some(env_from) = container.get("envFrom").and_then(Value::as_array) {
                for (ei, source) in env_from.iter().enumerate() {
                    if let Some(name) = k8s::field_str(source, "configMapRef.name") {
                        out.push((
                            "ConfigMap",
                            format!("{containers_path}.{ci}.envFrom.{ei}.configMapRef.name"),
                            name.to_string(),
                        ));
                    }
                    if let Some(name) = k8s::field_str(source, "secretRef.name") {
                        out.push((
                            "Secret",
                            format!("{containers_path}.{ci}.envFrom.{ei}.secretRef.name"),
                            name.to_string(),
                        ));
                    }
                }
            }
            if let Some(env) = container.get("env").and_then(Value::as_array) {
                for (ei, var) in env.iter().enumerate() {
                    if let Some(name) = k8s::field_str(var, "valueFrom.configMapKeyRef.name") {
                        out.push((
                            "ConfigMap",
                            format!("{containers_path}.{ci}.env.{ei}.valueFrom.configMapKeyRef.name"),
                            name.to_string(),
                        ));
                    }
                    if let Some(name) = k8s::field_str(var, "valueFrom.secretKeyRef.name") {
                        out.push((
                            "Secret",
                            format!("{containers_path}.{ci}.env.{ei}.valueFrom.secretKeyRef.name"),
                            name.to_string(),
                        ));
                    }
                }
            }
        }
    }

    // The same target referenced through several paths still produces a
    // single edge; evidence carries the first path seen.
    out.sort_by(|a, b| (a.0, &a.2).cmp(&(b.0, &b.2)));
    out.dedup_by(|a, b| a.0 == b.0 && a.2 == b.2);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn collects_volume_env_and_env_from_references() {
        let payload = json!({
            "spec": {
                "volumes": [
                    {"name": "cfg", "configMap": {"name": "app-config"}},
                    {"name": "creds", "secret": {"secretName": "db-creds"}}
                ],
                "containers": [{
                    "name": "app",
                    "envFrom": [{"configMapRef": {"name": "env-config"}}],
                    "env": [{"name": "TOKEN", "valueFrom": {"secretKeyRef": {"name": "db-creds", "key": "token"}}}]
                }]
            }
        });
        let refs = spec_references(&payload);
        let names: Vec<_> = refs.iter().map(|(k, _, n)| (*k, n.as_str())).collect();
        assert!(names.contains(&("ConfigMap", "app-config")));
        assert!(names.contains(&("ConfigMap", "env-config")));
        assert!(names.contains(&("Secret", "db-creds")));
        // db-creds appears twice in the spec but only once here.
        assert_eq!(refs.len(), 3);
    }
}
