//! Change anomalies: classified mutations derived from event diffs,
//! with routine churn filtered out before anything is emitted.

use std::cmp::Ordering;

use serde_json::{json, Value};

use crate::anomaly::{anomaly, Detector, DetectorInput, ResourceEvent};
use crate::model::{Anomaly, AnomalyCategory, ChangeRecord, EventKind, FieldChange};

const WORKLOAD_KINDS: [&str; 3] = ["Deployment", "StatefulSet", "DaemonSet"];
const RBAC_KINDS: [&str; 4] = ["Role", "ClusterRole", "RoleBinding", "ClusterRoleBinding"];

pub struct ChangeDetector;

impl Detector for ChangeDetector {
    fn name(&self) -> &'static str {
        "change"
    }

    fn detect(&self, input: &DetectorInput<'_>) -> Vec<Anomaly> {
        let mut out = Vec::new();
        let kind = input.resource.kind.as_str();

        for event in input.events {
            if !input.window.contains(event.timestamp) {
                continue;
            }

            if event.kind == EventKind::Create
                && (WORKLOAD_KINDS.contains(&kind) || RBAC_KINDS.contains(&kind))
            {
                out.push(anomaly(
                    input.resource,
                    AnomalyCategory::Change,
                    "ResourceCreated",
                    event.timestamp,
                    format!("{kind} {} was created", input.resource.name),
                    Value::Null,
                ));
                continue;
            }

            let Some(change) = &event.change else { continue };
            if change.diff.is_empty() || is_routine_churn(kind, change) {
                continue;
            }
            classify_mutation(input, event, change, &mut out);
        }
        out
    }
}

/// Churn suppression: replica-count-only edits, status-only edits, and
/// for ReplicaSets the rollout bookkeeping the deployment controller
/// writes on every scale step.
fn is_routine_churn(kind: &str, change: &ChangeRecord) -> bool {
    let only_replicas = change.diff.iter().all(|c| is_replica_path(&c.path));
    if only_replicas {
        return true;
    }
    let only_status = change.diff.iter().all(|c| crate::k8s::is_status_path(&c.path));
    if only_status {
        return true;
    }
    if kind == "ReplicaSet" {
        return change.diff.iter().all(|c| {
            c.path.starts_with("metadata.annotations.deployment.kubernetes.io/")
                || is_replica_path(&c.path)
                || crate::k8s::is_status_path(&c.path)
        });
    }
    false
}

fn is_replica_path(path: &str) -> bool {
    path == "spec.replicas" || (path.starts_with("status.") && path.contains("replicas"))
}

fn classify_mutation(
    input: &DetectorInput<'_>,
    event: &ResourceEvent,
    change: &ChangeRecord,
    out: &mut Vec<Anomaly>,
) {
    let kind = input.resource.kind.as_str();
    let paths: Vec<&str> = change.diff.iter().map(|c| c.path.as_str()).collect();

    if kind == "HelmRelease" {
        if let Some(anomaly) = classify_helm(input, event, change) {
            out.push(anomaly);
            return;
        }
    }

    if let Some(image_change) = find_image_change(&change.diff) {
        out.push(anomaly(
            input.resource,
            AnomalyCategory::Change,
            "ImageChanged",
            event.timestamp,
            format!("{kind} {} changed a container image", input.resource.name),
            image_change,
        ));
        return;
    }

    if paths.iter().any(|p| p.contains(".env") || p.contains("envFrom")) {
        out.push(anomaly(
            input.resource,
            AnomalyCategory::Change,
            "EnvironmentChanged",
            event.timestamp,
            format!("{kind} {} changed container environment", input.resource.name),
            json!({"paths": paths}),
        ));
        return;
    }

    if paths.iter().any(|p| p.contains(".resources.")) {
        out.push(anomaly(
            input.resource,
            AnomalyCategory::Change,
            "ResourceLimitsChanged",
            event.timestamp,
            format!("{kind} {} changed resource limits", input.resource.name),
            json!({"paths": paths}),
        ));
        return;
    }

    if kind == "Node"
        && change
            .diff
            .iter()
            .any(|c| c.path.starts_with("spec.taints") && c.op != crate::model::DiffOp::Remove)
    {
        out.push(anomaly(
            input.resource,
            AnomalyCategory::Change,
            "TaintAdded",
            event.timestamp,
            format!("node {} was tainted", input.resource.name),
            json!({"paths": paths}),
        ));
        return;
    }

    let (anomaly_type, summary) = match kind {
        "ConfigMap" => ("ConfigChange", format!("configmap {} data changed", input.resource.name)),
        "Secret" => ("SecretChange", format!("secret {} data changed", input.resource.name)),
        "Role" | "ClusterRole" => (
            "RBACRuleChanged",
            format!("{kind} {} rules changed", input.resource.name),
        ),
        "RoleBinding" | "ClusterRoleBinding" => (
            "RBACBindingChanged",
            format!("{kind} {} subjects changed", input.resource.name),
        ),
        k if WORKLOAD_KINDS.contains(&k) || k == "ReplicaSet" => (
            "WorkloadSpecModified",
            format!("{kind} {} spec was modified", input.resource.name),
        ),
        "HelmRelease" => (
            "ValuesChanged",
            format!("helmrelease {} configuration changed", input.resource.name),
        ),
        _ => return,
    };
    out.push(anomaly(
        input.resource,
        AnomalyCategory::Change,
        anomaly_type,
        event.timestamp,
        summary,
        json!({"paths": paths}),
    ));
}

/// HelmRelease flavours: compare the chart-version (or applied
/// revision) diff values with the numeric-aware comparator.
fn classify_helm(
    input: &DetectorInput<'_>,
    event: &ResourceEvent,
    change: &ChangeRecord,
) -> Option<Anomaly> {
    let version_change = change.diff.iter().find(|c| {
        c.path == "spec.chart.spec.version" || c.path == "status.lastAppliedRevision"
    })?;
    let old = version_change.old_value.as_ref()?.as_str()?;
    let new = version_change.new_value.as_ref()?.as_str()?;
    let (anomaly_type, verb) = match compare_versions(new, old) {
        Ordering::Greater => ("HelmUpgrade", "upgraded"),
        Ordering::Less => ("HelmRollback", "rolled back"),
        Ordering::Equal => return None,
    };
    Some(anomaly(
        input.resource,
        AnomalyCategory::Change,
        anomaly_type,
        event.timestamp,
        format!("helmrelease {} {verb} from {old} to {new}", input.resource.name),
        json!({"from": old, "to": new}),
    ))
}

/// Image replacement: a direct `.image` edit or a whole container-array
/// replacement whose image values differ.
fn find_image_change(diff: &[FieldChange]) -> Option<Value> {
    for change in diff {
        if change.path.contains("containers") && change.path.ends_with(".image") {
            return Some(json!({
                "path": change.path,
                "from": change.old_value,
                "to": change.new_value,
            }));
        }
        if change.path.ends_with("containers") {
            let old_images = collect_images(change.old_value.as_ref());
            let new_images = collect_images(change.new_value.as_ref());
            if !new_images.is_empty() && old_images != new_images {
                return Some(json!({
                    "path": change.path,
                    "from": old_images,
                    "to": new_images,
                }));
            }
        }
    }
    None
}

fn collect_images(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|containers| {
            containers
                .iter()
                .filter_map(|c| c.get("image").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Numeric-aware version comparison: split on `.` and `-`, numeric
/// segments compared as integers, lexicographic fallback.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let split = |v: &str| -> Vec<String> {
        v.split(['.', '-']).map(str::to_string).collect()
    };
    let (a_parts, b_parts) = (split(a), split(b));
    for i in 0..a_parts.len().max(b_parts.len()) {
        let (pa, pb) = (a_parts.get(i), b_parts.get(i));
        let ordering = match (pa, pb) {
            (Some(pa), Some(pb)) => match (pa.parse::<i64>(), pb.parse::<i64>()) {
                (Ok(na), Ok(nb)) => na.cmp(&nb),
                _ => pa.cmp(pb),
            },
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => Ordering::Equal,
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}
