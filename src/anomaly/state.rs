//! State anomalies: kind-specific rules over payload phases, conditions,
//! and container statuses inside the window.

use serde_json::{json, Value};

use crate::anomaly::{anomaly, severity, Detector, DetectorInput, ResourceEvent};
use crate::k8s;
use crate::model::{Anomaly, AnomalyCategory, EventKind, Severity, NANOS_PER_SECOND};

pub struct StateDetector;

impl Detector for StateDetector {
    fn name(&self) -> &'static str {
        "state"
    }

    fn detect(&self, input: &DetectorInput<'_>) -> Vec<Anomaly> {
        let mut out = Vec::new();
        let in_window: Vec<&ResourceEvent> = input
            .events
            .iter()
            .filter(|e| input.window.contains(e.timestamp))
            .collect();

        match input.resource.kind.as_str() {
            "Pod" => detect_pod(input, &in_window, &mut out),
            "Node" => detect_node(input, &in_window, &mut out),
            "Deployment" => detect_deployment(input, &in_window, &mut out),
            "StatefulSet" => detect_statefulset(input, &in_window, &mut out),
            "EndpointSlice" => detect_endpointslice(input, &in_window, &mut out),
            "Service" | "Ingress" => detect_backend_language(input, &mut out),
            "ConfigMap" | "Secret" => detect_deleted(input, &in_window, &mut out),
            "HelmRelease" | "Kustomization" => detect_flux(input, &in_window, &mut out),
            "PersistentVolumeClaim" => detect_pvc(input, &in_window, &mut out),
            _ => {}
        }

        // Warning-grade native event reasons become anomalies of their
        // own so the causal analyzer can root in them.
        for kube_event in input.k8s_events {
            if !input.window.contains(kube_event.timestamp) {
                continue;
            }
            if severity::native_reason_severity(&kube_event.reason) >= Severity::High {
                out.push(anomaly(
                    input.resource,
                    AnomalyCategory::State,
                    &kube_event.reason,
                    kube_event.timestamp,
                    kube_event.message.clone(),
                    json!({"count": kube_event.count}),
                ));
            }
        }
        out
    }
}

fn detect_pod(input: &DetectorInput<'_>, events: &[&ResourceEvent], out: &mut Vec<Anomaly>) {
    for event in events {
        let payload = &event.payload;
        if k8s::field_str(payload, "status.phase") == Some("Failed") {
            let reason = k8s::field_str(payload, "status.reason").unwrap_or("");
            if reason == "Evicted" {
                out.push(anomaly(
                    input.resource,
                    AnomalyCategory::State,
                    "Evicted",
                    event.timestamp,
                    format!("pod {} was evicted", input.resource.name),
                    Value::Null,
                ));
            } else {
                out.push(anomaly(
                    input.resource,
                    AnomalyCategory::State,
                    "PodFailed",
                    event.timestamp,
                    format!("pod {} entered Failed phase", input.resource.name),
                    json!({"reason": reason}),
                ));
            }
        }

        if let Some(("False", Some("Unschedulable"))) = k8s::condition(payload, "PodScheduled") {
            out.push(anomaly(
                input.resource,
                AnomalyCategory::State,
                "Unschedulable",
                event.timestamp,
                format!("pod {} cannot be scheduled", input.resource.name),
                Value::Null,
            ));
        }

        for status in k8s::container_statuses(payload) {
            let container = status.get("name").and_then(Value::as_str).unwrap_or("");
            if let Some(reason) = k8s::field_str(status, "state.waiting.reason") {
                if matches!(
                    reason,
                    "CrashLoopBackOff" | "ImagePullBackOff" | "ErrImagePull" | "CreateContainerError"
                ) {
                    out.push(anomaly(
                        input.resource,
                        AnomalyCategory::State,
                        reason,
                        event.timestamp,
                        format!("container {container} is waiting: {reason}"),
                        json!({"container": container}),
                    ));
                }
            }
            if k8s::field_str(status, "lastState.terminated.reason") == Some("OOMKilled")
                || k8s::field_str(status, "state.terminated.reason") == Some("OOMKilled")
            {
                out.push(anomaly(
                    input.resource,
                    AnomalyCategory::State,
                    "OOMKilled",
                    event.timestamp,
                    format!("container {container} was OOM killed"),
                    json!({"container": container}),
                ));
            }
        }

        if let Some(init_statuses) =
            k8s::field(payload, "status.initContainerStatuses").and_then(Value::as_array)
        {
            for status in init_statuses {
                let failed = k8s::field_i64(status, "state.terminated.exitCode")
                    .is_some_and(|code| code != 0)
                    || k8s::field_i64(status, "lastState.terminated.exitCode")
                        .is_some_and(|code| code != 0);
                if failed {
                    let container = status.get("name").and_then(Value::as_str).unwrap_or("");
                    out.push(anomaly(
                        input.resource,
                        AnomalyCategory::State,
                        "InitContainerFailed",
                        event.timestamp,
                        format!("init container {container} failed in pod {}", input.resource.name),
                        json!({"container": container}),
                    ));
                }
            }
        }
    }

    // Sustained Pending beyond the threshold.
    let pending: Vec<&&ResourceEvent> = events
        .iter()
        .filter(|e| k8s::field_str(&e.payload, "status.phase") == Some("Pending"))
        .collect();
    if let (Some(first), Some(last)) = (pending.first(), pending.last()) {
        let threshold = input.config.pod_pending_secs as i64 * NANOS_PER_SECOND;
        if last.timestamp - first.timestamp >= threshold {
            out.push(anomaly(
                input.resource,
                AnomalyCategory::State,
                "PodPending",
                last.timestamp,
                format!(
                    "pod {} pending for over {}s",
                    input.resource.name, input.config.pod_pending_secs
                ),
                Value::Null,
            ));
        }
    }
}

fn detect_node(input: &DetectorInput<'_>, events: &[&ResourceEvent], out: &mut Vec<Anomaly>) {
    for event in events {
        let checks = [
            ("Ready", "False", "NodeNotReady"),
            ("DiskPressure", "True", "DiskPressure"),
            ("MemoryPressure", "True", "NodeMemoryPressure"),
            ("PIDPressure", "True", "NodePIDPressure"),
        ];
        for (cond, bad_status, anomaly_type) in checks {
            if let Some((status, reason)) = k8s::condition(&event.payload, cond) {
                if status == bad_status {
                    out.push(anomaly(
                        input.resource,
                        AnomalyCategory::State,
                        anomaly_type,
                        event.timestamp,
                        format!("node {} condition {cond}={status}", input.resource.name),
                        json!({"reason": reason}),
                    ));
                }
            }
        }
    }
}

fn detect_deployment(input: &DetectorInput<'_>, events: &[&ResourceEvent], out: &mut Vec<Anomaly>) {
    for event in events {
        if let Some(("False", Some("ProgressDeadlineExceeded"))) =
            k8s::condition(&event.payload, "Progressing")
        {
            out.push(anomaly(
                input.resource,
                AnomalyCategory::State,
                "RolloutStuck",
                event.timestamp,
                format!("deployment {} exceeded its progress deadline", input.resource.name),
                Value::Null,
            ));
        }
    }

    // A config change with unavailable replicas anywhere in the window
    // marks the rollout as stuck even before the deadline fires.
    let config_changed = events
        .iter()
        .any(|e| e.change.as_ref().is_some_and(|c| c.config_changed));
    let unavailable = events
        .iter()
        .filter_map(|e| k8s::field_i64(&e.payload, "status.unavailableReplicas"))
        .max()
        .unwrap_or(0);
    if config_changed && unavailable > 0 {
        let timestamp = events.last().map(|e| e.timestamp).unwrap_or(input.window.end);
        out.push(anomaly(
            input.resource,
            AnomalyCategory::State,
            "RolloutStuck",
            timestamp,
            format!(
                "deployment {} has {unavailable} unavailable replicas after a config change",
                input.resource.name
            ),
            json!({"unavailableReplicas": unavailable}),
        ));
    }
}

fn detect_statefulset(input: &DetectorInput<'_>, events: &[&ResourceEvent], out: &mut Vec<Anomaly>) {
    let config_change_ts = events
        .iter()
        .filter(|e| e.change.as_ref().is_some_and(|c| c.config_changed))
        .map(|e| e.timestamp)
        .min();
    let Some(config_change_ts) = config_change_ts else {
        return;
    };
    for event in events {
        if event.timestamp < config_change_ts {
            continue;
        }
        let current = k8s::field_str(&event.payload, "status.currentRevision");
        let update = k8s::field_str(&event.payload, "status.updateRevision");
        if let (Some(current), Some(update)) = (current, update) {
            if current != update {
                out.push(anomaly(
                    input.resource,
                    AnomalyCategory::State,
                    "UpdateRollback",
                    event.timestamp,
                    format!(
                        "statefulset {} revisions diverged after a config change",
                        input.resource.name
                    ),
                    json!({"currentRevision": current, "updateRevision": update}),
                ));
            }
        }
    }
}

fn detect_endpointslice(input: &DetectorInput<'_>, events: &[&ResourceEvent], out: &mut Vec<Anomaly>) {
    for event in events {
        let Some(endpoints) = k8s::field(&event.payload, "endpoints").and_then(Value::as_array)
        else {
            continue;
        };
        let any_ready = endpoints
            .iter()
            .any(|ep| k8s::field(ep, "conditions.ready").and_then(Value::as_bool) == Some(true));
        if endpoints.is_empty() || !any_ready {
            out.push(anomaly(
                input.resource,
                AnomalyCategory::State,
                "NoReadyEndpoints",
                event.timestamp,
                format!("endpointslice {} has no ready endpoints", input.resource.name),
                Value::Null,
            ));
        }
    }
}

fn detect_backend_language(input: &DetectorInput<'_>, out: &mut Vec<Anomaly>) {
    for kube_event in input.k8s_events {
        if !input.window.contains(kube_event.timestamp) {
            continue;
        }
        let message = kube_event.message.to_lowercase();
        if message.contains("no endpoints available")
            || message.contains("no ready endpoints")
            || (message.contains("backend") && message.contains("unavailable"))
        {
            out.push(anomaly(
                input.resource,
                AnomalyCategory::State,
                "BackendDown",
                kube_event.timestamp,
                kube_event.message.clone(),
                Value::Null,
            ));
        }
    }
}

fn detect_deleted(input: &DetectorInput<'_>, events: &[&ResourceEvent], out: &mut Vec<Anomaly>) {
    for event in events {
        if event.kind == EventKind::Delete {
            out.push(anomaly(
                input.resource,
                AnomalyCategory::State,
                "Deleted",
                event.timestamp,
                format!(
                    "{} {} was deleted",
                    input.resource.kind.to_lowercase(),
                    input.resource.name
                ),
                Value::Null,
            ));
        }
    }
}

fn detect_flux(input: &DetectorInput<'_>, events: &[&ResourceEvent], out: &mut Vec<Anomaly>) {
    let anomaly_type = if input.resource.kind == "HelmRelease" {
        "HelmReleaseFailed"
    } else {
        "KustomizationFailed"
    };
    for event in events {
        let ready = k8s::condition(&event.payload, "Ready");
        let released = k8s::condition(&event.payload, "Released");
        let failed_reason = [ready, released].into_iter().flatten().find_map(|(status, reason)| {
            if status == "False" {
                Some(reason.unwrap_or("ReconciliationFailed").to_string())
            } else if matches!(
                reason,
                Some("InstallFailed") | Some("UpgradeFailed") | Some("BuildFailed")
                    | Some("ReconciliationFailed")
            ) {
                reason.map(str::to_string)
            } else {
                None
            }
        });
        if let Some(reason) = failed_reason {
            out.push(anomaly(
                input.resource,
                AnomalyCategory::State,
                anomaly_type,
                event.timestamp,
                format!("{} {} is not ready: {reason}", input.resource.kind, input.resource.name),
                json!({"reason": reason}),
            ));
        }
    }
}

fn detect_pvc(input: &DetectorInput<'_>, events: &[&ResourceEvent], out: &mut Vec<Anomaly>) {
    for event in events {
        if k8s::field_str(&event.payload, "status.phase") == Some("Lost") {
            out.push(anomaly(
                input.resource,
                AnomalyCategory::State,
                "PVCBindingFailed",
                event.timestamp,
                format!("pvc {} lost its volume binding", input.resource.name),
                Value::Null,
            ));
        }
    }
    let pending: Vec<&&ResourceEvent> = events
        .iter()
        .filter(|e| k8s::field_str(&e.payload, "status.phase") == Some("Pending"))
        .collect();
    if let (Some(first), Some(last)) = (pending.first(), pending.last()) {
        let threshold = input.config.pvc_pending_secs as i64 * NANOS_PER_SECOND;
        if last.timestamp - first.timestamp >= threshold {
            let reason = k8s::condition(&last.payload, "Pending")
                .and_then(|(_, reason)| reason)
                .unwrap_or("pending");
            out.push(anomaly(
                input.resource,
                AnomalyCategory::State,
                "PVCBindingFailed",
                last.timestamp,
                format!("pvc {} pending: {reason}", input.resource.name),
                json!({"reason": reason}),
            ));
        }
    }
}
