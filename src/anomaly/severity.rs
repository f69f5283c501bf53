//! Severity classification: a pure function of category, anomaly type,
//! and resource kind, with kind-specific overrides.

use crate::model::{AnomalyCategory, Severity};

pub fn classify(category: AnomalyCategory, anomaly_type: &str, kind: &str) -> Severity {
    // Kind overrides come first: some signals are echoes of a change
    // higher up the ownership chain.
    if kind == "ReplicaSet" && matches!(anomaly_type, "WorkloadSpecModified" | "SpecModified") {
        return Severity::Low;
    }

    match category {
        AnomalyCategory::State => match anomaly_type {
            "PodFailed" | "NodeNotReady" | "HelmReleaseFailed" | "KustomizationFailed"
            | "PVCBindingFailed" | "CrashLoopBackOff" | "OOMKilled" | "FailedScheduling" => {
                Severity::Critical
            }
            "Evicted" | "Unschedulable" | "PodPending" | "NodeMemoryPressure"
            | "NodePIDPressure" | "RolloutStuck" | "UpdateRollback" | "NoReadyEndpoints"
            | "BackendDown" | "Deleted" | "ImagePullBackOff" | "ErrImagePull"
            | "CreateContainerError" | "InitContainerFailed" | "BackOff" => Severity::High,
            "DiskPressure" => Severity::Medium,
            _ => Severity::Medium,
        },
        AnomalyCategory::Change => match anomaly_type {
            "HelmRollback" | "RBACRuleChanged" | "RBACBindingChanged" => Severity::High,
            "ImageChanged" | "ResourceLimitsChanged" | "TaintAdded" | "SecretChange" => {
                Severity::Medium
            }
            "HelmUpgrade" | "ValuesChanged" | "ConfigChange" | "EnvironmentChanged"
            | "WorkloadSpecModified" => Severity::Medium,
            "ResourceCreated" => Severity::Low,
            _ => Severity::Low,
        },
        AnomalyCategory::Network => match anomaly_type {
            "ConnectionRefused" => Severity::High,
            _ => Severity::Medium,
        },
        AnomalyCategory::Performance => Severity::Medium,
    }
}

/// Severity of native Kubernetes event reasons, used when surfacing
/// native events alongside anomalies.
pub fn native_reason_severity(reason: &str) -> Severity {
    match reason {
        "FailedScheduling" | "FailedCreate" | "FailedMount" | "OOMKilling" => Severity::Critical,
        "BackOff" | "Evicted" | "Failed" | "Unhealthy" | "FailedAttachVolume"
        | "NetworkNotReady" => Severity::High,
        "Killing" | "Preempting" | "NodeNotReady" => Severity::Medium,
        // Scheduled, Pulled, Created, Started, SuccessfulCreate, ...
        _ => Severity::Low,
    }
}
