//! Anomaly detection over a per-resource event slice.
//!
//! Detectors are stateless capability sets `{name, detect}` selected by
//! configuration. Their outputs are unioned and deduplicated by
//! `(uid, category, type, bucketed timestamp)`.

pub mod change;
pub mod network;
pub mod severity;
pub mod state;

use std::collections::BTreeSet;

use serde_json::Value;

use crate::config::AnomalyConfig;
use crate::model::{
    Anomaly, ChangeRecord, EventKind, ResourceRef, TimeRange, UnixNanos, NANOS_PER_SECOND,
};

pub use change::ChangeDetector;
pub use network::NetworkDetector;
pub use state::StateDetector;

/// One stored event enriched with its change record, as consumed by the
/// detectors.
#[derive(Debug, Clone)]
pub struct ResourceEvent {
    pub event_id: String,
    pub timestamp: UnixNanos,
    pub kind: EventKind,
    pub payload: Value,
    pub change: Option<ChangeRecord>,
}

/// A native Kubernetes `Event` object involving the resource.
#[derive(Debug, Clone)]
pub struct KubeEvent {
    pub reason: String,
    pub message: String,
    pub timestamp: UnixNanos,
    pub count: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct DetectorInput<'a> {
    pub resource: &'a ResourceRef,
    pub events: &'a [ResourceEvent],
    pub k8s_events: &'a [KubeEvent],
    pub window: TimeRange,
    pub config: &'a AnomalyConfig,
}

pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;
    fn detect(&self, input: &DetectorInput<'_>) -> Vec<Anomaly>;
}

pub fn default_detectors() -> Vec<Box<dyn Detector>> {
    vec![
        Box::new(StateDetector),
        Box::new(ChangeDetector),
        Box::new(NetworkDetector),
    ]
}

/// Runs every detector and deduplicates the union.
pub fn run_detectors(input: &DetectorInput<'_>) -> Vec<Anomaly> {
    let bucket = input.config.dedup_bucket_secs as i64 * NANOS_PER_SECOND;
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for detector in default_detectors() {
        for anomaly in detector.detect(input) {
            if seen.insert(anomaly.dedup_key(bucket)) {
                out.push(anomaly);
            }
        }
    }
    out.sort_by_key(|a| a.timestamp);
    out
}

pub(crate) fn anomaly(
    resource: &ResourceRef,
    category: crate::model::AnomalyCategory,
    anomaly_type: &str,
    timestamp: UnixNanos,
    summary: String,
    details: Value,
) -> Anomaly {
    Anomaly {
        resource: resource.clone(),
        category,
        anomaly_type: anomaly_type.to_string(),
        severity: severity::classify(category, anomaly_type, &resource.kind),
        timestamp,
        summary,
        details,
    }
}
