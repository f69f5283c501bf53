//! Network anomalies: connection-failure language in event messages.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::json;

use crate::anomaly::{anomaly, Detector, DetectorInput};
use crate::model::{Anomaly, AnomalyCategory};

fn failure_phrases() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(connection refused|connection reset|network (is )?unreachable|no route to host)")
            .expect("network phrase pattern is valid")
    })
}

pub struct NetworkDetector;

impl Detector for NetworkDetector {
    fn name(&self) -> &'static str {
        "network"
    }

    fn detect(&self, input: &DetectorInput<'_>) -> Vec<Anomaly> {
        let mut out = Vec::new();
        for kube_event in input.k8s_events {
            if !input.window.contains(kube_event.timestamp) {
                continue;
            }
            if let Some(found) = failure_phrases().find(&kube_event.message) {
                out.push(anomaly(
                    input.resource,
                    AnomalyCategory::Network,
                    "ConnectionRefused",
                    kube_event.timestamp,
                    kube_event.message.clone(),
                    json!({"phrase": found.as_str(), "reason": kube_event.reason}),
                ));
            }
        }
        for event in input.events {
            if !input.window.contains(event.timestamp) {
                continue;
            }
            let Some(message) = crate::k8s::field_str(&event.payload, "message") else {
                continue;
            };
            if let Some(found) = failure_phrases().find(message) {
                out.push(anomaly(
                    input.resource,
                    AnomalyCategory::Network,
                    "ConnectionRefused",
                    event.timestamp,
                    message.to_string(),
                    json!({"phrase": found.as_str()}),
                ));
            }
        }
        out
    }
}
