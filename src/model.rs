//! Core data model for captured cluster events.
//!
//! This module defines the entities shared by the storage engine, the
//! graph pipeline, the analyzers, and the service layer.
//!
//! # Key Types
//!
//! - [`Event`] - A single captured lifecycle event (create/update/delete)
//! - [`ResourceRef`] - The full identity of a cluster resource
//! - [`ChangeRecord`] / [`FieldChange`] - Per-edit diff facts
//! - [`Anomaly`] - A detected deviation with category and severity
//! - [`FinalState`] - Last-known state carried across hourly rotation

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SpectreError};

/// Nanoseconds since the Unix epoch. All core timestamps use this unit.
pub type UnixNanos = i64;

pub const NANOS_PER_SECOND: i64 = 1_000_000_000;
pub const NANOS_PER_HOUR: i64 = 3_600 * NANOS_PER_SECOND;

/// Normalizes a request timestamp that may be unix seconds or nanoseconds.
///
/// Values below 10^12 are treated as seconds. Cluster history does not
/// reach back to 1970-01-12, which is the last instant the two ranges
/// could collide.
pub fn normalize_timestamp(raw: i64) -> UnixNanos {
    if raw.abs() < 1_000_000_000_000 {
        raw * NANOS_PER_SECOND
    } else {
        raw
    }
}

/// The lifecycle phase an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Create,
    Update,
    Delete,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Create => "create",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            EventKind::Create => 0,
            EventKind::Update => 1,
            EventKind::Delete => 2,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(EventKind::Create),
            1 => Ok(EventKind::Update),
            2 => Ok(EventKind::Delete),
            other => Err(SpectreError::Corruption(format!(
                "invalid event kind tag {other}"
            ))),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full identity of a cluster resource.
///
/// `uid` is the canonical key; `{namespace, kind, name}` is the
/// secondary address used when the uid is not yet known.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl ResourceRef {
    /// Key used by the final-state map and the name-keyed lookup cache.
    pub fn state_key(&self) -> String {
        format!("{}/{}/{}", self.namespace, self.kind, self.name)
    }

    pub fn state_key_for(namespace: &str, kind: &str, name: &str) -> String {
        format!("{namespace}/{kind}/{name}")
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.namespace, self.kind, self.name)
        }
    }
}

/// A single captured lifecycle event, the atomic input to the core.
///
/// The payload is the resource body with `managedFields` already pruned;
/// `raw_size` preserves the pre-pruning byte length for accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub timestamp: UnixNanos,
    pub kind: EventKind,
    pub resource: ResourceRef,
    pub payload: Value,
    #[serde(default)]
    pub raw_size: u32,
    /// Uid of the involved object for native Kubernetes `Event` resources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub involved_uid: Option<String>,
}

impl Event {
    /// Checks the documented event invariants.
    ///
    /// Delete events may carry an empty payload (or a last-known
    /// snapshot); create and update events must not.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(SpectreError::Validation("event id must be non-empty".into()));
        }
        if self.resource.uid.is_empty()
            || self.resource.kind.is_empty()
            || self.resource.name.is_empty()
        {
            return Err(SpectreError::Validation(format!(
                "event {} is missing uid, kind, or name",
                self.id
            )));
        }
        if self.kind != EventKind::Delete && self.payload.is_null() {
            return Err(SpectreError::Validation(format!(
                "{} event {} has an empty payload",
                self.kind, self.id
            )));
        }
        Ok(())
    }
}

/// Diff operation inside a [`FieldChange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffOp {
    Add,
    Replace,
    Remove,
}

/// One changed field between two revisions of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub path: String,
    pub op: DiffOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
}

/// Per-edit fact attached to a resource identity.
///
/// Consumed by the anomaly detectors and the causal analyzer; the
/// storage write path never reads these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub event_id: String,
    pub timestamp: UnixNanos,
    pub event_type: EventKind,
    pub config_changed: bool,
    pub status_changed: bool,
    #[serde(default)]
    pub diff: Vec<FieldChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Value>,
}

/// Anomaly classification buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyCategory {
    State,
    Change,
    Network,
    Performance,
}

impl AnomalyCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyCategory::State => "state",
            AnomalyCategory::Change => "change",
            AnomalyCategory::Network => "network",
            AnomalyCategory::Performance => "performance",
        }
    }
}

impl fmt::Display for AnomalyCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity levels, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected deviation from the recent baseline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub resource: ResourceRef,
    pub category: AnomalyCategory,
    #[serde(rename = "type")]
    pub anomaly_type: String,
    pub severity: Severity,
    pub timestamp: UnixNanos,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl Anomaly {
    /// Deduplication key: `(uid, category, type, bucketed timestamp)`.
    pub fn dedup_key(&self, bucket_nanos: i64) -> String {
        let bucket = if bucket_nanos > 0 {
            self.timestamp.div_euclid(bucket_nanos)
        } else {
            self.timestamp
        };
        format!(
            "{}|{}|{}|{}",
            self.resource.uid, self.category, self.anomaly_type, bucket
        )
    }
}

/// Last-known state of a resource, carried across hourly rotation so
/// point-in-time queries can see resources created before the window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalState {
    pub uid: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    pub timestamp: UnixNanos,
    pub event_kind: EventKind,
    pub snapshot: Value,
}

/// Time window `[start, end]` in nanoseconds, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: UnixNanos,
    pub end: UnixNanos,
}

impl TimeRange {
    pub fn new(start: UnixNanos, end: UnixNanos) -> Result<Self> {
        if end < start {
            return Err(SpectreError::Validation(format!(
                "time range end {end} precedes start {start}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, ts: UnixNanos) -> bool {
        ts >= self.start && ts <= self.end
    }

    pub fn overlaps(&self, min: UnixNanos, max: UnixNanos) -> bool {
        min <= self.end && max >= self.start
    }
}
