//! Dynamic access over Kubernetes resource payloads.
//!
//! Payload shapes vary by kind and version, so the core treats them as
//! tagged maps: nested fields are read through accessors that return
//! "absent" instead of failing, and the few places that need typed
//! values convert once at the entry point.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::model::{DiffOp, FieldChange};

/// Reads a nested field by dotted path, e.g. `status.phase` or
/// `spec.template.spec.containers.0.image`. Numeric segments index
/// into arrays. Returns `None` for any missing step.
pub fn field<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = payload;
    for segment in path.split('.') {
        match current {
            Value::Object(map) => current = map.get(segment)?,
            Value::Array(items) => {
                let idx: usize = segment.parse().ok()?;
                current = items.get(idx)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

/// String-typed field access.
pub fn field_str<'a>(payload: &'a Value, path: &str) -> Option<&'a str> {
    field(payload, path).and_then(Value::as_str)
}

/// Integer-typed field access.
pub fn field_i64(payload: &Value, path: &str) -> Option<i64> {
    field(payload, path).and_then(Value::as_i64)
}

/// Looks up a `status.conditions[*]` entry by type and returns
/// `(status, reason)`.
pub fn condition<'a>(payload: &'a Value, cond_type: &str) -> Option<(&'a str, Option<&'a str>)> {
    let conditions = field(payload, "status.conditions")?.as_array()?;
    for cond in conditions {
        if cond.get("type").and_then(Value::as_str) == Some(cond_type) {
            let status = cond.get("status").and_then(Value::as_str)?;
            let reason = cond.get("reason").and_then(Value::as_str);
            return Some((status, reason));
        }
    }
    None
}

/// Iterates `status.containerStatuses` plus `status.initContainerStatuses`.
pub fn container_statuses(payload: &Value) -> Vec<&Value> {
    let mut out = Vec::new();
    for path in ["status.containerStatuses", "status.initContainerStatuses"] {
        if let Some(items) = field(payload, path).and_then(Value::as_array) {
            out.extend(items.iter());
        }
    }
    out
}

/// Labels from `metadata.labels` as an owned map.
pub fn labels(payload: &Value) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Some(map) = field(payload, "metadata.labels").and_then(Value::as_object) {
        for (k, v) in map {
            if let Some(s) = v.as_str() {
                out.insert(k.clone(), s.to_string());
            }
        }
    }
    out
}

/// Whether `selector` is a subset of `labels` (empty selectors match nothing).
pub fn selector_matches(selector: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> bool {
    if selector.is_empty() {
        return false;
    }
    selector
        .iter()
        .all(|(k, v)| labels.get(k).map(String::as_str) == Some(v.as_str()))
}

/// Removes `metadata.managedFields` in place and returns the byte length
/// of the payload before pruning.
pub fn prune_managed_fields(payload: &mut Value) -> u32 {
    let raw_size = serde_json::to_vec(payload).map(|b| b.len() as u32).unwrap_or(0);
    if let Some(metadata) = payload.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.remove("managedFields");
    }
    raw_size
}

/// Minimal snapshot kept in the final-state map: identity metadata plus
/// status phase and conditions. Everything else is dropped to keep the
/// carried-over map small.
pub fn minimal_snapshot(payload: &Value) -> Value {
    let mut out = Map::new();
    for key in ["apiVersion", "kind"] {
        if let Some(v) = payload.get(key) {
            out.insert(key.to_string(), v.clone());
        }
    }
    if let Some(metadata) = payload.get("metadata").and_then(Value::as_object) {
        let mut meta = Map::new();
        for key in ["name", "namespace", "uid", "labels"] {
            if let Some(v) = metadata.get(key) {
                meta.insert(key.to_string(), v.clone());
            }
        }
        out.insert("metadata".to_string(), Value::Object(meta));
    }
    if let Some(status) = payload.get("status").and_then(Value::as_object) {
        let mut st = Map::new();
        for key in ["phase", "conditions", "replicas", "unavailableReplicas", "readyReplicas"] {
            if let Some(v) = status.get(key) {
                st.insert(key.to_string(), v.clone());
            }
        }
        if !st.is_empty() {
            out.insert("status".to_string(), Value::Object(st));
        }
    }
    Value::Object(out)
}

/// Structural diff between two payload revisions.
///
/// Paths are dotted; array elements diff by index; whole-value type
/// changes report a single `replace` at the parent path. Ordering is
/// deterministic (object keys sorted by serde_json's map order, arrays
/// by index).
pub fn diff(old: &Value, new: &Value) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    diff_inner(old, new, String::new(), &mut changes);
    changes
}

fn diff_inner(old: &Value, new: &Value, path: String, out: &mut Vec<FieldChange>) {
    match (old, new) {
        (Value::Object(a), Value::Object(b)) => {
            for (key, old_val) in a {
                let child = join_path(&path, key);
                match b.get(key) {
                    Some(new_val) => diff_inner(old_val, new_val, child, out),
                    None => out.push(FieldChange {
                        path: child,
                        op: DiffOp::Remove,
                        old_value: Some(old_val.clone()),
                        new_value: None,
                    }),
                }
            }
            for (key, new_val) in b {
                if !a.contains_key(key) {
                    out.push(FieldChange {
                        path: join_path(&path, key),
                        op: DiffOp::Add,
                        old_value: None,
                        new_value: Some(new_val.clone()),
                    });
                }
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            let common = a.len().min(b.len());
            for i in 0..common {
                diff_inner(&a[i], &b[i], join_path(&path, &i.to_string()), out);
            }
            for (i, old_val) in a.iter().enumerate().skip(common) {
                out.push(FieldChange {
                    path: join_path(&path, &i.to_string()),
                    op: DiffOp::Remove,
                    old_value: Some(old_val.clone()),
                    new_value: None,
                });
            }
            for (i, new_val) in b.iter().enumerate().skip(common) {
                out.push(FieldChange {
                    path: join_path(&path, &i.to_string()),
                    op: DiffOp::Add,
                    old_value: None,
                    new_value: Some(new_val.clone()),
                });
            }
        }
        _ => {
            if old != new {
                out.push(FieldChange {
                    path,
                    op: DiffOp::Replace,
                    old_value: Some(old.clone()),
                    new_value: Some(new.clone()),
                });
            }
        }
    }
}

fn join_path(parent: &str, segment: &str) -> String {
    if parent.is_empty() {
        segment.to_string()
    } else {
        format!("{parent}.{segment}")
    }
}

/// Whether a change set touches anything outside `status.*` and the
/// always-churning metadata bookkeeping fields.
pub fn is_config_path(path: &str) -> bool {
    if path.starts_with("status.") || path == "status" {
        return false;
    }
    !matches!(
        path,
        "metadata.resourceVersion" | "metadata.generation" | "metadata.managedFields"
    )
}

/// Whether a change set touches the status subtree.
pub fn is_status_path(path: &str) -> bool {
    path == "status" || path.starts_with("status.")
}
