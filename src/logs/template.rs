//! Drain-style log template extraction, scoped per namespace.
//!
//! Lines are normalized (semantic message extracted from known JSON
//! fields, lowercased, trimmed), tokenized, and clustered by token
//! count + leading token + positional similarity. Variable masking is
//! applied only when rendering patterns for consumers. Templates
//! persist as a versioned JSON snapshot written atomically.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::TemplateConfig;
use crate::error::{Result, SpectreError};
use crate::logs::mask;
use crate::model::UnixNanos;

const SNAPSHOT_VERSION: u32 = 1;
const WILDCARD: &str = "<*>";

/// JSON fields probed, in order, for the semantic message of a line.
const MESSAGE_FIELDS: [&str; 6] = ["message", "msg", "log", "text", "_raw", "event"];

/// A consumer-facing template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateRecord {
    pub id: String,
    pub namespace: String,
    /// Masked pattern text.
    pub pattern: String,
    pub tokens: Vec<String>,
    pub count: u64,
    pub first_seen: UnixNanos,
    pub last_seen: UnixNanos,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Cluster {
    namespace: String,
    tokens: Vec<String>,
    count: u64,
    first_seen: UnixNanos,
    last_seen: UnixNanos,
}

impl Cluster {
    fn pattern(&self) -> String {
        self.tokens.join(" ")
    }

    fn id(&self) -> String {
        template_id(&self.namespace, &self.pattern())
    }

    fn render(&self) -> TemplateRecord {
        let pattern = mask::mask_variables(&self.pattern());
        TemplateRecord {
            id: self.id(),
            namespace: self.namespace.clone(),
            pattern,
            tokens: self.tokens.clone(),
            count: self.count,
            first_seen: self.first_seen,
            last_seen: self.last_seen,
        }
    }
}

/// `sha256(namespace || pattern)`, hex-encoded.
pub fn template_id(namespace: &str, pattern: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update(pattern.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    clusters: Vec<Cluster>,
}

#[derive(Default)]
struct StoreState {
    /// Buckets keyed by `(namespace, token count)`.
    buckets: HashMap<(String, usize), Vec<Cluster>>,
}

/// Namespace-scoped template store with Drain-style clustering.
pub struct TemplateStore {
    config: TemplateConfig,
    state: Mutex<StoreState>,
}

impl TemplateStore {
    pub fn new(config: TemplateConfig) -> Self {
        Self {
            config,
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Restores from the snapshot file when present and version-matched;
    /// otherwise starts empty.
    pub fn open(config: TemplateConfig) -> Self {
        let store = Self::new(config);
        match store.restore() {
            Ok(count) if count > 0 => info!(templates = count, "restored template snapshot"),
            Ok(_) => {}
            Err(err) => warn!(err = %err, "template snapshot unreadable, starting empty"),
        }
        store
    }

    /// Ingests one raw log line.
    pub fn ingest(&self, namespace: &str, raw_line: &str, timestamp: UnixNanos) {
        let message = normalize(raw_line);
        if message.is_empty() {
            return;
        }
        let tokens: Vec<String> = message.split_whitespace().map(str::to_string).collect();
        let mut state = self.state.lock();
        let bucket = state
            .buckets
            .entry((namespace.to_string(), tokens.len()))
            .or_default();

        let mut best: Option<(usize, f64)> = None;
        for (i, cluster) in bucket.iter().enumerate() {
            let sim = similarity(&cluster.tokens, &tokens);
            if sim >= self.config.cluster_similarity
                && best.is_none_or(|(_, best_sim)| sim > best_sim)
            {
                best = Some((i, sim));
            }
        }
        match best {
            Some((i, _)) => {
                let cluster = &mut bucket[i];
                merge_tokens(&mut cluster.tokens, &tokens);
                cluster.count += 1;
                cluster.last_seen = cluster.last_seen.max(timestamp);
                cluster.first_seen = cluster.first_seen.min(timestamp);
            }
            None => bucket.push(Cluster {
                namespace: namespace.to_string(),
                tokens,
                count: 1,
                first_seen: timestamp,
                last_seen: timestamp,
            }),
        }
    }

    /// Rendered templates, optionally filtered by namespace and a
    /// substring of the masked pattern.
    pub fn search(&self, namespace: Option<&str>, contains: Option<&str>) -> Vec<TemplateRecord> {
        let state = self.state.lock();
        let mut out: Vec<TemplateRecord> = state
            .buckets
            .values()
            .flatten()
            .filter(|c| namespace.is_none_or(|ns| c.namespace == ns))
            .map(Cluster::render)
            .filter(|t| contains.is_none_or(|needle| t.pattern.contains(needle)))
            .collect();
        out.sort_by(|a, b| b.count.cmp(&a.count));
        out
    }

    pub fn template_count(&self) -> usize {
        self.state.lock().buckets.values().map(Vec::len).sum()
    }

    /// Prunes low-count templates and merges near-identical patterns.
    pub fn rebalance(&self) -> (usize, usize) {
        let mut state = self.state.lock();
        let mut pruned = 0;
        let mut merged = 0;
        for bucket in state.buckets.values_mut() {
            let before = bucket.len();
            bucket.retain(|c| c.count >= self.config.prune_threshold);
            pruned += before - bucket.len();

            let mut i = 0;
            while i < bucket.len() {
                let mut j = i + 1;
                while j < bucket.len() {
                    let sim = strsim::normalized_levenshtein(
                        &bucket[i].pattern(),
                        &bucket[j].pattern(),
                    );
                    if sim >= self.config.merge_similarity {
                        let absorbed = bucket.remove(j);
                        let target = &mut bucket[i];
                        let absorbed_tokens = absorbed.tokens.clone();
                        merge_tokens(&mut target.tokens, &absorbed_tokens);
                        target.count += absorbed.count;
                        target.first_seen = target.first_seen.min(absorbed.first_seen);
                        target.last_seen = target.last_seen.max(absorbed.last_seen);
                        merged += 1;
                    } else {
                        j += 1;
                    }
                }
                i += 1;
            }
        }
        state.buckets.retain(|_, bucket| !bucket.is_empty());
        if pruned > 0 || merged > 0 {
            debug!(pruned, merged, "rebalanced templates");
        }
        (pruned, merged)
    }

    /// Writes the snapshot via a temp file and an atomic rename.
    pub fn persist(&self) -> Result<()> {
        let snapshot = {
            let state = self.state.lock();
            Snapshot {
                version: SNAPSHOT_VERSION,
                clusters: state.buckets.values().flatten().cloned().collect(),
            }
        };
        let path = &self.config.snapshot_path;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer(tmp.as_file(), &snapshot)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path)
            .map_err(|err| SpectreError::Io(err.error))?;
        Ok(())
    }

    fn restore(&self) -> Result<usize> {
        let path = &self.config.snapshot_path;
        if !path.exists() {
            return Ok(0);
        }
        let raw = std::fs::read(path)?;
        let snapshot: Snapshot = serde_json::from_slice(&raw)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Ok(0);
        }
        let mut state = self.state.lock();
        let count = snapshot.clusters.len();
        for cluster in snapshot.clusters {
            state
                .buckets
                .entry((cluster.namespace.clone(), cluster.tokens.len()))
                .or_default()
                .push(cluster);
        }
        Ok(count)
    }
}

/// Extracts the semantic message: for JSON lines the first known
/// message field wins, otherwise the raw line. Lowercased and trimmed.
fn normalize(raw_line: &str) -> String {
    let trimmed = raw_line.trim();
    if trimmed.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
            for field in MESSAGE_FIELDS {
                if let Some(message) = value.get(field).and_then(serde_json::Value::as_str) {
                    return message.trim().to_lowercase();
                }
            }
        }
    }
    trimmed.to_lowercase()
}

/// Positional token similarity; wildcards match anything.
fn similarity(a: &[String], b: &[String]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let matching = a
        .iter()
        .zip(b.iter())
        .filter(|(x, y)| *x == WILDCARD || x == y)
        .count();
    matching as f64 / a.len() as f64
}

/// Wildcards every position where the tokens disagree.
fn merge_tokens(target: &mut [String], incoming: &[String]) {
    for (slot, token) in target.iter_mut().zip(incoming.iter()) {
        if slot != token && slot != WILDCARD {
            *slot = WILDCARD.to_string();
        }
    }
}
