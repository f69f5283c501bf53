use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, SpectreError};

/// Top-level service configuration.
///
/// Every section has defaults good enough for a single-node deployment;
/// an optional TOML file overrides them, and the binary applies flag
/// overrides on top.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub graph: GraphConfig,
    pub analyzer: AnalyzerConfig,
    pub anomaly: AnomalyConfig,
    pub templates: TemplateConfig,
    pub api: ApiConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw)
            .map_err(|err| SpectreError::Validation(format!("config parse error: {err}")))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Uncompressed size at which the current block is sealed.
    pub block_target_size: usize,
    /// Bounded fan-out across hourly files.
    pub file_concurrency: usize,
    /// Bounded fan-out across blocks within one file.
    pub block_concurrency: usize,
    /// Files strictly older than this are deleted by maintenance.
    pub retention_max_age_hours: u64,
    /// Final-state entries for deleted resources older than this horizon
    /// are dropped when index sections are rewritten.
    pub state_retention_hours: u64,
    /// How often the retention pass runs.
    pub retention_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            block_target_size: 10 * 1024 * 1024,
            file_concurrency: 4,
            block_concurrency: 4,
            retention_max_age_hours: 7 * 24,
            state_retention_hours: 24,
            retention_interval_secs: 3600,
        }
    }
}

impl StorageConfig {
    pub fn retention_max_age(&self) -> Duration {
        Duration::from_secs(self.retention_max_age_hours * 3600)
    }

    pub fn state_retention(&self) -> Duration {
        Duration::from_secs(self.state_retention_hours * 3600)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Capacity of the pipeline's bounded event buffer.
    pub channel_capacity: usize,
    pub query_cache_capacity: usize,
    pub query_cache_ttl_secs: u64,
    pub lookup_cache_capacity: usize,
    /// Previous-payload cache used for diff computation.
    pub last_payload_capacity: usize,
    pub query_timeout_millis: u64,
    pub slow_query_threshold_millis: u64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            query_cache_capacity: 512,
            query_cache_ttl_secs: 30,
            lookup_cache_capacity: 4096,
            last_payload_capacity: 8192,
            query_timeout_millis: 10_000,
            slow_query_threshold_millis: 1_000,
        }
    }
}

impl GraphConfig {
    pub fn query_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.query_cache_ttl_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_millis)
    }

    pub fn slow_query_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_query_threshold_millis)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub default_lookback_secs: u64,
    pub min_lookback_secs: u64,
    pub max_lookback_secs: u64,
    pub default_depth: u32,
    pub min_depth: u32,
    pub max_depth: u32,
    pub default_paths: usize,
    pub min_paths: usize,
    pub max_paths: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            default_lookback_secs: 600,
            min_lookback_secs: 60,
            max_lookback_secs: 3600,
            default_depth: 5,
            min_depth: 1,
            max_depth: 10,
            default_paths: 5,
            min_paths: 1,
            max_paths: 20,
        }
    }
}

impl AnalyzerConfig {
    pub fn clamp_lookback(&self, requested: Option<u64>) -> Duration {
        let secs = requested
            .unwrap_or(self.default_lookback_secs)
            .clamp(self.min_lookback_secs, self.max_lookback_secs);
        Duration::from_secs(secs)
    }

    pub fn clamp_depth(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.default_depth)
            .clamp(self.min_depth, self.max_depth)
    }

    pub fn clamp_paths(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_paths)
            .clamp(self.min_paths, self.max_paths)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Bucket width for anomaly deduplication.
    pub dedup_bucket_secs: u64,
    /// Sustained-Pending threshold for pods.
    pub pod_pending_secs: u64,
    /// Sustained-Pending threshold for PVCs.
    pub pvc_pending_secs: u64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            dedup_bucket_secs: 60,
            pod_pending_secs: 300,
            pvc_pending_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    pub snapshot_path: PathBuf,
    pub snapshot_interval_secs: u64,
    /// Templates below this count are pruned by the rebalancer.
    pub prune_threshold: u64,
    /// Patterns at or above this similarity are merged.
    pub merge_similarity: f64,
    /// Drain tree similarity threshold for joining an existing cluster.
    pub cluster_similarity: f64,
    pub max_depth: usize,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            snapshot_path: PathBuf::from("./data/templates.json"),
            snapshot_interval_secs: 300,
            prune_threshold: 3,
            merge_similarity: 0.85,
            cluster_similarity: 0.5,
            max_depth: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub allow_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8420,
            allow_origins: Vec::new(),
        }
    }
}
