//! Distinct namespaces/kinds/groups over a window, with an LRU+TTL
//! cache owned by the service. The cache-hit flag is returned to the
//! caller so the REST handler can set its response header.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::Result;
use crate::graph::cache::CacheCounters;
use crate::model::{normalize_timestamp, TimeRange, NANOS_PER_HOUR};
use crate::service::run_storage;
use crate::storage::{EventQuery, MetadataSets, QueryExecutor, QueryFilters};

const CACHE_CAPACITY: usize = 128;

#[derive(Debug, Clone, Serialize)]
pub struct MetadataResponse {
    pub namespaces: Vec<String>,
    pub kinds: Vec<String>,
    pub groups: Vec<String>,
}

impl From<MetadataSets> for MetadataResponse {
    fn from(sets: MetadataSets) -> Self {
        Self {
            namespaces: sets.namespaces,
            kinds: sets.kinds,
            groups: sets.groups,
        }
    }
}

pub struct MetadataService {
    executor: Arc<QueryExecutor>,
    cache: Mutex<LruCache<String, (MetadataResponse, Instant)>>,
    ttl: Duration,
    pub counters: CacheCounters,
}

impl MetadataService {
    pub fn new(executor: Arc<QueryExecutor>, ttl: Duration) -> Self {
        Self {
            executor,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            )),
            ttl,
            counters: CacheCounters::default(),
        }
    }

    /// Returns the metadata and whether it was served from the cache.
    pub async fn metadata(
        &self,
        cancel: &CancellationToken,
        start: i64,
        end: i64,
    ) -> Result<(MetadataResponse, bool)> {
        let range = TimeRange::new(normalize_timestamp(start), normalize_timestamp(end))?;
        // Hour-granular key: any instant inside the same pair of hours
        // sees the same index sections.
        let key = format!(
            "{}:{}",
            range.start.div_euclid(NANOS_PER_HOUR),
            range.end.div_euclid(NANOS_PER_HOUR)
        );

        {
            let mut cache = self.cache.lock();
            if let Some((response, inserted)) = cache.get(&key) {
                if inserted.elapsed() < self.ttl {
                    self.counters.hit();
                    return Ok((response.clone(), true));
                }
                cache.pop(&key);
            }
            self.counters.miss();
        }

        let executor = Arc::clone(&self.executor);
        let sets = match run_storage(move || executor.metadata(range)).await {
            Ok(sets) => sets,
            Err(err) => {
                // Index-only path failed; fall back to a full scan.
                warn!(err = %err, "metadata index path failed, scanning events");
                let executor = Arc::clone(&self.executor);
                let cancel = cancel.clone();
                run_storage(move || scan_metadata(&executor, &cancel, range)).await?
            }
        };
        let response = MetadataResponse::from(sets);
        self.cache
            .lock()
            .push(key, (response.clone(), Instant::now()));
        Ok((response, false))
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }
}

fn scan_metadata(
    executor: &QueryExecutor,
    cancel: &CancellationToken,
    range: TimeRange,
) -> Result<MetadataSets> {
    use std::collections::BTreeSet;
    let outcome = executor.query(
        cancel,
        &EventQuery {
            range,
            filters: QueryFilters::default(),
            limit: None,
            descending: false,
        },
    )?;
    let mut namespaces = BTreeSet::new();
    let mut kinds = BTreeSet::new();
    let mut groups = BTreeSet::new();
    for event in &outcome.events {
        namespaces.insert(event.resource.namespace.clone());
        kinds.insert(event.resource.kind.clone());
        groups.insert(event.resource.group.clone());
    }
    Ok(MetadataSets {
        namespaces: namespaces.into_iter().collect(),
        kinds: kinds.into_iter().collect(),
        groups: groups.into_iter().collect(),
    })
}
