//! Read-through caching in front of the graph store.
//!
//! Two caches: query results (LRU + TTL, snapshots of result rows,
//! write queries bypass) and resource lookups (uid- and name-keyed,
//! invalidated by the pipeline on identity-changing writes). Cache
//! locks are short critical sections released before the underlying
//! query is issued.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::warn;

use crate::config::GraphConfig;
use crate::error::{Result, SpectreError};
use crate::graph::store::{is_write_query, GraphQuery, GraphStore, QueryResult};
use crate::graph::GraphNode;

/// Hit/miss/eviction counters shared by both cache kinds.
#[derive(Debug, Default)]
pub struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheCounters {
    pub fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn evicted(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.evictions.load(Ordering::Relaxed),
        )
    }
}

struct CachedEntry {
    result: QueryResult,
    inserted: Instant,
}

/// Cached wrapper every reader goes through.
pub struct CachedGraphClient {
    store: Arc<dyn GraphStore>,
    cache: Mutex<LruCache<String, CachedEntry>>,
    ttl: Duration,
    timeout: Duration,
    slow_threshold: Duration,
    pub counters: CacheCounters,
}

impl CachedGraphClient {
    pub fn new(store: Arc<dyn GraphStore>, config: &GraphConfig) -> Self {
        let capacity = NonZeroUsize::new(config.query_cache_capacity.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            cache: Mutex::new(LruCache::new(capacity)),
            ttl: config.query_cache_ttl(),
            timeout: config.query_timeout(),
            slow_threshold: config.slow_query_threshold(),
            counters: CacheCounters::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    /// Executes one query. Reads are served from the cache when fresh;
    /// write queries always bypass and are never stored.
    pub async fn execute(&self, query: GraphQuery) -> Result<QueryResult> {
        let write = is_write_query(&query.query);
        let key = cache_key(&query);

        if !write {
            let mut cache = self.cache.lock();
            if let Some(entry) = cache.get(&key) {
                if entry.inserted.elapsed() < self.ttl {
                    self.counters.hit();
                    return Ok(entry.result.clone());
                }
                cache.pop(&key);
            }
            self.counters.miss();
        }

        let started = Instant::now();
        let result = tokio::time::timeout(self.timeout, self.store.execute_query(query.clone()))
            .await
            .map_err(|_| SpectreError::Timeout(format!("graph query exceeded {:?}", self.timeout)))??;
        let elapsed = started.elapsed();
        if elapsed > self.slow_threshold {
            warn!(elapsed_ms = elapsed.as_millis() as u64, query = %query.query, "slow graph query");
        }

        if !write {
            let mut cache = self.cache.lock();
            if cache
                .push(
                    key,
                    CachedEntry {
                        result: result.clone(),
                        inserted: Instant::now(),
                    },
                )
                .is_some_and(|(old_key, _)| !cache.contains(&old_key))
            {
                self.counters.evicted();
            }
        }
        Ok(result)
    }

    /// One retry with a short backoff for transient and timeout errors;
    /// the second failure is surfaced.
    pub async fn execute_with_retry(&self, query: GraphQuery) -> Result<QueryResult> {
        match self.execute(query.clone()).await {
            Ok(result) => Ok(result),
            Err(err) if err.is_retriable() => {
                tokio::time::sleep(Duration::from_millis(100)).await;
                self.execute(query).await
            }
            Err(err) => Err(err),
        }
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }
}

fn cache_key(query: &GraphQuery) -> String {
    // serde_json maps are ordered, so parameter serialization is
    // canonical for identical parameter sets.
    format!(
        "{}|{}",
        query.query.trim(),
        serde_json::to_string(&query.parameters).unwrap_or_default()
    )
}

/// Uid- and name-keyed cache for extractor reference resolution.
pub struct LookupCache {
    by_uid: Mutex<LruCache<String, GraphNode>>,
    by_name: Mutex<LruCache<String, String>>,
    pub counters: CacheCounters,
}

impl LookupCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            by_uid: Mutex::new(LruCache::new(capacity)),
            by_name: Mutex::new(LruCache::new(capacity)),
            counters: CacheCounters::default(),
        }
    }

    pub fn get_by_uid(&self, uid: &str) -> Option<GraphNode> {
        let mut cache = self.by_uid.lock();
        match cache.get(uid) {
            Some(node) => {
                self.counters.hit();
                Some(node.clone())
            }
            None => {
                self.counters.miss();
                None
            }
        }
    }

    pub fn get_by_name(&self, name_key: &str) -> Option<GraphNode> {
        let uid = {
            let mut names = self.by_name.lock();
            names.get(name_key).cloned()
        };
        match uid {
            Some(uid) => self.get_by_uid(&uid),
            None => {
                self.counters.miss();
                None
            }
        }
    }

    pub fn put(&self, node: GraphNode) {
        let name_key = node.name_key();
        let uid = node.uid.clone();
        if let Some((old, _)) = self.by_name.lock().push(name_key.clone(), uid.clone()) {
            if old != name_key {
                self.counters.evicted();
            }
        }
        if let Some((old, _)) = self.by_uid.lock().push(uid.clone(), node) {
            if old != uid {
                self.counters.evicted();
            }
        }
    }

    /// Drops both addresses of a resource, used on deletes and on any
    /// write that could change identity.
    pub fn invalidate(&self, uid: &str, name_key: &str) {
        self.by_uid.lock().pop(uid);
        self.by_name.lock().pop(name_key);
    }

    pub fn clear(&self) {
        self.by_uid.lock().clear();
        self.by_name.lock().clear();
    }
}
