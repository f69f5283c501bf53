//! Event → graph pipeline.
//!
//! Storage-committed events are buffered on a bounded queue (overflow
//! drops the oldest event and counts it) and consumed by a worker that
//! derives the change record, then runs every matching extractor in
//! priority order. Extractor failures are logged and skipped; an event
//! counts as committed to the graph once all extractors had their
//! attempt, so reprocessing is always safe.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::GraphConfig;
use crate::error::Result;
use crate::graph::cache::{CachedGraphClient, LookupCache};
use crate::graph::extract::{default_extractors, Extractor, Resolver};
use crate::graph::queries;
use crate::graph::store::GraphStore;
use crate::k8s;
use crate::model::{ChangeRecord, Event, EventKind};

struct EventQueue {
    buf: Mutex<VecDeque<Event>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl EventQueue {
    fn push(&self, event: Event) {
        {
            let mut buf = self.buf.lock();
            if buf.len() >= self.capacity {
                buf.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            buf.push_back(event);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Event> {
        self.buf.lock().pop_front()
    }
}

/// Per-event processing state: the extractor set, reference resolution,
/// and the previous-payload cache used for diffing.
pub struct PipelineWorker {
    store: Arc<dyn GraphStore>,
    client: Arc<CachedGraphClient>,
    resolver: Resolver,
    extractors: Vec<Box<dyn Extractor>>,
    last_payload: LruCache<String, Value>,
}

impl PipelineWorker {
    pub fn new(
        store: Arc<dyn GraphStore>,
        client: Arc<CachedGraphClient>,
        lookup: Arc<LookupCache>,
        config: &GraphConfig,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.last_payload_capacity.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            client: client.clone(),
            resolver: Resolver::new(client, lookup),
            extractors: default_extractors(),
            last_payload: LruCache::new(capacity),
        }
    }

    /// Processes one event to completion. Never fails: every error is
    /// logged and the remaining extractors still run.
    pub async fn process_event(&mut self, event: &Event) {
        let record = self.build_change_record(event);
        match queries::record_change_event(&event.resource.uid, &record) {
            Ok(query) => {
                if let Err(err) = self.client.execute(query).await {
                    warn!(event_id = %event.id, err = %err, "failed to record change event");
                }
            }
            Err(err) => warn!(event_id = %event.id, err = %err, "failed to encode change record"),
        }

        for extractor in &self.extractors {
            if !extractor.matches(event) {
                continue;
            }
            match extractor.extract(event, &self.resolver).await {
                Ok(output) => {
                    for node in output.nodes {
                        if let Err(err) = self.store.create_node(node).await {
                            warn!(extractor = extractor.name(), err = %err, "node upsert failed");
                        }
                    }
                    for edge in output.edges {
                        if let Err(err) = self.store.create_edge(edge).await {
                            warn!(extractor = extractor.name(), err = %err, "edge upsert failed");
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        extractor = extractor.name(),
                        event_id = %event.id,
                        err = %err,
                        "extractor failed, skipping"
                    );
                }
            }
        }

        match event.kind {
            EventKind::Delete => {
                self.last_payload.pop(&event.resource.uid);
            }
            _ => {
                self.last_payload
                    .put(event.resource.uid.clone(), event.payload.clone());
            }
        }
    }

    /// Derives the per-edit change record by diffing against the
    /// previous payload revision, when one is cached.
    fn build_change_record(&mut self, event: &Event) -> ChangeRecord {
        let diff = match event.kind {
            EventKind::Update => self
                .last_payload
                .get(&event.resource.uid)
                .map(|prev| k8s::diff(prev, &event.payload))
                .unwrap_or_default(),
            EventKind::Create | EventKind::Delete => Vec::new(),
        };
        let config_changed = diff.iter().any(|c| k8s::is_config_path(&c.path));
        let status_changed = diff.iter().any(|c| k8s::is_status_path(&c.path));
        ChangeRecord {
            event_id: event.id.clone(),
            timestamp: event.timestamp,
            event_type: event.kind,
            config_changed,
            status_changed,
            diff,
            snapshot: (event.kind == EventKind::Create)
                .then(|| k8s::minimal_snapshot(&event.payload)),
        }
    }
}

/// Handle owning the queue and the worker task.
pub struct GraphPipeline {
    queue: Arc<EventQueue>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl GraphPipeline {
    /// Spawns the pipeline worker on the current tokio runtime.
    pub fn spawn(
        store: Arc<dyn GraphStore>,
        client: Arc<CachedGraphClient>,
        lookup: Arc<LookupCache>,
        config: &GraphConfig,
    ) -> Self {
        let queue = Arc::new(EventQueue {
            buf: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: config.channel_capacity.max(1),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        let mut worker = PipelineWorker::new(store, client, lookup, config);
        let worker_queue = Arc::clone(&queue);
        let handle = tokio::spawn(async move {
            loop {
                match worker_queue.pop() {
                    Some(event) => worker.process_event(&event).await,
                    None => {
                        if worker_queue.closed.load(Ordering::Acquire) {
                            break;
                        }
                        worker_queue.notify.notified().await;
                    }
                }
            }
            debug!("graph pipeline worker drained and stopped");
        });
        Self {
            queue,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Enqueues one event. Never blocks; overflow drops the oldest
    /// buffered event.
    pub fn submit(&self, event: Event) {
        self.queue.push(event);
    }

    /// Events dropped to overflow since start.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    /// Buffered, not-yet-processed events.
    pub fn backlog(&self) -> usize {
        self.queue.buf.lock().len()
    }

    /// Stops the worker after the queue drains.
    pub async fn shutdown(&self) -> Result<()> {
        self.queue.closed.store(true, Ordering::Release);
        self.queue.notify.notify_one();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|err| crate::error::SpectreError::Internal(format!(
                    "pipeline worker panicked: {err}"
                )))?;
        }
        Ok(())
    }
}
