//! Query execution over the block store.
//!
//! Pipeline: select overlapping hour files, select candidate blocks per
//! file (inverted indexes, Bloom filters, timestamp ranges), decompress
//! candidates on a bounded worker pool, filter events, merge and order.
//! The open hour participates through a writer snapshot: its sealed
//! blocks are read from disk, its unsealed buffer straight from memory.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{Result, SpectreError};
use crate::model::{Event, EventKind, FinalState, TimeRange, UnixNanos, NANOS_PER_SECOND};
use crate::storage::block::BlockMeta;
use crate::storage::file::{self, FileReader, IndexSection};
use crate::storage::store::EventStore;

/// Exact-match filters; `name` is not indexed and is applied only during
/// the event-filter stage.
#[derive(Debug, Clone, Default)]
pub struct QueryFilters {
    pub kind: Option<String>,
    pub namespace: Option<String>,
    pub group: Option<String>,
    pub name: Option<String>,
}

impl QueryFilters {
    pub fn matches(&self, event: &Event) -> bool {
        let r = &event.resource;
        self.kind.as_deref().is_none_or(|v| v == r.kind)
            && self.namespace.as_deref().is_none_or(|v| v == r.namespace)
            && self.group.as_deref().is_none_or(|v| v == r.group)
            && self.name.as_deref().is_none_or(|v| v == r.name)
    }
}

#[derive(Debug, Clone)]
pub struct EventQuery {
    pub range: TimeRange,
    pub filters: QueryFilters,
    pub limit: Option<usize>,
    pub descending: bool,
}

/// Per-query accounting exposed through response envelopes so degraded
/// reads are never silent.
#[derive(Debug, Default, Clone)]
pub struct QueryStats {
    pub files_scanned: u32,
    pub blocks_scanned: u32,
    pub blocks_skipped: u32,
    pub index_less_files: u32,
    pub warnings: Vec<String>,
}

#[derive(Debug, Default, Clone)]
pub struct QueryOutcome {
    pub events: Vec<Event>,
    pub stats: QueryStats,
}

/// Point-in-time view of every resource as of some instant.
#[derive(Debug, Default, Clone)]
pub struct SnapshotOutcome {
    pub resources: BTreeMap<String, FinalState>,
    pub stats: QueryStats,
}

/// Distinct metadata values over a window, served from index sections
/// without decompressing blocks.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetadataSets {
    pub namespaces: Vec<String>,
    pub kinds: Vec<String>,
    pub groups: Vec<String>,
}

struct BlockTask {
    path: PathBuf,
    meta: BlockMeta,
    hour: i64,
}

enum TaskOutput {
    Events { hour: i64, block_id: u32, events: Vec<Event> },
    Failed { hour: i64, block_id: u32, message: String },
}

pub struct QueryExecutor {
    store: Arc<EventStore>,
}

impl QueryExecutor {
    pub fn new(store: Arc<EventStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    /// Runs a filtered range query. Observes `cancel` at file and block
    /// boundaries; in-flight decompressions finish their current block.
    pub fn query(&self, cancel: &CancellationToken, query: &EventQuery) -> Result<QueryOutcome> {
        if cancel.is_cancelled() {
            return Err(SpectreError::Cancelled);
        }
        let mut stats = QueryStats::default();
        let open = self.store.snapshot_open();
        let open_path = open.as_ref().map(|s| s.path.clone());

        let mut tasks: Vec<BlockTask> = Vec::new();
        for (hour, path) in self.store.list_files()? {
            if !file::hour_overlaps(hour, query.range.start, query.range.end) {
                continue;
            }
            if Some(&path) == open_path.as_ref() {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(SpectreError::Cancelled);
            }
            let reader = match FileReader::open(&path) {
                Ok(reader) => reader,
                Err(err) => {
                    warn!(file = %path.display(), err = %err, "skipping unreadable file");
                    stats.blocks_skipped += 1;
                    stats
                        .warnings
                        .push(format!("file {} unreadable: {err}", path.display()));
                    continue;
                }
            };
            stats.files_scanned += 1;
            if reader.index_less {
                stats.index_less_files += 1;
                stats
                    .warnings
                    .push(format!("file {} served without its index", path.display()));
            }
            stats.blocks_skipped += reader.skipped_blocks;
            self.collect_candidates(&reader.index, &path, hour, query, &mut tasks);
        }

        // The open hour: sealed blocks come from disk, the active buffer
        // from the snapshot itself.
        let mut buffered: Vec<Event> = Vec::new();
        if let Some(snapshot) = open {
            if file::hour_overlaps(snapshot.hour_epoch, query.range.start, query.range.end) {
                stats.files_scanned += 1;
                self.collect_candidates(
                    &snapshot.index,
                    &snapshot.path,
                    snapshot.hour_epoch,
                    query,
                    &mut tasks,
                );
                buffered = snapshot.buffered;
            }
        }

        let outputs = self.run_tasks(cancel, tasks, &mut stats)?;

        // (hour, block id, intra-block position) reconstructs append
        // order so equal timestamps keep insertion order after sorting.
        let mut keyed: Vec<(UnixNanos, i64, u32, usize, Event)> = Vec::new();
        for output in outputs {
            match output {
                TaskOutput::Events { hour, block_id, events } => {
                    stats.blocks_scanned += 1;
                    for (pos, event) in events.into_iter().enumerate() {
                        if query.range.contains(event.timestamp) && query.filters.matches(&event) {
                            keyed.push((event.timestamp, hour, block_id, pos, event));
                        }
                    }
                }
                TaskOutput::Failed { hour, block_id, message } => {
                    stats.blocks_skipped += 1;
                    stats
                        .warnings
                        .push(format!("block {block_id} in hour {hour} skipped: {message}"));
                }
            }
        }
        for (pos, event) in buffered.into_iter().enumerate() {
            if query.range.contains(event.timestamp) && query.filters.matches(&event) {
                keyed.push((event.timestamp, i64::MAX, u32::MAX, pos, event));
            }
        }

        keyed.sort_by(|a, b| (a.0, a.1, a.2, a.3).cmp(&(b.0, b.1, b.2, b.3)));
        let mut events: Vec<Event> = keyed.into_iter().map(|(_, _, _, _, e)| e).collect();
        if query.descending {
            events.reverse();
        }
        if let Some(limit) = query.limit {
            events.truncate(limit);
        }
        Ok(QueryOutcome { events, stats })
    }

    /// All resources as of `at`: seeded from the final-state map of the
    /// last file finalized before the instant's hour, then overlaid with
    /// this hour's events up to `at`.
    pub fn snapshot_at(
        &self,
        cancel: &CancellationToken,
        at: UnixNanos,
        filters: &QueryFilters,
    ) -> Result<SnapshotOutcome> {
        let mut stats = QueryStats::default();
        let at_hour_start =
            file::hour_epoch_for(at, self.store.tz_offset()) * NANOS_PER_SECOND;
        let mut resources: BTreeMap<String, FinalState> = BTreeMap::new();

        // Seed: most recent finalized file strictly before this hour.
        let open = self.store.snapshot_open();
        let open_path = open.as_ref().map(|s| s.path.clone());
        let seed_path = self
            .store
            .list_files()?
            .into_iter()
            .filter(|(hour, path)| {
                *hour * NANOS_PER_SECOND < at_hour_start && Some(path) != open_path.as_ref()
            })
            .next_back()
            .map(|(_, path)| path);
        let mut seed_index: Option<IndexSection> = None;
        if let Some(path) = seed_path {
            match FileReader::open(&path) {
                Ok(reader) => seed_index = Some(reader.index),
                Err(err) => {
                    stats
                        .warnings
                        .push(format!("seed file {} unreadable: {err}", path.display()));
                }
            }
        }
        if let Some(index) = seed_index {
            for (key, state) in index.final_states {
                resources.insert(key, state);
            }
        } else if let Some(snapshot) = &open {
            if snapshot.hour_epoch * NANOS_PER_SECOND >= at_hour_start {
                // No earlier finalized file: the open file's carried-over
                // map is the only seed available. Entries newer than the
                // instant are replaced by the replay below or dropped.
                for (key, state) in &snapshot.index.final_states {
                    if state.timestamp <= at {
                        resources.insert(key.clone(), state.clone());
                    }
                }
            }
        }

        // Replay the hour containing `at` to overlay later events.
        let replay = EventQuery {
            range: TimeRange::new(at_hour_start, at)?,
            filters: QueryFilters::default(),
            limit: None,
            descending: false,
        };
        let outcome = self.query(cancel, &replay)?;
        stats.warnings.extend(outcome.stats.warnings.clone());
        stats.blocks_scanned += outcome.stats.blocks_scanned;
        stats.blocks_skipped += outcome.stats.blocks_skipped;
        for event in outcome.events {
            let key = event.resource.state_key();
            resources.insert(
                key,
                FinalState {
                    uid: event.resource.uid.clone(),
                    group: event.resource.group.clone(),
                    version: event.resource.version.clone(),
                    timestamp: event.timestamp,
                    event_kind: event.kind,
                    snapshot: crate::k8s::minimal_snapshot(&event.payload),
                },
            );
        }

        resources.retain(|key, state| {
            if state.event_kind == EventKind::Delete {
                return false;
            }
            let mut parts = key.splitn(3, '/');
            let ns = parts.next().unwrap_or_default();
            let kind = parts.next().unwrap_or_default();
            let name = parts.next().unwrap_or_default();
            filters.kind.as_deref().is_none_or(|v| v == kind)
                && filters.namespace.as_deref().is_none_or(|v| v == ns)
                && filters.name.as_deref().is_none_or(|v| v == name)
                && filters.group.as_deref().is_none_or(|v| v == state.group)
        });
        Ok(SnapshotOutcome { resources, stats })
    }

    /// Distinct namespaces/kinds/groups over a window, read from index
    /// sections plus the open buffer. Never decompresses a block.
    pub fn metadata(&self, range: TimeRange) -> Result<MetadataSets> {
        use std::collections::BTreeSet;
        let mut namespaces = BTreeSet::new();
        let mut kinds = BTreeSet::new();
        let mut groups = BTreeSet::new();

        let open = self.store.snapshot_open();
        let open_path = open.as_ref().map(|s| s.path.clone());
        for (hour, path) in self.store.list_files()? {
            if !file::hour_overlaps(hour, range.start, range.end) {
                continue;
            }
            if Some(&path) == open_path.as_ref() {
                continue;
            }
            let reader = match FileReader::open(&path) {
                Ok(reader) => reader,
                Err(err) => {
                    warn!(file = %path.display(), err = %err, "metadata scan skipping file");
                    continue;
                }
            };
            namespaces.extend(reader.index.namespace_to_blocks.keys().cloned());
            kinds.extend(reader.index.kind_to_blocks.keys().cloned());
            groups.extend(reader.index.group_to_blocks.keys().cloned());
        }
        if let Some(snapshot) = open {
            if file::hour_overlaps(snapshot.hour_epoch, range.start, range.end) {
                namespaces.extend(snapshot.index.namespace_to_blocks.keys().cloned());
                kinds.extend(snapshot.index.kind_to_blocks.keys().cloned());
                groups.extend(snapshot.index.group_to_blocks.keys().cloned());
                for event in &snapshot.buffered {
                    namespaces.insert(event.resource.namespace.clone());
                    kinds.insert(event.resource.kind.clone());
                    groups.insert(event.resource.group.clone());
                }
            }
        }
        Ok(MetadataSets {
            namespaces: namespaces.into_iter().collect(),
            kinds: kinds.into_iter().collect(),
            groups: groups.into_iter().collect(),
        })
    }

    fn collect_candidates(
        &self,
        index: &IndexSection,
        path: &std::path::Path,
        hour: i64,
        query: &EventQuery,
        tasks: &mut Vec<BlockTask>,
    ) {
        let candidates = index.candidate_blocks(
            query.filters.kind.as_deref(),
            query.filters.namespace.as_deref(),
            query.filters.group.as_deref(),
            query.range.start,
            query.range.end,
        );
        for meta in candidates {
            tasks.push(BlockTask {
                path: path.to_path_buf(),
                meta: meta.clone(),
                hour,
            });
        }
    }

    /// Decompresses candidate blocks on a bounded pool of scoped worker
    /// threads. Workers stop picking up new blocks once `cancel` fires.
    fn run_tasks(
        &self,
        cancel: &CancellationToken,
        tasks: Vec<BlockTask>,
        _stats: &mut QueryStats,
    ) -> Result<Vec<TaskOutput>> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        let config = self.store.config();
        let workers = (config.file_concurrency.max(1) * config.block_concurrency.max(1))
            .min(tasks.len())
            .max(1);

        let next = AtomicUsize::new(0);
        let outputs: Mutex<Vec<TaskOutput>> = Mutex::new(Vec::with_capacity(tasks.len()));
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    if cancel.is_cancelled() {
                        return;
                    }
                    let i = next.fetch_add(1, Ordering::Relaxed);
                    if i >= tasks.len() {
                        return;
                    }
                    let task = &tasks[i];
                    let output = match file::read_block_at(&task.path, &task.meta) {
                        Ok(events) => TaskOutput::Events {
                            hour: task.hour,
                            block_id: task.meta.id,
                            events,
                        },
                        Err(err) => {
                            warn!(
                                file = %task.path.display(),
                                block_id = task.meta.id,
                                err = %err,
                                "skipping unreadable block"
                            );
                            TaskOutput::Failed {
                                hour: task.hour,
                                block_id: task.meta.id,
                                message: err.to_string(),
                            }
                        }
                    };
                    outputs.lock().push(output);
                });
            }
        });
        if cancel.is_cancelled() {
            return Err(SpectreError::Cancelled);
        }
        Ok(outputs.into_inner())
    }
}
