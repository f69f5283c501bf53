//! Timeline reconstruction over a window, with pagination.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::anomaly::severity;
use crate::error::{Result, SpectreError};
use crate::k8s;
use crate::model::{
    normalize_timestamp, Event, EventKind, FinalState, ResourceRef, Severity, TimeRange, UnixNanos,
    NANOS_PER_HOUR,
};
use crate::service::run_storage;
use crate::storage::{EventQuery, QueryExecutor, QueryFilters};

const DEFAULT_LIMIT: usize = 500;
const MAX_LIMIT: usize = 5_000;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimelineParams {
    pub start: Option<i64>,
    pub end: Option<i64>,
    /// Point-in-time snapshot instant instead of a window.
    pub at: Option<i64>,
    pub namespace: Option<String>,
    pub kind: Option<String>,
    pub group: Option<String>,
    pub name: Option<String>,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
    pub order: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TimelineEvent {
    pub id: String,
    pub timestamp: UnixNanos,
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
}

#[derive(Debug, Serialize)]
pub struct TimelineEntry {
    pub resource: ResourceRef,
    pub events: Vec<TimelineEvent>,
}

#[derive(Debug, Serialize)]
pub struct SnapshotEntry {
    pub key: String,
    pub state: FinalState,
}

#[derive(Debug, Default, Serialize)]
pub struct TimelineResponse {
    pub entries: Vec<TimelineEntry>,
    pub total_events: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Vec<SnapshotEntry>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

pub struct TimelineService {
    executor: Arc<QueryExecutor>,
}

impl TimelineService {
    pub fn new(executor: Arc<QueryExecutor>) -> Self {
        Self { executor }
    }

    pub async fn timeline(
        &self,
        cancel: &CancellationToken,
        params: TimelineParams,
    ) -> Result<TimelineResponse> {
        if let Some(at) = params.at {
            return self.snapshot(cancel, normalize_timestamp(at), &params).await;
        }
        let (range, filters) = parse_window(&params)?;
        let limit = params.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
        let offset = decode_cursor(params.cursor.as_deref())?;
        let descending = params.order.as_deref() == Some("desc");

        // One bounded storage query per hour shard; shards run
        // concurrently on the blocking pool and merge by timestamp.
        let shards = hour_shards(range);
        let concurrency = self.executor.store().config().file_concurrency.max(1);
        let semaphore = Arc::new(tokio::sync::Semaphore::new(concurrency));
        let mut handles = Vec::with_capacity(shards.len());
        for shard in shards {
            let executor = Arc::clone(&self.executor);
            let filters = filters.clone();
            let cancel = cancel.clone();
            let semaphore = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| SpectreError::Cancelled)?;
                run_storage(move || {
                    executor.query(
                        &cancel,
                        &EventQuery {
                            range: shard,
                            filters,
                            limit: None,
                            descending: false,
                        },
                    )
                })
                .await
            }));
        }

        let mut events: Vec<Event> = Vec::new();
        let mut warnings = Vec::new();
        for handle in handles {
            let outcome = handle
                .await
                .map_err(|err| SpectreError::Internal(format!("timeline shard panicked: {err}")))??;
            warnings.extend(outcome.stats.warnings);
            events.extend(outcome.events);
        }
        events.sort_by_key(|e| e.timestamp);
        if descending {
            events.reverse();
        }

        let total = events.len();
        let page: Vec<Event> = events.into_iter().skip(offset).take(limit).collect();
        let next_cursor = (offset + page.len() < total).then(|| encode_cursor(offset + limit));

        let mut entries: Vec<TimelineEntry> = Vec::new();
        for event in &page {
            let timeline_event = to_timeline_event(event);
            match entries
                .iter_mut()
                .find(|entry| entry.resource.uid == event.resource.uid)
            {
                Some(entry) => entry.events.push(timeline_event),
                None => entries.push(TimelineEntry {
                    resource: event.resource.clone(),
                    events: vec![timeline_event],
                }),
            }
        }
        Ok(TimelineResponse {
            entries,
            total_events: total,
            next_cursor,
            snapshot: None,
            warnings,
        })
    }

    async fn snapshot(
        &self,
        cancel: &CancellationToken,
        at: UnixNanos,
        params: &TimelineParams,
    ) -> Result<TimelineResponse> {
        let filters = QueryFilters {
            kind: params.kind.clone(),
            namespace: params.namespace.clone(),
            group: params.group.clone(),
            name: params.name.clone(),
        };
        let executor = Arc::clone(&self.executor);
        let cancel = cancel.clone();
        let outcome = run_storage(move || executor.snapshot_at(&cancel, at, &filters)).await?;
        let snapshot = outcome
            .resources
            .into_iter()
            .map(|(key, state)| SnapshotEntry { key, state })
            .collect();
        Ok(TimelineResponse {
            entries: Vec::new(),
            total_events: 0,
            next_cursor: None,
            snapshot: Some(snapshot),
            warnings: outcome.stats.warnings,
        })
    }
}

fn to_timeline_event(event: &Event) -> TimelineEvent {
    let (reason, message, severity) = if event.resource.kind == "Event" {
        let reason = k8s::field_str(&event.payload, "reason").map(str::to_string);
        let message = k8s::field_str(&event.payload, "message").map(str::to_string);
        let severity = reason
            .as_deref()
            .map(severity::native_reason_severity);
        (reason, message, severity)
    } else {
        (None, None, None)
    };
    TimelineEvent {
        id: event.id.clone(),
        timestamp: event.timestamp,
        kind: event.kind,
        reason,
        message,
        severity,
    }
}

pub(crate) fn parse_window(params: &TimelineParams) -> Result<(TimeRange, QueryFilters)> {
    let start = params
        .start
        .ok_or_else(|| SpectreError::Validation("start is required".into()))?;
    let end = params
        .end
        .ok_or_else(|| SpectreError::Validation("end is required".into()))?;
    let range = TimeRange::new(normalize_timestamp(start), normalize_timestamp(end))?;
    let filters = QueryFilters {
        kind: params.kind.clone(),
        namespace: params.namespace.clone(),
        group: params.group.clone(),
        name: params.name.clone(),
    };
    Ok((range, filters))
}

fn hour_shards(range: TimeRange) -> Vec<TimeRange> {
    let mut shards = Vec::new();
    let mut cursor = range.start;
    while cursor <= range.end {
        let shard_end = ((cursor / NANOS_PER_HOUR) + 1) * NANOS_PER_HOUR - 1;
        shards.push(TimeRange {
            start: cursor,
            end: shard_end.min(range.end),
        });
        cursor = shard_end + 1;
    }
    shards
}

fn encode_cursor(offset: usize) -> String {
    BASE64.encode(format!("offset:{offset}"))
}

fn decode_cursor(cursor: Option<&str>) -> Result<usize> {
    let Some(cursor) = cursor else {
        return Ok(0);
    };
    let raw = BASE64
        .decode(cursor)
        .map_err(|_| SpectreError::Validation("malformed cursor".into()))?;
    let text = String::from_utf8(raw)
        .map_err(|_| SpectreError::Validation("malformed cursor".into()))?;
    text.strip_prefix("offset:")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| SpectreError::Validation("malformed cursor".into()))
}
