//! Unified search across the event store and the log template store.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::logs::{TemplateRecord, TemplateStore};
use crate::model::{normalize_timestamp, Event, TimeRange};
use crate::service::run_storage;
use crate::storage::{EventQuery, QueryExecutor, QueryFilters, QueryStats};

const DEFAULT_LIMIT: usize = 200;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchParams {
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub namespace: Option<String>,
    pub kind: Option<String>,
    pub group: Option<String>,
    pub version: Option<String>,
    pub name: Option<String>,
    /// Free-text needle matched against template patterns.
    pub q: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub events: Vec<Event>,
    pub templates: Vec<TemplateRecord>,
    pub blocks_scanned: u32,
    pub blocks_skipped: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

pub struct SearchService {
    executor: Arc<QueryExecutor>,
    templates: Arc<TemplateStore>,
}

impl SearchService {
    pub fn new(executor: Arc<QueryExecutor>, templates: Arc<TemplateStore>) -> Self {
        Self { executor, templates }
    }

    pub async fn search(
        &self,
        cancel: &CancellationToken,
        params: SearchParams,
    ) -> Result<SearchResponse> {
        let start = params
            .start
            .ok_or_else(|| crate::error::SpectreError::Validation("start is required".into()))?;
        let end = params
            .end
            .ok_or_else(|| crate::error::SpectreError::Validation("end is required".into()))?;
        let range = TimeRange::new(normalize_timestamp(start), normalize_timestamp(end))?;
        let limit = params.limit.unwrap_or(DEFAULT_LIMIT);

        let filters = QueryFilters {
            kind: params.kind.clone(),
            namespace: params.namespace.clone(),
            group: params.group.clone(),
            name: params.name.clone(),
        };
        let executor = Arc::clone(&self.executor);
        let cancel_clone = cancel.clone();
        let version = params.version.clone();
        let outcome = run_storage(move || {
            let mut outcome = executor.query(
                &cancel_clone,
                &EventQuery {
                    range,
                    filters,
                    // Version is filtered after the fact, so the limit
                    // is applied below rather than in the executor.
                    limit: None,
                    descending: false,
                },
            )?;
            if let Some(version) = version {
                outcome.events.retain(|e| e.resource.version == version);
            }
            outcome.events.truncate(limit);
            Ok(outcome)
        })
        .await?;

        let templates = self
            .templates
            .search(params.namespace.as_deref(), params.q.as_deref());

        let QueryStats {
            blocks_scanned,
            blocks_skipped,
            warnings,
            ..
        } = outcome.stats;
        Ok(SearchResponse {
            events: outcome.events,
            templates,
            blocks_scanned,
            blocks_skipped,
            warnings,
        })
    }
}
