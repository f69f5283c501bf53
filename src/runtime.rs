//! Process assembly: constructs the storage engine, graph pipeline,
//! services, and integration manager once, and hands the shared
//! instances to every consumer.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::analyze::CausalAnalyzer;
use crate::api::AppState;
use crate::config::Config;
use crate::error::Result;
use crate::graph::cache::{CachedGraphClient, LookupCache};
use crate::graph::memory::MemoryGraphStore;
use crate::graph::pipeline::GraphPipeline;
use crate::graph::store::GraphStore;
use crate::integration::{GraphStoreIntegration, IntegrationManager, TemplatePersister};
use crate::logs::TemplateStore;
use crate::model::{Event, UnixNanos, NANOS_PER_SECOND};
use crate::service::{
    GraphService, MetadataService, SearchService, TimelineService, ToolRegistry,
};
use crate::storage::{EventStore, QueryExecutor};

pub struct Runtime {
    pub config: Config,
    pub store: Arc<EventStore>,
    pub executor: Arc<QueryExecutor>,
    pub graph_store: Arc<dyn GraphStore>,
    pub client: Arc<CachedGraphClient>,
    pub pipeline: Arc<GraphPipeline>,
    pub templates: Arc<TemplateStore>,
    pub manager: Arc<IntegrationManager>,
    pub state: Arc<AppState>,
    pub tools: Arc<ToolRegistry>,
}

impl Runtime {
    /// Boots against the embedded graph store.
    pub async fn start(config: Config) -> Result<Self> {
        Self::start_with(config, Arc::new(MemoryGraphStore::new())).await
    }

    /// Boots against any graph store implementation.
    pub async fn start_with(config: Config, graph_store: Arc<dyn GraphStore>) -> Result<Self> {
        let store = Arc::new(EventStore::open(config.storage.clone())?);
        let executor = Arc::new(QueryExecutor::new(Arc::clone(&store)));

        let client = Arc::new(CachedGraphClient::new(
            Arc::clone(&graph_store),
            &config.graph,
        ));
        let lookup = Arc::new(LookupCache::new(config.graph.lookup_cache_capacity));
        let pipeline = Arc::new(GraphPipeline::spawn(
            Arc::clone(&graph_store),
            Arc::clone(&client),
            Arc::clone(&lookup),
            &config.graph,
        ));
        let templates = Arc::new(TemplateStore::open(config.templates.clone()));

        let mut manager = IntegrationManager::new();
        manager.register(Arc::new(GraphStoreIntegration::new(Arc::clone(
            &graph_store,
        ))));
        manager.register(Arc::new(TemplatePersister::new(
            Arc::clone(&templates),
            Duration::from_secs(config.templates.snapshot_interval_secs),
        )));
        let manager = Arc::new(manager);
        manager.start_all().await?;

        let timeline = Arc::new(TimelineService::new(Arc::clone(&executor)));
        let analyzer = CausalAnalyzer::new(Arc::clone(&client), config.analyzer.clone());
        let graph_service = Arc::new(GraphService::new(
            Arc::clone(&client),
            analyzer,
            Arc::clone(&executor),
            config.anomaly.clone(),
        ));
        let metadata = Arc::new(MetadataService::new(
            Arc::clone(&executor),
            config.graph.query_cache_ttl(),
        ));
        let search = Arc::new(SearchService::new(
            Arc::clone(&executor),
            Arc::clone(&templates),
        ));

        let tools = Arc::new(ToolRegistry::new(
            Arc::clone(&timeline),
            Arc::clone(&graph_service),
            Arc::clone(&metadata),
            Arc::clone(&search),
        ));
        let state = Arc::new(AppState {
            timeline,
            graph: graph_service,
            metadata,
            search,
            store: Arc::clone(&store),
            manager: Arc::clone(&manager),
        });

        Ok(Self {
            config,
            store,
            executor,
            graph_store,
            client,
            pipeline,
            templates,
            manager,
            state,
            tools,
        })
    }

    /// Event capture entry point: persist first, then hand off to the
    /// graph pipeline. Storage errors propagate to the caller; pipeline
    /// buffering never blocks.
    pub fn submit_event(&self, event: Event) -> Result<()> {
        self.store.write_event(event.clone())?;
        self.pipeline.submit(event);
        Ok(())
    }

    /// Periodic retention over both stores, jittered so instances do not
    /// synchronize their IO.
    pub fn spawn_retention(&self, now_fn: fn() -> UnixNanos) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let graph_store = Arc::clone(&self.graph_store);
        let interval = Duration::from_secs(self.config.storage.retention_interval_secs.max(60));
        let graph_horizon_nanos =
            self.config.storage.retention_max_age().as_secs() as i64 * NANOS_PER_SECOND;
        tokio::spawn(async move {
            let jitter = rand::thread_rng().gen_range(0..interval.as_secs() / 10 + 1);
            tokio::time::sleep(Duration::from_secs(jitter)).await;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let now = now_fn();
                let store = Arc::clone(&store);
                match tokio::task::spawn_blocking(move || store.run_retention(now)).await {
                    Ok(Ok(report)) if report.files_deleted > 0 || report.states_dropped > 0 => {
                        info!(
                            files_deleted = report.files_deleted,
                            states_dropped = report.states_dropped,
                            "storage retention pass"
                        );
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => warn!(err = %err, "storage retention failed"),
                    Err(err) => warn!(err = %err, "retention task panicked"),
                }
                match graph_store
                    .delete_nodes_by_timestamp(now - graph_horizon_nanos)
                    .await
                {
                    Ok(removed) if removed > 0 => {
                        info!(removed, "graph retention removed deleted identities");
                    }
                    Ok(_) => {}
                    Err(err) => warn!(err = %err, "graph retention failed"),
                }
            }
        })
    }

    /// Clean shutdown: drain the pipeline, stop integrations (final
    /// template snapshot included), seal the open hour file.
    pub async fn shutdown(&self) -> Result<()> {
        if let Err(err) = self.pipeline.shutdown().await {
            warn!(err = %err, "pipeline shutdown failed");
        }
        self.manager.stop_all().await;
        let store = Arc::clone(&self.store);
        crate::service::run_storage(move || store.finalize_open()).await
    }
}
