//! Lifecycle management for external adapters.
//!
//! Integrations start in registration order and stop in reverse; their
//! aggregated health backs the liveness endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::graph::store::GraphStore;
use crate::logs::TemplateStore;

#[derive(Debug, Clone, Serialize)]
pub struct IntegrationHealth {
    pub name: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[async_trait]
pub trait Integration: Send + Sync {
    fn name(&self) -> &'static str;
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn health(&self) -> IntegrationHealth;
}

#[derive(Default)]
pub struct IntegrationManager {
    integrations: Vec<Arc<dyn Integration>>,
}

impl IntegrationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, integration: Arc<dyn Integration>) {
        self.integrations.push(integration);
    }

    /// Starts every integration in registration order. On failure the
    /// already-started prefix is stopped in reverse before the error is
    /// surfaced.
    pub async fn start_all(&self) -> Result<()> {
        for (i, integration) in self.integrations.iter().enumerate() {
            if let Err(err) = integration.start().await {
                error!(integration = integration.name(), err = %err, "integration failed to start");
                for started in self.integrations[..i].iter().rev() {
                    if let Err(stop_err) = started.stop().await {
                        warn!(integration = started.name(), err = %stop_err, "stop during rollback failed");
                    }
                }
                return Err(err);
            }
            info!(integration = integration.name(), "integration started");
        }
        Ok(())
    }

    /// Stops in reverse registration order; errors are logged, not
    /// propagated, so every integration gets its shutdown attempt.
    pub async fn stop_all(&self) {
        for integration in self.integrations.iter().rev() {
            if let Err(err) = integration.stop().await {
                warn!(integration = integration.name(), err = %err, "integration failed to stop");
            }
        }
    }

    pub async fn health_report(&self) -> Vec<IntegrationHealth> {
        let mut out = Vec::with_capacity(self.integrations.len());
        for integration in &self.integrations {
            out.push(integration.health().await);
        }
        out
    }
}

/// Graph store lifecycle: connect and initialize the schema on start,
/// close on stop, ping for health.
pub struct GraphStoreIntegration {
    store: Arc<dyn GraphStore>,
}

impl GraphStoreIntegration {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Integration for GraphStoreIntegration {
    fn name(&self) -> &'static str {
        "graph-store"
    }

    async fn start(&self) -> Result<()> {
        self.store.connect().await?;
        self.store.initialize_schema().await
    }

    async fn stop(&self) -> Result<()> {
        self.store.close().await
    }

    async fn health(&self) -> IntegrationHealth {
        match self.store.ping().await {
            Ok(()) => IntegrationHealth {
                name: "graph-store".into(),
                healthy: true,
                detail: None,
            },
            Err(err) => IntegrationHealth {
                name: "graph-store".into(),
                healthy: false,
                detail: Some(err.to_string()),
            },
        }
    }
}

/// Periodic template snapshotting plus rebalancing; a final snapshot is
/// written on stop.
pub struct TemplatePersister {
    templates: Arc<TemplateStore>,
    interval: std::time::Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TemplatePersister {
    pub fn new(templates: Arc<TemplateStore>, interval: std::time::Duration) -> Self {
        Self {
            templates,
            interval,
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Integration for TemplatePersister {
    fn name(&self) -> &'static str {
        "template-persister"
    }

    async fn start(&self) -> Result<()> {
        let templates = Arc::clone(&self.templates);
        let interval = self.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                templates.rebalance();
                if let Err(err) = templates.persist() {
                    warn!(err = %err, "template snapshot failed");
                }
            }
        });
        *self.task.lock() = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.templates.persist()
    }

    async fn health(&self) -> IntegrationHealth {
        IntegrationHealth {
            name: "template-persister".into(),
            healthy: self.task.lock().is_some(),
            detail: Some(format!("{} templates", self.templates.template_count())),
        }
    }
}
