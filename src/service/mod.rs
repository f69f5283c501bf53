//! Query service layer shared by REST handlers and in-process tool
//! consumers. Each service is constructed once at start-up and injected
//! into every consumer; no service calls a peer over HTTP.

pub mod graph;
pub mod metadata;
pub mod search;
pub mod timeline;
pub mod tools;

pub use graph::{GraphService, NamespaceGraph};
pub use metadata::{MetadataResponse, MetadataService};
pub use search::{SearchParams, SearchResponse, SearchService};
pub use timeline::{TimelineParams, TimelineResponse, TimelineService};
pub use tools::ToolRegistry;

use crate::error::{Result, SpectreError};

/// Bridges the synchronous storage engine onto the async runtime.
pub(crate) async fn run_storage<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| SpectreError::Internal(format!("storage task panicked: {err}")))?
}
