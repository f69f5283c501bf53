//! Graph store contract.
//!
//! The service owns this interface; a production deployment implements
//! it over a network graph driver while the embedded store backs tests
//! and single-node setups. Query-language syntax never crosses the
//! service API boundary: callers build [`GraphQuery`] values through
//! [`super::queries`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::graph::{GraphEdge, GraphNode};
use crate::model::UnixNanos;

/// A parameterized query for the graph store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQuery {
    pub query: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl GraphQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            parameters: Map::new(),
        }
    }

    pub fn param(mut self, key: &str, value: Value) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }
}

/// Result rows as column-name → value maps. Cloning yields an
/// independent snapshot, which is what the query cache stores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub rows: Vec<Map<String, Value>>,
}

impl QueryResult {
    pub fn single_column<'a>(&'a self, column: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
        self.rows.iter().filter_map(move |row| row.get(column))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    pub node_count: u64,
    pub edge_count: u64,
    pub change_event_count: u64,
}

/// Contract consumed by the pipeline, the analyzer, and the services.
///
/// `create_node` and `create_edge` are idempotent upserts: nodes merge
/// on `uid`, edges on `(type, from, to)` with evidence deduplication.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
    async fn ping(&self) -> Result<()>;
    async fn execute_query(&self, query: GraphQuery) -> Result<QueryResult>;
    async fn create_node(&self, node: GraphNode) -> Result<()>;
    async fn create_edge(&self, edge: GraphEdge) -> Result<()>;
    async fn get_node(&self, uid: &str) -> Result<Option<GraphNode>>;
    async fn delete_nodes_by_timestamp(&self, older_than: UnixNanos) -> Result<u64>;
    async fn get_graph_stats(&self) -> Result<GraphStats>;
    async fn initialize_schema(&self) -> Result<()>;
}

/// Case-insensitive whole-token scan for mutating clauses. Queries that
/// contain any of these must never be served from (or stored in) the
/// query-result cache.
pub fn is_write_query(query: &str) -> bool {
    query
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .any(|token| {
            token.eq_ignore_ascii_case("create")
                || token.eq_ignore_ascii_case("merge")
                || token.eq_ignore_ascii_case("delete")
                || token.eq_ignore_ascii_case("set")
                || token.eq_ignore_ascii_case("remove")
        })
}
