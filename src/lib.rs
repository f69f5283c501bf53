//! # Spectre - Kubernetes Observability Service
//!
//! Spectre continuously watches cluster resources, persists every
//! lifecycle event in a compressed, block-structured, searchable log,
//! and incrementally maintains a causal relationship graph over those
//! resources. On top of that substrate it reconstructs timelines,
//! explains failures by walking the graph back to a root cause, and
//! detects anomalies against a recent baseline.
//!
//! ## Architecture
//!
//! Spectre is layered, leaves first:
//! - **Storage**: append-only hourly files with compressed blocks,
//!   inverted + Bloom indexes, and carry-over final states
//! - **Graph**: extractors turning events into idempotent node/edge
//!   upserts behind a cached store client
//! - **Analysis**: the causal analyzer and the anomaly detectors
//! - **Services**: timeline, graph, metadata, and search services
//!   shared by the REST API and in-process tools

pub mod analyze;
pub mod anomaly;
pub mod api;
pub mod config;
pub mod error;
pub mod graph;
pub mod integration;
pub mod k8s;
pub mod logging;
pub mod logs;
pub mod model;
pub mod runtime;
pub mod service;
pub mod storage;

pub use crate::config::Config;
pub use crate::error::{Result, SpectreError};
pub use crate::model::{Anomaly, Event, EventKind, ResourceRef, TimeRange};
pub use crate::runtime::Runtime;
pub use crate::storage::{EventStore, QueryExecutor};
