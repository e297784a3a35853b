//! Orchestrator access
//!
//! The bridge never talks to Kubernetes directly. Producers receive an
//! `Arc<dyn Orchestrator>` so they can be driven by the real API client or by
//! the in-memory store in tests.

pub mod kube;
pub mod memory;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;

pub use kube::KubeApiClient;
pub use memory::InMemoryOrchestrator;
pub use types::{
    LabelSelector, PodEvent, PodEventKind, PodKey, PodStatus, WorkloadKey, WorkloadObject,
};

/// Stream of pod watch notifications; dropping it cancels the watch
pub type PodEventStream = BoxStream<'static, Result<PodEvent, OrchestratorError>>;

/// Stream of raw log chunks
pub type LogStream = BoxStream<'static, Result<Bytes, OrchestratorError>>;

/// Shared handle passed to every producer
pub type SharedOrchestrator = Arc<dyn Orchestrator>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Failed to parse orchestrator response: {0}")]
    Parse(String),

    #[error("Watch failed: {0}")]
    Watch(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid client configuration: {0}")]
    Config(String),
}

// ============================================================================
// SBIO: Trait for abstraction (allows fakes in tests)
// ============================================================================

#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Fetch a workload object; `Ok(None)` when it does not exist
    async fn get_workload(
        &self,
        key: &WorkloadKey,
    ) -> Result<Option<WorkloadObject>, OrchestratorError>;

    /// Fetch a pod; `Ok(None)` when it does not exist
    async fn get_pod(&self, key: &PodKey) -> Result<Option<PodStatus>, OrchestratorError>;

    /// Open a watch on pods in `namespace` matching `selector`
    async fn watch_pods(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<PodEventStream, OrchestratorError>;

    /// Follow a pod's logs starting `tail_lines` lines back
    async fn tail_logs(&self, key: &PodKey, tail_lines: usize)
        -> Result<LogStream, OrchestratorError>;
}
