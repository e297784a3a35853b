//! # Live Telemetry Bridge
//!
//! Turns one client connection into a stream of normalized events for one
//! node: lifecycle phases from the pod watch, sync/peer statistics from the
//! node's own RPC endpoint, or raw log chunks.
//!
//! ```text
//!  client ──ws──► Connection ─┬─► phase stream ──┐
//!                             ├─► collector ─────┼──► EventSink ──► writer task ──► client
//!                             └─► log relay ─────┘
//! ```
//!
//! Every producer runs in its own task, gates on [`readiness`], and shares
//! nothing with its siblings except the sink's queue. The connection's
//! cancellation token is raced against every sleep and network call, so a
//! client disconnect stops all producers promptly.

pub mod collector;
pub mod event;
pub mod locator;
pub mod logs;
pub mod phase;
pub mod readiness;
pub mod session;
pub mod sink;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::trace;
use uuid::Uuid;

use crate::config::{BridgeConfig, ProtocolProfile};
use crate::orchestrator::SharedOrchestrator;

pub use event::{BlockHeight, Event, Frame, StatsSample};
pub use locator::{locate, Located, NodeIdentity, ResourceSnapshot};
pub use phase::{Phase, PhaseTracker};
pub use session::{Bridge, Connection, ConnectionSummary, Producer};
pub use sink::{EventSink, FrameReader, FrameWriter, SinkError};

/// Error taxonomy surfaced to clients as `{"error": ...}` events
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TelemetryError {
    /// Workload absent: terminal for status and stats streams
    #[error("{protocol} node {identity} not found")]
    NotFound {
        protocol: String,
        identity: NodeIdentity,
    },

    /// Capability disabled or pod not running: retried every interval
    #[error("{0}")]
    PreconditionUnmet(String),

    /// An upstream RPC/WS call or orchestrator request failed
    #[error("{0}")]
    TransientUpstream(String),

    /// Writing to the client failed
    #[error("client connection closed")]
    ClientGone,

    /// The pod watch could not be opened or broke
    #[error("pod watch broken: {0}")]
    WatchBroken(String),
}

impl TelemetryError {
    pub fn capability_disabled(capability: crate::config::Capability) -> Self {
        TelemetryError::PreconditionUnmet(format!("{} is not enabled", capability))
    }
}

/// Why a producer stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// Connection teardown was requested (client disconnected)
    Cancelled,
    /// The sink refused an event because the writer is gone
    ClientGone,
    /// The workload did not exist
    NotFound,
    /// The workload was deleted while being watched
    Deleted,
    /// The source ran dry (log relay)
    Finished,
}

/// Control flow for producers: `Err` carries the reason to stop
pub type Flow<T> = Result<T, StreamEnd>;

/// Everything a producer task needs, shared read-only across a connection
pub struct ProducerContext {
    pub connection_id: Uuid,
    pub identity: NodeIdentity,
    pub profile: Arc<ProtocolProfile>,
    pub located: Located,
    pub orchestrator: SharedOrchestrator,
    pub config: Arc<BridgeConfig>,
    pub sink: EventSink,
    pub cancel: CancellationToken,
}

impl ProducerContext {
    /// Queue an event for the client
    pub async fn emit(&self, event: Event) -> Flow<()> {
        trace!(connection = %self.connection_id, ?event, "emit");
        tokio::select! {
            _ = self.cancel.cancelled() => Err(StreamEnd::Cancelled),
            sent = self.sink.send(event) => sent.map_err(|_| StreamEnd::ClientGone),
        }
    }

    pub async fn emit_error(&self, error: &TelemetryError) -> Flow<()> {
        self.emit(Event::error(error.to_string())).await
    }

    /// Run a future unless the connection is torn down first
    pub async fn guard<F: Future>(&self, fut: F) -> Flow<F::Output> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(StreamEnd::Cancelled),
            out = fut => Ok(out),
        }
    }

    pub async fn sleep(&self, duration: Duration) -> Flow<()> {
        self.guard(tokio::time::sleep(duration)).await
    }

    pub fn not_found(&self) -> TelemetryError {
        TelemetryError::NotFound {
            protocol: self.profile.name.clone(),
            identity: self.identity.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Context builders shared by the producer unit tests

    use super::*;
    use crate::config::protocols;
    use crate::orchestrator::InMemoryOrchestrator;
    use tokio::sync::mpsc;

    pub fn context(
        store: Arc<InMemoryOrchestrator>,
        profile: ProtocolProfile,
        config: BridgeConfig,
    ) -> (ProducerContext, mpsc::Receiver<Event>) {
        let identity = NodeIdentity::new("geth-1", "default");
        let (sink, rx) = EventSink::channel(64);
        let located = locate(&identity, &profile);
        let ctx = ProducerContext {
            connection_id: Uuid::new_v4(),
            identity,
            profile: Arc::new(profile),
            located,
            orchestrator: store,
            config: Arc::new(config),
            sink,
            cancel: CancellationToken::new(),
        };
        (ctx, rx)
    }

    pub fn ethereum_context(
        store: Arc<InMemoryOrchestrator>,
    ) -> (ProducerContext, mpsc::Receiver<Event>) {
        context(store, protocols::ethereum(), BridgeConfig::default())
    }
}
