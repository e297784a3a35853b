//! Connections and the bridge entry points
//!
//! A [`Connection`] owns one event sink writer plus its producers, each in
//! its own task. `run` returns only after every one of those tasks has
//! stopped, so nothing outlives the client connection.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use super::sink::{EventSink, FrameReader, FrameWriter, SinkWriter};
use super::{collector, locate, logs, phase, NodeIdentity, ProducerContext, StreamEnd};
use crate::config::{BridgeConfig, ProtocolProfile, ProtocolRegistry};
use crate::orchestrator::SharedOrchestrator;

/// Telemetry kind a producer task emits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Producer {
    Status,
    Stats,
    Logs { tail_lines: usize },
}

impl Producer {
    pub fn name(&self) -> &'static str {
        match self {
            Producer::Status => "status",
            Producer::Stats => "stats",
            Producer::Logs { .. } => "logs",
        }
    }

    async fn run(self, ctx: &ProducerContext) -> StreamEnd {
        match self {
            Producer::Status => phase::run(ctx).await,
            Producer::Stats => collector::run(ctx).await,
            Producer::Logs { tail_lines } => logs::run(ctx, tail_lines).await,
        }
    }
}

/// How a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub id: Uuid,
    /// Why each producer stopped
    pub ends: Vec<(Producer, StreamEnd)>,
    /// Event frames delivered to the client (close frame excluded)
    pub frames_written: u64,
}

/// One client session for one node
pub struct Connection {
    id: Uuid,
    identity: NodeIdentity,
    profile: Arc<ProtocolProfile>,
    producers: Vec<Producer>,
    orchestrator: SharedOrchestrator,
    config: Arc<BridgeConfig>,
}

impl Connection {
    pub fn new(
        identity: NodeIdentity,
        profile: Arc<ProtocolProfile>,
        orchestrator: SharedOrchestrator,
        config: Arc<BridgeConfig>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            profile,
            producers: Vec::new(),
            orchestrator,
            config,
        }
    }

    pub fn with_producer(mut self, producer: Producer) -> Self {
        self.producers.push(producer);
        self
    }

    /// Drive the client connection until every producer has stopped or the
    /// client went away.
    pub async fn run<W, R>(self, writer: W, reader: R) -> ConnectionSummary
    where
        W: FrameWriter + 'static,
        R: FrameReader + 'static,
    {
        let span = info_span!(
            "connection",
            id = %self.id,
            node = %self.identity,
            protocol = %self.profile.name
        );
        info!(parent: &span, producers = ?self.producers, "Connection opened");

        let cancel = CancellationToken::new();
        // Dropping this future mid-flight still stops every task
        let _teardown = cancel.clone().drop_guard();

        let (sink, events) = EventSink::channel(self.config.sink_capacity);
        let writer_task = tokio::spawn(
            SinkWriter::new(writer, reader, events, cancel.clone())
                .run()
                .instrument(span.clone()),
        );

        let ctx = Arc::new(ProducerContext {
            connection_id: self.id,
            located: locate(&self.identity, &self.profile),
            identity: self.identity,
            profile: self.profile,
            orchestrator: self.orchestrator,
            config: self.config,
            sink,
            cancel: cancel.clone(),
        });

        let mut tasks = JoinSet::new();
        for producer in self.producers {
            let ctx = ctx.clone();
            tasks.spawn(
                async move {
                    let end = producer.run(&ctx).await;
                    info!(producer = producer.name(), ?end, "Producer stopped");
                    (producer, end)
                }
                .instrument(span.clone()),
            );
        }
        // The writer sees end-of-queue once the last producer drops its sink
        drop(ctx);

        let mut ends = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(end) => ends.push(end),
                Err(e) => warn!(parent: &span, "Producer task failed: {}", e),
            }
        }

        let frames_written = match writer_task.await {
            Ok(count) => count,
            Err(e) => {
                warn!(parent: &span, "Writer task failed: {}", e);
                0
            }
        };

        info!(parent: &span, frames_written, "Connection closed");
        ConnectionSummary {
            id: self.id,
            ends,
            frames_written,
        }
    }
}

/// Entry points for the transport layer
#[derive(Clone)]
pub struct Bridge {
    orchestrator: SharedOrchestrator,
    config: Arc<BridgeConfig>,
    registry: Arc<ProtocolRegistry>,
}

impl Bridge {
    pub fn new(orchestrator: SharedOrchestrator, config: BridgeConfig) -> Self {
        let registry = Arc::new(config.registry());
        Self {
            orchestrator,
            config: Arc::new(config),
            registry,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProtocolRegistry {
        &self.registry
    }

    pub fn profile(&self, protocol: &str) -> Option<Arc<ProtocolProfile>> {
        self.registry.get(protocol)
    }

    fn connection(
        &self,
        identity: NodeIdentity,
        profile: Arc<ProtocolProfile>,
        producer: Producer,
    ) -> Connection {
        Connection::new(
            identity,
            profile,
            self.orchestrator.clone(),
            self.config.clone(),
        )
        .with_producer(producer)
    }

    /// Lifecycle phases of a node's pod
    pub async fn open_status_stream<W, R>(
        &self,
        identity: NodeIdentity,
        profile: Arc<ProtocolProfile>,
        writer: W,
        reader: R,
    ) -> ConnectionSummary
    where
        W: FrameWriter + 'static,
        R: FrameReader + 'static,
    {
        self.connection(identity, profile, Producer::Status)
            .run(writer, reader)
            .await
    }

    /// Sync and peer statistics from the node's own RPC endpoint
    pub async fn open_stats_stream<W, R>(
        &self,
        identity: NodeIdentity,
        profile: Arc<ProtocolProfile>,
        writer: W,
        reader: R,
    ) -> ConnectionSummary
    where
        W: FrameWriter + 'static,
        R: FrameReader + 'static,
    {
        self.connection(identity, profile, Producer::Stats)
            .run(writer, reader)
            .await
    }

    /// Raw log chunks; `tail_lines` defaults to the configured backlog
    pub async fn open_log_stream<W, R>(
        &self,
        identity: NodeIdentity,
        profile: Arc<ProtocolProfile>,
        tail_lines: Option<usize>,
        writer: W,
        reader: R,
    ) -> ConnectionSummary
    where
        W: FrameWriter + 'static,
        R: FrameReader + 'static,
    {
        let tail_lines = tail_lines.unwrap_or(self.config.log_tail_lines);
        self.connection(identity, profile, Producer::Logs { tail_lines })
            .run(writer, reader)
            .await
    }
}
