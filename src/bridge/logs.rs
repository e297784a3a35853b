//! Log tail relay
//!
//! Forwards raw log chunks from the node's ordinal-0 pod, one binary frame
//! per chunk. Chunks are whatever the orchestrator hands back, so clients
//! must not assume line framing. There is no reconnect: a read error ends the
//! relay quietly and the client opens a fresh tail.

use futures::StreamExt;
use tracing::{debug, info};

use super::event::Event;
use super::{Flow, ProducerContext, StreamEnd, TelemetryError};

/// Log producer
pub async fn run(ctx: &ProducerContext, tail_lines: usize) -> StreamEnd {
    match relay(ctx, tail_lines).await {
        Ok(end) | Err(end) => end,
    }
}

async fn relay(ctx: &ProducerContext, tail_lines: usize) -> Flow<StreamEnd> {
    let pod = &ctx.located.pod;
    let mut chunks = match ctx.guard(ctx.orchestrator.tail_logs(pod, tail_lines)).await? {
        Ok(chunks) => chunks,
        Err(e) => {
            info!(connection = %ctx.connection_id, "Cannot tail logs of {}: {}", pod.qualified(), e);
            ctx.emit_error(&TelemetryError::TransientUpstream(e.to_string()))
                .await?;
            return Ok(StreamEnd::Finished);
        }
    };

    loop {
        match ctx.guard(chunks.next()).await? {
            Some(Ok(chunk)) => ctx.emit(Event::Log(chunk)).await?,
            Some(Err(e)) => {
                debug!(connection = %ctx.connection_id, "Log stream of {} failed: {}", pod.qualified(), e);
                return Ok(StreamEnd::Finished);
            }
            None => return Ok(StreamEnd::Finished),
        }
    }
}
