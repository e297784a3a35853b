//! Proxied multiplex strategy
//!
//! ```text
//! AwaitingReady ──► AwaitingPodRunning ──► Connected ──► Streaming
//!       ▲                                      │             │
//!       └───────────────── Faulted ◄───────────┴─────────────┘
//! ```
//!
//! One upstream WebSocket per attempt. The fixed batch goes out on connect;
//! after that a call is re-sent on the interval only once its previous reply
//! has arrived, so an id is never outstanding twice on one connection.
//! Replies are attributed by id, never by arrival order, and each one is
//! emitted as its own partial sample.
//!
//! Unlike polling, any upstream failure is fatal to the connection: after a
//! framing or protocol error there is no safe way to resynchronize a
//! multiplexed stream, so the collector reports once and reconnects.

use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::apply_result;
use super::rpc::{RpcError, RpcRequest, RpcResponse};
use crate::bridge::event::{Event, StatsSample};
use crate::bridge::locator::ResourceSnapshot;
use crate::bridge::readiness::{Precondition, Readiness};
use crate::bridge::{Flow, ProducerContext, StreamEnd, TelemetryError};
use crate::config::{Capability, RpcCall};

type Upstream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ============================================================================
// SBIO: Pure data structures
// ============================================================================

/// Tracks which request ids are awaiting a reply on one upstream connection
#[derive(Debug, Default)]
pub struct Correlator {
    outstanding: HashMap<u64, Instant>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `id` for a new request; false while a request with that id is
    /// still unanswered
    pub fn try_issue(&mut self, id: u64, now: Instant) -> bool {
        if self.outstanding.contains_key(&id) {
            return false;
        }
        self.outstanding.insert(id, now);
        true
    }

    /// Record a reply; false for ids that were not outstanding
    pub fn complete(&mut self, id: u64) -> bool {
        self.outstanding.remove(&id).is_some()
    }

    pub fn is_outstanding(&self, id: u64) -> bool {
        self.outstanding.contains_key(&id)
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Lowest id issued more than `deadline` before `now` and still unanswered
    pub fn overdue(&self, now: Instant, deadline: Duration) -> Option<u64> {
        self.outstanding
            .iter()
            .filter(|(_, issued)| now.saturating_duration_since(**issued) > deadline)
            .map(|(id, _)| *id)
            .min()
    }
}

enum CollectorState {
    AwaitingReady,
    AwaitingPodRunning,
    Connected(Upstream),
    Streaming {
        write: SplitSink<Upstream, Message>,
        read: SplitStream<Upstream>,
        correlator: Correlator,
    },
    Faulted(TelemetryError),
}

// ============================================================================
// Producer loop
// ============================================================================

pub async fn run(ctx: &ProducerContext, calls: &[RpcCall]) -> StreamEnd {
    match proxy(ctx, calls).await {
        Ok(never) => match never {},
        Err(end) => end,
    }
}

async fn proxy(ctx: &ProducerContext, calls: &[RpcCall]) -> Flow<Infallible> {
    let interval = ctx.config.stats_interval();
    let enabled = Readiness::new(ctx, Precondition::capability(Capability::Ws), interval);
    let running = Readiness::new(ctx, Precondition::capability_and_running(Capability::Ws), interval);
    let mut state = CollectorState::AwaitingReady;

    loop {
        state = match state {
            CollectorState::AwaitingReady => match enabled.gate().await? {
                Some(_) => CollectorState::AwaitingPodRunning,
                None => {
                    ctx.sleep(interval).await?;
                    CollectorState::AwaitingReady
                }
            },

            CollectorState::AwaitingPodRunning => match running.gate().await? {
                Some(ready) => connect(ctx, &ready.snapshot).await?,
                None => {
                    ctx.sleep(interval).await?;
                    CollectorState::AwaitingReady
                }
            },

            CollectorState::Connected(upstream) => {
                let (mut write, read) = upstream.split();
                let mut correlator = Correlator::new();
                let deadline = ctx.config.request_timeout();
                match ctx.guard(send_batch(&mut write, &mut correlator, calls, deadline)).await? {
                    Ok(()) => CollectorState::Streaming {
                        write,
                        read,
                        correlator,
                    },
                    Err(e) => CollectorState::Faulted(TelemetryError::TransientUpstream(e.to_string())),
                }
            }

            CollectorState::Streaming {
                write,
                read,
                correlator,
            } => stream(ctx, calls, write, read, correlator).await?,

            CollectorState::Faulted(error) => {
                warn!(connection = %ctx.connection_id, "Upstream for {} faulted: {}", ctx.identity, error);
                ctx.emit_error(&error).await?;
                ctx.sleep(interval).await?;
                CollectorState::AwaitingReady
            }
        };
    }
}

async fn connect(ctx: &ProducerContext, snapshot: &ResourceSnapshot) -> Flow<CollectorState> {
    let Some(url) = snapshot.url(Capability::Ws) else {
        return Ok(CollectorState::Faulted(TelemetryError::capability_disabled(
            Capability::Ws,
        )));
    };

    let timeout = ctx.config.request_timeout();
    let state = match ctx.guard(tokio::time::timeout(timeout, connect_async(url.as_str()))).await? {
        Ok(Ok((upstream, _))) => {
            info!(connection = %ctx.connection_id, "Connected upstream to {}", url);
            CollectorState::Connected(upstream)
        }
        Ok(Err(e)) => CollectorState::Faulted(TelemetryError::TransientUpstream(
            RpcError::WebSocket(e.to_string()).to_string(),
        )),
        Err(_) => CollectorState::Faulted(TelemetryError::TransientUpstream(
            RpcError::Timeout(timeout).to_string(),
        )),
    };
    Ok(state)
}

/// Send every call whose id is free, giving up once `deadline` passes
async fn send_batch<W>(
    write: &mut W,
    correlator: &mut Correlator,
    calls: &[RpcCall],
    deadline: Duration,
) -> Result<(), RpcError>
where
    W: Sink<Message> + Unpin,
    W::Error: std::fmt::Display,
{
    let sends = async {
        for call in calls {
            if !correlator.try_issue(call.id, Instant::now()) {
                continue;
            }
            let text = RpcRequest::for_call(call).to_text()?;
            write
                .send(Message::Text(text.into()))
                .await
                .map_err(|e| RpcError::WebSocket(e.to_string()))?;
        }
        Ok::<(), RpcError>(())
    };
    tokio::time::timeout(deadline, sends)
        .await
        .unwrap_or(Err(RpcError::Timeout(deadline)))
}

/// Best-effort close of the upstream half, bounded by `deadline`
async fn close_upstream<W>(write: &mut W, deadline: Duration)
where
    W: Sink<Message> + Unpin,
    W::Error: std::fmt::Display,
{
    match tokio::time::timeout(deadline, write.close()).await {
        Ok(Ok(())) => debug!("Closed upstream connection"),
        Ok(Err(e)) => debug!("Closing upstream failed: {}", e),
        Err(_) => debug!("Closing upstream timed out after {:?}", deadline),
    }
}

async fn stream(
    ctx: &ProducerContext,
    calls: &[RpcCall],
    mut write: SplitSink<Upstream, Message>,
    mut read: SplitStream<Upstream>,
    mut correlator: Correlator,
) -> Flow<CollectorState> {
    let timeout = ctx.config.request_timeout();
    let mut reissue = tokio::time::interval(ctx.config.stats_interval());
    reissue.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The batch just went out; skip the immediate first tick
    reissue.tick().await;

    let fault = loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                close_upstream(&mut write, timeout).await;
                return Err(StreamEnd::Cancelled);
            }

            _ = reissue.tick() => {
                if let Some(id) = correlator.overdue(Instant::now(), timeout) {
                    debug!(connection = %ctx.connection_id, id, "Upstream request overdue");
                    break RpcError::Timeout(timeout);
                }
                match ctx.guard(send_batch(&mut write, &mut correlator, calls, timeout)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => break e,
                    Err(end) => {
                        close_upstream(&mut write, timeout).await;
                        return Err(end);
                    }
                }
            }

            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let reply = match RpcResponse::parse(text.as_str()) {
                        Ok(reply) => reply,
                        Err(e) => break e,
                    };
                    let Some(id) = reply.numeric_id() else {
                        debug!(connection = %ctx.connection_id, "Ignoring upstream message without id");
                        continue;
                    };
                    let Some(call) = calls.iter().find(|c| c.id == id) else {
                        debug!(connection = %ctx.connection_id, id, "Ignoring reply with unknown id");
                        continue;
                    };
                    if !correlator.complete(id) {
                        debug!(connection = %ctx.connection_id, id, "Ignoring unsolicited reply");
                        continue;
                    }
                    let result = match reply.into_result() {
                        Ok(result) => result,
                        Err(e) => break e,
                    };

                    let mut sample = StatsSample::default();
                    apply_result(&mut sample, call, &result);
                    ctx.emit(Event::Stats(sample)).await?;
                }
                Some(Ok(Message::Binary(_))) => {
                    break RpcError::Parse("unexpected binary frame".to_string());
                }
                Some(Ok(Message::Close(_))) | None => break RpcError::Closed,
                Some(Ok(_)) => continue,
                Some(Err(e)) => break RpcError::WebSocket(e.to_string()),
            }
        }
    };

    close_upstream(&mut write, timeout).await;
    Ok(CollectorState::Faulted(TelemetryError::TransientUpstream(
        fault.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_never_outstanding_twice() {
        let now = Instant::now();
        let mut correlator = Correlator::new();
        assert!(correlator.try_issue(1, now));
        assert!(correlator.try_issue(2, now));
        assert!(!correlator.try_issue(1, now));
        assert_eq!(correlator.outstanding(), 2);

        assert!(correlator.complete(2));
        assert!(!correlator.complete(2));
        assert!(!correlator.is_outstanding(2));
        assert!(correlator.try_issue(2, now));
    }

    #[test]
    fn test_interleaved_issue_and_complete() {
        // Drive a long random-ish schedule and check the invariant at every step
        let now = Instant::now();
        let mut correlator = Correlator::new();
        let mut in_flight = std::collections::HashSet::new();
        for step in 0u64..200 {
            let id = step % 3 + 1;
            if step % 5 == 0 {
                assert_eq!(correlator.complete(id), in_flight.remove(&id));
            } else if correlator.try_issue(id, now) {
                assert!(in_flight.insert(id), "id {} issued twice", id);
            }
            assert_eq!(correlator.outstanding(), in_flight.len());
        }
    }

    fn stalled_sink() -> impl Sink<Message, Error = RpcError> + Unpin {
        Box::pin(futures::sink::unfold((), |(), _message: Message| {
            futures::future::pending::<Result<(), RpcError>>()
        }))
    }

    fn call(id: u64) -> RpcCall {
        RpcCall::new(id, "system_health", Vec::new())
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_upstream_send_times_out() {
        let mut sink = stalled_sink();
        let mut correlator = Correlator::new();
        let result = send_batch(
            &mut sink,
            &mut correlator,
            &[call(1), call(2)],
            Duration::from_millis(400),
        )
        .await;
        assert_eq!(result, Err(RpcError::Timeout(Duration::from_millis(400))));
        assert!(correlator.is_outstanding(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_upstream_close_is_bounded() {
        let mut sink = stalled_sink();
        // Leave a send in flight so the close has to flush it
        let _ = tokio::time::timeout(
            Duration::from_millis(10),
            sink.send(Message::Text("{}".into())),
        )
        .await;

        let started = Instant::now();
        close_upstream(&mut sink, Duration::from_secs(5)).await;
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(6));
    }

    #[test]
    fn test_overdue() {
        let start = Instant::now();
        let mut correlator = Correlator::new();
        correlator.try_issue(2, start);
        correlator.try_issue(1, start + Duration::from_secs(4));

        let later = start + Duration::from_secs(6);
        assert_eq!(correlator.overdue(later, Duration::from_secs(5)), Some(2));
        assert_eq!(correlator.overdue(later, Duration::from_secs(10)), None);

        correlator.complete(2);
        assert_eq!(correlator.overdue(later, Duration::from_secs(5)), None);
    }
}
