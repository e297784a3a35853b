//! Lifecycle phase stream
//!
//! Watches the node's pods and turns every watch item into a display phase.
//! Consecutive identical phases are not collapsed; clients coalesce if they
//! care to.

use std::collections::HashSet;
use std::fmt;

use futures::StreamExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::event::Event;
use super::readiness::{Precondition, Readiness};
use super::{Flow, ProducerContext, StreamEnd, TelemetryError};
use crate::orchestrator::{PodEventKind, PodStatus};

/// Simplified, display-oriented lifecycle label
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Unknown,
    NotFound,
    Pending,
    Initializing,
    ContainerCreating,
    Running,
    /// Any other waiting reason or terminal pod phase, verbatim
    Error(String),
    Terminating,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Unknown => write!(f, "Unknown"),
            Phase::NotFound => write!(f, "NotFound"),
            Phase::Pending => write!(f, "Pending"),
            Phase::Initializing => write!(f, "Initializing"),
            Phase::ContainerCreating => write!(f, "ContainerCreating"),
            Phase::Running => write!(f, "Running"),
            Phase::Error(reason) => write!(f, "{}", reason),
            Phase::Terminating => write!(f, "Terminating"),
        }
    }
}

/// Derive the phase of a single pod status, ignoring history.
///
/// Precedence: deletion timestamp, then the first container's waiting
/// reason, then the coarse pod phase.
pub fn derive_phase(pod: &PodStatus) -> Phase {
    if pod.deletion_timestamp.is_some() {
        return Phase::Terminating;
    }

    if let Some(reason) = pod.waiting_reason.as_deref().filter(|r| !r.is_empty()) {
        return match reason {
            "PodInitializing" => Phase::Initializing,
            "ContainerCreating" => Phase::ContainerCreating,
            other => Phase::Error(other.to_string()),
        };
    }

    match pod.phase.as_deref() {
        Some("Pending") => Phase::Pending,
        Some("Running") => Phase::Running,
        Some("Unknown") | None => Phase::Unknown,
        Some(other) => Phase::Error(other.to_string()),
    }
}

/// Applies the sticky-terminating rule across a sequence of watch events.
///
/// Stickiness is keyed by pod uid: once a uid has been seen terminating (or
/// deleted) every later event for it is `Terminating`, however stale. A
/// replacement pod has a fresh uid and starts clean.
#[derive(Debug, Default)]
pub struct PhaseTracker {
    terminated: HashSet<String>,
    current_uid: Option<String>,
    absent: bool,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, kind: PodEventKind, pod: &PodStatus) -> Phase {
        self.current_uid = Some(pod.uid.clone());
        self.absent = kind == PodEventKind::Deleted;
        if kind == PodEventKind::Deleted || pod.deletion_timestamp.is_some() {
            self.terminated.insert(pod.uid.clone());
        }
        if self.terminated.contains(&pod.uid) {
            return Phase::Terminating;
        }
        derive_phase(pod)
    }

    /// Whether the most recently observed pod is terminating
    pub fn is_terminating(&self) -> bool {
        self.current_uid
            .as_ref()
            .map(|uid| self.terminated.contains(uid))
            .unwrap_or(false)
    }

    /// Record whether a point lookup found the tracked pod
    pub fn set_absent(&mut self, absent: bool) {
        self.absent = absent;
    }

    /// The pod is gone or going, so the workload may be torn down too
    pub fn awaiting_teardown(&self) -> bool {
        self.absent || self.is_terminating()
    }
}

enum WatchEnd {
    Deleted,
    Broken(String),
}

/// Status producer: runs until the workload is gone or the connection ends
pub async fn run(ctx: &ProducerContext) -> StreamEnd {
    match stream_phases(ctx).await {
        Ok(end) | Err(end) => end,
    }
}

async fn stream_phases(ctx: &ProducerContext) -> Flow<StreamEnd> {
    let retry = ctx.config.status_retry();
    let readiness = Readiness::new(ctx, Precondition::exists(), retry);
    let mut tracker = PhaseTracker::new();

    loop {
        readiness.await_ready().await?;

        match ctx.guard(ctx.orchestrator.get_pod(&ctx.located.pod)).await? {
            Ok(Some(_)) => tracker.set_absent(false),
            Ok(None) => {
                tracker.set_absent(true);
                ctx.emit(Event::Phase(Phase::NotFound)).await?;
            }
            Err(e) => warn!("Fetching pod {} failed: {}", ctx.located.pod.qualified(), e),
        }

        match follow_watch(ctx, &mut tracker).await? {
            WatchEnd::Deleted => {
                info!(connection = %ctx.connection_id, "Node {} deleted, ending status stream", ctx.identity);
                return Ok(StreamEnd::Deleted);
            }
            WatchEnd::Broken(reason) => {
                warn!(connection = %ctx.connection_id, "Pod watch for {} ended: {}", ctx.identity, reason);
                ctx.emit_error(&TelemetryError::WatchBroken(reason)).await?;
                ctx.sleep(retry).await?;
            }
        }
    }
}

async fn follow_watch(ctx: &ProducerContext, tracker: &mut PhaseTracker) -> Flow<WatchEnd> {
    let located = &ctx.located;
    let mut events = match ctx
        .guard(ctx.orchestrator.watch_pods(&located.pod.namespace, &located.selector))
        .await?
    {
        Ok(events) => events,
        Err(e) => return Ok(WatchEnd::Broken(e.to_string())),
    };

    let grace = ctx.config.terminating_grace();
    let confirm = tokio::time::sleep(grace);
    tokio::pin!(confirm);
    let mut confirming = tracker.awaiting_teardown();

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(StreamEnd::Cancelled),

            _ = &mut confirm, if confirming => {
                confirming = false;
                match ctx.guard(ctx.orchestrator.get_workload(&located.workload)).await? {
                    Ok(None) => return Ok(WatchEnd::Deleted),
                    Ok(Some(_)) => debug!("Workload {} still exists", located.workload.qualified()),
                    Err(e) => warn!("Confirming deletion of {} failed: {}", located.workload.qualified(), e),
                }
                if tracker.awaiting_teardown() {
                    confirm.as_mut().reset(Instant::now() + grace);
                    confirming = true;
                }
            }

            item = events.next() => match item {
                Some(Ok(event)) => {
                    if event.pod.name != located.pod.name {
                        continue;
                    }
                    let phase = tracker.observe(event.kind, &event.pod);
                    debug!(connection = %ctx.connection_id, kind = ?event.kind, %phase, "pod event");
                    ctx.emit(Event::Phase(phase)).await?;

                    if tracker.awaiting_teardown() && !confirming {
                        confirm.as_mut().reset(Instant::now() + grace);
                        confirming = true;
                    }
                }
                Some(Err(e)) => return Ok(WatchEnd::Broken(e.to_string())),
                None => return Ok(WatchEnd::Broken("watch closed by server".to_string())),
            }
        }
    }
}
