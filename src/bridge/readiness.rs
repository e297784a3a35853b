//! Readiness state machine
//!
//! Gates a producer until the workload exists and its precondition holds.
//!
//! ```text
//! CheckingWorkload ──absent──────────────► NotFound (terminal for this attempt)
//!        │ ──flag off / API error────────► Unmet (emit error, sleep, retry)
//!        ▼
//!   CheckingPod ──missing / not running──► Unmet (retry; never deletion)
//!        ▼
//!      Ready
//! ```
//!
//! A missing pod is only ever a retry: the workload was confirmed to exist in
//! the same pass, so the pod is between replicas (rollout, restart), not gone.

use std::time::Duration;

use tracing::{debug, warn};

use super::locator::ResourceSnapshot;
use super::{Flow, ProducerContext, StreamEnd, TelemetryError};
use crate::config::Capability;
use crate::orchestrator::PodStatus;

/// What must hold before a producer may start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Precondition {
    /// Endpoint that must be declared enabled
    pub capability: Option<Capability>,
    /// Whether the ordinal-0 pod must be in the Running phase
    pub pod_running: bool,
}

impl Precondition {
    /// Only the workload's existence is required
    pub fn exists() -> Self {
        Self::default()
    }

    pub fn capability(capability: Capability) -> Self {
        Self {
            capability: Some(capability),
            pod_running: false,
        }
    }

    pub fn capability_and_running(capability: Capability) -> Self {
        Self {
            capability: Some(capability),
            pod_running: true,
        }
    }
}

/// Outcome of one readiness pass
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    NotFound,
    Unmet(TelemetryError),
    Ready(Ready),
}

/// Data gathered by a successful pass
#[derive(Debug, Clone, PartialEq)]
pub struct Ready {
    pub snapshot: ResourceSnapshot,
    /// Present when the precondition required a running pod
    pub pod: Option<PodStatus>,
}

enum ReadinessState {
    CheckingWorkload,
    CheckingPod(ResourceSnapshot),
}

pub struct Readiness<'a> {
    ctx: &'a ProducerContext,
    precondition: Precondition,
    interval: Duration,
}

impl<'a> Readiness<'a> {
    pub fn new(ctx: &'a ProducerContext, precondition: Precondition, interval: Duration) -> Self {
        Self {
            ctx,
            precondition,
            interval,
        }
    }

    /// Run one pass through the states without emitting anything
    pub async fn check(&self) -> Flow<Verdict> {
        let ctx = self.ctx;
        let located = &ctx.located;
        let mut state = ReadinessState::CheckingWorkload;

        loop {
            state = match state {
                ReadinessState::CheckingWorkload => {
                    let workload = match ctx
                        .guard(ctx.orchestrator.get_workload(&located.workload))
                        .await?
                    {
                        Ok(Some(workload)) => workload,
                        Ok(None) => return Ok(Verdict::NotFound),
                        Err(e) => {
                            warn!("Checking workload {} failed: {}", located.workload.qualified(), e);
                            return Ok(Verdict::Unmet(TelemetryError::TransientUpstream(
                                e.to_string(),
                            )));
                        }
                    };

                    let host = ctx.config.host_for(&workload.name, &workload.namespace);
                    let snapshot = ResourceSnapshot::from_workload(&workload, &ctx.profile, host);

                    if let Some(capability) = self.precondition.capability {
                        if !snapshot.is_enabled(capability) {
                            return Ok(Verdict::Unmet(TelemetryError::capability_disabled(
                                capability,
                            )));
                        }
                    }

                    if !self.precondition.pod_running {
                        return Ok(Verdict::Ready(Ready {
                            snapshot,
                            pod: None,
                        }));
                    }
                    ReadinessState::CheckingPod(snapshot)
                }
                ReadinessState::CheckingPod(snapshot) => {
                    match ctx.guard(ctx.orchestrator.get_pod(&located.pod)).await? {
                        Ok(Some(pod)) if pod.is_running() && pod.deletion_timestamp.is_none() => {
                            return Ok(Verdict::Ready(Ready {
                                snapshot,
                                pod: Some(pod),
                            }));
                        }
                        Ok(Some(pod)) => {
                            debug!(
                                "Pod {} not running yet (phase {:?})",
                                located.pod.qualified(),
                                pod.phase
                            );
                            return Ok(Verdict::Unmet(TelemetryError::PreconditionUnmet(
                                "node is not running".to_string(),
                            )));
                        }
                        Ok(None) => {
                            debug!("Pod {} absent, workload exists", located.pod.qualified());
                            return Ok(Verdict::Unmet(TelemetryError::PreconditionUnmet(
                                "node is not running".to_string(),
                            )));
                        }
                        Err(e) => {
                            warn!("Checking pod {} failed: {}", located.pod.qualified(), e);
                            return Ok(Verdict::Unmet(TelemetryError::TransientUpstream(
                                e.to_string(),
                            )));
                        }
                    }
                }
            };
        }
    }

    /// One pass that reports to the client.
    ///
    /// `NotFound` emits the terminal error and stops the producer; an unmet
    /// precondition emits why and yields `None` so the caller can sleep and
    /// retry.
    pub async fn gate(&self) -> Flow<Option<Ready>> {
        match self.check().await? {
            Verdict::Ready(ready) => Ok(Some(ready)),
            Verdict::Unmet(reason) => {
                self.ctx.emit_error(&reason).await?;
                Ok(None)
            }
            Verdict::NotFound => {
                self.ctx.emit_error(&self.ctx.not_found()).await?;
                Err(StreamEnd::NotFound)
            }
        }
    }

    /// Block until ready, reporting every unmet cycle
    pub async fn await_ready(&self) -> Flow<Ready> {
        loop {
            if let Some(ready) = self.gate().await? {
                return Ok(ready);
            }
            self.ctx.sleep(self.interval).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::event::Event;
    use crate::bridge::testing;
    use crate::orchestrator::InMemoryOrchestrator;
    use serde_json::json;
    use std::sync::Arc;

    fn error_text(event: Event) -> String {
        match event {
            Event::Error(message) => message,
            other => panic!("Expected error event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_not_found_is_terminal() {
        let store = Arc::new(InMemoryOrchestrator::new());
        let (ctx, mut rx) = testing::ethereum_context(store);

        let readiness = Readiness::new(&ctx, Precondition::exists(), Duration::from_secs(3));
        assert_eq!(readiness.await_ready().await, Err(StreamEnd::NotFound));
        assert_eq!(error_text(rx.recv().await.unwrap()), "ethereum node default/geth-1 not found");
    }

    #[tokio::test]
    async fn test_ready_when_exists() {
        let store = Arc::new(InMemoryOrchestrator::new());
        let (ctx, _rx) = testing::ethereum_context(store.clone());
        store.put_workload(&ctx.located.workload, json!({"spec": {"rpc": true}}));

        let readiness = Readiness::new(&ctx, Precondition::capability(Capability::Rpc), Duration::from_secs(1));
        let ready = readiness.await_ready().await.unwrap();
        assert_eq!(ready.snapshot.host, "geth-1.default.svc");
        assert!(ready.pod.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmet_capability_retries_until_enabled() {
        let store = Arc::new(InMemoryOrchestrator::new());
        let (ctx, mut rx) = testing::ethereum_context(store.clone());
        let key = ctx.located.workload.clone();
        store.put_workload(&key, json!({"spec": {"rpc": false}}));

        let flipper = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(2500)).await;
                store.set_workload_field(&key, "/spec/rpc", json!(true));
            })
        };

        let readiness = Readiness::new(&ctx, Precondition::capability(Capability::Rpc), Duration::from_secs(1));
        let ready = readiness.await_ready().await.unwrap();
        assert!(ready.snapshot.is_enabled(Capability::Rpc));
        flipper.await.unwrap();

        // Checks at t=0, 1, 2 were unmet; t=3 succeeded
        let mut errors = Vec::new();
        while let Ok(event) = rx.try_recv() {
            errors.push(error_text(event));
        }
        assert_eq!(errors, vec!["rpc is not enabled"; 3]);
    }

    #[tokio::test]
    async fn test_missing_pod_is_unmet_not_deleted() {
        let store = Arc::new(InMemoryOrchestrator::new());
        let (ctx, _rx) = testing::context(
            store.clone(),
            crate::config::protocols::polkadot(),
            crate::config::BridgeConfig::default(),
        );
        store.put_workload(&ctx.located.workload, json!({"spec": {"ws": true}}));

        let readiness = Readiness::new(
            &ctx,
            Precondition::capability_and_running(Capability::Ws),
            Duration::from_secs(1),
        );
        assert_eq!(
            readiness.check().await.unwrap(),
            Verdict::Unmet(TelemetryError::PreconditionUnmet("node is not running".to_string()))
        );

        store.put_pod(
            "default",
            PodStatus::new("geth-1-0", "u1").with_phase("Running"),
        );
        match readiness.check().await.unwrap() {
            Verdict::Ready(ready) => assert!(ready.pod.unwrap().is_running()),
            other => panic!("Expected ready, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_terminating_pod_is_not_ready() {
        let store = Arc::new(InMemoryOrchestrator::new());
        let (ctx, _rx) = testing::context(
            store.clone(),
            crate::config::protocols::polkadot(),
            crate::config::BridgeConfig::default(),
        );
        store.put_workload(&ctx.located.workload, json!({"spec": {"ws": true}}));
        store.put_pod("default", PodStatus::new("geth-1-0", "u1").with_phase("Running"));
        store.begin_pod_deletion("default", "geth-1-0");

        let readiness = Readiness::new(
            &ctx,
            Precondition::capability_and_running(Capability::Ws),
            Duration::from_secs(1),
        );
        assert!(matches!(readiness.check().await.unwrap(), Verdict::Unmet(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_retry_sleep() {
        let store = Arc::new(InMemoryOrchestrator::new());
        let (ctx, _rx) = testing::ethereum_context(store.clone());
        store.put_workload(&ctx.located.workload, json!({"spec": {"rpc": false}}));

        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            cancel.cancel();
        });

        let readiness = Readiness::new(&ctx, Precondition::capability(Capability::Rpc), Duration::from_secs(3));
        assert_eq!(readiness.await_ready().await, Err(StreamEnd::Cancelled));
    }
}
