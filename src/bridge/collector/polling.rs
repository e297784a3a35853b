//! Polling strategy
//!
//! Every interval: re-check readiness, then issue each call on its own.
//! A failed call is logged and its fields are simply absent from the sample;
//! the loop never stops for upstream errors.

use std::convert::Infallible;

use tracing::{debug, warn};

use super::apply_result;
use super::rpc::{RpcClient, RpcError};
use crate::bridge::event::{Event, StatsSample};
use crate::bridge::readiness::{Precondition, Readiness};
use crate::bridge::{Flow, ProducerContext, StreamEnd, TelemetryError};
use crate::config::{Capability, RpcCall};

pub async fn run(ctx: &ProducerContext, client: &dyn RpcClient, calls: &[RpcCall]) -> StreamEnd {
    match poll(ctx, client, calls).await {
        Ok(never) => match never {},
        Err(end) => end,
    }
}

async fn poll(ctx: &ProducerContext, client: &dyn RpcClient, calls: &[RpcCall]) -> Flow<Infallible> {
    let interval = ctx.config.stats_interval();
    let readiness = Readiness::new(ctx, Precondition::capability(Capability::Rpc), interval);

    loop {
        if let Some(ready) = readiness.gate().await? {
            if let Some(url) = ready.snapshot.url(Capability::Rpc) {
                match collect(ctx, client, &url, calls).await? {
                    Ok(sample) => ctx.emit(Event::Stats(sample)).await?,
                    Err(e) => {
                        ctx.emit_error(&TelemetryError::TransientUpstream(e.to_string()))
                            .await?
                    }
                }
            }
        }
        ctx.sleep(interval).await?;
    }
}

/// One polling cycle. Errs only when no call at all succeeded.
async fn collect(
    ctx: &ProducerContext,
    client: &dyn RpcClient,
    url: &str,
    calls: &[RpcCall],
) -> Flow<Result<StatsSample, RpcError>> {
    let mut sample = StatsSample::default();
    let mut last_error = None;
    let mut answered = 0usize;

    for call in calls {
        match ctx.guard(client.call(url, call)).await? {
            Ok(result) => {
                apply_result(&mut sample, call, &result);
                answered += 1;
            }
            Err(e) => {
                warn!(connection = %ctx.connection_id, method = %call.method, "RPC call to {} failed: {}", url, e);
                last_error = Some(e);
            }
        }
    }

    if answered == 0 {
        if let Some(e) = last_error {
            return Ok(Err(e));
        }
    }

    sample.fill_head_when_synced();
    debug!(connection = %ctx.connection_id, ?sample, "collected");
    Ok(Ok(sample))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::testing;
    use crate::bridge::BlockHeight;
    use crate::orchestrator::InMemoryOrchestrator;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    // ========================================================================
    // SBIO: Mock implementation for testing (no I/O)
    // ========================================================================

    #[derive(Default)]
    struct MockRpc {
        results: HashMap<String, Value>,
        urls: Mutex<Vec<String>>,
    }

    impl MockRpc {
        fn with(mut self, method: &str, result: Value) -> Self {
            self.results.insert(method.to_string(), result);
            self
        }
    }

    #[async_trait]
    impl RpcClient for MockRpc {
        async fn call(&self, url: &str, call: &RpcCall) -> Result<Value, RpcError> {
            self.urls.lock().unwrap().push(url.to_string());
            self.results
                .get(&call.method)
                .cloned()
                .ok_or_else(|| RpcError::Http("connection refused".to_string()))
        }
    }

    fn setup(spec: Value) -> (crate::bridge::ProducerContext, tokio::sync::mpsc::Receiver<Event>) {
        let store = Arc::new(InMemoryOrchestrator::new());
        let (ctx, rx) = testing::ethereum_context(store.clone());
        store.put_workload(&ctx.located.workload, spec);
        (ctx, rx)
    }

    fn calls(ctx: &crate::bridge::ProducerContext) -> Vec<RpcCall> {
        ctx.profile.collector.calls().to_vec()
    }

    #[tokio::test]
    async fn test_failed_call_omits_fields() {
        let (ctx, _rx) = setup(json!({"spec": {"rpc": true}}));
        let rpc = MockRpc::default()
            .with("eth_blockNumber", json!("0x64"))
            .with("eth_syncing", json!(false));

        let sample = collect(&ctx, &rpc, "http://node:8545", &calls(&ctx))
            .await
            .unwrap()
            .unwrap();
        assert!(sample.current_block.is_some());
        assert_eq!(sample.highest_block, sample.current_block);
        assert!(sample.peers_count.is_none());
        assert_eq!(rpc.urls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_all_calls_failing_is_an_error() {
        let (ctx, _rx) = setup(json!({"spec": {"rpc": true}}));
        let result = collect(&ctx, &MockRpc::default(), "http://node:8545", &calls(&ctx))
            .await
            .unwrap();
        assert_eq!(
            result.unwrap_err(),
            RpcError::Http("connection refused".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_then_enabled() {
        let store = Arc::new(InMemoryOrchestrator::new());
        let (ctx, mut rx) = testing::ethereum_context(store.clone());
        let key = ctx.located.workload.clone();
        store.put_workload(&key, json!({"spec": {"rpc": false, "rpcPort": 18545}}));

        let rpc = Arc::new(
            MockRpc::default()
                .with("eth_blockNumber", json!("0x10"))
                .with("net_peerCount", json!("0x3")),
        );
        let cancel = ctx.cancel.clone();
        let calls = calls(&ctx);
        let worker_rpc = rpc.clone();
        let handle = tokio::spawn(async move { run(&ctx, worker_rpc.as_ref(), &calls).await });

        for _ in 0..2 {
            assert_eq!(rx.recv().await, Some(Event::error("rpc is not enabled")));
        }
        store.set_workload_field(&key, "/spec/rpc", json!(true));

        let sample = loop {
            match rx.recv().await {
                Some(Event::Stats(sample)) => break sample,
                Some(Event::Error(_)) => continue,
                other => panic!("Unexpected event {:?}", other),
            }
        };
        assert_eq!(sample.peers_count, Some(3));
        assert!(matches!(sample.current_block, Some(BlockHeight::Quantity(_))));
        assert_eq!(rpc.urls.lock().unwrap()[0], "http://geth-1.default.svc:18545");

        cancel.cancel();
        assert_eq!(handle.await.unwrap(), StreamEnd::Cancelled);
    }
}
