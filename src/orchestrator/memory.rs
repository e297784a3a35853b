//! In-memory orchestrator
//!
//! Holds workloads, pods and log lines in `DashMap`s and fans pod changes out
//! to watchers over a broadcast channel. Used by the test suites and by
//! `--in-memory` runs where no cluster is available.

use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::types::{
    LabelSelector, PodEvent, PodEventKind, PodKey, PodStatus, WorkloadKey, WorkloadObject,
};
use super::{LogStream, Orchestrator, OrchestratorError, PodEventStream};

const EVENT_BUFFER: usize = 256;

/// Orchestrator state kept entirely in memory
pub struct InMemoryOrchestrator {
    workloads: DashMap<String, WorkloadObject>,
    pods: DashMap<String, PodStatus>,
    logs: DashMap<String, Vec<Bytes>>,
    pod_events: broadcast::Sender<(String, PodEvent)>,
    log_events: broadcast::Sender<(String, Bytes)>,
    watch_breaker: Mutex<CancellationToken>,
    watches_refused: std::sync::atomic::AtomicBool,
}

impl Default for InMemoryOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryOrchestrator {
    pub fn new() -> Self {
        let (pod_events, _) = broadcast::channel(EVENT_BUFFER);
        let (log_events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            workloads: DashMap::new(),
            pods: DashMap::new(),
            logs: DashMap::new(),
            pod_events,
            log_events,
            watch_breaker: Mutex::new(CancellationToken::new()),
            watches_refused: std::sync::atomic::AtomicBool::new(false),
        }
    }

    // =========================================================================
    // Workloads
    // =========================================================================

    /// Create or replace a workload object
    pub fn put_workload(&self, key: &WorkloadKey, object: Value) {
        self.workloads.insert(
            key.qualified(),
            WorkloadObject::new(&key.name, &key.namespace, object),
        );
    }

    /// Remove a workload; returns whether it existed
    pub fn remove_workload(&self, key: &WorkloadKey) -> bool {
        self.workloads.remove(&key.qualified()).is_some()
    }

    /// Patch a single field of a workload in place
    pub fn set_workload_field(&self, key: &WorkloadKey, pointer: &str, value: Value) -> bool {
        match self.workloads.get_mut(&key.qualified()) {
            Some(mut workload) => match workload.object.pointer_mut(pointer) {
                Some(slot) => {
                    *slot = value;
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    pub fn workload_count(&self) -> usize {
        self.workloads.len()
    }

    // =========================================================================
    // Pods
    // =========================================================================

    /// Create or update a pod and notify watchers
    pub fn put_pod(&self, namespace: &str, pod: PodStatus) {
        let key = PodKey::new(namespace, &pod.name).qualified();
        let kind = if self.pods.contains_key(&key) {
            PodEventKind::Modified
        } else {
            PodEventKind::Added
        };
        self.pods.insert(key, pod.clone());
        self.publish(namespace, PodEvent::new(kind, pod));
    }

    /// Set a deletion timestamp on a pod (graceful deletion in progress)
    pub fn begin_pod_deletion(&self, namespace: &str, name: &str) -> bool {
        let key = PodKey::new(namespace, name).qualified();
        let updated = match self.pods.get_mut(&key) {
            Some(mut pod) => {
                pod.deletion_timestamp = Some(Utc::now());
                Some(pod.clone())
            }
            None => None,
        };
        match updated {
            Some(pod) => {
                self.publish(namespace, PodEvent::new(PodEventKind::Modified, pod));
                true
            }
            None => false,
        }
    }

    /// Remove a pod and notify watchers
    pub fn delete_pod(&self, namespace: &str, name: &str) -> bool {
        match self.pods.remove(&PodKey::new(namespace, name).qualified()) {
            Some((_, pod)) => {
                self.publish(namespace, PodEvent::new(PodEventKind::Deleted, pod));
                true
            }
            None => false,
        }
    }

    fn publish(&self, namespace: &str, event: PodEvent) {
        // No receivers is fine: nobody is watching yet
        let _ = self.pod_events.send((namespace.to_string(), event));
    }

    // =========================================================================
    // Watch control
    // =========================================================================

    /// Terminate every open watch with an error
    pub fn break_watches(&self) {
        let mut breaker = self
            .watch_breaker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        breaker.cancel();
        *breaker = CancellationToken::new();
    }

    /// Make subsequent `watch_pods` calls fail (or succeed again)
    pub fn refuse_watches(&self, refuse: bool) {
        self.watches_refused
            .store(refuse, std::sync::atomic::Ordering::SeqCst);
    }

    /// Number of watch subscriptions currently open
    pub fn open_watches(&self) -> usize {
        self.pod_events.receiver_count()
    }

    // =========================================================================
    // Logs
    // =========================================================================

    /// Append a log chunk to a pod and notify followers
    pub fn append_log(&self, namespace: &str, pod: &str, chunk: impl Into<Bytes>) {
        let key = PodKey::new(namespace, pod).qualified();
        let chunk = chunk.into();
        self.logs.entry(key.clone()).or_default().push(chunk.clone());
        let _ = self.log_events.send((key, chunk));
    }
}

#[async_trait]
impl Orchestrator for InMemoryOrchestrator {
    async fn get_workload(
        &self,
        key: &WorkloadKey,
    ) -> Result<Option<WorkloadObject>, OrchestratorError> {
        Ok(self.workloads.get(&key.qualified()).map(|w| w.clone()))
    }

    async fn get_pod(&self, key: &PodKey) -> Result<Option<PodStatus>, OrchestratorError> {
        Ok(self.pods.get(&key.qualified()).map(|p| p.clone()))
    }

    async fn watch_pods(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<PodEventStream, OrchestratorError> {
        if self
            .watches_refused
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            return Err(OrchestratorError::Watch("watch refused".to_string()));
        }

        // Subscribe before snapshotting so nothing put in between is lost
        let rx = self.pod_events.subscribe();
        let mut existing: Vec<PodEvent> = self
            .pods
            .iter()
            .filter(|entry| entry.key().starts_with(&format!("{}/", namespace)))
            .filter(|entry| selector.matches(&entry.value().labels))
            .map(|entry| PodEvent::new(PodEventKind::Added, entry.value().clone()))
            .collect();
        existing.sort_by(|a, b| a.pod.name.cmp(&b.pod.name));

        let breaker = self
            .watch_breaker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let namespace = namespace.to_string();
        let selector = selector.clone();

        let events = futures::stream::unfold(Some(rx), move |state| {
            let breaker = breaker.clone();
            let namespace = namespace.clone();
            let selector = selector.clone();
            async move {
                let mut rx = state?;
                loop {
                    tokio::select! {
                        _ = breaker.cancelled() => {
                            return Some((Err(OrchestratorError::Watch("watch closed".to_string())), None));
                        }
                        received = rx.recv() => match received {
                            Ok((ns, event)) => {
                                if ns == namespace && selector.matches(&event.pod.labels) {
                                    return Some((Ok(event), Some(rx)));
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                return Some((
                                    Err(OrchestratorError::Watch(format!("watch lagged by {} events", n))),
                                    None,
                                ));
                            }
                            Err(broadcast::error::RecvError::Closed) => return None,
                        }
                    }
                }
            }
        });

        // Like the API server, a new watch first lists what already exists
        Ok(futures::stream::iter(existing.into_iter().map(Ok))
            .chain(events)
            .boxed())
    }

    async fn tail_logs(
        &self,
        key: &PodKey,
        tail_lines: usize,
    ) -> Result<LogStream, OrchestratorError> {
        let qualified = key.qualified();
        if !self.pods.contains_key(&qualified) {
            return Err(OrchestratorError::NotFound(qualified));
        }

        // Subscribe before snapshotting so nothing appended in between is lost
        let rx = self.log_events.subscribe();
        let backlog: Vec<Bytes> = self
            .logs
            .get(&qualified)
            .map(|lines| {
                let skip = lines.len().saturating_sub(tail_lines);
                lines[skip..].to_vec()
            })
            .unwrap_or_default();

        let follow = futures::stream::unfold(Some(rx), move |state| {
            let qualified = qualified.clone();
            async move {
                let mut rx = state?;
                loop {
                    match rx.recv().await {
                        Ok((key, chunk)) if key == qualified => {
                            return Some((Ok::<_, OrchestratorError>(chunk), Some(rx)))
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            return Some((
                                Err(OrchestratorError::Watch(format!("log follow lagged by {} chunks", n))),
                                None,
                            ));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(futures::stream::iter(backlog.into_iter().map(Ok))
            .chain(follow)
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key() -> WorkloadKey {
        WorkloadKey {
            group: "ethereum.kotal.io".to_string(),
            version: "v1alpha1".to_string(),
            plural: "nodes".to_string(),
            namespace: "default".to_string(),
            name: "geth-1".to_string(),
        }
    }

    fn pod(phase: &str) -> PodStatus {
        PodStatus::new("geth-1-0", "uid-1")
            .with_phase(phase)
            .with_label("app.kubernetes.io/instance", "geth-1")
    }

    #[tokio::test]
    async fn test_workload_crud() {
        let store = InMemoryOrchestrator::new();
        assert!(store.get_workload(&key()).await.unwrap().is_none());

        store.put_workload(&key(), json!({"spec": {"rpc": false}}));
        assert_eq!(store.workload_count(), 1);

        assert!(store.set_workload_field(&key(), "/spec/rpc", json!(true)));
        let workload = store.get_workload(&key()).await.unwrap().unwrap();
        assert_eq!(workload.pointer("/spec/rpc"), Some(&json!(true)));

        assert!(store.remove_workload(&key()));
        assert!(!store.remove_workload(&key()));
    }

    #[tokio::test]
    async fn test_watch_filters_by_namespace_and_selector() {
        let store = InMemoryOrchestrator::new();
        let selector = LabelSelector::matching("app.kubernetes.io/instance", "geth-1");
        let mut watch = store.watch_pods("default", &selector).await.unwrap();

        store.put_pod("other", pod("Pending"));
        store.put_pod(
            "default",
            PodStatus::new("unrelated-0", "u9").with_label("app.kubernetes.io/instance", "x"),
        );
        store.put_pod("default", pod("Pending"));
        store.put_pod("default", pod("Running"));

        let first = watch.next().await.unwrap().unwrap();
        assert_eq!(first.kind, PodEventKind::Added);
        assert_eq!(first.pod.phase.as_deref(), Some("Pending"));

        let second = watch.next().await.unwrap().unwrap();
        assert_eq!(second.kind, PodEventKind::Modified);
        assert!(second.pod.is_running());
    }

    #[tokio::test]
    async fn test_deletion_events() {
        let store = InMemoryOrchestrator::new();
        let selector = LabelSelector::matching("app.kubernetes.io/instance", "geth-1");
        store.put_pod("default", pod("Running"));
        let mut watch = store.watch_pods("default", &selector).await.unwrap();

        assert!(store.begin_pod_deletion("default", "geth-1-0"));
        assert!(store.delete_pod("default", "geth-1-0"));

        let replayed = watch.next().await.unwrap().unwrap();
        assert_eq!(replayed.kind, PodEventKind::Added);
        assert!(replayed.pod.deletion_timestamp.is_none());
        let terminating = watch.next().await.unwrap().unwrap();
        assert!(terminating.pod.deletion_timestamp.is_some());
        let deleted = watch.next().await.unwrap().unwrap();
        assert_eq!(deleted.kind, PodEventKind::Deleted);
    }

    #[tokio::test]
    async fn test_break_and_refuse_watches() {
        let store = InMemoryOrchestrator::new();
        let selector = LabelSelector::default();
        let mut watch = store.watch_pods("default", &selector).await.unwrap();
        assert_eq!(store.open_watches(), 1);

        store.break_watches();
        assert!(matches!(watch.next().await, Some(Err(OrchestratorError::Watch(_)))));
        assert!(watch.next().await.is_none());

        store.refuse_watches(true);
        assert!(store.watch_pods("default", &selector).await.is_err());
        store.refuse_watches(false);
        assert!(store.watch_pods("default", &selector).await.is_ok());
    }

    #[tokio::test]
    async fn test_tail_logs_backlog_then_follow() {
        let store = InMemoryOrchestrator::new();
        store.put_pod("default", pod("Running"));
        for i in 0..5 {
            store.append_log("default", "geth-1-0", format!("line {}\n", i));
        }

        let mut logs = store
            .tail_logs(&PodKey::new("default", "geth-1-0"), 2)
            .await
            .unwrap();
        assert_eq!(logs.next().await.unwrap().unwrap(), Bytes::from("line 3\n"));
        assert_eq!(logs.next().await.unwrap().unwrap(), Bytes::from("line 4\n"));

        store.append_log("default", "geth-1-0", "line 5\n");
        assert_eq!(logs.next().await.unwrap().unwrap(), Bytes::from("line 5\n"));
    }

    #[tokio::test]
    async fn test_tail_logs_ends_when_follower_falls_behind() {
        let store = InMemoryOrchestrator::new();
        store.put_pod("default", pod("Running"));

        let mut logs = store
            .tail_logs(&PodKey::new("default", "geth-1-0"), 0)
            .await
            .unwrap();
        for i in 0..EVENT_BUFFER + 10 {
            store.append_log("default", "geth-1-0", format!("line {}\n", i));
        }

        match logs.next().await {
            Some(Err(OrchestratorError::Watch(message))) => {
                assert_eq!(message, "log follow lagged by 10 chunks")
            }
            other => panic!("Expected lag error, got {:?}", other),
        }
        assert!(logs.next().await.is_none());
    }

    #[tokio::test]
    async fn test_tail_logs_missing_pod() {
        let store = InMemoryOrchestrator::new();
        let result = store.tail_logs(&PodKey::new("default", "nope-0"), 10).await;
        assert!(matches!(result, Err(OrchestratorError::NotFound(_))));
    }
}
