//! Kubernetes REST API client
//!
//! Talks to the API server with plain `reqwest` calls: custom resources for
//! workloads, core pods, `?watch=true` for newline-delimited watch events,
//! and the pod `log` subresource for tailing.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, Lines};
use tokio_util::io::StreamReader;
use tracing::{debug, trace};

use super::types::{
    LabelSelector, PodEvent, PodEventKind, PodKey, PodStatus, WorkloadKey, WorkloadObject,
};
use super::{LogStream, Orchestrator, OrchestratorError, PodEventStream};
use crate::config::KubeConfig;

// ============================================================================
// Wire structures (pure, no I/O)
// ============================================================================

#[derive(Debug, Deserialize)]
struct KubeObjectMeta {
    name: String,
    #[serde(default)]
    uid: String,
    #[serde(default, rename = "deletionTimestamp")]
    deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    labels: std::collections::HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct KubePodStatus {
    #[serde(default)]
    phase: Option<String>,
    #[serde(default, rename = "containerStatuses")]
    container_statuses: Vec<KubeContainerStatus>,
}

#[derive(Debug, Deserialize)]
struct KubeContainerStatus {
    #[serde(default)]
    state: Option<KubeContainerState>,
}

#[derive(Debug, Deserialize)]
struct KubeContainerState {
    #[serde(default)]
    waiting: Option<KubeWaiting>,
}

#[derive(Debug, Deserialize)]
struct KubeWaiting {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KubePod {
    metadata: KubeObjectMeta,
    #[serde(default)]
    status: Option<KubePodStatus>,
}

impl From<KubePod> for PodStatus {
    fn from(pod: KubePod) -> Self {
        let status = pod.status.unwrap_or_default();
        let waiting_reason = status
            .container_statuses
            .first()
            .and_then(|c| c.state.as_ref())
            .and_then(|s| s.waiting.as_ref())
            .and_then(|w| w.reason.clone())
            .filter(|r| !r.is_empty());

        PodStatus {
            name: pod.metadata.name,
            uid: pod.metadata.uid,
            phase: status.phase,
            deletion_timestamp: pod.metadata.deletion_timestamp,
            waiting_reason,
            labels: pod.metadata.labels,
        }
    }
}

#[derive(Debug, Deserialize)]
struct KubeWatchEvent {
    #[serde(rename = "type")]
    event_type: String,
    object: Value,
}

/// Parse a single pod from its JSON representation
pub fn parse_pod(json: &str) -> Result<PodStatus, OrchestratorError> {
    let pod: KubePod =
        serde_json::from_str(json).map_err(|e| OrchestratorError::Parse(e.to_string()))?;
    Ok(pod.into())
}

/// Parse one line of a watch response.
///
/// Returns `Ok(None)` for bookmarks and blank keep-alive lines, and an error
/// for `ERROR` events (typically an expired resource version).
pub fn parse_watch_line(line: &str) -> Result<Option<PodEvent>, OrchestratorError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let event: KubeWatchEvent =
        serde_json::from_str(line).map_err(|e| OrchestratorError::Parse(e.to_string()))?;

    let kind = match event.event_type.as_str() {
        "ADDED" => PodEventKind::Added,
        "MODIFIED" => PodEventKind::Modified,
        "DELETED" => PodEventKind::Deleted,
        "BOOKMARK" => return Ok(None),
        "ERROR" => {
            let message = event
                .object
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown watch error")
                .to_string();
            return Err(OrchestratorError::Watch(message));
        }
        other => {
            return Err(OrchestratorError::Parse(format!(
                "unknown watch event type '{}'",
                other
            )))
        }
    };

    let pod: KubePod =
        serde_json::from_value(event.object).map_err(|e| OrchestratorError::Parse(e.to_string()))?;

    Ok(Some(PodEvent::new(kind, pod.into())))
}

// ============================================================================
// SBIO: I/O implementation (real HTTP client)
// ============================================================================

/// Orchestrator backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
    request_timeout: Duration,
}

impl KubeApiClient {
    /// Build a client from configuration, reading the token and CA files
    pub fn from_config(
        config: &KubeConfig,
        request_timeout: Duration,
    ) -> Result<Self, OrchestratorError> {
        // No overall timeout on the client: watches and log follows are
        // long-lived. Point requests set their own deadline.
        let mut builder = Client::builder().connect_timeout(Duration::from_secs(10));

        if let Some(ref ca_file) = config.ca_file {
            let pem = std::fs::read(ca_file).map_err(|e| {
                OrchestratorError::Config(format!("reading {}: {}", ca_file.display(), e))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| OrchestratorError::Config(e.to_string()))?;
            builder = builder.add_root_certificate(cert);
        }

        if config.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let token = match config.token_file {
            Some(ref path) => Some(
                std::fs::read_to_string(path)
                    .map_err(|e| {
                        OrchestratorError::Config(format!("reading {}: {}", path.display(), e))
                    })?
                    .trim()
                    .to_string(),
            ),
            None => None,
        };

        let client = builder
            .build()
            .map_err(|e| OrchestratorError::Config(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            token,
            request_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn get(&self, url: &str) -> RequestBuilder {
        let req = self.client.get(url);
        match self.token {
            Some(ref token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn workload_url(&self, key: &WorkloadKey) -> String {
        format!(
            "{}/apis/{}/{}/namespaces/{}/{}/{}",
            self.base_url, key.group, key.version, key.namespace, key.plural, key.name
        )
    }

    fn pods_url(&self, namespace: &str) -> String {
        format!("{}/api/v1/namespaces/{}/pods", self.base_url, namespace)
    }

    /// GET a single object, mapping 404 to `None`
    async fn get_object(&self, url: &str) -> Result<Option<Value>, OrchestratorError> {
        trace!("GET {}", url);
        let response = self.get(url).timeout(self.request_timeout).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = error_for_status(response).await?;

        let object = response
            .json::<Value>()
            .await
            .map_err(|e| OrchestratorError::Parse(e.to_string()))?;
        Ok(Some(object))
    }
}

async fn error_for_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, OrchestratorError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(OrchestratorError::Api {
        status: status.as_u16(),
        message,
    })
}

type WatchLines = Lines<StreamReader<futures::stream::BoxStream<'static, std::io::Result<bytes::Bytes>>, bytes::Bytes>>;

#[async_trait]
impl Orchestrator for KubeApiClient {
    async fn get_workload(
        &self,
        key: &WorkloadKey,
    ) -> Result<Option<WorkloadObject>, OrchestratorError> {
        let object = self.get_object(&self.workload_url(key)).await?;
        Ok(object.map(|obj| WorkloadObject::new(&key.name, &key.namespace, obj)))
    }

    async fn get_pod(&self, key: &PodKey) -> Result<Option<PodStatus>, OrchestratorError> {
        let url = format!("{}/{}", self.pods_url(&key.namespace), key.name);
        match self.get_object(&url).await? {
            Some(object) => {
                let pod: KubePod = serde_json::from_value(object)
                    .map_err(|e| OrchestratorError::Parse(e.to_string()))?;
                Ok(Some(pod.into()))
            }
            None => Ok(None),
        }
    }

    async fn watch_pods(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<PodEventStream, OrchestratorError> {
        let url = self.pods_url(namespace);
        debug!("Opening pod watch on {} ({})", url, selector.to_query());

        let response = self
            .get(&url)
            .query(&[
                ("labelSelector", selector.to_query().as_str()),
                ("watch", "true"),
            ])
            .send()
            .await?;
        let response = error_for_status(response).await?;

        let body = response
            .bytes_stream()
            .map_err(std::io::Error::other)
            .boxed();
        let lines: WatchLines = StreamReader::new(body).lines();

        // The state is dropped after the first error so a broken body
        // terminates the stream instead of repeating the same failure.
        let events = futures::stream::unfold(Some(lines), |state| async move {
            let mut lines = state?;
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match parse_watch_line(&line) {
                        Ok(Some(event)) => return Some((Ok(event), Some(lines))),
                        Ok(None) => continue,
                        Err(e) => return Some((Err(e), None)),
                    },
                    Ok(None) => return None,
                    Err(e) => return Some((Err(OrchestratorError::Watch(e.to_string())), None)),
                }
            }
        });

        Ok(events.boxed())
    }

    async fn tail_logs(
        &self,
        key: &PodKey,
        tail_lines: usize,
    ) -> Result<LogStream, OrchestratorError> {
        let url = format!("{}/{}/log", self.pods_url(&key.namespace), key.name);
        let tail = tail_lines.to_string();

        let response = self
            .get(&url)
            .query(&[("follow", "true"), ("tailLines", tail.as_str())])
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(OrchestratorError::NotFound(key.qualified()));
        }
        let response = error_for_status(response).await?;

        Ok(response
            .bytes_stream()
            .map_err(OrchestratorError::Http)
            .boxed())
    }
}
