use std::sync::Arc;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::bridge::NodeIdentity;
use crate::config::ProtocolProfile;
use crate::server::state::{AppState, ConnectionInfo};
use crate::server::ws;

/// Path of every per-node stream
#[derive(Debug, Deserialize)]
pub struct NodePath {
    pub namespace: String,
    pub protocol: String,
    pub name: String,
}

impl NodePath {
    fn identity(&self) -> NodeIdentity {
        NodeIdentity::new(&self.name, &self.namespace)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    /// Lines of backlog before following
    pub tail: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
enum StreamKind {
    Status,
    Stats,
    Logs { tail: Option<usize> },
}

impl StreamKind {
    fn name(&self) -> &'static str {
        match self {
            StreamKind::Status => "status",
            StreamKind::Stats => "stats",
            StreamKind::Logs { .. } => "logs",
        }
    }
}

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Serialize)]
struct BridgeStatus {
    active_connections: usize,
    connections: Vec<ConnectionInfo>,
}

/// Active connection listing
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let mut connections: Vec<ConnectionInfo> =
        state.connections.iter().map(|c| c.value().clone()).collect();
    connections.sort_by_key(|c| c.opened_at);
    Json(BridgeStatus {
        active_connections: connections.len(),
        connections,
    })
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ProtocolSummary {
    pub name: String,
    pub group: String,
    pub version: String,
    pub strategy: String,
    pub capability: String,
    pub methods: Vec<String>,
}

impl From<&ProtocolProfile> for ProtocolSummary {
    fn from(profile: &ProtocolProfile) -> Self {
        Self {
            name: profile.name.clone(),
            group: profile.group.clone(),
            version: profile.version.clone(),
            strategy: profile.collector.strategy_name().to_string(),
            capability: profile.collector.capability().to_string(),
            methods: profile
                .collector
                .calls()
                .iter()
                .map(|c| c.method.clone())
                .collect(),
        }
    }
}

/// Configured protocols
pub async fn protocols(State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.bridge.registry();
    let summaries: Vec<ProtocolSummary> = registry
        .names()
        .iter()
        .filter_map(|name| registry.get(name))
        .map(|profile| ProtocolSummary::from(profile.as_ref()))
        .collect();
    Json(summaries)
}

/// Lifecycle phase stream (WebSocket)
pub async fn status_stream(
    State(state): State<AppState>,
    Path(path): Path<NodePath>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    open_stream(state, path, upgrade, StreamKind::Status)
}

/// Sync/peer statistics stream (WebSocket)
pub async fn stats_stream(
    State(state): State<AppState>,
    Path(path): Path<NodePath>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    open_stream(state, path, upgrade, StreamKind::Stats)
}

/// Log tail stream (WebSocket)
pub async fn logs_stream(
    State(state): State<AppState>,
    Path(path): Path<NodePath>,
    Query(query): Query<LogQuery>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    open_stream(state, path, upgrade, StreamKind::Logs { tail: query.tail })
}

fn open_stream(
    state: AppState,
    path: NodePath,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    kind: StreamKind,
) -> Response {
    let Some(profile) = state.bridge.profile(&path.protocol) else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": format!("unknown protocol '{}'", path.protocol)
            })),
        )
            .into_response();
    };

    match upgrade {
        Ok(upgrade) => upgrade
            .on_upgrade(move |socket| serve(state, socket, path.identity(), profile, kind))
            .into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

async fn serve(
    state: AppState,
    socket: WebSocket,
    identity: NodeIdentity,
    profile: Arc<ProtocolProfile>,
    kind: StreamKind,
) {
    let info = ConnectionInfo::new(&profile.name, &identity, kind.name());
    let id = info.id;
    state.register_connection(info);

    let (writer, reader) = ws::split(socket);
    let bridge = &state.bridge;
    let summary = match kind {
        StreamKind::Status => bridge.open_status_stream(identity, profile, writer, reader).await,
        StreamKind::Stats => bridge.open_stats_stream(identity, profile, writer, reader).await,
        StreamKind::Logs { tail } => {
            bridge
                .open_log_stream(identity, profile, tail, writer, reader)
                .await
        }
    };

    state.complete_connection(&id);
    info!(
        session = %id,
        connection = %summary.id,
        frames = summary.frames_written,
        ends = ?summary.ends,
        "Stream finished"
    );
}

/// Create the Axum router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/v1/protocols", get(protocols))
        .route(
            "/v1/namespaces/{namespace}/{protocol}/nodes/{name}/status",
            get(status_stream),
        )
        .route(
            "/v1/namespaces/{namespace}/{protocol}/nodes/{name}/stats",
            get(stats_stream),
        )
        .route(
            "/v1/namespaces/{namespace}/{protocol}/nodes/{name}/logs",
            get(logs_stream),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
