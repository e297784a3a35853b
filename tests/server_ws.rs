//! WebSocket routes served over a real socket

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use nodewatch::bridge::{locate, Bridge, NodeIdentity};
use nodewatch::config::{protocols, BridgeConfig};
use nodewatch::orchestrator::InMemoryOrchestrator;
use nodewatch::server::{create_router, AppState};

/// Find an available port for testing
fn find_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to address")
        .local_addr()
        .expect("Failed to get local address")
        .port()
}

async fn start_bridge(store: Arc<InMemoryOrchestrator>) -> String {
    let port = find_available_port();
    let config = BridgeConfig {
        status_retry_ms: 50,
        stats_interval_ms: 50,
        ..BridgeConfig::default()
    };
    let app = create_router(AppState::new(Bridge::new(store, config)));

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .expect("Failed to bind bridge");
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give server time to start
    sleep(Duration::from_millis(50)).await;
    format!("127.0.0.1:{}", port)
}

#[tokio::test]
async fn test_missing_node_gets_error_then_close() {
    let addr = start_bridge(Arc::new(InMemoryOrchestrator::new())).await;

    let (mut socket, _) = connect_async(format!(
        "ws://{}/v1/namespaces/default/ethereum/nodes/geth-1/status",
        addr
    ))
    .await
    .expect("Failed to connect");

    let message = timeout(Duration::from_secs(2), socket.next())
        .await
        .expect("no frame from bridge")
        .unwrap()
        .unwrap();
    match message {
        Message::Text(text) => {
            let body: Value = serde_json::from_str(text.as_str()).unwrap();
            assert_eq!(body, json!({"error": "ethereum node default/geth-1 not found"}));
        }
        other => panic!("Expected text frame, got {:?}", other),
    }

    let message = timeout(Duration::from_secs(2), socket.next())
        .await
        .expect("no close from bridge")
        .unwrap()
        .unwrap();
    assert!(matches!(message, Message::Close(_)));
}

#[tokio::test]
async fn test_open_streams_are_listed_until_client_leaves() {
    let store = Arc::new(InMemoryOrchestrator::new());
    let identity = NodeIdentity::new("geth-1", "default");
    store.put_workload(
        &locate(&identity, &protocols::ethereum()).workload,
        json!({"spec": {"rpc": false}}),
    );
    let addr = start_bridge(store).await;
    let http = reqwest::Client::new();

    let (mut socket, _) = connect_async(format!(
        "ws://{}/v1/namespaces/default/ethereum/nodes/geth-1/stats",
        addr
    ))
    .await
    .expect("Failed to connect");

    let message = timeout(Duration::from_secs(2), socket.next())
        .await
        .expect("no frame from bridge")
        .unwrap()
        .unwrap();
    match message {
        Message::Text(text) => assert_eq!(text.as_str(), r#"{"error":"rpc is not enabled"}"#),
        other => panic!("Expected text frame, got {:?}", other),
    }

    let status: Value = http
        .get(format!("http://{}/status", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["active_connections"], 1);
    assert_eq!(status["connections"][0]["name"], "geth-1");
    assert_eq!(status["connections"][0]["stream"], "stats");

    socket.close(None).await.unwrap();
    drop(socket);

    let mut active = 1;
    for _ in 0..40 {
        let status: Value = http
            .get(format!("http://{}/status", addr))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        active = status["active_connections"].as_u64().unwrap();
        if active == 0 {
            break;
        }
        sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(active, 0);
}

#[tokio::test]
async fn test_unknown_protocol_is_rejected_before_upgrade() {
    let addr = start_bridge(Arc::new(InMemoryOrchestrator::new())).await;

    let result = connect_async(format!(
        "ws://{}/v1/namespaces/default/dogecoin/nodes/doge-1/stats",
        addr
    ))
    .await;
    assert!(result.is_err());

    let response = reqwest::get(format!("http://{}/v1/protocols", addr))
        .await
        .unwrap();
    assert!(response.status().is_success());
}
