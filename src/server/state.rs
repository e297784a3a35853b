use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use crate::bridge::{Bridge, NodeIdentity};

/// A client stream currently being served
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub protocol: String,
    pub namespace: String,
    pub name: String,
    pub stream: &'static str,
    pub opened_at: DateTime<Utc>,
}

impl ConnectionInfo {
    pub fn new(protocol: &str, identity: &NodeIdentity, stream: &'static str) -> Self {
        Self {
            id: Uuid::new_v4(),
            protocol: protocol.to_string(),
            namespace: identity.namespace.clone(),
            name: identity.name.clone(),
            stream,
            opened_at: Utc::now(),
        }
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub bridge: Bridge,
    pub connections: Arc<DashMap<Uuid, ConnectionInfo>>,
}

impl AppState {
    pub fn new(bridge: Bridge) -> Self {
        Self {
            bridge,
            connections: Arc::new(DashMap::new()),
        }
    }

    /// Register an open connection
    pub fn register_connection(&self, info: ConnectionInfo) {
        self.connections.insert(info.id, info);
    }

    /// Remove a finished connection
    pub fn complete_connection(&self, id: &Uuid) -> Option<ConnectionInfo> {
        self.connections.remove(id).map(|(_, c)| c)
    }

    pub fn active_connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::orchestrator::InMemoryOrchestrator;

    fn create_test_state() -> AppState {
        AppState::new(Bridge::new(
            Arc::new(InMemoryOrchestrator::new()),
            BridgeConfig::default(),
        ))
    }

    #[test]
    fn test_state_creation() {
        let state = create_test_state();
        assert_eq!(state.active_connection_count(), 0);
        assert_eq!(state.bridge.registry().len(), 3);
    }

    #[test]
    fn test_connection_tracking() {
        let state = create_test_state();
        let info = ConnectionInfo::new("ethereum", &NodeIdentity::new("geth-1", "default"), "stats");
        let id = info.id;

        state.register_connection(info);
        assert_eq!(state.active_connection_count(), 1);

        let completed = state.complete_connection(&id).unwrap();
        assert_eq!(completed.name, "geth-1");
        assert_eq!(state.active_connection_count(), 0);
        assert!(state.complete_connection(&id).is_none());
    }
}
