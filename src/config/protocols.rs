//! Protocol profiles
//!
//! A profile tells the bridge everything protocol-specific it needs: where
//! the workload custom resource lives, which spec fields carry the endpoint
//! flags and ports, and which collector strategy to run with which RPC calls.
//! Adding a protocol is a configuration change, not new code.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// SBIO: Pure data structures
// ============================================================================

/// Endpoint capability a collector depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Rpc,
    Ws,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Rpc => "rpc",
            Capability::Ws => "ws",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an endpoint's flag and port live in the workload object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EndpointFields {
    /// JSON pointer to the boolean enable flag (e.g., "/spec/rpc")
    pub enabled: String,
    /// JSON pointer to the port (e.g., "/spec/rpcPort")
    pub port: String,
    /// Port used when the field is absent
    pub default_port: u16,
}

impl EndpointFields {
    pub fn new(enabled: &str, port: &str, default_port: u16) -> Self {
        Self {
            enabled: enabled.to_string(),
            port: port.to_string(),
            default_port,
        }
    }
}

/// Normalized statistics field an RPC result can feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StatsField {
    CurrentBlock,
    HighestBlock,
    PeersCount,
    Syncing,
}

/// Maps one value inside an RPC result onto a stats field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// JSON pointer into the `result` member; empty means the whole result
    #[serde(default)]
    pub pointer: String,
    pub field: StatsField,
}

impl FieldMapping {
    pub fn new(pointer: &str, field: StatsField) -> Self {
        Self {
            pointer: pointer.to_string(),
            field,
        }
    }
}

/// One JSON-RPC call issued by a collector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcCall {
    /// Correlation id; required (and unique) for proxied calls
    #[serde(default)]
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
    pub fields: Vec<FieldMapping>,
}

impl RpcCall {
    pub fn new(id: u64, method: &str, fields: Vec<FieldMapping>) -> Self {
        Self {
            id,
            method: method.to_string(),
            params: Vec::new(),
            fields,
        }
    }
}

/// Collector strategy and its calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "kebab-case")]
pub enum CollectorProfile {
    /// Request/response JSON-RPC over HTTP on the RPC endpoint
    Polling { calls: Vec<RpcCall> },
    /// Correlated JSON-RPC over one persistent WebSocket on the WS endpoint
    Proxied { calls: Vec<RpcCall> },
}

impl CollectorProfile {
    pub fn calls(&self) -> &[RpcCall] {
        match self {
            CollectorProfile::Polling { calls } | CollectorProfile::Proxied { calls } => calls,
        }
    }

    /// Endpoint capability this strategy requires
    pub fn capability(&self) -> Capability {
        match self {
            CollectorProfile::Polling { .. } => Capability::Rpc,
            CollectorProfile::Proxied { .. } => Capability::Ws,
        }
    }

    pub fn strategy_name(&self) -> &'static str {
        match self {
            CollectorProfile::Polling { .. } => "polling",
            CollectorProfile::Proxied { .. } => "proxied",
        }
    }
}

/// Everything protocol-specific the bridge needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProtocolProfile {
    /// Route name (e.g., "ethereum")
    pub name: String,
    /// Custom resource API group
    pub group: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_plural")]
    pub plural: String,
    #[serde(default)]
    pub rpc: Option<EndpointFields>,
    #[serde(default)]
    pub ws: Option<EndpointFields>,
    pub collector: CollectorProfile,
}

fn default_version() -> String {
    "v1alpha1".to_string()
}

fn default_plural() -> String {
    "nodes".to_string()
}

impl ProtocolProfile {
    /// Endpoint field mapping for a capability, if the protocol declares one
    pub fn endpoint(&self, capability: Capability) -> Option<&EndpointFields> {
        match capability {
            Capability::Rpc => self.rpc.as_ref(),
            Capability::Ws => self.ws.as_ref(),
        }
    }
}

// ============================================================================
// Built-in profiles
// ============================================================================

/// Ethereum execution clients: polled over HTTP JSON-RPC
pub fn ethereum() -> ProtocolProfile {
    ProtocolProfile {
        name: "ethereum".to_string(),
        group: "ethereum.kotal.io".to_string(),
        version: default_version(),
        plural: default_plural(),
        rpc: Some(EndpointFields::new("/spec/rpc", "/spec/rpcPort", 8545)),
        ws: Some(EndpointFields::new("/spec/ws", "/spec/wsPort", 8546)),
        collector: CollectorProfile::Polling {
            calls: vec![
                RpcCall::new(
                    1,
                    "eth_blockNumber",
                    vec![FieldMapping::new("", StatsField::CurrentBlock)],
                ),
                // `false` when synced, otherwise an object with hex heights;
                // listed after eth_blockNumber so its currentBlock wins
                RpcCall::new(
                    2,
                    "eth_syncing",
                    vec![
                        FieldMapping::new("/currentBlock", StatsField::CurrentBlock),
                        FieldMapping::new("/highestBlock", StatsField::HighestBlock),
                        FieldMapping::new("", StatsField::Syncing),
                    ],
                ),
                RpcCall::new(
                    3,
                    "net_peerCount",
                    vec![FieldMapping::new("", StatsField::PeersCount)],
                ),
            ],
        },
    }
}

/// Polkadot/Substrate nodes: correlated calls over one WebSocket
pub fn polkadot() -> ProtocolProfile {
    ProtocolProfile {
        name: "polkadot".to_string(),
        group: "polkadot.kotal.io".to_string(),
        version: default_version(),
        plural: default_plural(),
        rpc: Some(EndpointFields::new("/spec/rpc", "/spec/rpcPort", 9933)),
        ws: Some(EndpointFields::new("/spec/ws", "/spec/wsPort", 9944)),
        collector: CollectorProfile::Proxied {
            calls: vec![
                RpcCall::new(
                    1,
                    "system_syncState",
                    vec![
                        FieldMapping::new("/currentBlock", StatsField::CurrentBlock),
                        FieldMapping::new("/highestBlock", StatsField::HighestBlock),
                    ],
                ),
                RpcCall::new(
                    2,
                    "system_health",
                    vec![
                        FieldMapping::new("/peers", StatsField::PeersCount),
                        FieldMapping::new("/isSyncing", StatsField::Syncing),
                    ],
                ),
            ],
        },
    }
}

/// NEAR nodes: polled over HTTP JSON-RPC
pub fn near() -> ProtocolProfile {
    ProtocolProfile {
        name: "near".to_string(),
        group: "near.kotal.io".to_string(),
        version: default_version(),
        plural: default_plural(),
        rpc: Some(EndpointFields::new("/spec/rpc", "/spec/rpcPort", 3030)),
        ws: None,
        collector: CollectorProfile::Polling {
            calls: vec![
                RpcCall::new(
                    1,
                    "status",
                    vec![
                        FieldMapping::new("/sync_info/latest_block_height", StatsField::CurrentBlock),
                        FieldMapping::new("/sync_info/syncing", StatsField::Syncing),
                    ],
                ),
                RpcCall::new(
                    2,
                    "network_info",
                    vec![FieldMapping::new("/num_active_peers", StatsField::PeersCount)],
                ),
            ],
        },
    }
}

pub fn builtin_profiles() -> Vec<ProtocolProfile> {
    vec![ethereum(), polkadot(), near()]
}

// ============================================================================
// Registry
// ============================================================================

/// Lookup table of configured profiles by route name
#[derive(Debug, Clone, Default)]
pub struct ProtocolRegistry {
    profiles: HashMap<String, Arc<ProtocolProfile>>,
}

impl ProtocolRegistry {
    pub fn new(profiles: &[ProtocolProfile]) -> Self {
        Self {
            profiles: profiles
                .iter()
                .map(|p| (p.name.clone(), Arc::new(p.clone())))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProtocolProfile>> {
        self.profiles.get(name).cloned()
    }

    /// Profile names in sorted order
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.profiles.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_strategies() {
        assert_eq!(ethereum().collector.capability(), Capability::Rpc);
        assert_eq!(polkadot().collector.capability(), Capability::Ws);
        assert_eq!(near().collector.strategy_name(), "polling");
    }

    #[test]
    fn test_polkadot_ids_are_fixed() {
        let ids: Vec<u64> = polkadot().collector.calls().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_profile_from_yaml() {
        let yaml = r#"
name: filecoin
group: filecoin.kotal.io
rpc:
  enabled: /spec/api
  port: /spec/apiPort
  default-port: 1234
collector:
  strategy: polling
  calls:
    - method: Filecoin.ChainHead
      fields:
        - pointer: /Height
          field: currentBlock
"#;
        let profile: ProtocolProfile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(profile.version, "v1alpha1");
        assert_eq!(profile.plural, "nodes");
        assert!(profile.ws.is_none());
        assert_eq!(profile.endpoint(Capability::Rpc).unwrap().default_port, 1234);
        assert_eq!(
            profile.collector.calls()[0].fields[0].field,
            StatsField::CurrentBlock
        );
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ProtocolRegistry::new(&builtin_profiles());
        assert_eq!(registry.len(), 3);
        assert!(registry.get("polkadot").is_some());
        assert!(registry.get("dogecoin").is_none());
        assert_eq!(registry.names(), vec!["ethereum", "near", "polkadot"]);
    }

    #[test]
    fn test_capability_display() {
        assert_eq!(Capability::Rpc.to_string(), "rpc");
        assert_eq!(Capability::Ws.to_string(), "ws");
    }
}
