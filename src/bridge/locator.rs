//! Resource locator
//!
//! Maps a logical node name onto the orchestrator objects behind it. Pure
//! naming convention: the workload is a custom resource of the protocol's
//! kind, its pods are the members of a stateful set of the same name, and
//! they carry the instance label.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{Capability, EndpointFields, ProtocolProfile};
use crate::orchestrator::{LabelSelector, PodKey, WorkloadKey, WorkloadObject};

/// Label every pod of a node carries
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";

/// Logical key of a node; immutable for the life of a connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub name: String,
    pub namespace: String,
}

impl NodeIdentity {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl std::fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Orchestrator objects to observe for one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    pub workload: WorkloadKey,
    /// Ordinal-0 pod of the node's stateful set
    pub pod: PodKey,
    /// Selector for every pod owned by the node
    pub selector: LabelSelector,
}

/// Resolve a node identity for a protocol
pub fn locate(identity: &NodeIdentity, profile: &ProtocolProfile) -> Located {
    Located {
        workload: WorkloadKey {
            group: profile.group.clone(),
            version: profile.version.clone(),
            plural: profile.plural.clone(),
            namespace: identity.namespace.clone(),
            name: identity.name.clone(),
        },
        pod: PodKey::new(&identity.namespace, format!("{}-0", identity.name)),
        selector: LabelSelector::matching(INSTANCE_LABEL, &identity.name),
    }
}

/// An endpoint as declared on the workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub enabled: bool,
    pub port: u16,
}

impl Endpoint {
    fn project(workload: &WorkloadObject, fields: &EndpointFields) -> Self {
        let enabled = workload
            .pointer(&fields.enabled)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let port = workload
            .pointer(&fields.port)
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(fields.default_port);
        Self { enabled, port }
    }
}

/// The workload fields telemetry depends on
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceSnapshot {
    pub protocol: String,
    pub host: String,
    pub rpc: Option<Endpoint>,
    pub ws: Option<Endpoint>,
}

impl ResourceSnapshot {
    /// Project a workload object through a protocol profile
    pub fn from_workload(workload: &WorkloadObject, profile: &ProtocolProfile, host: String) -> Self {
        Self {
            protocol: profile.name.clone(),
            host,
            rpc: profile.rpc.as_ref().map(|f| Endpoint::project(workload, f)),
            ws: profile.ws.as_ref().map(|f| Endpoint::project(workload, f)),
        }
    }

    pub fn endpoint(&self, capability: Capability) -> Option<Endpoint> {
        match capability {
            Capability::Rpc => self.rpc,
            Capability::Ws => self.ws,
        }
    }

    pub fn is_enabled(&self, capability: Capability) -> bool {
        self.endpoint(capability).map(|e| e.enabled).unwrap_or(false)
    }

    /// URL of an endpoint: `http://` for RPC, `ws://` for WS
    pub fn url(&self, capability: Capability) -> Option<String> {
        let endpoint = self.endpoint(capability)?;
        let scheme = match capability {
            Capability::Rpc => "http",
            Capability::Ws => "ws",
        };
        Some(format!("{}://{}:{}", scheme, self.host, endpoint.port))
    }
}
