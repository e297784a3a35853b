//! Orchestrator object shapes consumed by the bridge
//!
//! These are deliberately narrow projections of the Kubernetes objects: the
//! bridge only needs enough of a workload to read its endpoint flags and
//! enough of a pod to derive a display phase.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Address of a workload custom resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkloadKey {
    /// API group (e.g., "ethereum.kotal.io")
    pub group: String,
    /// API version (e.g., "v1alpha1")
    pub version: String,
    /// Plural resource name (e.g., "nodes")
    pub plural: String,
    pub namespace: String,
    pub name: String,
}

impl WorkloadKey {
    /// Fully qualified key: "group/plural/namespace/name"
    pub fn qualified(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.group, self.plural, self.namespace, self.name
        )
    }
}

/// Address of a pod
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

impl PodKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Qualified key: "namespace/name"
    pub fn qualified(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// A workload object as returned by the orchestrator
///
/// The full object is kept as JSON; protocol profiles project the fields they
/// need out of it with JSON pointers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadObject {
    pub name: String,
    pub namespace: String,
    pub object: Value,
}

impl WorkloadObject {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, object: Value) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            object,
        }
    }

    /// Look up a field by JSON pointer (e.g., "/spec/rpc")
    pub fn pointer(&self, pointer: &str) -> Option<&Value> {
        self.object.pointer(pointer)
    }
}

/// Observed state of a pod, reduced to what phase derivation needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodStatus {
    pub name: String,
    /// Pod uid; a recreated pod with the same name gets a new uid
    #[serde(default)]
    pub uid: String,
    /// Coarse phase: Pending, Running, Succeeded, Failed, Unknown
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    /// Waiting-state reason of the first container, if any
    #[serde(default)]
    pub waiting_reason: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl PodStatus {
    pub fn new(name: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: uid.into(),
            phase: None,
            deletion_timestamp: None,
            waiting_reason: None,
            labels: HashMap::new(),
        }
    }

    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    pub fn with_waiting_reason(mut self, reason: impl Into<String>) -> Self {
        self.waiting_reason = Some(reason.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn is_running(&self) -> bool {
        self.phase.as_deref() == Some("Running")
    }
}

/// Kind of a pod watch notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PodEventKind {
    Added,
    Modified,
    Deleted,
}

/// One item from a pod watch feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodEvent {
    pub kind: PodEventKind,
    pub pod: PodStatus,
}

impl PodEvent {
    pub fn new(kind: PodEventKind, pod: PodStatus) -> Self {
        Self { kind, pod }
    }
}

/// Label selector for filtering pods
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    /// Match exact labels
    #[serde(rename = "matchLabels")]
    #[serde(default)]
    pub match_labels: HashMap<String, String>,
}

impl LabelSelector {
    /// Create a selector that matches a specific label
    pub fn matching(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut labels = HashMap::new();
        labels.insert(key.into(), value.into());
        Self {
            match_labels: labels,
        }
    }

    /// Check if labels match this selector
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }

    /// Render as a `labelSelector` query value ("k1=v1,k2=v2"), sorted by key
    pub fn to_query(&self) -> String {
        let mut pairs: Vec<_> = self.match_labels.iter().collect();
        pairs.sort();
        pairs
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_selector_matches() {
        let selector = LabelSelector::matching("app.kubernetes.io/instance", "geth-1");

        let pod = PodStatus::new("geth-1-0", "uid-1")
            .with_label("app.kubernetes.io/instance", "geth-1")
            .with_label("app.kubernetes.io/name", "ethereum");
        assert!(selector.matches(&pod.labels));

        let other = PodStatus::new("geth-2-0", "uid-2").with_label("app.kubernetes.io/instance", "geth-2");
        assert!(!selector.matches(&other.labels));
    }

    #[test]
    fn test_label_selector_query_is_sorted() {
        let mut selector = LabelSelector::matching("b", "2");
        selector.match_labels.insert("a".to_string(), "1".to_string());
        assert_eq!(selector.to_query(), "a=1,b=2");
    }

    #[test]
    fn test_workload_pointer() {
        let workload = WorkloadObject::new(
            "geth-1",
            "default",
            serde_json::json!({"spec": {"rpc": true, "rpcPort": 8545}}),
        );
        assert_eq!(workload.pointer("/spec/rpc"), Some(&Value::Bool(true)));
        assert!(workload.pointer("/spec/ws").is_none());
    }

    #[test]
    fn test_qualified_keys() {
        let key = WorkloadKey {
            group: "ethereum.kotal.io".to_string(),
            version: "v1alpha1".to_string(),
            plural: "nodes".to_string(),
            namespace: "default".to_string(),
            name: "geth-1".to_string(),
        };
        assert_eq!(key.qualified(), "ethereum.kotal.io/nodes/default/geth-1");
        assert_eq!(PodKey::new("default", "geth-1-0").qualified(), "default/geth-1-0");
    }
}
