pub mod protocols;

pub use protocols::{
    builtin_profiles, Capability, CollectorProfile, EndpointFields, FieldMapping,
    ProtocolProfile, ProtocolRegistry, RpcCall, StatsField,
};

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for loading and validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Kubernetes API access
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct KubeConfig {
    /// API server URL; defaults to a local `kubectl proxy`
    pub api_url: String,
    /// Bearer token file (service account token when running in-cluster)
    pub token_file: Option<PathBuf>,
    /// PEM bundle used to verify the API server
    pub ca_file: Option<PathBuf>,
    /// Skip TLS verification
    pub insecure: bool,
}

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

impl Default for KubeConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8001".to_string(),
            token_file: None,
            ca_file: None,
            insecure: false,
        }
    }
}

impl KubeConfig {
    /// Settings for a pod using its mounted service account
    pub fn in_cluster() -> Self {
        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        Self {
            api_url: "https://kubernetes.default.svc".to_string(),
            token_file: Some(dir.join("token")),
            ca_file: Some(dir.join("ca.crt")),
            insecure: false,
        }
    }
}

/// Bridge configuration
///
/// Every field has a default, so an empty file (or no file) is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BridgeConfig {
    /// Readiness re-check interval for status streams
    pub status_retry_ms: u64,
    /// Polling interval (and readiness re-check interval) for stats streams
    pub stats_interval_ms: u64,
    /// Delay before confirming a terminating pod's workload is gone
    pub terminating_grace_ms: u64,
    /// Deadline for each upstream RPC call and orchestrator GET
    pub request_timeout_ms: u64,
    /// Log lines replayed before following
    pub log_tail_lines: usize,
    /// Events buffered per connection before producers wait
    pub sink_capacity: usize,
    /// Service host for a node; `$NAME` and `$NAMESPACE` are substituted
    pub host_template: String,
    pub kube: KubeConfig,
    pub protocols: Vec<ProtocolProfile>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            status_retry_ms: 3000,
            stats_interval_ms: 1000,
            terminating_grace_ms: 3000,
            request_timeout_ms: 5000,
            log_tail_lines: 100,
            sink_capacity: 64,
            host_template: "$NAME.$NAMESPACE.svc".to_string(),
            kube: KubeConfig::default(),
            protocols: builtin_profiles(),
        }
    }
}

impl BridgeConfig {
    pub fn status_retry(&self) -> Duration {
        Duration::from_millis(self.status_retry_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    pub fn terminating_grace(&self) -> Duration {
        Duration::from_millis(self.terminating_grace_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Resolve the service host for a node
    pub fn host_for(&self, name: &str, namespace: &str) -> String {
        // $NAMESPACE first: "$NAME" is a prefix of it
        self.host_template
            .replace("$NAMESPACE", namespace)
            .replace("$NAME", name)
    }

    pub fn registry(&self) -> ProtocolRegistry {
        ProtocolRegistry::new(&self.protocols)
    }

    /// Parse from YAML (JSON is accepted as well, being a YAML subset)
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants the collectors rely on
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("status-retry-ms", self.status_retry_ms),
            ("stats-interval-ms", self.stats_interval_ms),
            ("terminating-grace-ms", self.terminating_grace_ms),
            ("request-timeout-ms", self.request_timeout_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::Validation(format!("{} must be positive", name)));
            }
        }
        if self.sink_capacity == 0 {
            return Err(ConfigError::Validation(
                "sink-capacity must be positive".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for profile in &self.protocols {
            if !names.insert(profile.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate protocol '{}'",
                    profile.name
                )));
            }
            validate_profile(profile)?;
        }

        Ok(())
    }
}

fn validate_profile(profile: &ProtocolProfile) -> Result<(), ConfigError> {
    let capability = profile.collector.capability();
    if profile.endpoint(capability).is_none() {
        return Err(ConfigError::Validation(format!(
            "protocol '{}' uses the {} strategy but declares no {} endpoint",
            profile.name,
            profile.collector.strategy_name(),
            capability
        )));
    }

    let calls = profile.collector.calls();
    if calls.is_empty() {
        return Err(ConfigError::Validation(format!(
            "protocol '{}' has no collector calls",
            profile.name
        )));
    }

    if let CollectorProfile::Proxied { calls } = &profile.collector {
        let mut ids = HashSet::new();
        for call in calls {
            if call.id == 0 || !ids.insert(call.id) {
                return Err(ConfigError::Validation(format!(
                    "protocol '{}': proxied call '{}' needs a unique non-zero id",
                    profile.name, call.method
                )));
            }
        }
    }

    Ok(())
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure functions
// ============================================================================

/// Load and parse a config file from disk.
/// Files ending in `.json` are parsed as JSON, everything else as YAML.
pub fn load_config_file(path: &Path) -> Result<BridgeConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => BridgeConfig::from_json(&content),
        _ => BridgeConfig::from_yaml(&content),
    }
}
