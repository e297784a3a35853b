use clap::{ArgAction, Parser};
use std::path::PathBuf;

use crate::config::{BridgeConfig, KubeConfig};

#[derive(Parser, Debug)]
#[command(name = "nodewatch")]
#[command(about = "Stream live status, stats and logs of blockchain nodes running on Kubernetes")]
#[command(version)]
pub struct Args {
    /// Path to the config file (YAML, or JSON with a .json extension)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Dry-run mode: validate config and show what would be served
    #[arg(long)]
    pub dry_run: bool,

    /// Address to listen on
    #[arg(long, value_name = "ADDR")]
    pub bind_addr: Option<String>,

    /// Port to listen on
    #[arg(short, long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Path to a .env file loaded before anything else
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,

    /// Kubernetes API server URL (overrides the config file)
    #[arg(long, env = "KUBE_API_URL", value_name = "URL")]
    pub kube_api_url: Option<String>,

    /// Use the pod's service account to reach the API server
    #[arg(long)]
    pub in_cluster: bool,

    /// Serve from an empty in-memory orchestrator instead of a cluster
    #[arg(long, conflicts_with_all = ["in_cluster", "kube_api_url"])]
    pub in_memory: bool,
}

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;

impl Args {
    pub fn listen_addr(&self) -> String {
        format!(
            "{}:{}",
            self.bind_addr.as_deref().unwrap_or(DEFAULT_BIND_ADDR),
            self.port.unwrap_or(DEFAULT_PORT)
        )
    }

    /// Apply command-line overrides on top of the loaded config
    pub fn apply_overrides(&self, config: &mut BridgeConfig) {
        if self.in_cluster {
            config.kube = KubeConfig::in_cluster();
        }
        if let Some(ref url) = self.kube_api_url {
            config.kube.api_url = url.clone();
        }
    }
}

// ============================================================================
// SBIO: Pure display logic (no I/O - returns formatted strings)
// ============================================================================

/// Format a dry-run report of the effective configuration.
/// Pure function - returns a formatted string.
pub fn format_dry_run(config: &BridgeConfig, args: &Args) -> String {
    let mut output = String::new();

    output.push_str("nodewatch v0.1.0 - Dry Run Mode\n\n");
    match args.config {
        Some(ref path) => output.push_str(&format!("Config: {}\n", path.display())),
        None => output.push_str("Config: (defaults)\n"),
    }
    output.push_str(&format!("Listen: {}\n", args.listen_addr()));
    if args.in_memory {
        output.push_str("Orchestrator: in-memory\n");
    } else {
        output.push_str(&format!("Orchestrator: {}\n", config.kube.api_url));
        if let Some(ref token) = config.kube.token_file {
            output.push_str(&format!("  Token: {}\n", token.display()));
        }
    }
    output.push('\n');

    output.push_str("Timing:\n");
    output.push_str(&format!("  Status retry:      {} ms\n", config.status_retry_ms));
    output.push_str(&format!("  Stats interval:    {} ms\n", config.stats_interval_ms));
    output.push_str(&format!("  Terminating grace: {} ms\n", config.terminating_grace_ms));
    output.push_str(&format!("  Request timeout:   {} ms\n", config.request_timeout_ms));
    output.push_str(&format!("  Log tail:          {} lines\n", config.log_tail_lines));
    output.push('\n');

    let registry = config.registry();
    output.push_str(&format!("Protocols ({}):\n", registry.len()));
    for name in registry.names() {
        let Some(profile) = registry.get(&name) else {
            continue;
        };
        output.push_str(&format!(
            "  - {} [{}/{}] {} via {}\n",
            profile.name,
            profile.group,
            profile.version,
            profile.collector.strategy_name(),
            profile.collector.capability()
        ));
        let methods: Vec<&str> = profile
            .collector
            .calls()
            .iter()
            .map(|c| c.method.as_str())
            .collect();
        output.push_str(&format!("      Calls: {}\n", methods.join(", ")));
    }

    output.push_str("\nValidation: PASSED\n");
    output.push_str("Ready to serve. Remove --dry-run to start.\n");

    output
}
