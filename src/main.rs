use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use nodewatch::bridge::Bridge;
use nodewatch::cli::{format_dry_run, Args};
use nodewatch::config::{load_config_file, BridgeConfig};
use nodewatch::orchestrator::{InMemoryOrchestrator, KubeApiClient, SharedOrchestrator};
use nodewatch::server::{create_router, AppState};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    // Load .env file if specified
    if let Some(ref env_file) = args.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
    }

    let mut config = match args.config {
        Some(ref path) => match load_config_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load config file {}: {}", path.display(), e);
                process::exit(1);
            }
        },
        None => BridgeConfig::default(),
    };
    args.apply_overrides(&mut config);

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        process::exit(1);
    }

    // Dry-run mode: print effective config and exit
    if args.dry_run {
        let output = format_dry_run(&config, &args);
        println!("{}", output);
        return;
    }

    let orchestrator: SharedOrchestrator = if args.in_memory {
        info!("Using in-memory orchestrator");
        Arc::new(InMemoryOrchestrator::new())
    } else {
        match KubeApiClient::from_config(&config.kube, config.request_timeout()) {
            Ok(client) => {
                info!("Using Kubernetes API at {}", client.base_url());
                Arc::new(client)
            }
            Err(e) => {
                error!("Failed to create Kubernetes client: {}", e);
                process::exit(1);
            }
        }
    };

    let bridge = Bridge::new(orchestrator, config);
    info!("Loaded {} protocols", bridge.registry().len());
    let state = AppState::new(bridge);

    let addr = args.listen_addr();
    let app = create_router(state);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            process::exit(1);
        }
    };

    info!("Server listening on {}", addr);
    info!("Endpoints:");
    info!("  GET /health       - Health check");
    info!("  GET /status       - Open streams");
    info!("  GET /v1/protocols - Configured protocols");
    info!("  WS  /v1/namespaces/{{namespace}}/{{protocol}}/nodes/{{name}}/status");
    info!("  WS  /v1/namespaces/{{namespace}}/{{protocol}}/nodes/{{name}}/stats");
    info!("  WS  /v1/namespaces/{{namespace}}/{{protocol}}/nodes/{{name}}/logs?tail=N");

    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {}", e);
        process::exit(1);
    }
}
