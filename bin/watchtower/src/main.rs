//! Watchtower - Substrate chain indexer for portfolio tracking.
//!
//! # Usage
//!
//! ```bash
//! # Track Kusama against a local node
//! watchtower --chains kusama --rpc-url-kusama ws://127.0.0.1:9944
//!
//! # Environment overrides work for every flag
//! DB_PATH=/data/user.db LISTEN=0.0.0.0:5000 watchtower
//! ```
//!
//! Exit codes: 0 normal, 1 configuration error, 2 storage error,
//! 3 fatal runtime error.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use watchtower_core::metrics::init_metrics;
use watchtower_core::models::ChainSpec;
use watchtower_session::{ChainHandle, ControllerConfig, ServerConfig, SessionController};
use watchtower_storage::{Database, DatabaseConfig, SqliteStore};
use watchtower_substrate::{SubstrateClient, SubstrateClientConfig};

/// Watchtower CLI - Substrate indexer for portfolio tracking.
#[derive(Parser, Debug)]
#[command(name = "watchtower")]
#[command(about = "Substrate chain indexer for portfolio tracking")]
#[command(version)]
struct Cli {
    /// Listen address for the client WebSocket.
    #[arg(long, env = "LISTEN", default_value = "127.0.0.1:5000")]
    listen: String,

    /// Path to the user's database file.
    #[arg(long, env = "DB_PATH", default_value = "watchtower.db")]
    db: String,

    /// Chains to serve, comma separated.
    #[arg(long, env = "CHAINS", default_value = "kusama", value_delimiter = ',')]
    chains: Vec<String>,

    /// Blocks behind the head treated as immutable. Overrides the
    /// per-chain preset; zero accepts the best head at your own risk.
    #[arg(long, env = "FINALITY_DEPTH")]
    finality_depth: Option<u64>,

    /// Kusama node WebSocket URL.
    #[arg(long, env = "RPC_URL_KUSAMA")]
    rpc_url_kusama: Option<String>,

    /// Polkadot node WebSocket URL.
    #[arg(long, env = "RPC_URL_POLKADOT")]
    rpc_url_polkadot: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable JSON log output.
    #[arg(long, env = "JSON_LOGS")]
    json_logs: bool,

    /// Prometheus metrics port. Disabled when absent.
    #[arg(long, env = "METRICS_PORT")]
    metrics_port: Option<u16>,
}

enum FatalError {
    Config(String),
    Storage(String),
    Runtime(String),
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(FatalError::Config(message)) => {
            error!("configuration error: {message}");
            ExitCode::from(1)
        }
        Err(FatalError::Storage(message)) => {
            error!("storage error: {message}");
            ExitCode::from(2)
        }
        Err(FatalError::Runtime(message)) => {
            error!("fatal: {message}");
            ExitCode::from(3)
        }
    }
}

async fn run(cli: Cli) -> Result<(), FatalError> {
    info!("starting watchtower");

    if let Some(port) = cli.metrics_port {
        match format!("0.0.0.0:{port}").parse::<std::net::SocketAddr>() {
            Ok(addr) => match PrometheusBuilder::new().with_http_listener(addr).install() {
                Ok(()) => {
                    init_metrics();
                    info!(port, "metrics exporter listening");
                }
                Err(e) => warn!("failed to start metrics exporter: {e}, continuing without"),
            },
            Err(e) => warn!("invalid metrics address: {e}, continuing without"),
        }
    }

    info!(path = %cli.db, "opening database");
    let database = Database::open(&DatabaseConfig::at_path(&cli.db))
        .await
        .map_err(|e| FatalError::Storage(e.to_string()))?;
    let store = Arc::new(SqliteStore::new(Arc::new(database)));

    let mut controller = SessionController::new(store, ControllerConfig::default());

    if cli.chains.is_empty() {
        return Err(FatalError::Config("no chains configured".into()));
    }
    for chain_id in &cli.chains {
        let mut spec = ChainSpec::preset(chain_id)
            .ok_or_else(|| FatalError::Config(format!("unsupported chain: {chain_id}")))?;
        if let Some(depth) = cli.finality_depth {
            spec.finality_depth = depth;
        }

        let rpc_url = match chain_id.as_str() {
            "kusama" => cli.rpc_url_kusama.clone(),
            "polkadot" => cli.rpc_url_polkadot.clone(),
            _ => None,
        }
        .ok_or_else(|| FatalError::Config(format!("no RPC URL configured for {chain_id}")))?;

        info!(chain = %chain_id, url = %rpc_url, "connecting to node");
        let client = SubstrateClient::connect(
            spec.clone(),
            SubstrateClientConfig {
                ws_url: rpc_url,
                ..Default::default()
            },
        )
        .await
        .map_err(|e| FatalError::Runtime(format!("{chain_id}: {e}")))?;

        controller.register_chain(ChainHandle {
            spec,
            client: Arc::new(client),
        });
    }

    let controller = Arc::new(controller);
    let server_config = ServerConfig {
        listen: cli.listen.clone(),
    };

    info!(listen = %cli.listen, chains = ?cli.chains, "watchtower ready");
    watchtower_session::serve(server_config, controller, shutdown_signal())
        .await
        .map_err(|e| FatalError::Runtime(e.to_string()))?;

    info!("shutdown complete");
    Ok(())
}

/// Initialize tracing subscriber.
fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        fmt().with_env_filter(filter).json().init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    debug!("shutdown signal received");
}
