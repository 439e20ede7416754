//! Covenant signer daemon binary.
//!
//! Serves signing requests over HTTP and counters over a separate metrics
//! endpoint until interrupted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use covenant_btcclient::BtcClient;
use covenant_signer::metrics::serve_metrics;
use covenant_signer::{
    BitcoindChainInfo, Config, SignerBackend, SignerMetrics, SignerServer, SigningPolicyEngine,
    VersionedParamsRetriever,
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Remote covenant signer for Bitcoin staking.
#[derive(Parser, Debug)]
#[command(name = "covenant-signer")]
#[command(about = "Remote covenant signing service for staking unbonding transactions")]
#[command(version)]
struct Args {
    /// Path to the TOML config file
    #[arg(long, env = "COVENANT_SIGNER_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    /// Path to the global params JSON file
    #[arg(long, default_value = "global-params.json")]
    params: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the signing and metrics servers
    Start,
    /// Write the default config file if none exists
    DumpCfg,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let result = match args.command {
        Command::DumpCfg => dump_config(&args.config),
        Command::Start => start(&args.config, &args.params).await,
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn dump_config(path: &Path) -> Result<(), String> {
    let written = covenant_signer::config::write_default_if_absent(path)
        .map_err(|e| format!("Failed to write config: {}", e))?;
    if !written {
        info!("Config file {:?} already exists, leaving it untouched", path);
    }
    Ok(())
}

async fn start(config_path: &Path, params_path: &Path) -> Result<(), String> {
    info!("Starting covenant-signer");
    info!("Config file: {:?}", config_path);
    info!("Params file: {:?}", params_path);

    let config = Config::load(config_path)
        .and_then(|c| c.parse())
        .map_err(|e| format!("Failed to load config: {}", e))?;

    let params = VersionedParamsRetriever::from_file(params_path)
        .map_err(|e| format!("Failed to load global params: {}", e))?;

    let chain_client = BtcClient::new(&config.btc_node)
        .map_err(|e| format!("Failed to create btc node client: {}", e))?;
    let signer_client = BtcClient::new(&config.btc_signer)
        .map_err(|e| format!("Failed to create btc signer client: {}", e))?;

    info!(
        "Network: {}, signer backend: {:?}",
        config.network, config.signer_type
    );

    let engine = SigningPolicyEngine::new(
        Arc::new(SignerBackend::new(
            config.signer_type,
            Arc::new(signer_client),
        )),
        Arc::new(BitcoindChainInfo::new(Arc::new(chain_client))),
        Arc::new(params),
        config.network,
    );

    let metrics =
        Arc::new(SignerMetrics::new().map_err(|e| format!("Failed to create metrics: {}", e))?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install CTRL+C handler: {}", e);
        }
        info!("Shutting down gracefully");
        let _ = shutdown_tx.send(true);
    });

    let mut metrics_shutdown = shutdown_rx.clone();
    let metrics_addr = config.metrics_addr;
    let metrics_server = tokio::spawn(serve_metrics(metrics_addr, metrics.clone(), async move {
        metrics_shutdown.changed().await.ok();
    }));

    let mut server_shutdown = shutdown_rx;
    let server = SignerServer::new(config.server, Arc::new(engine), metrics);
    let served = server
        .run(async move {
            server_shutdown.changed().await.ok();
        })
        .await;

    if served.is_err() {
        metrics_server.abort();
    }

    match metrics_server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Metrics server error: {}", e),
        Err(e) if e.is_cancelled() => {}
        Err(e) => error!("Metrics server task failed: {}", e),
    }

    served.map_err(|e| format!("Server error: {}", e))
}
