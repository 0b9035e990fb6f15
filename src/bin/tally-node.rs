#![forbid(unsafe_code)]
//! Runs one tallychain node: HTTP API, bootstrap announce and periodic consensus.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tallychain::api::run_api_server;
use tallychain::config::{load_config, DEFAULT_CONFIG_PATH};
use tallychain::node::Node;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Run a tallychain node", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// API port, overrides network.api_port
    #[arg(short, long)]
    port: Option<u16>,
    /// Bootstrap peer address (repeatable), added to network.bootstrap_peers
    #[arg(short = 'n', long = "peer")]
    peers: Vec<String>,
    /// Proof-of-work difficulty, overrides ledger.difficulty
    #[arg(short, long)]
    difficulty: Option<u32>,
    /// Database path, overrides database.path
    #[arg(long)]
    database: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli.config)?;
    if let Some(port) = cli.port {
        config.network.api_port = port;
    }
    if let Some(difficulty) = cli.difficulty {
        config.ledger.difficulty = difficulty;
    }
    if let Some(database) = cli.database {
        config.database.path = database;
    }
    config.network.bootstrap_peers.extend(cli.peers);
    config.validate()?;

    let addr = config.bind_socket()?;
    info!(
        config = %cli.config.display(),
        difficulty = config.ledger.difficulty,
        database = %config.database.path,
        "starting tallychain node"
    );

    let node = Arc::new(Node::from_config(config).await?);
    info!(address = %node.address(), "node initialized");

    {
        let node = node.clone();
        tokio::spawn(async move {
            match node.bootstrap().await {
                Ok(resolution) => info!(?resolution, "bootstrap complete"),
                Err(e) => warn!(error = %e, "bootstrap failed"),
            }
        });
    }

    let resolver = node.spawn_periodic_resolution();
    if resolver.is_none() {
        info!("periodic consensus disabled");
    }

    run_api_server(node.clone(), addr).await?;

    if let Some(task) = resolver {
        task.abort();
    }
    node.cancel_mining();
    info!("node stopped");
    Ok(())
}
