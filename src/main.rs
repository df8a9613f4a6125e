use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use geo_radio_proxy::config::{ServerConfig, StorageConfig};
use geo_radio_proxy::ingest;
use geo_radio_proxy::logging::init_tracing;
use geo_radio_proxy::server::handler::{AppState, ProxyServer};
use geo_radio_proxy::store::StationStore;

#[derive(Debug, Parser)]
#[command(name = "geo-radio-proxy", version, about = "Geo radio station directory and audio stream proxy")]
struct Cli {
    /// YAML configuration file.
    #[arg(short, long, env = "GEO_RADIO_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, e.g. 0.0.0.0:8000.
    #[arg(short, long)]
    bind: Option<String>,

    /// Directory of built front-end assets.
    #[arg(long)]
    static_dir: Option<PathBuf>,

    /// Skip the startup ingestion run.
    #[arg(long)]
    no_ingest: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = ServerConfig::load(cli.config.as_deref())?;
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if cli.static_dir.is_some() {
        config.static_dir = cli.static_dir;
    }
    if cli.no_ingest {
        config.ingest_on_start = false;
    }

    let storage = StorageConfig::resolve(
        &config.database_path,
        config.fallback_database_path.as_deref(),
    );
    let store = Arc::new(StationStore::open(&storage)?);

    if config.ingest_on_start {
        let sources = ingest::registry(&config);
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            ingest::run_ingestion(&sources, store).await;
        });
    }

    let bind = config.bind.clone();
    let server = ProxyServer::start(AppState::new(config, Some(store)), &bind).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.shutdown().await;
    Ok(())
}
