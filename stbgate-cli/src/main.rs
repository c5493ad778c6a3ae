mod config;
mod error;
mod hls;
mod proxy;

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use stalker_client::PortalSession;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

#[derive(Debug, Parser)]
#[command(
    name = "stbgate",
    version,
    about = "Stalker middleware bridge serving IPTV channels to ordinary media players"
)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "stbgate.yml", env = "STBGATE_CONFIG")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging();

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(args: Args) -> Result<()> {
    let config = config::read_config(&args.config)?;

    let session = Arc::new(PortalSession::new(config.portal_config())?);
    info!(portal = %session.base_url(), "connecting to the middleware portal");
    session.start().await?;

    let shutdown = CancellationToken::new();
    let _watchdog = stalker_client::spawn_watchdog(Arc::clone(&session), shutdown.clone());

    info!("retrieving the channel catalog");
    let channels = Arc::new(stalker_client::retrieve_channels(&session).await?);
    if channels.is_empty() {
        return Err(Error::EmptyCatalog);
    }

    let mut services = Vec::new();
    if config.hls.enabled {
        services.push(tokio::spawn(hls::serve(
            config.hls.bind.clone(),
            Arc::clone(&channels),
            shutdown.clone(),
        )));
    }
    if config.proxy.enabled {
        let rewrite_to = config.proxy.rewrite.then(|| config.hls.bind.clone());
        let state = proxy::ProxyState::new(Arc::clone(&session), &channels, rewrite_to);
        services.push(tokio::spawn(proxy::serve(
            config.proxy.bind.clone(),
            state,
            shutdown.clone(),
        )));
    }

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                shutdown.cancel();
            }
        }
    });

    for service in services {
        service.await??;
    }
    Ok(())
}
