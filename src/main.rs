use std::path::PathBuf;
use std::sync::Arc;

use tidepool::bridge::handler::LoggingHandler;
use tidepool::bridge::Bridge;
use tidepool::config::BridgeConfig;
use tidepool::irc::transport::TcpConnector;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("tidepool v{}", env!("CARGO_PKG_VERSION"));

    let config = BridgeConfig::from_env()?;
    if config.networks.is_empty() {
        warn!("no networks configured; set TIDEPOOL_CONFIG or TIDEPOOL_NETWORKS");
        return Ok(());
    }

    let ca_files: Vec<PathBuf> = config
        .networks
        .iter()
        .filter_map(|n| n.ca_file.clone())
        .collect();
    let connector = Arc::new(TcpConnector::new(&ca_files)?);
    let bridge = Arc::new(Bridge::new(config, Arc::new(LoggingHandler), connector));

    for network in &bridge.config().networks {
        if !network.bot.enabled {
            info!(domain = %network.domain, "bot disabled, clients will claim events");
            continue;
        }
        let bridge = bridge.clone();
        let domain = network.domain.clone();
        tokio::spawn(async move {
            match bridge.connect_bot(&domain).await {
                Ok(bot) => info!(%domain, nick = %bot.nick(), "bot connected"),
                Err(e) => error!(%domain, "bot failed to connect: {e}"),
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("interrupt received");
    bridge.shutdown();
    // Give QUITs a moment to flush.
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    Ok(())
}
