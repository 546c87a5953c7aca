//! whalewire entrypoint: build the Core from the environment, run until
//! interrupted, tear down in order.

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use whalewire_backend::{Core, CoreConfig};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Seed roster from the environment; the leaderboard collaborator grows it
/// at runtime through `Core::publish_scored_traders`.
fn initial_traders() -> Vec<String> {
    std::env::var("WW_TRADERS")
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    info!("🐋 whalewire core starting");

    let config = CoreConfig::from_env();
    let core = Core::new(config).context("failed to construct core")?;

    let traders = initial_traders();
    if traders.is_empty() {
        warn!("no initial traders configured (WW_TRADERS); waiting for scored batches");
    }
    core.start(traders).await.context("core startup failed")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    core.stop().await;
    Ok(())
}
