//! Scanforge service entry point.

use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use scanforge::App;
use scanforge_core::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    info!(
        image = %config.runner.image,
        kv = %config.kv.url,
        "Starting scanforge"
    );

    let shutdown = CancellationToken::new();
    let app = App::connect(config, shutdown.clone()).await?;
    app.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, draining");
    shutdown.cancel();

    // Give workers and the container reaper a moment to wind down
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    info!("Scanforge stopped");
    Ok(())
}
