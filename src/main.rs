use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use marvin::config::BotConfig;
use marvin::runtime::BotRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,marvin=debug")),
        )
        .init();

    let config = BotConfig::load();
    let runtime = BotRuntime::bootstrap(config).context("failed to bootstrap bot runtime")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = runtime.spawn_poll_scheduler(shutdown_rx.clone());

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
        }
        tracing::info!("Shutdown requested...");
        let _ = shutdown_tx.send(true);
    });

    // Both loops observe the shutdown flag between work items, so the
    // envelope or poll batch in flight finishes before the process ends.
    runtime.run_subscription_loop(shutdown_rx).await;
    if let Some(handle) = scheduler {
        if let Err(e) = handle.await {
            tracing::warn!("Poll scheduler task failed: {}", e);
        }
    }
    Ok(())
}
