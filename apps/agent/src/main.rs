//! CanBridge field agent.
//!
//! Discovers CAN dongles on the LAN, keeps control and data channels open to
//! the backend, and executes the backend's requests against the dongles.

mod app;
mod bridge;
mod client;
mod config;
mod dongles;
mod handler;
mod runner;

use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::AgentConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path = config::config_path()?;
    let cfg = AgentConfig::load(&path)?;
    info!(path = %path.display(), "configuration loaded");

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("interrupt received");
                    cancel.cancel();
                }
                Err(e) => tracing::warn!("cannot listen for Ctrl-C: {e}"),
            }
        });
    }

    app::run(cfg, cancel).await
}
