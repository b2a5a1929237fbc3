use canbridge_backend::{Backend, BackendConfig, config};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path = config::config_path()?;
    let cfg = BackendConfig::load(&path)?;
    info!(path = %path.display(), listen = %cfg.listen_addr, groups = cfg.groups.len(), "configuration loaded");

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

    Backend::new(&cfg).run(cancel).await
}
