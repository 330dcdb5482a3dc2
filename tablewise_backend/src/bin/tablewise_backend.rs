use anyhow::{Context, Result};
use flume::unbounded;
use tablewise_backend::config::BackendConfig;
use tablewise_backend::runtime::BackendRuntime;
use tablewise_backend::server::serve_backend;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tablewise_backend=debug")),
        )
        .init();

    let config = BackendConfig::load();
    tracing::debug!("Effective config: {:?}", config.redacted());
    let (event_tx, event_rx) = unbounded();
    let runtime = BackendRuntime::bootstrap(config, event_tx)
        .context("failed to bootstrap backend runtime")?;

    tracing::info!(
        "Starting Tablewise backend (set TABLEWISE_BACKEND_TOKEN + optional TABLEWISE_BACKEND_BIND; auth mode via TABLEWISE_BACKEND_AUTH_MODE)"
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(serve_backend(runtime, event_rx))
}
