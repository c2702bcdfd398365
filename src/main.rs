//! proofstream - HTTP Server Entry Point
//!
//! Starts the verification server and its background loops.

use proofstream::{api, config::Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "proofstream=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        monitor = %config.monitor.base_url,
        store = ?config.store.store_type,
        max_concurrent_jobs = config.jobs.max_concurrent_jobs,
        "Loaded configuration"
    );

    api::serve(config).await?;

    Ok(())
}
