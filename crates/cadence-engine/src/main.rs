use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cadence_core::{Config, FileStore};
use cadence_engine::{Driver, ReleaseScheduler, Runtime};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence_engine=info,cadence_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("cadence-scheduler starting...");

    let config = Config::from_env()?;
    tracing::info!(
        conf_paths = ?config.conf_paths,
        timezone = %config.timezone,
        "configuration loaded"
    );

    let store = Arc::new(FileStore::from_config(&config));
    let runtime = Runtime::with_defaults(config, store);
    let scheduler = ReleaseScheduler::new(Driver::new(runtime));

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    scheduler.run(token).await?;
    tracing::info!("cadence-scheduler stopped");
    Ok(())
}
