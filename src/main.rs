use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vlive_keeper::{LogNotifier, NoopPurger, Settings, VliveKeeper};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let settings = Settings::load().context("loading settings")?;

  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.logging.filter)),
    )
    .init();

  let keeper = VliveKeeper::start(&settings, Arc::new(LogNotifier), Arc::new(NoopPurger))
    .await
    .context("starting vlive-keeper")?;

  tokio::signal::ctrl_c()
    .await
    .context("waiting for ctrl-c")?;
  info!("Received ctrl-c, shutting down.");

  keeper
    .shutdown(Some(SHUTDOWN_TIMEOUT))
    .await
    .context("shutting down")?;
  Ok(())
}
