mod agent;
mod app;
mod cache;
mod config;
mod event;
mod export;
mod net;
mod notify;
mod sync;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = app::Args::parse();

  // The long-running loop logs to daily-rotated files in the data
  // directory; one-shot commands log to stderr.
  let _guard = init_tracing(matches!(args.command, app::Command::Run))?;

  app::run(args).await
}

fn init_tracing(to_file: bool) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  if to_file {
    let dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?
      .join("cachesync")
      .join("logs");
    std::fs::create_dir_all(&dir)
      .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

    let (writer, guard) =
      tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "cachesync.log"));
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(writer)
      .with_ansi(false)
      .init();
    Ok(Some(guard))
  } else {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(std::io::stderr)
      .init();
    Ok(None)
  }
}
