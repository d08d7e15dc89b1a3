mod commands;
mod config;
mod logging;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;

use sensordash::api::Dashboard;
use sensordash::transport::{CredentialStore, HttpExecutor, SqliteCredentials, Transport};
use sensordash::QueryClient;

#[derive(Parser, Debug)]
#[command(name = "sensordash")]
#[command(about = "Command-line client for the sensor dashboard and its incident desk")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/sensordash/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(args.verbose)?;

  let credentials: Arc<dyn CredentialStore> = Arc::new(match &config.credentials.path {
    Some(path) => SqliteCredentials::open(path)?,
    None => SqliteCredentials::open_default()?,
  });

  let base_url = config.backend_url()?;
  let transport: Arc<dyn Transport> = Arc::new(
    HttpExecutor::new(base_url.clone(), config.timeout(), credentials.clone())
      .map_err(|e| eyre!("Failed to set up connection to {}: {}", base_url, e))?,
  );

  // One client per process; every query and mutation shares its cache.
  let client = QueryClient::new();
  let dashboard = Dashboard::new(&client, transport, credentials, config.dashboard_settings());

  tracing::debug!(backend = %base_url, "dashboard ready");
  commands::run(args.command, &dashboard).await
}
