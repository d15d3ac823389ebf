use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;

use ledgersync::{App, Config};

#[derive(Parser, Debug)]
#[command(name = "ledgersync")]
#[command(about = "Offline-first sync agent for the Ledgerline business apps")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/ledgersync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Run a single drain cycle and exit
  #[arg(long)]
  once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    )
    .with_writer(std::io::stderr)
    .init();

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Initialize and run the engine
  let mut app = App::new(config)?;

  if args.once {
    let outcome = app.sync_now().await?;
    tracing::info!(?outcome, "drain finished");
    return Ok(());
  }

  app.run().await
}
