use crate::cli::args::Args;
use dotenvy::dotenv;
use room_relay::config::RelayConfig;
use tracing::{error, warn};
use tracing_subscriber::filter::EnvFilter;

mod cli;

/// Entry point of the application.
///
/// Loads the environment and the configuration file, initializes logging,
/// parses the command line arguments, and runs the application.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Load environment variables from the `.env` file.
    dotenv().ok();

    let loaded = RelayConfig::load();
    let cfg = loaded.as_ref().cloned().unwrap_or_default().with_env_overrides();

    // `RUST_LOG` wins over the level from the configuration file.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.rust_log));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = &loaded {
        warn!("could not load config file, using defaults: {e}");
    }

    let args = Args::new();

    if let Err(e) = args.run(cfg).await {
        error!("{e:#}");
    }

    Ok(())
}
