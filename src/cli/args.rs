use clap::{Parser, Subcommand};
use room_relay::config::RelayConfig;
use room_relay::relay::{
    appstate::Registry,
    server::{self, ServerState},
};
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(version = env!("CARGO_PKG_VERSION"), about = "Relay messages between the members of a room")]
#[command(long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Start the relay server
    Serve {
        /// Port to run the relay server on
        #[arg(short, long)]
        port: Option<u16>,
        /// The Listen address to run the relay server on
        #[arg(short, long)]
        listen_address: Option<String>,
        /// Maximum number of members per room
        #[arg(short, long)]
        capacity: Option<usize>,
    },
    /// Inspect the configuration file
    Config {
        /// Show path to config file
        #[arg(short, long)]
        path: bool,

        /// View configured Options
        #[arg(short, long)]
        show: bool,
    },
}

impl Default for Args {
    fn default() -> Self {
        Self::new()
    }
}

impl Args {
    pub fn new() -> Self {
        Self::parse()
    }

    pub async fn run(&self, cfg: RelayConfig) -> anyhow::Result<()> {
        debug!("args: {:#?}", self);
        match &self.command {
            Some(Commands::Serve {
                port,
                listen_address,
                capacity,
            }) => serve(cfg, *port, listen_address.as_deref(), *capacity).await,
            Some(Commands::Config { path, show }) => {
                if *path {
                    println!("{}", RelayConfig::path()?.display());
                }
                if *show {
                    println!("{cfg:#?}");
                }
                Ok(())
            }
            None => serve(cfg, None, None, None).await,
        }
    }
}

/// Applies the `serve` flags on top of the loaded configuration.
fn apply_flags(
    mut cfg: RelayConfig,
    port: Option<u16>,
    listen_address: Option<&str>,
    capacity: Option<usize>,
) -> anyhow::Result<RelayConfig> {
    if let Some(port) = port {
        cfg.app_port = port;
    }
    if let Some(address) = listen_address {
        cfg.app_host = address.to_string();
    }
    if let Some(capacity) = capacity {
        cfg.room_capacity = capacity;
    }

    cfg.validate()?;
    Ok(cfg)
}

async fn serve(
    cfg: RelayConfig,
    port: Option<u16>,
    listen_address: Option<&str>,
    capacity: Option<usize>,
) -> anyhow::Result<()> {
    let cfg = apply_flags(cfg, port, listen_address, capacity)?;

    info!(
        "Serving on {}:{} in {} mode, {} members per room",
        cfg.app_host, cfg.app_port, cfg.app_environment, cfg.room_capacity
    );

    let state = ServerState::new(Registry::new(cfg.room_capacity), cfg.session_settings());
    server::start_ws(cfg.app_port, &cfg.app_host, state).await
}
