mod server;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use bakerstreet_core::{config::load_config, logging, Registry};

use server::HudsonServer;

#[derive(Parser, Debug)]
#[command(name = "hudson")]
#[command(about = "Baker Street registry daemon", long_about = None)]
struct Args {
    /// Config file (YAML or TOML)
    #[arg(long, short, env = "BAKERSTREET_CONFIG_PATH")]
    config: Option<String>,

    /// Override server.host
    #[arg(long)]
    host: Option<String>,

    /// Override server.http_port
    #[arg(long)]
    port: Option<u16>,

    /// Override logging.level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration, command-line flags win
    let mut config = load_config(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.http_port = port;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Hudson starting...");
    info!("HTTP address: {}", config.http_address());
    info!(
        sweep_interval_secs = config.registry.sweep_interval_secs,
        default_ttl_secs = config.registry.default_ttl_secs,
        "Registry settings"
    );

    // 3. Build the registry and serve it
    let registry = Arc::new(Registry::new(config.registry.clone())?);
    HudsonServer::new(config, registry).run().await
}
