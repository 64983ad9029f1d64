use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use polygate::{Config, Supervisor};

#[derive(Parser, Debug)]
#[command(name = "polygate")]
#[command(about = "A multi-protocol reverse proxy with load balancing and WebSocket relaying")]
struct Args {
    /// Directory containing global.toml plus one <name>.toml per server
    #[arg(long, default_value = "./config")]
    configs: String,

    /// Single configuration file (legacy mode)
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // single process-wide TLS crypto provider for rustls, quinn, and reqwest
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let config = match &args.config {
        Some(file) => Config::load(file)?,
        None => Config::load_dir(&args.configs)?,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match &args.config {
        Some(file) => info!(config_mode = "single_file", config_path = %file, "starting polygate"),
        None => info!(config_mode = "multi_file", config_dir = %args.configs, "starting polygate"),
    }

    let supervisor = Supervisor::new(config);
    supervisor.run().await?;

    info!("shutdown complete");
    Ok(())
}
