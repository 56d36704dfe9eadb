use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use edge_gateway::{observability, Config, Gateway};

#[derive(Parser, Debug)]
#[command(name = "edge-gateway")]
#[command(about = "Policy-driven edge API gateway with resilience pipelines")]
struct Args {
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    #[arg(short, long)]
    validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting edge gateway");

    let config = Config::load(&args.config).await?;

    if args.validate_config {
        info!("Configuration is valid");
        return Ok(());
    }

    observability::register_metrics();

    let gateway = Gateway::from_config(&config)?;

    let server_task = tokio::spawn(async move {
        if let Err(e) = gateway.serve().await {
            error!("Server error: {}", e);
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = server_task => {
            error!("Server task exited unexpectedly");
        }
    }

    info!("Edge gateway shutdown complete");
    Ok(())
}
