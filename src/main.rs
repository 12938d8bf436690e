use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use terrapin::{Config, Server};

#[derive(Parser, Debug)]
#[command(name = "terrapin")]
#[command(about = "Multi-tenant HTTP/HTTPS server and reverse proxy")]
#[command(version)]
struct Args {
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    #[arg(short, long)]
    validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config).await?;

    // Initialize tracing; logs.level seeds the default filter.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logs.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if args.validate_config {
        info!("Configuration is valid");
        return Ok(());
    }

    let server = Server::new(config)?;

    let runner = {
        let server = server.clone();
        tokio::spawn(async move { server.start().await })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            server.stop();
        }
        outcome = runner => {
            outcome??;
        }
    }

    info!("Shutdown complete");
    Ok(())
}
