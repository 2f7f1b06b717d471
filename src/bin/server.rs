//! HTTP server for the inventory assistant.

use anyhow::Result;
use clap::Parser;
use inventory_assistant::{server, AppContext, AssistantConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "inventory-assistant-server")]
struct Args {
    /// Listen address (default: BIND_ADDR or 0.0.0.0:8080)
    #[arg(short, long)]
    bind: Option<String>,

    /// Seed data file (default: INVENTORY_DATA or data/inventory.json)
    #[arg(short, long)]
    data: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = AssistantConfig::from_env()?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(data) = args.data {
        config.data_path = data;
    }

    match &config.default_pipeline_collection {
        Some(collection) => info!("Bare pipelines default to '{}'", collection),
        None => warn!("No default pipeline collection; bare pipelines will be rejected"),
    }
    if config.environment.exposes_errors() {
        info!("Error details are included in responses (set APP_ENV=production to hide them)");
    }

    let addr = config.bind_addr.clone();
    let ctx = Arc::new(AppContext::from_config(config)?);
    server::serve(ctx, &addr).await?;
    Ok(())
}
