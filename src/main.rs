use anyhow::Result;
use clap::Parser;
use inventory_assistant::{AppContext, AssistantConfig, ChatOutcome, ChatRequestHandler};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "inventory-assistant")]
#[command(about = "Ask a natural-language question about the inventory")]
struct Args {
    /// The question, in any language
    question: String,

    /// Seed data file (default: INVENTORY_DATA or data/inventory.json)
    #[arg(short, long)]
    data: Option<PathBuf>,

    /// API key (or set AI_API_KEY / OPENAI_API_KEY)
    #[arg(long)]
    api_key: Option<String>,

    /// Print the full JSON response instead of the answer text
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = AssistantConfig::from_env()?;
    if let Some(data) = args.data {
        config.data_path = data;
    }
    if let Some(key) = args.api_key {
        config.api_key = Some(key);
    }

    let ctx = Arc::new(AppContext::from_config(config)?);
    info!("Question: {}", args.question);
    let outcome = ChatRequestHandler::new(ctx).handle(&args.question).await;

    if args.json {
        println!("{}", outcome.to_json()?);
    } else {
        println!("{}", outcome.reply());
    }
    if let ChatOutcome::Failed(failure) = &outcome {
        if let Some(detail) = &failure.error {
            eprintln!("error: {}", detail);
        }
        std::process::exit(1);
    }
    Ok(())
}
