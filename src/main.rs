use anyhow::{Context, Result};
use clap::Parser;

use compute_orchestrator::compute_api_from_file;
use compute_orchestrator::domain::config::ComputeConfig;
use compute_orchestrator::logger;

#[derive(Parser)]
#[command(name = "compute_orchestrator", about = "Instance lifecycle orchestration for a VM fleet")]
struct Args {
    /// JSON configuration file; built-in defaults are used when omitted
    #[arg(short, long)]
    config: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    logger::init();

    log::info!("Starting compute orchestrator.");

    let config = match &args.config {
        Some(path) => {
            let compute_api = compute_api_from_file(path).with_context(|| format!("failed to load configuration '{}'", path))?;
            compute_api.config().clone()
        }
        None => {
            log::info!("No configuration file given, using defaults.");
            ComputeConfig::default()
        }
    };

    println!("{:#?}", config);
    Ok(())
}
