use anyhow::Result;
use clap::Parser;
use log::info;

use concept_tuner::trainers::{load_config, train_from_config, TrainConfig};

fn main() -> Result<()> {
    // Initialize logging
    concept_tuner::logging::init_logger();

    let args = TrainConfig::parse();
    let config = match &args.config {
        Some(path) => {
            if !path.exists() {
                eprintln!("Error: Config file not found: {}", path.display());
                std::process::exit(1);
            }
            info!("Starting trainer with config: {}", path.display());
            load_config(path)?
        }
        None => args,
    };

    let summary = train_from_config(config)?;

    info!(
        "Training completed successfully: {} steps, {} checkpoint(s), {} sample(s)",
        summary.steps,
        summary.checkpoints.len(),
        summary.samples.len()
    );
    if let Some(last) = summary.checkpoints.last() {
        info!("Final weights: {}", last.display());
    }
    Ok(())
}
