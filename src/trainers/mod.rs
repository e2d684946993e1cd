pub mod checkpoint;
pub mod collate;
pub mod config;
pub mod custom_diffusion;
pub mod data_loader;
pub mod ddpm_scheduler;
pub mod grad_mask;
pub mod loss;
pub mod noise;
pub mod optimizer;
pub mod plan;
pub mod progress;
pub mod sampling;
pub mod vocab;

// Re-export key types
pub use config::{load_config, save_config, ConceptBinding, TrainConfig};
pub use custom_diffusion::{ConceptTrainer, TrainerState, TrainingSummary};
pub use plan::{FinetuneMode, TrainingPlan};

use anyhow::Result;
use candle_core::Device;
use log::info;

use crate::loaders::SdModelSource;
use crate::trainers::data_loader::FinetuneDataset;

/// Pick the compute device: CUDA when available unless `cpu` is set.
pub fn select_device(cpu: bool) -> Result<Device> {
    if cpu {
        return Ok(Device::Cpu);
    }
    let device = Device::cuda_if_available(0)?;
    if device.is_cpu() {
        info!("No CUDA device available, training on CPU");
    }
    Ok(device)
}

/// Run a full training job: validate, load the model, build the dataset and train.
pub fn train_from_config(config: TrainConfig) -> Result<TrainingSummary> {
    // invocation mistakes surface before anything is loaded
    config.validate()?;
    let bindings = config.concept_bindings()?;

    let saved = save_config(&config, &config.out_dir)?;
    info!("Run configuration saved to {}", saved.display());

    let device = select_device(config.cpu)?;
    let source = SdModelSource::new(config.maindir.clone(), config.model, device);
    let style = config.style;
    let mut trainer = ConceptTrainer::setup(config, bindings.clone(), &source)?;

    let dataset = FinetuneDataset::new(&bindings, trainer.tokenizer(), trainer.resolution(), style)?;
    trainer.train(Box::new(dataset))
}
