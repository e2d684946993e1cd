//! Training loop driver for textual inversion and custom diffusion.
//!
//! Setup order matters: vocabulary extension, then resume, then the
//! training plan, so a resumed checkpoint lands in pretrained-precision
//! weights before they are split into trainable and frozen sets.

use anyhow::{Context, Result};
use candle_core::DType;
use log::{info, warn};
use std::path::PathBuf;

use crate::models::{Component, ModelBundle, ModelSource, ParamStore, Vocabulary};
use crate::trainers::checkpoint::{checkpoint_path, delta_reference, Checkpoint};
use crate::trainers::config::{ConceptBinding, TrainConfig};
use crate::trainers::data_loader::{num_epochs, DataLoader, ExampleSource};
use crate::trainers::ddpm_scheduler::DDPMScheduler;
use crate::trainers::grad_mask::GradientMask;
use crate::trainers::loss::forward_loss;
use crate::trainers::noise::NoiseSource;
use crate::trainers::optimizer::{scaled_lr, GroupedAdamW};
use crate::trainers::plan::{FinetuneMode, TrainableSet, TrainingPlan};
use crate::trainers::progress::TrainingProgress;
use crate::trainers::sampling::{sample_path, save_sample, SampleSettings};
use crate::trainers::vocab::extend_vocabulary;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    Idle,
    Running,
    Saving,
    Completed,
}

#[derive(Debug, Clone, Default)]
pub struct TrainingSummary {
    pub steps: usize,
    pub epochs: usize,
    pub last_loss: Option<f32>,
    pub skipped_steps: usize,
    pub checkpoints: Vec<PathBuf>,
    pub samples: Vec<PathBuf>,
}

pub struct ConceptTrainer {
    config: TrainConfig,
    bindings: Vec<ConceptBinding>,
    models: ModelBundle,
    plan: TrainingPlan,
    trainables: TrainableSet,
    mask: GradientMask,
    /// Modifier token and its id, in binding order
    tokens: Vec<(String, u32)>,
    scheduler: DDPMScheduler,
    reference: Option<ParamStore>,
    noise: NoiseSource,
    state: TrainerState,
}

impl ConceptTrainer {
    /// Load the model, add the concept tokens, resume if asked and split
    /// parameters into trainable and frozen sets.
    pub fn setup(config: TrainConfig, bindings: Vec<ConceptBinding>, source: &dyn ModelSource) -> Result<Self> {
        config.validate()?;
        let mode = FinetuneMode::from_config(config.finetune_type, config.freeze_model);
        info!("=== Setting up {} fine-tuning for {} concept(s) ===", mode, bindings.len());

        let mut models = source.load().context("Failed to load pretrained model")?;
        let pairs = extend_vocabulary(models.tokenizer.as_mut(), models.text_encoder.params_mut(), &bindings)?;

        if let Some(path) = &config.delta_ckpt {
            if path.exists() {
                info!("Resuming from {}", path.display());
                let ckpt = Checkpoint::load(path, &models.device)?;
                ckpt.apply(
                    models.tokenizer.as_mut(),
                    models.text_encoder.params_mut(),
                    models.backbone.params_mut(),
                )?;
            } else {
                warn!("Delta checkpoint {} not found, starting from pretrained weights", path.display());
            }
        }

        let plan = TrainingPlan::resolve(mode, models.text_encoder.params(), models.backbone.params())?;
        let reference = delta_reference(source, &plan)?;
        let trainables = plan.apply(&mut models)?;

        if config.low_mem {
            let text = models.text_encoder.set_gradient_checkpointing(true);
            let backbone = models.backbone.set_gradient_checkpointing(true);
            info!("Gradient checkpointing: text encoder {}, backbone {}", text, backbone);
        }

        let scheduler = DDPMScheduler::new(source.scheduler_config()?, &models.device)?;
        info!(
            "Scheduler: {} train timesteps, {:?} prediction",
            scheduler.num_train_timesteps(),
            scheduler.prediction_type()
        );

        let mask = GradientMask::new(pairs.iter().map(|p| p.new_id).collect());
        let tokens = bindings
            .iter()
            .zip(&pairs)
            .map(|(b, p)| (b.modifier_token.clone(), p.new_id))
            .collect();
        let noise = NoiseSource::new(config.seed);

        Ok(Self {
            config,
            bindings,
            models,
            plan,
            trainables,
            mask,
            tokens,
            scheduler,
            reference,
            noise,
            state: TrainerState::Idle,
        })
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn models(&self) -> &ModelBundle {
        &self.models
    }

    pub fn tokenizer(&self) -> &dyn Vocabulary {
        self.models.tokenizer.as_ref()
    }

    pub fn plan(&self) -> &TrainingPlan {
        &self.plan
    }

    pub fn tokens(&self) -> &[(String, u32)] {
        &self.tokens
    }

    pub fn trainables(&self) -> &TrainableSet {
        &self.trainables
    }

    /// Training image side: latent sample size times the codec downscale.
    pub fn resolution(&self) -> usize {
        self.models.backbone.sample_size() * self.models.image_codec.downscale_factor()
    }

    /// Prior preservation is on when every concept has class images.
    pub fn with_prior(&self) -> bool {
        !self.bindings.is_empty() && self.bindings.iter().all(|b| b.prior_dir.is_some())
    }

    fn transition(&mut self, next: TrainerState) {
        info!("Trainer state: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn sample_settings(&self) -> SampleSettings {
        SampleSettings {
            steps: self.config.sample_steps,
            guidance_scale: self.config.guidance_scale,
            seed: self.config.seed,
        }
    }

    fn save(&mut self, step: Option<usize>, global_step: usize, summary: &mut TrainingSummary) -> Result<()> {
        self.transition(TrainerState::Saving);

        let ckpt = Checkpoint::capture(
            &self.plan,
            &self.tokens,
            self.models.text_encoder.params(),
            self.models.backbone.params(),
            self.reference.as_ref(),
            global_step,
        )?;
        let path = checkpoint_path(&self.config.out_dir, &self.config.token_label(), step);
        ckpt.save(&path)?;
        summary.checkpoints.push(path);

        if let Some(step) = step {
            if self.config.sample_steps > 0 {
                let settings = self.sample_settings();
                for binding in &self.bindings {
                    let path = sample_path(&self.config.out_dir, &binding.name, step);
                    if let Some(path) = save_sample(
                        &self.models,
                        &self.scheduler,
                        &binding.sample_prompt(),
                        &settings,
                        self.plan.precision.backbone,
                        &path,
                    ) {
                        summary.samples.push(path);
                    }
                }
            }
        }
        Ok(())
    }

    /// Run until `train_steps` optimizer steps, then write the final checkpoint.
    pub fn train(&mut self, source: Box<dyn ExampleSource>) -> Result<TrainingSummary> {
        let with_prior = self.with_prior();
        let loader = DataLoader::new(
            source,
            self.config.batch_size,
            with_prior,
            self.models.tokenizer.pad_id(),
            self.models.device.clone(),
        )?;
        let train_steps = self.config.train_steps;
        let save_step = self.config.save_step;
        let steps_per_epoch = loader.steps_per_epoch();
        let epochs = num_epochs(train_steps, steps_per_epoch);

        let lr = scaled_lr(self.config.lr, self.config.batch_size, with_prior, self.config.scale_lr);
        let mut optimizer = GroupedAdamW::new(&self.trainables, lr, self.config.weight_decay)?;

        info!("=== Starting training ===");
        info!(
            "{} examples, batch {}{}, {} steps/epoch, {} epochs, {} steps, lr {:.2e}",
            loader.len(),
            loader.batch_size(),
            if with_prior { " (+ priors)" } else { "" },
            steps_per_epoch,
            epochs,
            train_steps,
            lr
        );

        self.transition(TrainerState::Running);
        let progress = TrainingProgress::new(train_steps);
        let mut summary = TrainingSummary::default();
        let mut global_step = 0;

        'epochs: for epoch in 0..epochs {
            summary.epochs = epoch + 1;
            for indices in loader.epoch_indices(self.noise.rng()) {
                let batch = loader.batch(&indices, self.noise.rng())?;
                let out = forward_loss(&self.models, &batch, &self.scheduler, &self.plan, &mut self.noise)?;
                let loss: f32 = out.loss.to_dtype(DType::F32)?.to_scalar()?;
                global_step += 1;

                if !loss.is_finite() && self.config.skip_nonfinite {
                    warn!("Step {}: non-finite loss {}, skipping update", global_step, loss);
                    summary.skipped_steps += 1;
                    progress.step(global_step, None);
                } else {
                    let mut grads = out.loss.backward()?;
                    self.mask.apply(&mut grads, &self.trainables.embedding)?;
                    optimizer.step(&grads)?;
                    summary.last_loss = Some(loss);
                    progress.step(global_step, Some(loss));
                }

                if global_step % save_step == 0 {
                    progress.println(&format!("Saving checkpoint at step {}", global_step));
                    self.save(Some(global_step), global_step, &mut summary)?;
                    self.transition(TrainerState::Running);
                }
                if global_step >= train_steps {
                    break 'epochs;
                }
            }
        }
        progress.finish();
        summary.steps = global_step;

        self.save(None, global_step, &mut summary)?;
        self.transition(TrainerState::Completed);
        info!(
            "Training complete: {} steps in {} epochs, {} skipped, final loss {}",
            summary.steps,
            summary.epochs,
            summary.skipped_steps,
            summary.last_loss.map(|l| format!("{:.4}", l)).unwrap_or_else(|| "n/a".into())
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tiny::{TinyConfig, TinySource};
    use crate::trainers::config::FinetuneType;

    fn config(out: &std::path::Path) -> TrainConfig {
        TrainConfig {
            token: Some("cat".into()),
            term: Some("cat".into()),
            data: Some("unused".into()),
            out_dir: out.to_path_buf(),
            seed: Some(1),
            ..Default::default()
        }
    }

    #[test]
    fn test_setup_extends_vocab_and_plans() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = config(dir.path());
        c.finetune_type = FinetuneType::Text;
        let bindings = c.concept_bindings().unwrap();
        let source = TinySource::new(TinyConfig::default());
        let trainer = ConceptTrainer::setup(c, bindings, &source).unwrap();

        assert_eq!(trainer.state(), TrainerState::Idle);
        assert_eq!(trainer.plan().mode, FinetuneMode::EmbeddingOnly);
        assert_eq!(trainer.tokens()[0].0, "<cat>");
        assert_eq!(trainer.tokenizer().token_to_id("<cat>"), Some(trainer.tokens()[0].1));
        assert_eq!(trainer.resolution(), 8);
        assert!(!trainer.with_prior());
        assert!(trainer.reference.is_none());
    }

    #[test]
    fn test_missing_resume_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = config(dir.path());
        c.delta_ckpt = Some(dir.path().join("missing.safetensors"));
        let bindings = c.concept_bindings().unwrap();
        let source = TinySource::new(TinyConfig::default());
        let trainer = ConceptTrainer::setup(c, bindings, &source).unwrap();
        assert!(trainer.reference.is_some());
    }
}
