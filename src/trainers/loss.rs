//! Diffusion forward-loss step.

use anyhow::{bail, Result};
use candle_core::{DType, Tensor};
use candle_nn::loss::mse;

use crate::models::ModelBundle;
use crate::trainers::collate::TrainingBatch;
use crate::trainers::ddpm_scheduler::DDPMScheduler;
use crate::trainers::noise::NoiseSource;
use crate::trainers::plan::TrainingPlan;

pub struct LossOutput {
    /// Scalar F32 loss with the graph attached
    pub loss: Tensor,
    /// Examples the loss was computed over
    pub batch_size: usize,
}

/// Encode, noise, denoise and score one batch.
///
/// With prior preservation the loss is the sum of the instance-half and
/// class-half mean squared errors.
pub fn forward_loss(
    models: &ModelBundle,
    batch: &TrainingBatch,
    scheduler: &DDPMScheduler,
    plan: &TrainingPlan,
    noise: &mut NoiseSource,
) -> Result<LossOutput> {
    let device = &models.device;
    let batch_size = batch.len();
    if batch.with_prior && batch_size % 2 != 0 {
        bail!("prior-preservation batch must have an even size, got {}", batch_size);
    }

    let latents = models.image_codec.encode(&batch.images.to_device(device)?)?;
    let latents = (latents.to_dtype(DType::F32)? * models.image_codec.scaling_factor())?.detach();

    let eps = noise.randn(latents.shape(), device)?;
    let timesteps = noise.timesteps(batch_size, scheduler.num_train_timesteps(), device)?;
    let target = scheduler.training_target(&latents, &eps, &timesteps)?;
    let noisy_latents = scheduler.add_noise(&latents, &eps, &timesteps)?;

    let backbone_dtype = plan.precision.backbone;
    let text_cond = models.text_encoder.forward(&batch.input_ids.to_device(device)?)?;
    let pred = models.backbone.forward(
        &noisy_latents.to_dtype(backbone_dtype)?,
        &timesteps,
        &text_cond.to_dtype(backbone_dtype)?,
    )?;

    let pred = pred.to_dtype(DType::F32)?;
    let target = target.to_dtype(DType::F32)?;
    let loss = if batch.with_prior {
        let half = batch_size / 2;
        let instance = mse(&pred.narrow(0, 0, half)?, &target.narrow(0, 0, half)?)?;
        let prior = mse(&pred.narrow(0, half, half)?, &target.narrow(0, half, half)?)?;
        (instance + prior)?
    } else {
        mse(&pred, &target)?
    };

    Ok(LossOutput { loss, batch_size })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tiny::{TinyConfig, TinySource};
    use crate::models::{Component, ModelSource};
    use crate::trainers::collate::Example;
    use crate::trainers::ddpm_scheduler::{PredictionType, SchedulerConfig};
    use crate::trainers::plan::FinetuneMode;
    use candle_core::Device;

    fn batch(n: usize, with_prior: bool) -> TrainingBatch {
        let mut noise = NoiseSource::new(Some(5));
        let examples: Vec<Example> = (0..n)
            .map(|i| Example {
                image: noise.randn((3, 8, 8), &Device::Cpu).unwrap().tanh().unwrap(),
                input_ids: vec![0, 3 + i as u32, 1, 1, 1, 1, 1, 1],
                class_image: Some(noise.randn((3, 8, 8), &Device::Cpu).unwrap().tanh().unwrap()),
                class_input_ids: Some(vec![0, 6, 1, 1, 1, 1, 1, 1]),
            })
            .collect();
        TrainingBatch::collate(&examples, with_prior, 1, &Device::Cpu).unwrap()
    }

    fn run(mode: FinetuneMode, prediction_type: PredictionType, with_prior: bool) -> LossOutput {
        let mut m = TinySource::new(TinyConfig::default()).load().unwrap();
        let plan = TrainingPlan::resolve(mode, m.text_encoder.params(), m.backbone.params()).unwrap();
        plan.apply(&mut m).unwrap();
        let scheduler = DDPMScheduler::new(
            SchedulerConfig {
                prediction_type,
                ..Default::default()
            },
            &Device::Cpu,
        )
        .unwrap();
        let mut noise = NoiseSource::new(Some(11));
        forward_loss(&m, &batch(2, with_prior), &scheduler, &plan, &mut noise).unwrap()
    }

    #[test]
    fn test_loss_is_finite_scalar() {
        for mode in [FinetuneMode::EmbeddingOnly, FinetuneMode::KeyValueCrossAttention] {
            for pt in [PredictionType::Epsilon, PredictionType::VPrediction] {
                let out = run(mode, pt, false);
                assert_eq!(out.loss.dims(), &[] as &[usize]);
                let v: f32 = out.loss.to_scalar().unwrap();
                assert!(v.is_finite() && v >= 0.0, "{mode} {pt:?}: {v}");
            }
        }
    }

    #[test]
    fn test_prior_doubles_batch() {
        assert_eq!(run(FinetuneMode::FullCrossAttention, PredictionType::Epsilon, false).batch_size, 2);
        assert_eq!(run(FinetuneMode::FullCrossAttention, PredictionType::Epsilon, true).batch_size, 4);
    }

    #[test]
    fn test_gradient_reaches_embedding() {
        let mut m = TinySource::new(TinyConfig::default()).load().unwrap();
        let plan =
            TrainingPlan::resolve(FinetuneMode::EmbeddingOnly, m.text_encoder.params(), m.backbone.params()).unwrap();
        let set = plan.apply(&mut m).unwrap();
        let scheduler = DDPMScheduler::new(SchedulerConfig::default(), &Device::Cpu).unwrap();
        let mut noise = NoiseSource::new(Some(3));
        let out = forward_loss(&m, &batch(1, false), &scheduler, &plan, &mut noise).unwrap();
        let grads = out.loss.backward().unwrap();
        assert!(grads.get(set.embedding.as_tensor()).is_some());
    }
}
