//! DDPM noise schedule for training, plus DDIM steps for sample rendering.
//! Configured from a diffusers `scheduler_config.json`.

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// What the backbone is trained to predict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    Epsilon,
    VPrediction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub num_train_timesteps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: String,
    pub prediction_type: PredictionType,
    pub steps_offset: usize,
    pub set_alpha_to_one: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: "scaled_linear".to_string(),
            prediction_type: PredictionType::Epsilon,
            steps_offset: 1,
            set_alpha_to_one: false,
        }
    }
}

impl SchedulerConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read scheduler config: {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse scheduler config: {}", path.display()))
    }
}

pub struct DDPMScheduler {
    config: SchedulerConfig,
    alphas_cumprod: Vec<f64>,
    sqrt_alphas_cumprod: Tensor,
    sqrt_one_minus_alphas_cumprod: Tensor,
}

impl DDPMScheduler {
    pub fn new(config: SchedulerConfig, device: &Device) -> Result<Self> {
        let n = config.num_train_timesteps;
        if n < 2 {
            bail!("num_train_timesteps must be at least 2, got {}", n);
        }
        let betas: Vec<f64> = match config.beta_schedule.as_str() {
            "linear" => (0..n)
                .map(|i| config.beta_start + (config.beta_end - config.beta_start) * i as f64 / (n - 1) as f64)
                .collect(),
            "scaled_linear" => {
                let start = config.beta_start.sqrt();
                let end = config.beta_end.sqrt();
                (0..n)
                    .map(|i| {
                        let b = start + (end - start) * i as f64 / (n - 1) as f64;
                        b * b
                    })
                    .collect()
            }
            "squaredcos_cap_v2" => Self::cosine_betas(n),
            other => bail!("unsupported beta_schedule '{}'", other),
        };

        let mut alphas_cumprod = Vec::with_capacity(n);
        let mut acc = 1.0;
        for beta in &betas {
            acc *= 1.0 - beta;
            alphas_cumprod.push(acc);
        }

        let sqrt_a: Vec<f32> = alphas_cumprod.iter().map(|a| a.sqrt() as f32).collect();
        let sqrt_1ma: Vec<f32> = alphas_cumprod.iter().map(|a| (1.0 - a).sqrt() as f32).collect();

        Ok(Self {
            sqrt_alphas_cumprod: Tensor::from_vec(sqrt_a, n, device)?,
            sqrt_one_minus_alphas_cumprod: Tensor::from_vec(sqrt_1ma, n, device)?,
            alphas_cumprod,
            config,
        })
    }

    fn cosine_betas(n: usize) -> Vec<f64> {
        let f = |t: f64| ((t + 0.008) / 1.008 * std::f64::consts::PI / 2.0).cos().powi(2);
        (0..n)
            .map(|i| {
                let t1 = i as f64 / n as f64;
                let t2 = (i + 1) as f64 / n as f64;
                (1.0 - f(t2) / f(t1)).min(0.999)
            })
            .collect()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn num_train_timesteps(&self) -> usize {
        self.config.num_train_timesteps
    }

    pub fn prediction_type(&self) -> PredictionType {
        self.config.prediction_type
    }

    /// Per-example coefficients gathered at `timesteps`, shaped `[B, 1, 1, 1]`.
    fn coefficients(&self, timesteps: &Tensor, like: &Tensor) -> Result<(Tensor, Tensor)> {
        let batch_size = timesteps.dims1()?;
        let idx = timesteps.to_dtype(DType::U32)?;
        let sqrt_alpha_prod = self
            .sqrt_alphas_cumprod
            .index_select(&idx, 0)?
            .reshape((batch_size, 1, 1, 1))?
            .to_dtype(like.dtype())?;
        let sqrt_one_minus_alpha_prod = self
            .sqrt_one_minus_alphas_cumprod
            .index_select(&idx, 0)?
            .reshape((batch_size, 1, 1, 1))?
            .to_dtype(like.dtype())?;
        Ok((sqrt_alpha_prod, sqrt_one_minus_alpha_prod))
    }

    /// Forward diffusion: `sqrt(ᾱ_t)·x0 + sqrt(1-ᾱ_t)·noise`.
    pub fn add_noise(&self, original_samples: &Tensor, noise: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        let (a, s) = self.coefficients(timesteps, original_samples)?;
        Ok((a.broadcast_mul(original_samples)? + s.broadcast_mul(noise)?)?)
    }

    /// v-prediction target: `sqrt(ᾱ_t)·noise - sqrt(1-ᾱ_t)·x0`.
    pub fn get_velocity(&self, sample: &Tensor, noise: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        let (a, s) = self.coefficients(timesteps, sample)?;
        Ok((a.broadcast_mul(noise)? - s.broadcast_mul(sample)?)?)
    }

    /// Training target for the configured prediction type.
    pub fn training_target(&self, latents: &Tensor, noise: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        match self.config.prediction_type {
            PredictionType::Epsilon => Ok(noise.clone()),
            PredictionType::VPrediction => self.get_velocity(latents, noise, timesteps),
        }
    }

    /// Descending DDIM timesteps for `num_inference_steps` denoising steps.
    pub fn inference_timesteps(&self, num_inference_steps: usize) -> Vec<usize> {
        let n = self.config.num_train_timesteps;
        let steps = num_inference_steps.clamp(1, n);
        let ratio = n / steps;
        (0..steps)
            .map(|i| (i * ratio + self.config.steps_offset).min(n - 1))
            .rev()
            .collect()
    }

    /// One deterministic DDIM step (eta = 0) from `timestep` to the previous
    /// inference timestep.
    pub fn ddim_step(
        &self,
        model_output: &Tensor,
        timestep: usize,
        sample: &Tensor,
        num_inference_steps: usize,
    ) -> Result<Tensor> {
        let n = self.config.num_train_timesteps;
        let ratio = n / num_inference_steps.clamp(1, n);
        let alpha_t = self.alphas_cumprod[timestep.min(n - 1)];
        let alpha_prev = match timestep.checked_sub(ratio) {
            Some(prev) => self.alphas_cumprod[prev],
            None if self.config.set_alpha_to_one => 1.0,
            None => self.alphas_cumprod[0],
        };
        let (sqrt_a, sqrt_1ma) = (alpha_t.sqrt(), (1.0 - alpha_t).sqrt());

        let (pred_x0, pred_eps) = match self.config.prediction_type {
            PredictionType::Epsilon => {
                let x0 = ((sample - (model_output * sqrt_1ma)?)? / sqrt_a)?;
                (x0, model_output.clone())
            }
            PredictionType::VPrediction => {
                let x0 = ((sample * sqrt_a)? - (model_output * sqrt_1ma)?)?;
                let eps = ((model_output * sqrt_a)? + (sample * sqrt_1ma)?)?;
                (x0, eps)
            }
        };

        Ok(((pred_x0 * alpha_prev.sqrt())? + (pred_eps * (1.0 - alpha_prev).sqrt())?)?)
    }
}
