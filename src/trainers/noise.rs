//! Seeded randomness for noise, timesteps, shuffling and augmentation.
//!
//! Drawn on the host so a seed reproduces the same run on every device.

use anyhow::Result;
use candle_core::{Device, Shape, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

pub struct NoiseSource {
    rng: StdRng,
}

impl NoiseSource {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    /// Standard-normal F32 tensor.
    pub fn randn<S: Into<Shape>>(&mut self, shape: S, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        let data: Vec<f32> = (0..shape.elem_count())
            .map(|_| self.rng.sample::<f32, _>(StandardNormal))
            .collect();
        Ok(Tensor::from_vec(data, shape, device)?)
    }

    /// `n` timesteps drawn uniformly from `[0, num_train_timesteps)`, as U32.
    pub fn timesteps(&mut self, n: usize, num_train_timesteps: usize, device: &Device) -> Result<Tensor> {
        let data: Vec<u32> = (0..n)
            .map(|_| self.rng.gen_range(0..num_train_timesteps) as u32)
            .collect();
        Ok(Tensor::from_vec(data, n, device)?)
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}
