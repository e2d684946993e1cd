//! Model components the trainer drives, described by their call contracts.
//!
//! Every component owns a role-tagged [`ParamStore`]. The trainer mutates the
//! store (vocabulary growth, resume, freeze/precision plan) and then calls
//! [`Component::refresh`] so the component can rebuild anything it derived
//! from it.

pub mod clip;
pub mod layers;
pub mod params;
pub mod stable_diffusion;
pub mod tiny;
pub mod tokenizer;
pub mod unet;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

use crate::trainers::ddpm_scheduler::SchedulerConfig;

pub use params::{Param, ParamRole, ParamStore};
pub use tokenizer::{ClipTokenizer, Vocabulary};

/// Shared surface of every trainable or frozen module.
pub trait Component {
    fn params(&self) -> &ParamStore;
    fn params_mut(&mut self) -> &mut ParamStore;

    /// Rebuild derived forward state after the store changed shape, dtype or
    /// trainability. Called once after setup, before the first forward pass.
    fn refresh(&mut self) -> Result<()> {
        Ok(())
    }

    /// Request activation recomputation to save memory. Returns whether the
    /// component honours it.
    fn set_gradient_checkpointing(&mut self, _enabled: bool) -> bool {
        false
    }
}

/// Maps token ids `[B, L]` to conditioning states `[B, L, D]`.
pub trait TextEncoder: Component {
    fn forward(&self, input_ids: &Tensor) -> Result<Tensor>;
}

/// Image encoder/decoder between pixel space `[B, 3, H, W]` in [-1, 1] and
/// unscaled latents.
pub trait ImageCodec: Component {
    fn encode(&self, images: &Tensor) -> Result<Tensor>;
    fn decode(&self, latents: &Tensor) -> Result<Tensor>;
    /// Multiplier applied to encoded latents before diffusion.
    fn scaling_factor(&self) -> f64;
    /// Pixel size of one latent cell.
    fn downscale_factor(&self) -> usize;
}

/// Predicts the training target from noisy latents.
pub trait DenoisingBackbone: Component {
    /// `noisy_latents` `[B, C, h, w]`, `timesteps` `[B]` (u32), `text_cond`
    /// `[B, L, D]`. Output has the latents' shape.
    fn forward(&self, noisy_latents: &Tensor, timesteps: &Tensor, text_cond: &Tensor)
        -> Result<Tensor>;
    fn in_channels(&self) -> usize;
    /// Latent side length the backbone was trained at.
    fn sample_size(&self) -> usize;
}

/// Everything the trainer needs from a pretrained model.
pub struct ModelBundle {
    pub tokenizer: Box<dyn Vocabulary>,
    pub text_encoder: Box<dyn TextEncoder>,
    pub image_codec: Box<dyn ImageCodec>,
    pub backbone: Box<dyn DenoisingBackbone>,
    pub device: Device,
}

/// Something that can produce pretrained components, possibly more than once.
pub trait ModelSource {
    fn load(&self) -> Result<ModelBundle>;

    /// A fresh, untouched copy of the backbone's parameters stored as `dtype`.
    /// Used as the reference for delta checkpoints.
    fn load_backbone_params(&self, dtype: DType) -> Result<ParamStore>;

    /// Noise schedule the backbone was trained with.
    fn scheduler_config(&self) -> Result<SchedulerConfig> {
        Ok(SchedulerConfig::default())
    }
}
