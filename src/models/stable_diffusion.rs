//! Stable Diffusion 1.x / 2.x components.
//!
//! Modules are built from the component's [`ParamStore`] through a custom
//! VarBuilder backend, so trainable variables stay linked to the live model.
//! The frozen VAE comes from candle-transformers; the text encoder and UNet
//! are the crate's own so gradients reach the trained parameters.

use anyhow::{anyhow, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_transformers::models::stable_diffusion::vae::{AutoEncoderKL, AutoEncoderKLConfig};
use log::warn;

use super::clip::{ClipTextConfig, ClipTextTransformer};
use super::unet::{UNet2DConditionModel, UNetConfig};
use super::{Component, DenoisingBackbone, ImageCodec, ParamRole, ParamStore, TextEncoder};

/// Role of a CLIP text-model weight from its structural position.
pub fn classify_text_key(key: &str) -> ParamRole {
    let parts: Vec<&str> = key.split('.').collect();
    for pair in parts.windows(2) {
        match pair {
            ["embeddings", "token_embedding"] => return ParamRole::TokenEmbedding,
            ["embeddings", "position_embedding"] => return ParamRole::PositionEmbedding,
            _ => {}
        }
    }
    ParamRole::TextEncoderBody
}

/// Role of a UNet weight: projections under a cross-attention (`attn2`)
/// block are tagged, everything else is backbone body.
pub fn classify_unet_key(key: &str) -> ParamRole {
    let parts: Vec<&str> = key.split('.').collect();
    for pair in parts.windows(2) {
        if pair[0] != "attn2" {
            continue;
        }
        return match pair[1] {
            "to_q" => ParamRole::CrossAttnQuery,
            "to_k" => ParamRole::CrossAttnKey,
            "to_v" => ParamRole::CrossAttnValue,
            "to_out" => ParamRole::CrossAttnOut,
            _ => ParamRole::BackboneBody,
        };
    }
    ParamRole::BackboneBody
}

fn module_dtype(params: &ParamStore, role: ParamRole) -> DType {
    params.dtype_of(role).unwrap_or(DType::F32)
}

fn not_built() -> anyhow::Error {
    anyhow!("component used before refresh()")
}

pub struct SdTextEncoder {
    params: ParamStore,
    config: ClipTextConfig,
    device: Device,
    model: Option<ClipTextTransformer>,
}

impl SdTextEncoder {
    pub fn new(params: ParamStore, config: ClipTextConfig, device: Device) -> Self {
        Self {
            params,
            config,
            device,
            model: None,
        }
    }
}

impl Component for SdTextEncoder {
    fn params(&self) -> &ParamStore {
        &self.params
    }

    fn params_mut(&mut self) -> &mut ParamStore {
        &mut self.params
    }

    fn refresh(&mut self) -> Result<()> {
        let dtype = module_dtype(&self.params, ParamRole::TextEncoderBody);
        let vb = self.params.var_builder(dtype, &self.device);
        self.model = Some(ClipTextTransformer::new(vb, &self.config)?);
        Ok(())
    }

    fn set_gradient_checkpointing(&mut self, enabled: bool) -> bool {
        if enabled {
            warn!("CLIP text encoder does not support gradient checkpointing, ignoring low_mem");
        }
        false
    }
}

impl TextEncoder for SdTextEncoder {
    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let model = self.model.as_ref().ok_or_else(not_built)?;
        Ok(model.forward(input_ids)?)
    }
}

pub struct SdImageCodec {
    params: ParamStore,
    config: AutoEncoderKLConfig,
    downscale: usize,
    device: Device,
    model: Option<AutoEncoderKL>,
}

impl SdImageCodec {
    pub fn new(params: ParamStore, config: AutoEncoderKLConfig, downscale: usize, device: Device) -> Self {
        Self {
            params,
            config,
            downscale,
            device,
            model: None,
        }
    }
}

impl Component for SdImageCodec {
    fn params(&self) -> &ParamStore {
        &self.params
    }

    fn params_mut(&mut self) -> &mut ParamStore {
        &mut self.params
    }

    fn refresh(&mut self) -> Result<()> {
        let dtype = module_dtype(&self.params, ParamRole::ImageCodec);
        let vb = self.params.var_builder(dtype, &self.device);
        self.model = Some(AutoEncoderKL::new(vb, 3, 3, self.config.clone())?);
        Ok(())
    }
}

impl ImageCodec for SdImageCodec {
    fn encode(&self, images: &Tensor) -> Result<Tensor> {
        let model = self.model.as_ref().ok_or_else(not_built)?;
        let dtype = module_dtype(&self.params, ParamRole::ImageCodec);
        let dist = model.encode(&images.to_dtype(dtype)?)?;
        Ok(dist.sample()?)
    }

    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let model = self.model.as_ref().ok_or_else(not_built)?;
        let dtype = module_dtype(&self.params, ParamRole::ImageCodec);
        Ok(model.decode(&latents.to_dtype(dtype)?)?)
    }

    fn scaling_factor(&self) -> f64 {
        0.18215
    }

    fn downscale_factor(&self) -> usize {
        self.downscale
    }
}

pub struct SdBackbone {
    params: ParamStore,
    config: UNetConfig,
    in_channels: usize,
    sample_size: usize,
    device: Device,
    model: Option<UNet2DConditionModel>,
}

impl SdBackbone {
    pub fn new(
        params: ParamStore,
        config: UNetConfig,
        in_channels: usize,
        sample_size: usize,
        device: Device,
    ) -> Self {
        Self {
            params,
            config,
            in_channels,
            sample_size,
            device,
            model: None,
        }
    }
}

impl Component for SdBackbone {
    fn params(&self) -> &ParamStore {
        &self.params
    }

    fn params_mut(&mut self) -> &mut ParamStore {
        &mut self.params
    }

    fn refresh(&mut self) -> Result<()> {
        let dtype = module_dtype(&self.params, ParamRole::BackboneBody);
        let vb = self.params.var_builder(dtype, &self.device);
        self.model = Some(UNet2DConditionModel::new(vb, self.in_channels, self.in_channels, &self.config)?);
        Ok(())
    }

    fn set_gradient_checkpointing(&mut self, enabled: bool) -> bool {
        if enabled {
            warn!("UNet does not support gradient checkpointing, ignoring low_mem");
        }
        false
    }
}

impl DenoisingBackbone for SdBackbone {
    fn forward(&self, noisy_latents: &Tensor, timesteps: &Tensor, text_cond: &Tensor) -> Result<Tensor> {
        let model = self.model.as_ref().ok_or_else(not_built)?;
        let dtype = module_dtype(&self.params, ParamRole::BackboneBody);
        let out = model.forward(
            &noisy_latents.to_dtype(dtype)?,
            timesteps,
            &text_cond.to_dtype(dtype)?,
        )?;
        Ok(out.to_dtype(noisy_latents.dtype())?)
    }

    fn in_channels(&self) -> usize {
        self.in_channels
    }

    fn sample_size(&self) -> usize {
        self.sample_size
    }
}
