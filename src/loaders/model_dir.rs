//! Stable Diffusion 1.x / 2.x loader for the diffusers directory layout:
//!
//! ```text
//! <maindir>/<v1|v2|v2v>/
//!     text/model.safetensors, text/tokenizer.json
//!     vae/diffusion_pytorch_model.safetensors, vae/config.json
//!     unet<model>/diffusion_pytorch_model.safetensors, unet<model>/config.json
//!     scheduler_config.json
//! ```

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_transformers::models::stable_diffusion::vae::AutoEncoderKLConfig;
use log::{info, warn};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::models::clip::ClipTextConfig;
use crate::models::stable_diffusion::{
    classify_text_key, classify_unet_key, SdBackbone, SdImageCodec, SdTextEncoder,
};
use crate::models::unet::{BlockConfig, UNetConfig};
use crate::models::{ClipTokenizer, Component, ModelBundle, ModelSource, ParamRole, ParamStore};
use crate::trainers::config::ModelVariant;
use crate::trainers::ddpm_scheduler::{PredictionType, SchedulerConfig};

const WEIGHTS: &str = "diffusion_pytorch_model.safetensors";
const CLIP_MAX_LENGTH: usize = 77;

#[derive(Deserialize, Default)]
struct VaeConfigJson {
    #[serde(default)]
    block_out_channels: Option<Vec<usize>>,
    #[serde(default)]
    layers_per_block: Option<usize>,
    #[serde(default)]
    latent_channels: Option<usize>,
    #[serde(default)]
    norm_num_groups: Option<usize>,
}

/// `attention_head_dim` is a scalar in 1.x configs and a per-block list in 2.x.
#[derive(Deserialize)]
#[serde(untagged)]
enum HeadDim {
    Single(usize),
    PerBlock(Vec<usize>),
}

#[derive(Deserialize, Default)]
struct UNetConfigJson {
    #[serde(default)]
    block_out_channels: Option<Vec<usize>>,
    #[serde(default)]
    cross_attention_dim: Option<usize>,
    #[serde(default)]
    attention_head_dim: Option<HeadDim>,
    #[serde(default)]
    layers_per_block: Option<usize>,
    #[serde(default)]
    use_linear_projection: Option<bool>,
    #[serde(default)]
    in_channels: Option<usize>,
    #[serde(default)]
    sample_size: Option<usize>,
    #[serde(default)]
    norm_num_groups: Option<usize>,
}

fn read_json<T: for<'de> Deserialize<'de> + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        warn!("{} not found, using defaults", path.display());
        return Ok(T::default());
    }
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Pretrained SD model on disk.
pub struct SdModelSource {
    pub maindir: PathBuf,
    pub variant: ModelVariant,
    pub device: Device,
}

impl SdModelSource {
    pub fn new(maindir: impl Into<PathBuf>, variant: ModelVariant, device: Device) -> Self {
        Self {
            maindir: maindir.into(),
            variant,
            device,
        }
    }

    fn root(&self) -> PathBuf {
        self.maindir.join(self.variant.family_dir())
    }

    fn unet_dir(&self) -> PathBuf {
        self.root().join(format!("unet{}", self.variant.id()))
    }

    fn clip_config(&self) -> ClipTextConfig {
        if self.variant.is_v2() {
            ClipTextConfig::v2_1()
        } else {
            ClipTextConfig::v1_5()
        }
    }

    fn vae_config(&self) -> Result<AutoEncoderKLConfig> {
        let json: VaeConfigJson = read_json(&self.root().join("vae").join("config.json"))?;
        Ok(AutoEncoderKLConfig {
            block_out_channels: json.block_out_channels.unwrap_or_else(|| vec![128, 256, 512, 512]),
            layers_per_block: json.layers_per_block.unwrap_or(2),
            latent_channels: json.latent_channels.unwrap_or(4),
            norm_num_groups: json.norm_num_groups.unwrap_or(32),
            use_quant_conv: true,
            use_post_quant_conv: true,
        })
    }

    /// UNet architecture plus `(in_channels, sample_size)`.
    fn unet_config(&self) -> Result<(UNetConfig, usize, usize)> {
        let json: UNetConfigJson = read_json(&self.unet_dir().join("config.json"))?;
        let v2 = self.variant.is_v2();

        let blocks = json.block_out_channels.unwrap_or_else(|| vec![320, 640, 1280, 1280]);
        let n_blocks = blocks.len();
        let head_dims = match json.attention_head_dim {
            Some(HeadDim::PerBlock(dims)) if dims.len() == n_blocks => dims,
            Some(HeadDim::Single(d)) => vec![d; n_blocks],
            _ if v2 => vec![5, 10, 20, 20],
            _ => vec![8; n_blocks],
        };

        let config = UNetConfig {
            blocks: blocks
                .into_iter()
                .zip(head_dims)
                .enumerate()
                .map(|(i, (out_channels, attention_head_dim))| BlockConfig {
                    out_channels,
                    // the innermost level has no attention
                    use_cross_attn: if i < n_blocks - 1 { Some(1) } else { None },
                    attention_head_dim,
                })
                .collect(),
            cross_attention_dim: json.cross_attention_dim.unwrap_or(if v2 { 1024 } else { 768 }),
            layers_per_block: json.layers_per_block.unwrap_or(2),
            use_linear_projection: json.use_linear_projection.unwrap_or(v2),
            norm_num_groups: json.norm_num_groups.unwrap_or(32),
            ..Default::default()
        };
        let in_channels = json.in_channels.unwrap_or(4);
        let sample_size = json
            .sample_size
            .unwrap_or(if self.variant == ModelVariant::V21v { 96 } else { 64 });
        Ok((config, in_channels, sample_size))
    }

    pub fn scheduler_config_path(&self) -> PathBuf {
        self.root().join("scheduler_config.json")
    }
}

impl ModelSource for SdModelSource {
    fn load(&self) -> Result<ModelBundle> {
        let root = self.root();
        info!("Loading SD {} from {}", self.variant.id(), root.display());

        let text_dir = root.join("text");
        let mut tokenizer = ClipTokenizer::from_file(&text_dir.join("tokenizer.json"), CLIP_MAX_LENGTH)?;
        if self.variant.is_v2() {
            tokenizer = tokenizer.with_pad_token("!")?;
        }
        let text_params = ParamStore::from_safetensors(
            &text_dir.join("model.safetensors"),
            &self.device,
            classify_text_key,
        )?;
        let text_encoder = SdTextEncoder::new(text_params, self.clip_config(), self.device.clone());

        let vae_config = self.vae_config()?;
        let downscale = 1 << vae_config.block_out_channels.len().saturating_sub(1);
        let vae_params = ParamStore::from_safetensors(
            &root.join("vae").join(WEIGHTS),
            &self.device,
            |_| ParamRole::ImageCodec,
        )?;
        let image_codec = SdImageCodec::new(vae_params, vae_config, downscale, self.device.clone());

        let backbone = self.load_backbone()?;
        info!(
            "Loaded text encoder ({} tensors), VAE ({} tensors), UNet ({} tensors)",
            text_encoder.params().len(),
            image_codec.params().len(),
            backbone.params().len(),
        );

        Ok(ModelBundle {
            tokenizer: Box::new(tokenizer),
            text_encoder: Box::new(text_encoder),
            image_codec: Box::new(image_codec),
            backbone: Box::new(backbone),
            device: self.device.clone(),
        })
    }

    fn load_backbone_params(&self, dtype: DType) -> Result<ParamStore> {
        let mut params = self.backbone_params()?;
        let keys: Vec<String> = params.iter().map(|(k, _)| k.to_string()).collect();
        for key in &keys {
            if params.get(key)?.dtype().is_float() {
                params.freeze(key, dtype)?;
            }
        }
        Ok(params)
    }

    fn scheduler_config(&self) -> Result<SchedulerConfig> {
        let path = self.scheduler_config_path();
        if !path.exists() {
            warn!("{} not found, using the SD noise schedule defaults", path.display());
            let prediction_type = if self.variant == ModelVariant::V21v {
                PredictionType::VPrediction
            } else {
                PredictionType::Epsilon
            };
            return Ok(SchedulerConfig {
                prediction_type,
                ..Default::default()
            });
        }
        SchedulerConfig::from_file(&path)
    }
}

impl SdModelSource {
    fn backbone_params(&self) -> Result<ParamStore> {
        ParamStore::from_safetensors(&self.unet_dir().join(WEIGHTS), &self.device, classify_unet_key)
    }

    fn load_backbone(&self) -> Result<SdBackbone> {
        let (config, in_channels, sample_size) = self.unet_config()?;
        Ok(SdBackbone::new(
            self.backbone_params()?,
            config,
            in_channels,
            sample_size,
            self.device.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(dir: &Path, variant: ModelVariant) -> SdModelSource {
        SdModelSource::new(dir, variant, Device::Cpu)
    }

    #[test]
    fn test_layout_paths() {
        let s = source(Path::new("/models"), ModelVariant::V21v);
        assert_eq!(s.unet_dir(), PathBuf::from("/models/v2v/unet21v"));
        assert_eq!(s.scheduler_config_path(), PathBuf::from("/models/v2v/scheduler_config.json"));
        let s = source(Path::new("/models"), ModelVariant::V14);
        assert_eq!(s.unet_dir(), PathBuf::from("/models/v1/unet14"));
    }

    #[test]
    fn test_unet_config_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let s = source(dir.path(), ModelVariant::V21);
        fs::create_dir_all(s.unet_dir()).unwrap();
        fs::write(
            s.unet_dir().join("config.json"),
            r#"{"attention_head_dim": [5, 10, 20, 20], "block_out_channels": [320, 640, 1280, 1280],
                "cross_attention_dim": 1024, "in_channels": 4, "sample_size": 96,
                "use_linear_projection": true}"#,
        )
        .unwrap();
        let (config, in_channels, sample_size) = s.unet_config().unwrap();
        assert_eq!(config.cross_attention_dim, 1024);
        assert_eq!(config.blocks[2].attention_head_dim, 20);
        assert!(config.blocks[3].use_cross_attn.is_none());
        assert_eq!((in_channels, sample_size), (4, 96));
    }

    #[test]
    fn test_missing_configs_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        let s = source(dir.path(), ModelVariant::V15);
        let (config, _, sample_size) = s.unet_config().unwrap();
        assert_eq!(config.cross_attention_dim, 768);
        assert_eq!(sample_size, 64);
        assert_eq!(s.vae_config().unwrap().block_out_channels.len(), 4);
        assert_eq!(s.scheduler_config().unwrap().prediction_type, PredictionType::Epsilon);
        let v = source(dir.path(), ModelVariant::V21v);
        assert_eq!(v.scheduler_config().unwrap().prediction_type, PredictionType::VPrediction);
    }
}
