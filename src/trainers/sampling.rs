//! Preview images: DDIM sampling with classifier-free guidance.

use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor};
use image::{ImageBuffer, Rgb};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};

use crate::models::ModelBundle;
use crate::trainers::ddpm_scheduler::DDPMScheduler;
use crate::trainers::noise::NoiseSource;

#[derive(Debug, Clone, Copy)]
pub struct SampleSettings {
    pub steps: usize,
    pub guidance_scale: f64,
    pub seed: Option<u64>,
}

impl Default for SampleSettings {
    fn default() -> Self {
        Self {
            steps: 50,
            guidance_scale: 7.5,
            seed: None,
        }
    }
}

/// `<out>/<name>-<step:04>.jpg`
pub fn sample_path(out_dir: &Path, name: &str, step: usize) -> PathBuf {
    out_dir.join(format!("{}-{:04}.jpg", name, step))
}

/// Render one image for `prompt`. Returns `[3, H, W]` F32 in [-1, 1].
///
/// Fails if the decoded image holds NaN or Inf.
pub fn render_sample(
    models: &ModelBundle,
    scheduler: &DDPMScheduler,
    prompt: &str,
    settings: &SampleSettings,
    backbone_dtype: DType,
) -> Result<Tensor> {
    let device = &models.device;
    let tokenizer = models.tokenizer.as_ref();
    let max_length = tokenizer.max_length();

    let mut ids = tokenizer.encode_padded("")?;
    ids.extend(tokenizer.encode_padded(prompt)?);
    let ids = Tensor::from_vec(ids, (2, max_length), device)?;
    let text_cond = models.text_encoder.forward(&ids)?.detach().to_dtype(backbone_dtype)?;

    let mut noise = NoiseSource::new(settings.seed);
    let size = models.backbone.sample_size();
    let mut latents = noise.randn((1, models.backbone.in_channels(), size, size), device)?;

    for &t in &scheduler.inference_timesteps(settings.steps) {
        let input = Tensor::cat(&[&latents, &latents], 0)?.to_dtype(backbone_dtype)?;
        let timesteps = Tensor::from_vec(vec![t as u32; 2], 2, device)?;
        let pred = models
            .backbone
            .forward(&input, &timesteps, &text_cond)?
            .to_dtype(DType::F32)?
            .detach();
        let uncond = pred.narrow(0, 0, 1)?;
        let cond = pred.narrow(0, 1, 1)?;
        let guided = (&uncond + ((cond - &uncond)? * settings.guidance_scale)?)?;
        latents = scheduler.ddim_step(&guided, t, &latents, settings.steps)?.detach();
    }

    let latents = (latents / models.image_codec.scaling_factor())?;
    let image = models.image_codec.decode(&latents)?.to_dtype(DType::F32)?.detach();
    let image = image.get(0)?;

    let values = image.flatten_all()?.to_vec1::<f32>()?;
    if values.iter().any(|v| !v.is_finite()) {
        bail!("decoded sample contains NaN or Inf");
    }
    Ok(image)
}

/// Write a `[3, H, W]` tensor in [-1, 1] as an RGB image.
pub fn save_tensor_as_image(tensor: &Tensor, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let (c, h, w) = tensor.dims3()?;
    if c != 3 {
        bail!("expected 3 channels, got {}", c);
    }
    let pixels = ((tensor.to_device(&Device::Cpu)?.to_dtype(DType::F32)? + 1.0)? * 127.5)?
        .clamp(0.0, 255.0)?
        .permute((1, 2, 0))?
        .flatten_all()?
        .to_vec1::<f32>()?;
    let data: Vec<u8> = pixels.iter().map(|&v| v.round() as u8).collect();
    let img = ImageBuffer::<Rgb<u8>, _>::from_raw(w as u32, h as u32, data)
        .ok_or_else(|| anyhow::anyhow!("Failed to create image buffer"))?;
    img.save(path)?;
    Ok(())
}

/// Render and save one preview. Failures are logged, never returned.
pub fn save_sample(
    models: &ModelBundle,
    scheduler: &DDPMScheduler,
    prompt: &str,
    settings: &SampleSettings,
    backbone_dtype: DType,
    path: &Path,
) -> Option<PathBuf> {
    let result = render_sample(models, scheduler, prompt, settings, backbone_dtype)
        .and_then(|image| save_tensor_as_image(&image, path));
    match result {
        Ok(()) => {
            info!("Saved sample '{}' to {}", prompt, path.display());
            Some(path.to_path_buf())
        }
        Err(e) => {
            warn!("Sample '{}' failed: {:#}", prompt, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tiny::{TinyConfig, TinySource};
    use crate::models::{Component, ModelSource};
    use crate::trainers::ddpm_scheduler::SchedulerConfig;

    #[test]
    fn test_render_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let m = TinySource::new(TinyConfig::default()).load().unwrap();
        let scheduler = DDPMScheduler::new(SchedulerConfig::default(), &Device::Cpu).unwrap();
        let settings = SampleSettings {
            steps: 5,
            guidance_scale: 7.5,
            seed: Some(1),
        };
        let a = render_sample(&m, &scheduler, "photo of cat", &settings, DType::F32).unwrap();
        let b = render_sample(&m, &scheduler, "photo of cat", &settings, DType::F32).unwrap();
        assert_eq!(a.dims(), &[3, 8, 8]);
        let a: Vec<f32> = a.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = b.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);

        let path = sample_path(dir.path(), "cat", 7);
        assert!(path.ends_with("cat-0007.jpg"));
        assert!(save_sample(&m, &scheduler, "photo of cat", &settings, DType::F32, &path).is_some());
        let img = image::open(&path).unwrap();
        assert_eq!((img.width(), img.height()), (8, 8));
    }

    #[test]
    fn test_nan_sample_is_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = TinySource::new(TinyConfig::default()).load().unwrap();
        let key = "decoder.proj.weight";
        let poisoned = (m.image_codec.params().get(key).unwrap() * f64::NAN).unwrap();
        m.image_codec.params_mut().replace(key, poisoned).unwrap();
        let scheduler = DDPMScheduler::new(SchedulerConfig::default(), &Device::Cpu).unwrap();
        let settings = SampleSettings {
            steps: 2,
            ..Default::default()
        };
        let path = dir.path().join("nan.jpg");
        assert!(save_sample(&m, &scheduler, "cat", &settings, DType::F32, &path).is_none());
        assert!(!path.exists());
    }
}
