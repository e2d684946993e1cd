//! Concept image datasets and the shuffling batch loader.

use anyhow::{bail, Context, Result};
use candle_core::{Device, Tensor};
use image::imageops::FilterType;
use image::DynamicImage;
use log::info;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use std::fs;
use std::path::{Path, PathBuf};

use crate::models::Vocabulary;
use crate::trainers::collate::{Example, TrainingBatch};
use crate::trainers::config::ConceptBinding;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "bmp"];

/// Smallest crop side, relative to the image's short side, for object augmentation.
const MIN_CROP_SCALE: f64 = 0.6;

/// Indexed access to training examples.
pub trait ExampleSource {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Materialise example `index`. Random augmentation draws from `rng`.
    fn example(&self, index: usize, rng: &mut StdRng) -> Result<Example>;
}

/// Examples already held as tensors.
pub struct InMemorySource {
    examples: Vec<Example>,
}

impl InMemorySource {
    pub fn new(examples: Vec<Example>) -> Self {
        Self { examples }
    }
}

impl ExampleSource for InMemorySource {
    fn len(&self) -> usize {
        self.examples.len()
    }

    fn example(&self, index: usize, _rng: &mut StdRng) -> Result<Example> {
        self.examples
            .get(index)
            .cloned()
            .with_context(|| format!("example {} out of range", index))
    }
}

#[derive(Debug, Clone)]
struct ImageItem {
    path: PathBuf,
    input_ids: Vec<u32>,
    class: Option<(PathBuf, Vec<u32>)>,
}

/// Instance images captioned `<modifier> <term>`, optionally paired with a
/// class image captioned `<term>`.
pub struct FinetuneDataset {
    items: Vec<ImageItem>,
    resolution: usize,
    style: bool,
}

pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut images: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read image folder: {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    images.sort();
    Ok(images)
}

impl FinetuneDataset {
    pub fn new(
        bindings: &[ConceptBinding],
        tokenizer: &dyn Vocabulary,
        resolution: usize,
        style: bool,
    ) -> Result<Self> {
        let mut items = Vec::new();
        for binding in bindings {
            let images = list_images(&binding.data_dir)?;
            if images.is_empty() {
                bail!("no images found in {}", binding.data_dir.display());
            }
            let input_ids = tokenizer.encode_padded(&binding.instance_caption())?;

            let class = match &binding.prior_dir {
                Some(dir) => {
                    let class_images = list_images(dir)?;
                    if class_images.is_empty() {
                        bail!("no class images found in {}", dir.display());
                    }
                    let class_ids = tokenizer.encode_padded(&binding.anchor_term)?;
                    Some((class_images, class_ids))
                }
                None => None,
            };

            info!(
                "{}: {} images from {}{}",
                binding.modifier_token,
                images.len(),
                binding.data_dir.display(),
                class
                    .as_ref()
                    .map(|(c, _)| format!(", {} class images", c.len()))
                    .unwrap_or_default()
            );

            for (i, path) in images.into_iter().enumerate() {
                let class = class
                    .as_ref()
                    .map(|(paths, ids)| (paths[i % paths.len()].clone(), ids.clone()));
                items.push(ImageItem {
                    path,
                    input_ids: input_ids.clone(),
                    class,
                });
            }
        }

        Ok(Self {
            items,
            resolution,
            style,
        })
    }

    fn load_image(&self, path: &Path, rng: &mut StdRng) -> Result<Tensor> {
        let img = image::open(path).with_context(|| format!("Failed to open image: {}", path.display()))?;
        let img = if self.style {
            center_crop(&img)
        } else {
            random_crop(&img, rng)
        };
        let img = img.resize_exact(self.resolution as u32, self.resolution as u32, FilterType::Triangle);
        let img = if rng.gen_bool(0.5) { img.fliph() } else { img };
        image_to_tensor(&img)
    }
}

impl ExampleSource for FinetuneDataset {
    fn len(&self) -> usize {
        self.items.len()
    }

    fn example(&self, index: usize, rng: &mut StdRng) -> Result<Example> {
        let item = self
            .items
            .get(index)
            .with_context(|| format!("example {} out of range", index))?;
        let image = self.load_image(&item.path, rng)?;
        let (class_image, class_input_ids) = match &item.class {
            Some((path, ids)) => (Some(self.load_image(path, rng)?), Some(ids.clone())),
            None => (None, None),
        };
        Ok(Example {
            image,
            input_ids: item.input_ids.clone(),
            class_image,
            class_input_ids,
        })
    }
}

fn center_crop(img: &DynamicImage) -> DynamicImage {
    let (w, h) = (img.width(), img.height());
    let side = w.min(h);
    img.crop_imm((w - side) / 2, (h - side) / 2, side, side)
}

fn random_crop(img: &DynamicImage, rng: &mut StdRng) -> DynamicImage {
    let (w, h) = (img.width(), img.height());
    let short = w.min(h);
    let scale = rng.gen_range(MIN_CROP_SCALE..=1.0);
    let side = ((short as f64 * scale).round() as u32).clamp(1, short);
    let x = rng.gen_range(0..=w - side);
    let y = rng.gen_range(0..=h - side);
    img.crop_imm(x, y, side, side)
}

/// `[3, H, W]` F32 in [-1, 1].
pub fn image_to_tensor(img: &DynamicImage) -> Result<Tensor> {
    let rgb = img.to_rgb8();
    let (w, h) = (rgb.width() as usize, rgb.height() as usize);
    let data: Vec<f32> = rgb.into_raw().into_iter().map(|v| v as f32 / 127.5 - 1.0).collect();
    Ok(Tensor::from_vec(data, (h, w, 3), &Device::Cpu)?.permute((2, 0, 1))?.contiguous()?)
}

/// Shuffled fixed-size batches over an [`ExampleSource`].
pub struct DataLoader {
    source: Box<dyn ExampleSource>,
    batch_size: usize,
    with_prior: bool,
    pad_id: u32,
    device: Device,
}

impl DataLoader {
    pub fn new(
        source: Box<dyn ExampleSource>,
        batch_size: usize,
        with_prior: bool,
        pad_id: u32,
        device: Device,
    ) -> Result<Self> {
        if source.is_empty() {
            bail!("training set is empty");
        }
        if batch_size == 0 {
            bail!("batch_size must be greater than zero");
        }
        Ok(Self {
            source,
            batch_size,
            with_prior,
            pad_id,
            device,
        })
    }

    pub fn len(&self) -> usize {
        self.source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn with_prior(&self) -> bool {
        self.with_prior
    }

    /// Batches per epoch; the last batch may be short.
    pub fn steps_per_epoch(&self) -> usize {
        self.source.len().div_ceil(self.batch_size)
    }

    /// Shuffled example indices for one epoch, chunked into batches.
    pub fn epoch_indices(&self, rng: &mut StdRng) -> Vec<Vec<usize>> {
        let mut indices: Vec<usize> = (0..self.source.len()).collect();
        indices.shuffle(rng);
        indices.chunks(self.batch_size).map(|c| c.to_vec()).collect()
    }

    pub fn batch(&self, indices: &[usize], rng: &mut StdRng) -> Result<TrainingBatch> {
        let examples = indices
            .iter()
            .map(|&i| self.source.example(i, rng))
            .collect::<Result<Vec<_>>>()?;
        TrainingBatch::collate(&examples, self.with_prior, self.pad_id, &self.device)
    }
}

/// Epochs needed to reach `train_steps` optimizer steps.
pub fn num_epochs(train_steps: usize, steps_per_epoch: usize) -> usize {
    train_steps.div_ceil(steps_per_epoch.max(1))
}
