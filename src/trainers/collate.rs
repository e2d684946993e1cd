//! Batch assembly. With prior preservation the batch holds every instance
//! example first and the matching class examples second.

use anyhow::{bail, Context, Result};
use candle_core::{Device, Tensor};

/// One dataset item: an instance image with its caption ids, and optionally
/// a class image with the bare-term caption ids.
#[derive(Debug, Clone)]
pub struct Example {
    /// `[3, H, W]` F32 in [-1, 1]
    pub image: Tensor,
    pub input_ids: Vec<u32>,
    pub class_image: Option<Tensor>,
    pub class_input_ids: Option<Vec<u32>>,
}

#[derive(Debug, Clone)]
pub struct TrainingBatch {
    /// `[B, 3, H, W]` F32
    pub images: Tensor,
    /// `[B, max_length]` U32
    pub input_ids: Tensor,
    pub with_prior: bool,
}

impl TrainingBatch {
    /// Stack `examples` into one batch. Caption rows shorter than the longest
    /// are right-padded with `pad_id`.
    pub fn collate(examples: &[Example], with_prior: bool, pad_id: u32, device: &Device) -> Result<Self> {
        if examples.is_empty() {
            bail!("cannot collate an empty batch");
        }
        let mut images: Vec<Tensor> = examples.iter().map(|e| e.image.clone()).collect();
        let mut ids: Vec<&[u32]> = examples.iter().map(|e| e.input_ids.as_slice()).collect();

        if with_prior {
            for (i, e) in examples.iter().enumerate() {
                let image = e
                    .class_image
                    .as_ref()
                    .with_context(|| format!("example {} has no class image", i))?;
                let class_ids = e
                    .class_input_ids
                    .as_deref()
                    .with_context(|| format!("example {} has no class caption", i))?;
                images.push(image.clone());
                ids.push(class_ids);
            }
        }

        let max_length = ids.iter().map(|row| row.len()).max().unwrap_or(0);
        let flat: Vec<u32> = ids
            .iter()
            .flat_map(|row| {
                row.iter()
                    .copied()
                    .chain(std::iter::repeat(pad_id).take(max_length - row.len()))
            })
            .collect();

        Ok(Self {
            images: Tensor::stack(&images, 0)?.to_device(device)?,
            input_ids: Tensor::from_vec(flat, (ids.len(), max_length), device)?,
            with_prior,
        })
    }

    /// Examples in the loss batch (doubled with prior preservation).
    pub fn len(&self) -> usize {
        self.images.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
