//! Restrict token-embedding updates to the learned rows.

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};

#[derive(Debug, Clone)]
pub struct GradientMask {
    token_ids: Vec<u32>,
}

impl GradientMask {
    pub fn new(token_ids: Vec<u32>) -> Self {
        Self { token_ids }
    }

    pub fn token_ids(&self) -> &[u32] {
        &self.token_ids
    }

    /// `[rows, 1]` U8 mask, 1 on the learned rows.
    pub fn row_mask(&self, rows: usize, device: &Device) -> Result<Tensor> {
        let mut mask = vec![0u8; rows];
        for &id in &self.token_ids {
            if let Some(m) = mask.get_mut(id as usize) {
                *m = 1;
            }
        }
        Ok(Tensor::from_vec(mask, (rows, 1), device)?)
    }

    /// Zero every row of the embedding gradient except the learned ones.
    ///
    /// Uses a select so NaN or Inf in a masked row still becomes zero.
    pub fn apply(&self, grads: &mut GradStore, embedding: &Var) -> Result<()> {
        let Some(grad) = grads.get(embedding.as_tensor()) else {
            return Ok(());
        };
        let mask = self
            .row_mask(grad.dim(0)?, grad.device())?
            .broadcast_as(grad.shape())?
            .contiguous()?;
        let masked = mask.where_cond(grad, &grad.zeros_like()?)?;
        grads.insert(embedding.as_tensor(), masked);
        Ok(())
    }
}
