//! AdamW with separate parameter groups for embeddings and attention weights.

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};

use crate::trainers::plan::TrainableSet;

/// Learning rate after batch scaling: `lr × batch_size`, doubled again with
/// prior preservation.
pub fn scaled_lr(lr: f64, batch_size: usize, with_prior: bool, scale_lr: bool) -> f64 {
    if !scale_lr {
        return lr;
    }
    let lr = lr * batch_size as f64;
    if with_prior {
        lr * 2.0
    } else {
        lr
    }
}

fn adamw_params(lr: f64, weight_decay: f64) -> ParamsAdamW {
    ParamsAdamW {
        lr,
        beta1: 0.9,
        beta2: 0.999,
        eps: 1e-8,
        weight_decay,
    }
}

/// The embedding group never decays: with a zero gradient its update is
/// exactly zero, so pretrained rows stay bit-identical.
pub struct GroupedAdamW {
    embedding: AdamW,
    attention: Option<AdamW>,
}

impl GroupedAdamW {
    pub fn new(trainables: &TrainableSet, lr: f64, weight_decay: f64) -> Result<Self> {
        let embedding = AdamW::new(vec![trainables.embedding.clone()], adamw_params(lr, 0.0))?;
        let attention = if trainables.attention.is_empty() {
            None
        } else {
            let vars = trainables.attention.iter().map(|(_, v)| v.clone()).collect();
            Some(AdamW::new(vars, adamw_params(lr, weight_decay))?)
        };
        Ok(Self { embedding, attention })
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.embedding.step(grads)?;
        if let Some(attention) = self.attention.as_mut() {
            attention.step(grads)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor, Var};

    #[test]
    fn test_lr_scaling() {
        assert!((scaled_lr(1e-5, 4, false, true) - 4e-5).abs() < 1e-12);
        assert!((scaled_lr(1e-5, 4, true, true) - 8e-5).abs() < 1e-12);
        assert_eq!(scaled_lr(1e-5, 4, true, false), 1e-5);
    }

    #[test]
    fn test_zero_gradient_leaves_embedding_untouched() {
        let dev = Device::Cpu;
        let embedding = Var::from_tensor(&Tensor::new(&[[0.5f32, -1.5], [2.0, 3.0]], &dev).unwrap()).unwrap();
        let attn = Var::ones((2, 2), DType::F32, &dev).unwrap();
        let set = TrainableSet {
            embedding: embedding.clone(),
            attention: vec![("attn2.to_k.weight".into(), attn.clone())],
        };
        let mut opt = GroupedAdamW::new(&set, 1e-2, 0.5).unwrap();
        let before: Vec<Vec<f32>> = embedding.as_tensor().to_vec2().unwrap();
        for _ in 0..5 {
            let loss = (embedding.as_tensor().zeros_like().unwrap().sum_all().unwrap()
                + attn.as_tensor().sum_all().unwrap())
            .unwrap();
            let mut grads = loss.backward().unwrap();
            grads.insert(embedding.as_tensor(), embedding.as_tensor().zeros_like().unwrap());
            opt.step(&grads).unwrap();
        }
        let after: Vec<Vec<f32>> = embedding.as_tensor().to_vec2().unwrap();
        assert_eq!(before, after);
        let w: Vec<Vec<f32>> = attn.as_tensor().to_vec2().unwrap();
        assert!(w[0][0] < 1.0);
    }
}
