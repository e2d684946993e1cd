//! Building blocks shared by the Stable Diffusion text encoder and UNet.
//!
//! Normalisation and attention are written with plain tensor ops so that
//! gradients reach every input. The fused kernels behind `candle_nn`'s
//! `LayerNorm` and `softmax_last_dim` have no backward pass.

use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn as nn;

/// Layer normalisation over the last dimension.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn new(weight: Tensor, bias: Tensor, eps: f64) -> Self {
        Self { weight, bias, eps }
    }
}

pub fn layer_norm(dim: usize, eps: f64, vs: nn::VarBuilder) -> Result<LayerNorm> {
    let weight = vs.get(dim, "weight")?;
    let bias = vs.get(dim, "bias")?;
    Ok(LayerNorm::new(weight, bias, eps))
}

impl Module for LayerNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let dtype = xs.dtype();
        let xs = xs.to_dtype(DType::F32)?;
        let mean = xs.mean_keepdim(D::Minus1)?;
        let centered = xs.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        normed
            .to_dtype(dtype)?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
    }
}

/// Scaled dot-product attention over `[batch, seq, head_dim]` inputs, computed
/// in f32. `mask` is added to the scores before the softmax.
pub fn attention(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    scale: f64,
    mask: Option<&Tensor>,
) -> Result<Tensor> {
    let in_dtype = query.dtype();
    let query = query.to_dtype(DType::F32)?;
    let key = key.to_dtype(DType::F32)?;
    let value = value.to_dtype(DType::F32)?;
    let scores = (query.matmul(&key.t()?)? * scale)?;
    let scores = match mask {
        Some(mask) => scores.broadcast_add(mask)?,
        None => scores,
    };
    let probs = nn::ops::softmax(&scores, D::Minus1)?;
    probs.matmul(&value)?.to_dtype(in_dtype)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    fn ramp(shape: (usize, usize, usize)) -> Tensor {
        let n = shape.0 * shape.1 * shape.2;
        Tensor::arange(0f32, n as f32, &Device::Cpu)
            .unwrap()
            .affine(0.37, -1.0)
            .unwrap()
            .sin()
            .unwrap()
            .reshape(shape)
            .unwrap()
    }

    #[test]
    fn test_layer_norm_matches_candle() {
        let dev = Device::Cpu;
        let xs = ramp((2, 3, 6));
        let weight = Tensor::new(&[1.0f32, 0.5, 2.0, -1.0, 0.3, 1.5], &dev).unwrap();
        let bias = Tensor::new(&[0.1f32, 0.0, -0.2, 0.3, 0.0, 1.0], &dev).unwrap();
        let ours = LayerNorm::new(weight.clone(), bias.clone(), 1e-5).forward(&xs).unwrap();
        let reference = nn::LayerNorm::new(weight, bias, 1e-5).forward(&xs).unwrap();
        let diff: f32 = (ours - reference).unwrap().abs().unwrap().max_all().unwrap().to_scalar().unwrap();
        assert!(diff < 1e-4, "max diff {}", diff);
    }

    #[test]
    fn test_layer_norm_passes_gradient_to_input() {
        let dev = Device::Cpu;
        let xs = Var::from_tensor(&ramp((1, 4, 6))).unwrap();
        let norm = LayerNorm::new(
            Tensor::ones(6, DType::F32, &dev).unwrap(),
            Tensor::zeros(6, DType::F32, &dev).unwrap(),
            1e-5,
        );
        let weights = ramp((1, 4, 6));
        let loss = (norm.forward(xs.as_tensor()).unwrap() * weights).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        let g = grads.get(xs.as_tensor()).expect("input gradient");
        let norm: f32 = g.sqr().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert!(norm > 0.0);
    }

    #[test]
    fn test_attention_passes_gradient_to_query_and_key() {
        let q = Var::from_tensor(&ramp((2, 3, 4))).unwrap();
        let k = Var::from_tensor(&ramp((2, 5, 4)).affine(1.3, 0.2).unwrap()).unwrap();
        let v = ramp((2, 5, 4)).affine(-0.7, 0.1).unwrap();
        let out = attention(q.as_tensor(), k.as_tensor(), &v, 0.5, None).unwrap();
        assert_eq!(out.dims(), &[2, 3, 4]);
        let grads = out.sqr().unwrap().sum_all().unwrap().backward().unwrap();
        for var in [&q, &k] {
            let g = grads.get(var.as_tensor()).expect("gradient");
            let norm: f32 = g.sqr().unwrap().sum_all().unwrap().to_scalar().unwrap();
            assert!(norm > 0.0);
        }
    }

    #[test]
    fn test_attention_mask_blocks_positions() {
        let dev = Device::Cpu;
        let q = ramp((1, 2, 4));
        let k = ramp((1, 2, 4));
        let v = Tensor::new(&[[[1f32, 1., 1., 1.], [5., 5., 5., 5.]]], &dev).unwrap();
        let mask = Tensor::new(&[[0f32, f32::MIN], [0., 0.]], &dev).unwrap();
        let out: Vec<Vec<Vec<f32>>> = attention(&q, &k, &v, 1.0, Some(&mask)).unwrap().to_vec3().unwrap();
        assert!((out[0][0][0] - 1.0).abs() < 1e-5);
        assert!(out[0][1][0] > 1.0);
    }
}
