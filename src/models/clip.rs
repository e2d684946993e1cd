//! CLIP text transformer used as the Stable Diffusion text encoder.
//!
//! Weight names follow the transformers `CLIPTextModel` layout
//! (`text_model.embeddings.token_embedding.weight`, ...).

use candle_core::{Device, Module, Result, Tensor};
use candle_nn as nn;

use super::layers::{attention, layer_norm, LayerNorm};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    QuickGelu,
    Gelu,
}

impl Module for Activation {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Activation::QuickGelu => xs * nn::ops::sigmoid(&(xs * 1.702f64)?)?,
            Activation::Gelu => xs.gelu(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClipTextConfig {
    pub vocab_size: usize,
    pub embed_dim: usize,
    pub intermediate_size: usize,
    pub max_position_embeddings: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub activation: Activation,
}

impl ClipTextConfig {
    /// openai/clip-vit-large-patch14, the SD 1.x text encoder.
    pub fn v1_5() -> Self {
        Self {
            vocab_size: 49408,
            embed_dim: 768,
            intermediate_size: 3072,
            max_position_embeddings: 77,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            activation: Activation::QuickGelu,
        }
    }

    /// OpenCLIP ViT-H text tower as shipped with SD 2.x (penultimate layer).
    pub fn v2_1() -> Self {
        Self {
            vocab_size: 49408,
            embed_dim: 1024,
            intermediate_size: 4096,
            max_position_embeddings: 77,
            num_hidden_layers: 23,
            num_attention_heads: 16,
            activation: Activation::Gelu,
        }
    }
}

#[derive(Debug)]
struct ClipTextEmbeddings {
    token_embedding: nn::Embedding,
    position_embedding: nn::Embedding,
}

impl ClipTextEmbeddings {
    fn new(vs: nn::VarBuilder, c: &ClipTextConfig) -> Result<Self> {
        Ok(Self {
            token_embedding: nn::embedding(c.vocab_size, c.embed_dim, vs.pp("token_embedding"))?,
            position_embedding: nn::embedding(c.max_position_embeddings, c.embed_dim, vs.pp("position_embedding"))?,
        })
    }

    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;
        let position_ids = Tensor::arange(0u32, seq_len as u32, input_ids.device())?.unsqueeze(0)?;
        let tokens = self.token_embedding.forward(input_ids)?;
        let positions = self.position_embedding.forward(&position_ids)?;
        tokens.broadcast_add(&positions)
    }
}

#[derive(Debug)]
struct ClipAttention {
    q_proj: nn::Linear,
    k_proj: nn::Linear,
    v_proj: nn::Linear,
    out_proj: nn::Linear,
    heads: usize,
    head_dim: usize,
}

impl ClipAttention {
    fn new(vs: nn::VarBuilder, c: &ClipTextConfig) -> Result<Self> {
        let dim = c.embed_dim;
        Ok(Self {
            q_proj: nn::linear(dim, dim, vs.pp("q_proj"))?,
            k_proj: nn::linear(dim, dim, vs.pp("k_proj"))?,
            v_proj: nn::linear(dim, dim, vs.pp("v_proj"))?,
            out_proj: nn::linear(dim, dim, vs.pp("out_proj"))?,
            heads: c.num_attention_heads,
            head_dim: dim / c.num_attention_heads,
        })
    }

    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (bsz, seq_len, _) = xs.dims3()?;
        xs.reshape((bsz, seq_len, self.heads, self.head_dim))?
            .transpose(1, 2)?
            .reshape((bsz * self.heads, seq_len, self.head_dim))
    }

    fn forward(&self, xs: &Tensor, causal_mask: &Tensor) -> Result<Tensor> {
        let (bsz, seq_len, dim) = xs.dims3()?;
        let q = self.split_heads(&self.q_proj.forward(xs)?)?;
        let k = self.split_heads(&self.k_proj.forward(xs)?)?;
        let v = self.split_heads(&self.v_proj.forward(xs)?)?;
        let scale = (self.head_dim as f64).powf(-0.5);
        let out = attention(&q, &k, &v, scale, Some(causal_mask))?
            .reshape((bsz, self.heads, seq_len, self.head_dim))?
            .transpose(1, 2)?
            .reshape((bsz, seq_len, dim))?;
        self.out_proj.forward(&out)
    }
}

#[derive(Debug)]
struct ClipEncoderLayer {
    self_attn: ClipAttention,
    layer_norm1: LayerNorm,
    fc1: nn::Linear,
    fc2: nn::Linear,
    activation: Activation,
    layer_norm2: LayerNorm,
}

impl ClipEncoderLayer {
    fn new(vs: nn::VarBuilder, c: &ClipTextConfig) -> Result<Self> {
        let mlp = vs.pp("mlp");
        Ok(Self {
            self_attn: ClipAttention::new(vs.pp("self_attn"), c)?,
            layer_norm1: layer_norm(c.embed_dim, 1e-5, vs.pp("layer_norm1"))?,
            fc1: nn::linear(c.embed_dim, c.intermediate_size, mlp.pp("fc1"))?,
            fc2: nn::linear(c.intermediate_size, c.embed_dim, mlp.pp("fc2"))?,
            activation: c.activation,
            layer_norm2: layer_norm(c.embed_dim, 1e-5, vs.pp("layer_norm2"))?,
        })
    }

    fn forward(&self, xs: &Tensor, causal_mask: &Tensor) -> Result<Tensor> {
        let h = self.self_attn.forward(&self.layer_norm1.forward(xs)?, causal_mask)?;
        let xs = (h + xs)?;
        let h = self.fc1.forward(&self.layer_norm2.forward(&xs)?)?;
        let h = self.fc2.forward(&self.activation.forward(&h)?)?;
        h + xs
    }
}

/// Token ids `[B, L]` to final hidden states `[B, L, D]`.
#[derive(Debug)]
pub struct ClipTextTransformer {
    embeddings: ClipTextEmbeddings,
    layers: Vec<ClipEncoderLayer>,
    final_layer_norm: LayerNorm,
}

impl ClipTextTransformer {
    pub fn new(vs: nn::VarBuilder, c: &ClipTextConfig) -> Result<Self> {
        let vs = vs.pp("text_model");
        let vs_layers = vs.pp("encoder").pp("layers");
        let layers = (0..c.num_hidden_layers)
            .map(|i| ClipEncoderLayer::new(vs_layers.pp(i.to_string()), c))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            embeddings: ClipTextEmbeddings::new(vs.pp("embeddings"), c)?,
            layers,
            final_layer_norm: layer_norm(c.embed_dim, 1e-5, vs.pp("final_layer_norm"))?,
        })
    }

    fn causal_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
        let mask: Vec<f32> = (0..seq_len)
            .flat_map(|i| (0..seq_len).map(move |j| if j > i { f32::MIN } else { 0.0 }))
            .collect();
        Tensor::from_vec(mask, (seq_len, seq_len), device)
    }
}

impl Module for ClipTextTransformer {
    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;
        let mut xs = self.embeddings.forward(input_ids)?;
        let mask = Self::causal_mask(seq_len, xs.device())?;
        for layer in &self.layers {
            xs = layer.forward(&xs, &mask)?;
        }
        self.final_layer_norm.forward(&xs)
    }
}
