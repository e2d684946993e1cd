//! Small reference components with the same call contracts as the Stable
//! Diffusion adapters.
//!
//! Weights are drawn from a seeded generator, so every [`TinySource::load`]
//! returns the same "pretrained" model. The test harness trains against these.

use anyhow::{bail, Result};
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::Linear;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::collections::HashMap;

use crate::trainers::ddpm_scheduler::{PredictionType, SchedulerConfig};

use super::{
    Component, DenoisingBackbone, ImageCodec, ModelBundle, ModelSource, ParamRole, ParamStore,
    TextEncoder, Vocabulary,
};

pub const BOS: &str = "<|startoftext|>";
pub const EOS: &str = "<|endoftext|>";
pub const UNK: &str = "<|unk|>";

/// Whitespace tokenizer over a fixed word list.
#[derive(Clone)]
pub struct WordTokenizer {
    ids: HashMap<String, u32>,
    words: Vec<String>,
    max_length: usize,
}

impl WordTokenizer {
    pub fn new(words: &[&str], max_length: usize) -> Self {
        let mut tok = Self {
            ids: HashMap::new(),
            words: Vec::new(),
            max_length,
        };
        for w in [BOS, EOS, UNK].iter().chain(words) {
            tok.push(w);
        }
        tok
    }

    fn push(&mut self, word: &str) -> u32 {
        let id = self.words.len() as u32;
        self.ids.insert(word.to_string(), id);
        self.words.push(word.to_string());
        id
    }
}

impl Vocabulary for WordTokenizer {
    fn vocab_size(&self) -> usize {
        self.words.len()
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        self.ids.get(token).copied()
    }

    fn add_token(&mut self, token: &str) -> Result<u32> {
        if token.split_whitespace().count() != 1 {
            bail!("token '{}' must be a single word", token);
        }
        Ok(match self.ids.get(token) {
            Some(&id) => id,
            None => self.push(token),
        })
    }

    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let unk = self.ids[UNK];
        let mut ids: Vec<u32> = text
            .split_whitespace()
            .map(|w| self.ids.get(w).copied().unwrap_or(unk))
            .collect();
        if add_special_tokens {
            ids.insert(0, self.ids[BOS]);
            ids.push(self.ids[EOS]);
        }
        Ok(ids)
    }

    fn max_length(&self) -> usize {
        self.max_length
    }

    fn pad_id(&self) -> u32 {
        self.ids[EOS]
    }
}

fn randn(rng: &mut StdRng, shape: &[usize], std: f64, device: &Device) -> Result<Tensor> {
    let normal = Normal::new(0.0, std)?;
    let n = shape.iter().product::<usize>();
    let data: Vec<f32> = (0..n).map(|_| normal.sample(rng) as f32).collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

fn linear(store: &ParamStore, weight: &str, bias: Option<&str>, x: &Tensor) -> Result<Tensor> {
    let dtype = x.dtype();
    let w = store.get(weight)?.to_dtype(dtype)?;
    let b = match bias {
        Some(b) => Some(store.get(b)?.to_dtype(dtype)?),
        None => None,
    };
    Ok(Linear::new(w, b).forward(x)?)
}

/// Token + position embedding followed by one residual projection.
pub struct TinyTextEncoder {
    params: ParamStore,
}

impl TinyTextEncoder {
    pub const TOKEN_EMBEDDING: &'static str = "token_embedding.weight";

    pub fn new(vocab: usize, dim: usize, max_length: usize, rng: &mut StdRng, device: &Device) -> Result<Self> {
        let mut params = ParamStore::new();
        params.insert(Self::TOKEN_EMBEDDING, ParamRole::TokenEmbedding, randn(rng, &[vocab, dim], 1.0, device)?);
        params.insert("position_embedding.weight", ParamRole::PositionEmbedding, randn(rng, &[max_length, dim], 0.1, device)?);
        params.insert("encoder.fc.weight", ParamRole::TextEncoderBody, randn(rng, &[dim, dim], 0.3, device)?);
        params.insert("encoder.fc.bias", ParamRole::TextEncoderBody, Tensor::zeros(dim, DType::F32, device)?);
        Ok(Self { params })
    }
}

impl Component for TinyTextEncoder {
    fn params(&self) -> &ParamStore {
        &self.params
    }

    fn params_mut(&mut self) -> &mut ParamStore {
        &mut self.params
    }
}

impl TextEncoder for TinyTextEncoder {
    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (b, l) = input_ids.dims2()?;
        let table = self.params.get(Self::TOKEN_EMBEDDING)?;
        let dim = table.dim(1)?;
        let tokens = table.index_select(&input_ids.flatten_all()?, 0)?.reshape((b, l, dim))?;
        let positions = self
            .params
            .get("position_embedding.weight")?
            .narrow(0, 0, l)?
            .to_dtype(tokens.dtype())?;
        let x = tokens.broadcast_add(&positions)?;
        let h = linear(&self.params, "encoder.fc.weight", Some("encoder.fc.bias"), &x)?.tanh()?;
        Ok((x + h)?)
    }
}

/// 2x average-pool plus channel projection, and its nearest-neighbour inverse.
pub struct TinyImageCodec {
    params: ParamStore,
}

impl TinyImageCodec {
    pub fn new(latent_channels: usize, rng: &mut StdRng, device: &Device) -> Result<Self> {
        let mut params = ParamStore::new();
        params.insert("encoder.proj.weight", ParamRole::ImageCodec, randn(rng, &[latent_channels, 3], 0.5, device)?);
        params.insert("decoder.proj.weight", ParamRole::ImageCodec, randn(rng, &[3, latent_channels], 0.5, device)?);
        Ok(Self { params })
    }
}

impl Component for TinyImageCodec {
    fn params(&self) -> &ParamStore {
        &self.params
    }

    fn params_mut(&mut self) -> &mut ParamStore {
        &mut self.params
    }
}

impl ImageCodec for TinyImageCodec {
    fn encode(&self, images: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = images.dims4()?;
        let dtype = self.params.get("encoder.proj.weight")?.dtype();
        let pooled = images
            .to_dtype(dtype)?
            .reshape((b, c, h / 2, 2, w / 2, 2))?
            .mean(5)?
            .mean(3)?;
        let x = pooled.permute((0, 2, 3, 1))?.contiguous()?;
        let z = linear(&self.params, "encoder.proj.weight", None, &x)?;
        Ok(z.permute((0, 3, 1, 2))?.contiguous()?)
    }

    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let dtype = self.params.get("decoder.proj.weight")?.dtype();
        let x = latents.to_dtype(dtype)?.permute((0, 2, 3, 1))?.contiguous()?;
        let rgb = linear(&self.params, "decoder.proj.weight", None, &x)?
            .permute((0, 3, 1, 2))?
            .contiguous()?;
        let (b, c, h, w) = rgb.dims4()?;
        let up = rgb
            .reshape((b, c, h, 1, w, 1))?
            .broadcast_as((b, c, h, 2, w, 2))?
            .contiguous()?
            .reshape((b, c, h * 2, w * 2))?;
        Ok(up.tanh()?)
    }

    fn scaling_factor(&self) -> f64 {
        0.18215
    }

    fn downscale_factor(&self) -> usize {
        2
    }
}

/// Per-pixel projection with one cross-attention block over the text states.
pub struct TinyBackbone {
    params: ParamStore,
    in_channels: usize,
    hidden: usize,
    sample_size: usize,
}

impl TinyBackbone {
    pub fn new(
        in_channels: usize,
        hidden: usize,
        cond_dim: usize,
        sample_size: usize,
        rng: &mut StdRng,
        device: &Device,
    ) -> Result<Self> {
        let mut p = ParamStore::new();
        p.insert("proj_in.weight", ParamRole::BackboneBody, randn(rng, &[hidden, in_channels], 0.5, device)?);
        p.insert("proj_in.bias", ParamRole::BackboneBody, Tensor::zeros(hidden, DType::F32, device)?);
        p.insert("attn2.to_q.weight", ParamRole::CrossAttnQuery, randn(rng, &[hidden, hidden], 0.3, device)?);
        p.insert("attn2.to_k.weight", ParamRole::CrossAttnKey, randn(rng, &[hidden, cond_dim], 0.3, device)?);
        p.insert("attn2.to_v.weight", ParamRole::CrossAttnValue, randn(rng, &[hidden, cond_dim], 0.3, device)?);
        p.insert("attn2.to_out.weight", ParamRole::CrossAttnOut, randn(rng, &[hidden, hidden], 0.3, device)?);
        p.insert("attn2.to_out.bias", ParamRole::CrossAttnOut, Tensor::zeros(hidden, DType::F32, device)?);
        p.insert("proj_out.weight", ParamRole::BackboneBody, randn(rng, &[in_channels, hidden], 0.3, device)?);
        Ok(Self {
            params: p,
            in_channels,
            hidden,
            sample_size,
        })
    }

    fn timestep_embedding(&self, timesteps: &Tensor, dtype: DType) -> Result<Tensor> {
        let steps = timesteps.to_dtype(DType::U32)?.to_vec1::<u32>()?;
        let half = self.hidden / 2;
        let mut data = Vec::with_capacity(steps.len() * self.hidden);
        for &t in &steps {
            for i in 0..half {
                let freq = (-(10000f64.ln()) * i as f64 / half as f64).exp();
                data.push((t as f64 * freq).sin() as f32);
            }
            for i in 0..half {
                let freq = (-(10000f64.ln()) * i as f64 / half as f64).exp();
                data.push((t as f64 * freq).cos() as f32);
            }
        }
        let emb = Tensor::from_vec(data, (steps.len(), 1, 2 * half), timesteps.device())?;
        Ok(emb.to_dtype(dtype)?)
    }
}

impl Component for TinyBackbone {
    fn params(&self) -> &ParamStore {
        &self.params
    }

    fn params_mut(&mut self) -> &mut ParamStore {
        &mut self.params
    }
}

impl DenoisingBackbone for TinyBackbone {
    fn forward(&self, noisy_latents: &Tensor, timesteps: &Tensor, text_cond: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = noisy_latents.dims4()?;
        let x = noisy_latents.flatten_from(2)?.transpose(1, 2)?.contiguous()?;
        let hs = linear(&self.params, "proj_in.weight", Some("proj_in.bias"), &x)?;
        let hs = hs.broadcast_add(&self.timestep_embedding(timesteps, hs.dtype())?)?;

        let cond = text_cond.to_dtype(hs.dtype())?;
        let q = linear(&self.params, "attn2.to_q.weight", None, &hs)?;
        let k = linear(&self.params, "attn2.to_k.weight", None, &cond)?;
        let v = linear(&self.params, "attn2.to_v.weight", None, &cond)?;
        let scores = (q.matmul(&k.t()?.contiguous()?)? / (self.hidden as f64).sqrt())?;
        let attn = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let o = attn.matmul(&v)?;
        let o = linear(&self.params, "attn2.to_out.weight", Some("attn2.to_out.bias"), &o)?;
        let hs = (hs + o)?;

        let out = linear(&self.params, "proj_out.weight", None, &hs)?;
        Ok(out.transpose(1, 2)?.contiguous()?.reshape((b, c, h, w))?)
    }

    fn in_channels(&self) -> usize {
        self.in_channels
    }

    fn sample_size(&self) -> usize {
        self.sample_size
    }
}

/// Sizes and seed of a reference model.
#[derive(Debug, Clone)]
pub struct TinyConfig {
    pub words: Vec<String>,
    pub embed_dim: usize,
    pub max_length: usize,
    pub latent_channels: usize,
    pub hidden: usize,
    pub sample_size: usize,
    pub seed: u64,
    pub prediction_type: PredictionType,
}

impl Default for TinyConfig {
    fn default() -> Self {
        Self {
            words: ["photo", "of", "a", "cat", "dog", "toy", "painting", "style"]
                .iter()
                .map(|w| w.to_string())
                .collect(),
            embed_dim: 8,
            max_length: 8,
            latent_channels: 4,
            hidden: 8,
            sample_size: 4,
            seed: 7,
            prediction_type: PredictionType::Epsilon,
        }
    }
}

pub struct TinySource {
    pub config: TinyConfig,
    pub device: Device,
}

impl TinySource {
    pub fn new(config: TinyConfig) -> Self {
        Self {
            config,
            device: Device::Cpu,
        }
    }

    fn backbone(&self) -> Result<TinyBackbone> {
        let c = &self.config;
        let mut rng = StdRng::seed_from_u64(c.seed + 3);
        TinyBackbone::new(c.latent_channels, c.hidden, c.embed_dim, c.sample_size, &mut rng, &self.device)
    }
}

impl ModelSource for TinySource {
    fn load(&self) -> Result<ModelBundle> {
        let c = &self.config;
        let words: Vec<&str> = c.words.iter().map(String::as_str).collect();
        let tokenizer = WordTokenizer::new(&words, c.max_length);

        let mut rng = StdRng::seed_from_u64(c.seed + 1);
        let text_encoder =
            TinyTextEncoder::new(tokenizer.vocab_size(), c.embed_dim, c.max_length, &mut rng, &self.device)?;
        let mut rng = StdRng::seed_from_u64(c.seed + 2);
        let image_codec = TinyImageCodec::new(c.latent_channels, &mut rng, &self.device)?;

        Ok(ModelBundle {
            tokenizer: Box::new(tokenizer),
            text_encoder: Box::new(text_encoder),
            image_codec: Box::new(image_codec),
            backbone: Box::new(self.backbone()?),
            device: self.device.clone(),
        })
    }

    fn load_backbone_params(&self, dtype: DType) -> Result<ParamStore> {
        let params = self.backbone()?.params;
        let keys: Vec<String> = params.iter().map(|(k, _)| k.to_string()).collect();
        params.snapshot(&keys, dtype)
    }

    fn scheduler_config(&self) -> Result<SchedulerConfig> {
        Ok(SchedulerConfig {
            prediction_type: self.config.prediction_type,
            ..Default::default()
        })
    }
}
