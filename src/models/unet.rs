//! Conditional UNet of Stable Diffusion 1.x / 2.x.
//!
//! Weight names follow the diffusers layout. Residual blocks and the timestep
//! embedding come from candle-transformers; the transformer blocks are built
//! here on [`super::layers`] so the cross-attention projections and the text
//! conditioning receive gradients.

use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn as nn;
use candle_transformers::models::stable_diffusion::{
    embeddings::{TimestepEmbedding, Timesteps},
    resnet::{ResnetBlock2D, ResnetBlock2DConfig},
};

use super::layers::{attention, layer_norm, LayerNorm};

/// One resolution level of the UNet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockConfig {
    pub out_channels: usize,
    /// Transformer depth of the level, `None` for a level without attention.
    pub use_cross_attn: Option<usize>,
    /// Number of attention heads (diffusers naming).
    pub attention_head_dim: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UNetConfig {
    pub blocks: Vec<BlockConfig>,
    pub layers_per_block: usize,
    pub cross_attention_dim: usize,
    pub norm_num_groups: usize,
    pub norm_eps: f64,
    pub flip_sin_to_cos: bool,
    pub freq_shift: f64,
    pub downsample_padding: usize,
    pub use_linear_projection: bool,
}

impl Default for UNetConfig {
    fn default() -> Self {
        let block = |out_channels, use_cross_attn| BlockConfig {
            out_channels,
            use_cross_attn,
            attention_head_dim: 8,
        };
        Self {
            blocks: vec![
                block(320, Some(1)),
                block(640, Some(1)),
                block(1280, Some(1)),
                block(1280, None),
            ],
            layers_per_block: 2,
            cross_attention_dim: 768,
            norm_num_groups: 32,
            norm_eps: 1e-5,
            flip_sin_to_cos: true,
            freq_shift: 0.0,
            downsample_padding: 1,
            use_linear_projection: false,
        }
    }
}

#[derive(Debug)]
struct CrossAttention {
    to_q: nn::Linear,
    to_k: nn::Linear,
    to_v: nn::Linear,
    to_out: nn::Linear,
    heads: usize,
    scale: f64,
}

impl CrossAttention {
    fn new(
        vs: nn::VarBuilder,
        query_dim: usize,
        context_dim: Option<usize>,
        heads: usize,
        dim_head: usize,
    ) -> Result<Self> {
        let inner_dim = dim_head * heads;
        let context_dim = context_dim.unwrap_or(query_dim);
        Ok(Self {
            to_q: nn::linear_no_bias(query_dim, inner_dim, vs.pp("to_q"))?,
            to_k: nn::linear_no_bias(context_dim, inner_dim, vs.pp("to_k"))?,
            to_v: nn::linear_no_bias(context_dim, inner_dim, vs.pp("to_v"))?,
            to_out: nn::linear(inner_dim, query_dim, vs.pp("to_out.0"))?,
            heads,
            scale: 1.0 / (dim_head as f64).sqrt(),
        })
    }

    fn reshape_heads_to_batch_dim(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, dim) = xs.dims3()?;
        xs.reshape((batch_size, seq_len, self.heads, dim / self.heads))?
            .transpose(1, 2)?
            .reshape((batch_size * self.heads, seq_len, dim / self.heads))
    }

    fn reshape_batch_dim_to_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, dim) = xs.dims3()?;
        xs.reshape((batch_size / self.heads, self.heads, seq_len, dim))?
            .transpose(1, 2)?
            .reshape((batch_size / self.heads, seq_len, dim * self.heads))
    }

    fn forward(&self, xs: &Tensor, context: Option<&Tensor>) -> Result<Tensor> {
        let context = context.unwrap_or(xs).contiguous()?;
        let query = self.reshape_heads_to_batch_dim(&self.to_q.forward(xs)?)?;
        let key = self.reshape_heads_to_batch_dim(&self.to_k.forward(&context)?)?;
        let value = self.reshape_heads_to_batch_dim(&self.to_v.forward(&context)?)?;
        let xs = attention(&query, &key, &value, self.scale, None)?;
        self.to_out.forward(&self.reshape_batch_dim_to_heads(&xs)?)
    }
}

/// GEGLU feed-forward with a 4x inner width.
#[derive(Debug)]
struct FeedForward {
    proj: nn::Linear,
    out: nn::Linear,
}

impl FeedForward {
    fn new(vs: nn::VarBuilder, dim: usize) -> Result<Self> {
        let inner_dim = dim * 4;
        let vs = vs.pp("net");
        Ok(Self {
            proj: nn::linear(dim, inner_dim * 2, vs.pp("0").pp("proj"))?,
            out: nn::linear(inner_dim, dim, vs.pp("2"))?,
        })
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let chunks = self.proj.forward(xs)?.chunk(2, D::Minus1)?;
        let hidden = (&chunks[0] * chunks[1].gelu()?)?;
        self.out.forward(&hidden)
    }
}

#[derive(Debug)]
struct BasicTransformerBlock {
    attn1: CrossAttention,
    attn2: CrossAttention,
    ff: FeedForward,
    norm1: LayerNorm,
    norm2: LayerNorm,
    norm3: LayerNorm,
}

impl BasicTransformerBlock {
    fn new(vs: nn::VarBuilder, dim: usize, n_heads: usize, d_head: usize, context_dim: usize) -> Result<Self> {
        Ok(Self {
            attn1: CrossAttention::new(vs.pp("attn1"), dim, None, n_heads, d_head)?,
            attn2: CrossAttention::new(vs.pp("attn2"), dim, Some(context_dim), n_heads, d_head)?,
            ff: FeedForward::new(vs.pp("ff"), dim)?,
            norm1: layer_norm(dim, 1e-5, vs.pp("norm1"))?,
            norm2: layer_norm(dim, 1e-5, vs.pp("norm2"))?,
            norm3: layer_norm(dim, 1e-5, vs.pp("norm3"))?,
        })
    }

    fn forward(&self, xs: &Tensor, context: &Tensor) -> Result<Tensor> {
        let xs = (self.attn1.forward(&self.norm1.forward(xs)?, None)? + xs)?;
        let xs = (self.attn2.forward(&self.norm2.forward(&xs)?, Some(context))? + xs)?;
        self.ff.forward(&self.norm3.forward(&xs)?)? + xs
    }
}

#[derive(Debug)]
enum Proj {
    Conv2d(nn::Conv2d),
    Linear(nn::Linear),
}

/// Transformer over the spatial positions of a feature map (diffusers
/// `Transformer2DModel`).
#[derive(Debug)]
struct SpatialTransformer {
    norm: nn::GroupNorm,
    proj_in: Proj,
    transformer_blocks: Vec<BasicTransformerBlock>,
    proj_out: Proj,
}

impl SpatialTransformer {
    fn new(vs: nn::VarBuilder, channels: usize, n_heads: usize, depth: usize, config: &UNetConfig) -> Result<Self> {
        let d_head = channels / n_heads;
        let inner_dim = n_heads * d_head;
        let norm = nn::group_norm(config.norm_num_groups, channels, 1e-6, vs.pp("norm"))?;
        let (proj_in, proj_out) = if config.use_linear_projection {
            (
                Proj::Linear(nn::linear(channels, inner_dim, vs.pp("proj_in"))?),
                Proj::Linear(nn::linear(inner_dim, channels, vs.pp("proj_out"))?),
            )
        } else {
            (
                Proj::Conv2d(nn::conv2d(channels, inner_dim, 1, Default::default(), vs.pp("proj_in"))?),
                Proj::Conv2d(nn::conv2d(inner_dim, channels, 1, Default::default(), vs.pp("proj_out"))?),
            )
        };
        let vs_tb = vs.pp("transformer_blocks");
        let transformer_blocks = (0..depth)
            .map(|i| {
                BasicTransformerBlock::new(
                    vs_tb.pp(i.to_string()),
                    inner_dim,
                    n_heads,
                    d_head,
                    config.cross_attention_dim,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            norm,
            proj_in,
            transformer_blocks,
            proj_out,
        })
    }

    fn forward(&self, xs: &Tensor, context: &Tensor) -> Result<Tensor> {
        let (batch, channels, height, width) = xs.dims4()?;
        let residual = xs;
        let xs = self.norm.forward(xs)?;
        let mut xs = match &self.proj_in {
            Proj::Conv2d(p) => {
                let xs = p.forward(&xs)?;
                let inner_dim = xs.dim(1)?;
                xs.permute((0, 2, 3, 1))?.reshape((batch, height * width, inner_dim))?
            }
            Proj::Linear(p) => {
                let xs = xs.permute((0, 2, 3, 1))?.reshape((batch, height * width, channels))?;
                p.forward(&xs)?
            }
        };
        for block in &self.transformer_blocks {
            xs = block.forward(&xs, context)?;
        }
        let inner_dim = xs.dim(2)?;
        let xs = match &self.proj_out {
            Proj::Conv2d(p) => {
                let xs = xs.reshape((batch, height, width, inner_dim))?.permute((0, 3, 1, 2))?;
                p.forward(&xs.contiguous()?)?
            }
            Proj::Linear(p) => p
                .forward(&xs)?
                .reshape((batch, height, width, channels))?
                .permute((0, 3, 1, 2))?,
        };
        xs + residual
    }
}

#[derive(Debug)]
struct Downsample2D {
    conv: nn::Conv2d,
}

impl Downsample2D {
    fn new(vs: nn::VarBuilder, channels: usize, padding: usize) -> Result<Self> {
        let config = nn::Conv2dConfig {
            stride: 2,
            padding,
            ..Default::default()
        };
        Ok(Self {
            conv: nn::conv2d(channels, channels, 3, config, vs.pp("conv"))?,
        })
    }
}

impl Module for Downsample2D {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.conv.forward(xs)
    }
}

#[derive(Debug)]
struct Upsample2D {
    conv: nn::Conv2d,
}

impl Upsample2D {
    fn new(vs: nn::VarBuilder, channels: usize) -> Result<Self> {
        let config = nn::Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        Ok(Self {
            conv: nn::conv2d(channels, channels, 3, config, vs.pp("conv"))?,
        })
    }

    fn forward(&self, xs: &Tensor, size: Option<(usize, usize)>) -> Result<Tensor> {
        let xs = match size {
            Some((h, w)) => xs.upsample_nearest2d(h, w)?,
            None => {
                let (_, _, h, w) = xs.dims4()?;
                xs.upsample_nearest2d(2 * h, 2 * w)?
            }
        };
        self.conv.forward(&xs)
    }
}

fn resnet_config(config: &UNetConfig, out_channels: usize, temb_channels: usize) -> ResnetBlock2DConfig {
    ResnetBlock2DConfig {
        out_channels: Some(out_channels),
        temb_channels: Some(temb_channels),
        groups: config.norm_num_groups,
        eps: config.norm_eps,
        ..Default::default()
    }
}

/// Encoder level: residual blocks, each optionally followed by a transformer.
#[derive(Debug)]
struct DownBlock {
    resnets: Vec<ResnetBlock2D>,
    attentions: Vec<SpatialTransformer>,
    downsampler: Option<Downsample2D>,
}

impl DownBlock {
    fn new(
        vs: nn::VarBuilder,
        in_channels: usize,
        block: BlockConfig,
        temb_channels: usize,
        add_downsample: bool,
        config: &UNetConfig,
    ) -> Result<Self> {
        let out_channels = block.out_channels;
        let resnet_cfg = resnet_config(config, out_channels, temb_channels);
        let vs_resnets = vs.pp("resnets");
        let resnets = (0..config.layers_per_block)
            .map(|i| {
                let in_channels = if i == 0 { in_channels } else { out_channels };
                ResnetBlock2D::new(vs_resnets.pp(i.to_string()), in_channels, resnet_cfg)
            })
            .collect::<Result<Vec<_>>>()?;
        let attentions = match block.use_cross_attn {
            Some(depth) => {
                let vs_attn = vs.pp("attentions");
                (0..config.layers_per_block)
                    .map(|i| {
                        SpatialTransformer::new(
                            vs_attn.pp(i.to_string()),
                            out_channels,
                            block.attention_head_dim,
                            depth,
                            config,
                        )
                    })
                    .collect::<Result<Vec<_>>>()?
            }
            None => Vec::new(),
        };
        let downsampler = if add_downsample {
            Some(Downsample2D::new(
                vs.pp("downsamplers").pp("0"),
                out_channels,
                config.downsample_padding,
            )?)
        } else {
            None
        };
        Ok(Self {
            resnets,
            attentions,
            downsampler,
        })
    }

    fn forward(&self, xs: &Tensor, temb: &Tensor, context: &Tensor) -> Result<(Tensor, Vec<Tensor>)> {
        let mut xs = xs.clone();
        let mut output_states = Vec::with_capacity(self.resnets.len() + 1);
        for (i, resnet) in self.resnets.iter().enumerate() {
            xs = resnet.forward(&xs, Some(temb))?;
            if let Some(attn) = self.attentions.get(i) {
                xs = attn.forward(&xs, context)?;
            }
            output_states.push(xs.clone());
        }
        if let Some(downsampler) = &self.downsampler {
            xs = downsampler.forward(&xs)?;
            output_states.push(xs.clone());
        }
        Ok((xs, output_states))
    }
}

#[derive(Debug)]
struct MidBlock {
    resnet: ResnetBlock2D,
    attn_resnets: Vec<(SpatialTransformer, ResnetBlock2D)>,
}

impl MidBlock {
    fn new(vs: nn::VarBuilder, channels: usize, temb_channels: usize, config: &UNetConfig) -> Result<Self> {
        let last = config.blocks.last().copied().ok_or_else(|| candle_core::Error::Msg("UNet has no blocks".into()))?;
        let resnet_cfg = resnet_config(config, channels, temb_channels);
        let vs_resnets = vs.pp("resnets");
        let resnet = ResnetBlock2D::new(vs_resnets.pp("0"), channels, resnet_cfg)?;
        let attn = SpatialTransformer::new(
            vs.pp("attentions").pp("0"),
            channels,
            last.attention_head_dim,
            last.use_cross_attn.unwrap_or(1),
            config,
        )?;
        let second = ResnetBlock2D::new(vs_resnets.pp("1"), channels, resnet_cfg)?;
        Ok(Self {
            resnet,
            attn_resnets: vec![(attn, second)],
        })
    }

    fn forward(&self, xs: &Tensor, temb: &Tensor, context: &Tensor) -> Result<Tensor> {
        let mut xs = self.resnet.forward(xs, Some(temb))?;
        for (attn, resnet) in &self.attn_resnets {
            xs = resnet.forward(&attn.forward(&xs, context)?, Some(temb))?;
        }
        Ok(xs)
    }
}

/// Decoder level: consumes one skip connection per residual block.
#[derive(Debug)]
struct UpBlock {
    resnets: Vec<ResnetBlock2D>,
    attentions: Vec<SpatialTransformer>,
    upsampler: Option<Upsample2D>,
}

impl UpBlock {
    fn new(
        vs: nn::VarBuilder,
        in_channels: usize,
        prev_output_channels: usize,
        block: BlockConfig,
        temb_channels: usize,
        add_upsample: bool,
        config: &UNetConfig,
    ) -> Result<Self> {
        let out_channels = block.out_channels;
        let num_layers = config.layers_per_block + 1;
        let resnet_cfg = resnet_config(config, out_channels, temb_channels);
        let vs_resnets = vs.pp("resnets");
        let resnets = (0..num_layers)
            .map(|i| {
                let skip_channels = if i == num_layers - 1 { in_channels } else { out_channels };
                let resnet_in = if i == 0 { prev_output_channels } else { out_channels };
                ResnetBlock2D::new(vs_resnets.pp(i.to_string()), resnet_in + skip_channels, resnet_cfg)
            })
            .collect::<Result<Vec<_>>>()?;
        let attentions = match block.use_cross_attn {
            Some(depth) => {
                let vs_attn = vs.pp("attentions");
                (0..num_layers)
                    .map(|i| {
                        SpatialTransformer::new(
                            vs_attn.pp(i.to_string()),
                            out_channels,
                            block.attention_head_dim,
                            depth,
                            config,
                        )
                    })
                    .collect::<Result<Vec<_>>>()?
            }
            None => Vec::new(),
        };
        let upsampler = if add_upsample {
            Some(Upsample2D::new(vs.pp("upsamplers").pp("0"), out_channels)?)
        } else {
            None
        };
        Ok(Self {
            resnets,
            attentions,
            upsampler,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        res_xs: &[Tensor],
        temb: &Tensor,
        upsample_size: Option<(usize, usize)>,
        context: &Tensor,
    ) -> Result<Tensor> {
        let mut xs = xs.clone();
        for (i, resnet) in self.resnets.iter().enumerate() {
            xs = Tensor::cat(&[&xs, &res_xs[res_xs.len() - i - 1]], 1)?.contiguous()?;
            xs = resnet.forward(&xs, Some(temb))?;
            if let Some(attn) = self.attentions.get(i) {
                xs = attn.forward(&xs, context)?;
            }
        }
        match &self.upsampler {
            Some(upsampler) => upsampler.forward(&xs, upsample_size),
            None => Ok(xs),
        }
    }
}

#[derive(Debug)]
pub struct UNet2DConditionModel {
    conv_in: nn::Conv2d,
    time_proj: Timesteps,
    time_embedding: TimestepEmbedding,
    down_blocks: Vec<DownBlock>,
    mid_block: MidBlock,
    up_blocks: Vec<UpBlock>,
    conv_norm_out: nn::GroupNorm,
    conv_out: nn::Conv2d,
}

impl UNet2DConditionModel {
    pub fn new(vs: nn::VarBuilder, in_channels: usize, out_channels: usize, config: &UNetConfig) -> Result<Self> {
        let n_blocks = config.blocks.len();
        if n_blocks == 0 {
            candle_core::bail!("UNet config has no blocks");
        }
        let b_channels = config.blocks[0].out_channels;
        let bl_channels = config.blocks[n_blocks - 1].out_channels;
        let time_embed_dim = b_channels * 4;
        let conv_cfg = nn::Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv_in = nn::conv2d(in_channels, b_channels, 3, conv_cfg, vs.pp("conv_in"))?;
        let time_proj = Timesteps::new(b_channels, config.flip_sin_to_cos, config.freq_shift);
        let time_embedding = TimestepEmbedding::new(vs.pp("time_embedding"), b_channels, time_embed_dim)?;

        let vs_db = vs.pp("down_blocks");
        let down_blocks = (0..n_blocks)
            .map(|i| {
                let in_channels = if i > 0 { config.blocks[i - 1].out_channels } else { b_channels };
                DownBlock::new(
                    vs_db.pp(i.to_string()),
                    in_channels,
                    config.blocks[i],
                    time_embed_dim,
                    i < n_blocks - 1,
                    config,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let mid_block = MidBlock::new(vs.pp("mid_block"), bl_channels, time_embed_dim, config)?;

        let vs_ub = vs.pp("up_blocks");
        let up_blocks = (0..n_blocks)
            .map(|i| {
                let prev_output_channels = if i > 0 { config.blocks[n_blocks - i].out_channels } else { bl_channels };
                let in_channels = {
                    let index = if i == n_blocks - 1 { 0 } else { n_blocks - i - 2 };
                    config.blocks[index].out_channels
                };
                UpBlock::new(
                    vs_ub.pp(i.to_string()),
                    in_channels,
                    prev_output_channels,
                    config.blocks[n_blocks - 1 - i],
                    time_embed_dim,
                    i < n_blocks - 1,
                    config,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let conv_norm_out = nn::group_norm(config.norm_num_groups, b_channels, config.norm_eps, vs.pp("conv_norm_out"))?;
        let conv_out = nn::conv2d(b_channels, out_channels, 3, conv_cfg, vs.pp("conv_out"))?;
        Ok(Self {
            conv_in,
            time_proj,
            time_embedding,
            down_blocks,
            mid_block,
            up_blocks,
            conv_norm_out,
            conv_out,
        })
    }

    /// `xs` `[B, C, H, W]`, `timesteps` `[B]`, `encoder_hidden_states` `[B, L, D]`.
    pub fn forward(&self, xs: &Tensor, timesteps: &Tensor, encoder_hidden_states: &Tensor) -> Result<Tensor> {
        let (_, _, height, width) = xs.dims4()?;
        let n_blocks = self.down_blocks.len();
        let overall_up_factor = 1usize << (n_blocks - 1);
        let forward_upsample_size = height % overall_up_factor != 0 || width % overall_up_factor != 0;

        // sinusoids in f32, the embedding MLP in the model dtype
        let emb = self.time_proj.forward(&timesteps.to_dtype(DType::F32)?)?;
        let emb = self.time_embedding.forward(&emb.to_dtype(xs.dtype())?)?;

        let xs = self.conv_in.forward(xs)?;
        let mut down_block_res_xs = vec![xs.clone()];
        let mut xs = xs;
        for block in &self.down_blocks {
            let (next, res_xs) = block.forward(&xs, &emb, encoder_hidden_states)?;
            down_block_res_xs.extend(res_xs);
            xs = next;
        }

        let mut xs = self.mid_block.forward(&xs, &emb, encoder_hidden_states)?;

        let mut upsample_size = None;
        for (i, block) in self.up_blocks.iter().enumerate() {
            let res_xs = down_block_res_xs.split_off(down_block_res_xs.len() - block.resnets.len());
            if i < n_blocks - 1 && forward_upsample_size {
                if let Some(last) = down_block_res_xs.last() {
                    let (_, _, h, w) = last.dims4()?;
                    upsample_size = Some((h, w));
                }
            }
            xs = block.forward(&xs, &res_xs, &emb, upsample_size, encoder_hidden_states)?;
        }

        let xs = nn::ops::silu(&self.conv_norm_out.forward(&xs)?)?;
        self.conv_out.forward(&xs)
    }
}
