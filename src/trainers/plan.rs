//! Trainable-parameter selection and per-module storage precision.
//!
//! Selection is by [`ParamRole`]: the token-embedding table is always
//! trained, plus a mode-dependent subset of the backbone's cross-attention
//! projections. Everything else is frozen.

use anyhow::{bail, Result};
use candle_core::{DType, Var};
use log::info;
use std::fmt;

use crate::models::{Component, ModelBundle, ParamRole, ParamStore};
use crate::trainers::config::{FinetuneType, FreezeModel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinetuneMode {
    /// Textual inversion
    EmbeddingOnly,
    /// Custom diffusion over query, key, value and output projections
    FullCrossAttention,
    /// Custom diffusion over key and value projections
    KeyValueCrossAttention,
}

impl FinetuneMode {
    pub fn from_config(finetune_type: FinetuneType, freeze_model: FreezeModel) -> Self {
        match (finetune_type, freeze_model) {
            (FinetuneType::Text, _) => Self::EmbeddingOnly,
            (FinetuneType::Custom, FreezeModel::CrossAttn) => Self::FullCrossAttention,
            (FinetuneType::Custom, FreezeModel::CrossAttnKv) => Self::KeyValueCrossAttention,
        }
    }

    /// Backbone roles trained in this mode.
    pub fn attention_roles(self) -> &'static [ParamRole] {
        match self {
            Self::EmbeddingOnly => &[],
            Self::FullCrossAttention => &[
                ParamRole::CrossAttnQuery,
                ParamRole::CrossAttnKey,
                ParamRole::CrossAttnValue,
                ParamRole::CrossAttnOut,
            ],
            Self::KeyValueCrossAttention => &[ParamRole::CrossAttnKey, ParamRole::CrossAttnValue],
        }
    }

    pub fn trains_backbone(self) -> bool {
        self != Self::EmbeddingOnly
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::EmbeddingOnly => "text",
            Self::FullCrossAttention => "custom-crossattn",
            Self::KeyValueCrossAttention => "custom-crossattn_kv",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::EmbeddingOnly),
            "custom-crossattn" => Some(Self::FullCrossAttention),
            "custom-crossattn_kv" => Some(Self::KeyValueCrossAttention),
            _ => None,
        }
    }
}

impl fmt::Display for FinetuneMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage dtype of every parameter once the plan is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionTable {
    pub trainable: DType,
    pub image_codec: DType,
    pub text_encoder: DType,
    pub backbone: DType,
}

impl PrecisionTable {
    pub fn for_mode(mode: FinetuneMode) -> Self {
        Self {
            trainable: DType::F32,
            image_codec: DType::F16,
            text_encoder: DType::F32,
            // the backbone computes in its storage dtype, so it stays full
            // precision while its attention weights train
            backbone: if mode.trains_backbone() { DType::F32 } else { DType::F16 },
        }
    }
}

/// How the training run treats every parameter, resolved once up front.
#[derive(Debug, Clone)]
pub struct TrainingPlan {
    pub mode: FinetuneMode,
    pub precision: PrecisionTable,
    pub embedding_key: String,
    pub attention_keys: Vec<String>,
}

/// Live variables the optimizer updates.
pub struct TrainableSet {
    pub embedding: Var,
    /// Cross-attention projections by parameter key, empty for textual inversion.
    pub attention: Vec<(String, Var)>,
}

impl TrainableSet {
    pub fn num_tensors(&self) -> usize {
        1 + self.attention.len()
    }

    pub fn num_elements(&self) -> usize {
        self.embedding.elem_count() + self.attention.iter().map(|(_, v)| v.elem_count()).sum::<usize>()
    }
}

fn freeze_all(params: &mut ParamStore, keep: &[String], dtype: DType) -> Result<()> {
    let keys: Vec<String> = params
        .iter()
        .filter(|(k, p)| p.tensor().dtype().is_float() && !keep.iter().any(|kk| kk == k))
        .map(|(k, _)| k.to_string())
        .collect();
    for key in keys {
        params.freeze(&key, dtype)?;
    }
    Ok(())
}

impl TrainingPlan {
    pub fn resolve(mode: FinetuneMode, text_params: &ParamStore, backbone_params: &ParamStore) -> Result<Self> {
        let embedding_key = text_params.unique_key(ParamRole::TokenEmbedding)?;
        let attention_keys: Vec<String> = mode
            .attention_roles()
            .iter()
            .flat_map(|&role| backbone_params.keys_with_role(role))
            .collect();
        if mode.trains_backbone() && attention_keys.is_empty() {
            bail!("backbone has no cross-attention parameters to train in {} mode", mode);
        }
        Ok(Self {
            mode,
            precision: PrecisionTable::for_mode(mode),
            embedding_key,
            attention_keys,
        })
    }

    /// Convert selected entries into F32 variables and freeze the rest at
    /// their module's dtype, then rebuild the components.
    pub fn apply(&self, models: &mut ModelBundle) -> Result<TrainableSet> {
        let text = models.text_encoder.params_mut();
        freeze_all(text, std::slice::from_ref(&self.embedding_key), self.precision.text_encoder)?;
        let embedding = text.make_trainable(&self.embedding_key)?;

        freeze_all(models.image_codec.params_mut(), &[], self.precision.image_codec)?;

        let backbone = models.backbone.params_mut();
        freeze_all(backbone, &self.attention_keys, self.precision.backbone)?;
        let mut attention = Vec::with_capacity(self.attention_keys.len());
        for key in &self.attention_keys {
            attention.push((key.clone(), backbone.make_trainable(key)?));
        }

        models.text_encoder.refresh()?;
        models.image_codec.refresh()?;
        models.backbone.refresh()?;

        let set = TrainableSet { embedding, attention };
        info!(
            "Training plan {}: {} trainable tensors ({} elements), backbone {:?}, codec {:?}",
            self.mode,
            set.num_tensors(),
            set.num_elements(),
            self.precision.backbone,
            self.precision.image_codec
        );
        Ok(set)
    }
}
