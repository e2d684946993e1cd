//! Safetensors checkpoints of learned embeddings and attention deltas.
//!
//! Two layouts share one file format:
//! - `embeddings`: one 1-D F32 tensor per modifier token, keyed by the token.
//! - `custom-delta`: `embeddings.<token>` tensors plus `delta.<param key>`
//!   tensors holding `trained - pretrained` for every trained projection.
//!
//! Metadata records the layout, fine-tuning mode, token list and step.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use log::info;
use safetensors::tensor::TensorView;
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::CheckpointError;
use crate::models::{ModelSource, ParamRole, ParamStore, Vocabulary};
use crate::trainers::plan::{FinetuneMode, TrainingPlan};
use crate::trainers::vocab::{overwrite_rows, resize_token_embeddings};

const EMBEDDING_PREFIX: &str = "embeddings.";
const DELTA_PREFIX: &str = "delta.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    Embeddings,
    CustomDelta,
}

impl CheckpointFormat {
    pub fn for_mode(mode: FinetuneMode) -> Self {
        if mode.trains_backbone() {
            Self::CustomDelta
        } else {
            Self::Embeddings
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Embeddings => "embeddings",
            Self::CustomDelta => "custom-delta",
        }
    }

    fn parse(s: &str) -> Result<Self, CheckpointError> {
        match s {
            "embeddings" => Ok(Self::Embeddings),
            "custom-delta" => Ok(Self::CustomDelta),
            other => Err(CheckpointError::UnknownFormat(other.to_string())),
        }
    }
}

/// `<out>/<label>-<step:04>.safetensors`, or `<out>/<label>.safetensors` for
/// the final checkpoint.
pub fn checkpoint_path(out_dir: &Path, label: &str, step: Option<usize>) -> PathBuf {
    match step {
        Some(step) => out_dir.join(format!("{}-{:04}.safetensors", label, step)),
        None => out_dir.join(format!("{}.safetensors", label)),
    }
}

/// Untouched pretrained values of the planned attention keys, the base that
/// deltas are measured against. `None` for textual inversion.
pub fn delta_reference(source: &dyn ModelSource, plan: &TrainingPlan) -> Result<Option<ParamStore>> {
    if !plan.mode.trains_backbone() {
        return Ok(None);
    }
    let pretrained = source
        .load_backbone_params(DType::F16)
        .context("Failed to load pretrained backbone for delta reference")?;
    Ok(Some(pretrained.snapshot(&plan.attention_keys, DType::F16)?))
}

#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub format: CheckpointFormat,
    pub mode: FinetuneMode,
    pub step: usize,
    /// Modifier token and its `[dim]` F32 embedding, in binding order
    pub embeddings: Vec<(String, Tensor)>,
    /// Backbone parameter key and its F32 `trained - pretrained` difference
    pub deltas: Vec<(String, Tensor)>,
}

impl Checkpoint {
    /// Snapshot the learned state.
    pub fn capture(
        plan: &TrainingPlan,
        tokens: &[(String, u32)],
        text_params: &ParamStore,
        backbone_params: &ParamStore,
        reference: Option<&ParamStore>,
        step: usize,
    ) -> Result<Self> {
        let table = text_params.get(&plan.embedding_key)?;
        let mut embeddings = Vec::with_capacity(tokens.len());
        for (token, id) in tokens {
            let row = table.get(*id as usize)?.to_dtype(DType::F32)?.detach();
            embeddings.push((token.clone(), row));
        }

        let format = CheckpointFormat::for_mode(plan.mode);
        let mut deltas = Vec::new();
        if format == CheckpointFormat::CustomDelta {
            let reference = reference.context("custom checkpoint needs the pretrained reference weights")?;
            for key in &plan.attention_keys {
                let trained = backbone_params.get(key)?.to_dtype(DType::F32)?;
                let pretrained = reference.get(key)?.to_dtype(DType::F32)?;
                deltas.push((key.clone(), (trained - pretrained)?.detach()));
            }
        }

        Ok(Self {
            format,
            mode: plan.mode,
            step,
            embeddings,
            deltas,
        })
    }

    fn tensor_name(&self, token: &str) -> String {
        match self.format {
            CheckpointFormat::Embeddings => token.to_string(),
            CheckpointFormat::CustomDelta => format!("{}{}", EMBEDDING_PREFIX, token),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Collect bytes first so every TensorView can borrow them.
        let mut tensor_data = Vec::new();
        let mut tensor_info = Vec::new();
        let named = self
            .embeddings
            .iter()
            .map(|(token, t)| (self.tensor_name(token), t))
            .chain(self.deltas.iter().map(|(key, t)| (format!("{}{}", DELTA_PREFIX, key), t)));
        for (name, tensor) in named {
            tensor_info.push((name, tensor.dims().to_vec(), tensor_data.len()));
            tensor_data.push(tensor_to_bytes(tensor)?);
        }

        let mut tensors = HashMap::new();
        for (name, shape, idx) in tensor_info {
            tensors.insert(name, TensorView::new(safetensors::Dtype::F32, shape, &tensor_data[idx])?);
        }

        let tokens: Vec<&str> = self.embeddings.iter().map(|(t, _)| t.as_str()).collect();
        let mut metadata = HashMap::new();
        metadata.insert("format".to_string(), self.format.as_str().to_string());
        metadata.insert("finetune_mode".to_string(), self.mode.as_str().to_string());
        metadata.insert("tokens".to_string(), serde_json::to_string(&tokens)?);
        metadata.insert("step".to_string(), self.step.to_string());

        safetensors::serialize_to_file(&tensors, &Some(metadata), path)
            .with_context(|| format!("Failed to write checkpoint: {}", path.display()))?;
        info!("Saved checkpoint to {}", path.display());
        Ok(())
    }

    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let buffer = fs::read(path).with_context(|| format!("Failed to read checkpoint: {}", path.display()))?;
        let (_, header) = SafeTensors::read_metadata(&buffer)
            .with_context(|| format!("Failed to parse checkpoint header: {}", path.display()))?;
        let metadata = header.metadata().clone().ok_or(CheckpointError::NoMetadata)?;
        let format = CheckpointFormat::parse(metadata.get("format").ok_or(CheckpointError::NoMetadata)?)?;
        let mode = match metadata.get("finetune_mode") {
            Some(m) => FinetuneMode::parse(m).ok_or_else(|| CheckpointError::UnknownFormat(m.clone()))?,
            None => match format {
                CheckpointFormat::Embeddings => FinetuneMode::EmbeddingOnly,
                CheckpointFormat::CustomDelta => FinetuneMode::KeyValueCrossAttention,
            },
        };
        let step = metadata.get("step").and_then(|s| s.parse().ok()).unwrap_or(0);
        let order: Vec<String> = match metadata.get("tokens") {
            Some(t) => serde_json::from_str(t).context("Failed to parse checkpoint token list")?,
            None => Vec::new(),
        };

        let tensors = candle_core::safetensors::load_buffer(&buffer, device)?;
        let mut embeddings = Vec::new();
        let mut deltas = Vec::new();
        for (name, tensor) in tensors {
            let tensor = tensor.to_dtype(DType::F32)?;
            let token = match format {
                CheckpointFormat::Embeddings => Some(name.clone()),
                CheckpointFormat::CustomDelta => name.strip_prefix(EMBEDDING_PREFIX).map(str::to_string),
            };
            if let Some(token) = token {
                if tensor.rank() != 1 {
                    return Err(CheckpointError::BadShape {
                        name,
                        got: tensor.dims().to_vec(),
                        expected: "[dim]".to_string(),
                    }
                    .into());
                }
                embeddings.push((token, tensor));
            } else if let Some(key) = name.strip_prefix(DELTA_PREFIX) {
                deltas.push((key.to_string(), tensor));
            } else {
                return Err(CheckpointError::UnknownParam(name).into());
            }
        }

        embeddings.sort_by_key(|(token, _)| order.iter().position(|o| o == token).unwrap_or(usize::MAX));
        deltas.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(Self {
            format,
            mode,
            step,
            embeddings,
            deltas,
        })
    }

    /// Write the checkpoint into live parameters: register missing tokens,
    /// set their embedding rows and add each delta to its pretrained weight.
    ///
    /// Returns the token ids written, in checkpoint order.
    pub fn apply(
        &self,
        tokenizer: &mut dyn Vocabulary,
        text_params: &mut ParamStore,
        backbone_params: &mut ParamStore,
    ) -> Result<Vec<(String, u32)>> {
        let mut ids = Vec::with_capacity(self.embeddings.len());
        for (token, _) in &self.embeddings {
            let id = match tokenizer.token_to_id(token) {
                Some(id) => id,
                None => tokenizer.add_token(token)?,
            };
            ids.push((token.clone(), id));
        }

        if !ids.is_empty() {
            resize_token_embeddings(text_params, tokenizer.vocab_size())?;
            let key = text_params.unique_key(ParamRole::TokenEmbedding)?;
            let table = text_params.get(&key)?;
            let dim = table.dim(1)?;
            let mut rows = Vec::with_capacity(self.embeddings.len());
            for (token, row) in &self.embeddings {
                if row.dims() != [dim] {
                    return Err(CheckpointError::BadShape {
                        name: token.clone(),
                        got: row.dims().to_vec(),
                        expected: format!("[{}]", dim),
                    }
                    .into());
                }
                rows.push(row.unsqueeze(0)?);
            }
            let rows = Tensor::cat(&rows, 0)?.to_device(table.device())?;
            let row_ids: Vec<u32> = ids.iter().map(|(_, id)| *id).collect();
            text_params.replace(&key, overwrite_rows(&table, &row_ids, &rows)?)?;
        }

        for (key, delta) in &self.deltas {
            let current = backbone_params
                .get(key)
                .map_err(|_| CheckpointError::UnknownParam(key.clone()))?;
            if current.dims() != delta.dims() {
                return Err(CheckpointError::BadShape {
                    name: format!("{}{}", DELTA_PREFIX, key),
                    got: delta.dims().to_vec(),
                    expected: format!("{:?}", current.dims()),
                }
                .into());
            }
            let updated = (current.to_dtype(DType::F32)? + delta.to_device(current.device())?)?;
            backbone_params.replace(key, updated)?;
        }

        info!(
            "Applied {} checkpoint (step {}): {} embeddings, {} deltas",
            self.format.as_str(),
            self.step,
            self.embeddings.len(),
            self.deltas.len()
        );
        Ok(ids)
    }
}

fn tensor_to_bytes(tensor: &Tensor) -> Result<Vec<u8>> {
    let data = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    Ok(bytemuck::cast_slice::<f32, u8>(&data).to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tiny::{TinyConfig, TinySource, TinyTextEncoder, WordTokenizer};
    use crate::models::{Component, ModelBundle};

    fn load() -> (ModelBundle, TinySource) {
        let source = TinySource::new(TinyConfig::default());
        (source.load().unwrap(), source)
    }

    #[test]
    fn test_paths() {
        let out = Path::new("train");
        assert_eq!(checkpoint_path(out, "cat+toy", Some(50)), PathBuf::from("train/cat+toy-0050.safetensors"));
        assert_eq!(checkpoint_path(out, "cat", None), PathBuf::from("train/cat.safetensors"));
    }

    #[test]
    fn test_embedding_checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (m, _) = load();
        let plan = TrainingPlan::resolve(FinetuneMode::EmbeddingOnly, m.text_encoder.params(), m.backbone.params())
            .unwrap();
        let ckpt = Checkpoint::capture(
            &plan,
            &[("<cat>".into(), 3), ("<toy>".into(), 5)],
            m.text_encoder.params(),
            m.backbone.params(),
            None,
            12,
        )
        .unwrap();
        let path = dir.path().join("cat.safetensors");
        ckpt.save(&path).unwrap();

        let back = Checkpoint::load(&path, &Device::Cpu).unwrap();
        assert_eq!(back.format, CheckpointFormat::Embeddings);
        assert_eq!(back.step, 12);
        let tokens: Vec<&str> = back.embeddings.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(tokens, vec!["<cat>", "<toy>"]);
        assert!(back.deltas.is_empty());

        // raw layout: key is the token itself
        let raw = candle_core::safetensors::load(&path, &Device::Cpu).unwrap();
        assert_eq!(raw["<cat>"].dims(), &[8]);

        let mut tok = WordTokenizer::new(&["cat"], 8);
        let (mut fresh, _) = load();
        let ids = back.apply(&mut tok, fresh.text_encoder.params_mut(), fresh.backbone.params_mut()).unwrap();
        assert_eq!(ids.len(), 2);
        let table = fresh.text_encoder.params().get(TinyTextEncoder::TOKEN_EMBEDDING).unwrap();
        let row: Vec<f32> = table.get(ids[1].1 as usize).unwrap().to_vec1().unwrap();
        let expected: Vec<f32> = m
            .text_encoder
            .params()
            .get(TinyTextEncoder::TOKEN_EMBEDDING)
            .unwrap()
            .get(5)
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(row, expected);
    }

    #[test]
    fn test_delta_is_relative_to_reference() {
        let dir = tempfile::tempdir().unwrap();
        let (mut m, source) = load();
        let plan = TrainingPlan::resolve(
            FinetuneMode::KeyValueCrossAttention,
            m.text_encoder.params(),
            m.backbone.params(),
        )
        .unwrap();
        let reference = delta_reference(&source, &plan).unwrap().unwrap();
        assert_eq!(reference.len(), 2);

        plan.apply(&mut m).unwrap();
        let key = "attn2.to_k.weight";
        let trained = (m.backbone.params().get(key).unwrap() + 0.25).unwrap();
        m.backbone.params_mut().replace(key, trained).unwrap();

        let ckpt = Checkpoint::capture(
            &plan,
            &[("<cat>".into(), 3)],
            m.text_encoder.params(),
            m.backbone.params(),
            Some(&reference),
            1,
        )
        .unwrap();
        let path = dir.path().join("cat-0001.safetensors");
        ckpt.save(&path).unwrap();
        let back = Checkpoint::load(&path, &Device::Cpu).unwrap();
        assert_eq!(back.format, CheckpointFormat::CustomDelta);
        assert_eq!(back.mode, FinetuneMode::KeyValueCrossAttention);
        let delta = &back.deltas.iter().find(|(k, _)| k == key).unwrap().1;
        let mean: f32 = delta.mean_all().unwrap().to_scalar().unwrap();
        assert!((mean - 0.25).abs() < 1e-2, "{mean}");
    }

    #[test]
    fn test_malformed_checkpoints_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let dev = Device::Cpu;

        let no_meta = dir.path().join("plain.safetensors");
        let t = Tensor::zeros(4, DType::F32, &dev).unwrap();
        candle_core::safetensors::save(&HashMap::from([("<cat>".to_string(), t.clone())]), &no_meta).unwrap();
        let err = Checkpoint::load(&no_meta, &dev).unwrap_err();
        assert!(matches!(err.downcast_ref::<CheckpointError>(), Some(CheckpointError::NoMetadata)));

        let bad_rank = dir.path().join("bad.safetensors");
        let ckpt = Checkpoint {
            format: CheckpointFormat::Embeddings,
            mode: FinetuneMode::EmbeddingOnly,
            step: 0,
            embeddings: vec![("<cat>".into(), Tensor::zeros((2, 2), DType::F32, &dev).unwrap())],
            deltas: vec![],
        };
        ckpt.save(&bad_rank).unwrap();
        let err = Checkpoint::load(&bad_rank, &dev).unwrap_err();
        assert!(matches!(err.downcast_ref::<CheckpointError>(), Some(CheckpointError::BadShape { .. })));

        let wrong_delta = Checkpoint {
            format: CheckpointFormat::CustomDelta,
            mode: FinetuneMode::FullCrossAttention,
            step: 0,
            embeddings: vec![],
            deltas: vec![("attn2.to_k.weight".into(), Tensor::zeros((3, 3), DType::F32, &dev).unwrap())],
        };
        let (mut m, _) = load();
        let mut tok = WordTokenizer::new(&[], 8);
        let err = wrong_delta
            .apply(&mut tok, m.text_encoder.params_mut(), m.backbone.params_mut())
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<CheckpointError>(), Some(CheckpointError::BadShape { .. })));
    }
}
