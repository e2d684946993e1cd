//! Run configuration: CLI flags, YAML file form, and concept bindings.

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinetuneType {
    /// Textual inversion: only the new embeddings are learned
    Text,
    /// Custom diffusion: embeddings plus UNet cross-attention
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum FreezeModel {
    /// Train query, key, value and output projections of cross-attention
    #[value(name = "crossattn")]
    #[serde(rename = "crossattn")]
    CrossAttn,
    /// Train only key and value projections of cross-attention
    #[value(name = "crossattn_kv")]
    #[serde(rename = "crossattn_kv")]
    CrossAttnKv,
}

impl FreezeModel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CrossAttn => "crossattn",
            Self::CrossAttnKv => "crossattn_kv",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum ModelVariant {
    #[value(name = "12")]
    #[serde(rename = "12")]
    V12,
    #[value(name = "14")]
    #[serde(rename = "14")]
    V14,
    #[value(name = "15")]
    #[serde(rename = "15")]
    V15,
    #[value(name = "21")]
    #[serde(rename = "21")]
    V21,
    #[value(name = "21v")]
    #[serde(rename = "21v")]
    V21v,
}

impl ModelVariant {
    pub fn id(self) -> &'static str {
        match self {
            Self::V12 => "12",
            Self::V14 => "14",
            Self::V15 => "15",
            Self::V21 => "21",
            Self::V21v => "21v",
        }
    }

    pub fn is_v2(self) -> bool {
        matches!(self, Self::V21 | Self::V21v)
    }

    /// Directory under the main models dir holding this family.
    pub fn family_dir(self) -> &'static str {
        match self {
            Self::V21v => "v2v",
            Self::V21 => "v2",
            _ => "v1",
        }
    }
}

/// Fine-tune a diffusion model on new concepts
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(author, version, about, long_about = None)]
#[serde(default)]
pub struct TrainConfig {
    /// Load the whole run configuration from a YAML file instead of flags
    #[arg(long, value_name = "FILE")]
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// Textual Inversion or Custom Diffusion
    #[arg(long = "type", value_enum, default_value = "custom")]
    #[serde(rename = "type")]
    pub finetune_type: FinetuneType,

    /// Special word(s) to invoke the embedding, separated by '+'
    #[arg(short = 't', long)]
    pub token: Option<String>,

    /// Generic word(s) associated with that object or style, separated by '+'
    #[arg(long)]
    pub term: Option<String>,

    /// Folder(s) containing target images, separated by '+'
    #[arg(long)]
    pub data: Option<String>,

    /// Folder(s) containing generic class images (priors for the new tokens)
    #[arg(long = "term_data")]
    pub term_data: Option<String>,

    /// Learn a style rather than an object
    #[arg(long, alias = "st")]
    pub style: bool,

    #[arg(short = 'm', long, value_enum, default_value = "15")]
    pub model: ModelVariant,

    /// Main SD models directory
    #[arg(long, alias = "md", default_value = "./models")]
    pub maindir: PathBuf,

    /// Delta checkpoint to resume from
    #[arg(short = 'r', long = "delta_ckpt")]
    pub delta_ckpt: Option<PathBuf>,

    /// Output directory
    #[arg(short = 'o', long = "out_dir", default_value = "train")]
    pub out_dir: PathBuf,

    /// Batch size for the training data loader
    #[arg(short = 'b', long = "batch_size", default_value_t = 1)]
    pub batch_size: usize,

    /// Number of training steps
    #[arg(long = "train_steps", alias = "ts", default_value_t = 2000)]
    pub train_steps: usize,

    /// How often to save checkpoints and samples
    #[arg(long = "save_step", default_value_t = 500)]
    pub save_step: usize,

    /// Gradient checkpointing: less memory, slower training
    #[arg(long = "low_mem", alias = "lo")]
    pub low_mem: bool,

    /// Which cross-attention projections custom diffusion trains
    #[arg(long = "freeze_model", value_enum, default_value = "crossattn_kv")]
    pub freeze_model: FreezeModel,

    /// Initial learning rate (1e-3 .. 5e-4 suits textual inversion)
    #[arg(long, default_value_t = 1e-5)]
    pub lr: f64,

    /// Scale learning rate by batch size (and by 2 with priors)
    #[arg(long = "scale_lr", default_value_t = true, action = ArgAction::Set)]
    pub scale_lr: bool,

    /// Seed for reproducible training and samples
    #[arg(short = 'S', long)]
    pub seed: Option<u64>,

    /// Denoising steps for periodic samples
    #[arg(long = "sample_steps", default_value_t = 50)]
    pub sample_steps: usize,

    /// Classifier-free guidance scale for periodic samples
    #[arg(long = "guidance_scale", default_value_t = 7.5)]
    pub guidance_scale: f64,

    /// AdamW weight decay for attention weights (embeddings never decay)
    #[arg(long = "weight_decay", default_value_t = 0.01)]
    pub weight_decay: f64,

    /// Skip the update when the loss is NaN or infinite
    #[arg(long = "skip_nonfinite", default_value_t = true, action = ArgAction::Set)]
    pub skip_nonfinite: bool,

    /// Run on CPU even when a GPU is available
    #[arg(long)]
    pub cpu: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            config: None,
            finetune_type: FinetuneType::Custom,
            token: None,
            term: None,
            data: None,
            term_data: None,
            style: false,
            model: ModelVariant::V15,
            maindir: PathBuf::from("./models"),
            delta_ckpt: None,
            out_dir: PathBuf::from("train"),
            batch_size: 1,
            train_steps: 2000,
            save_step: 500,
            low_mem: false,
            freeze_model: FreezeModel::CrossAttnKv,
            lr: 1e-5,
            scale_lr: true,
            seed: None,
            sample_steps: 50,
            guidance_scale: 7.5,
            weight_decay: 0.01,
            skip_nonfinite: true,
            cpu: false,
        }
    }
}

/// One concept to learn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConceptBinding {
    /// Bare token name as given on the command line, e.g. `cat`
    pub name: String,
    /// Vocabulary entry, e.g. `<cat>`
    pub modifier_token: String,
    pub anchor_term: String,
    pub data_dir: PathBuf,
    pub prior_dir: Option<PathBuf>,
}

impl ConceptBinding {
    pub fn instance_caption(&self) -> String {
        format!("{} {}", self.modifier_token, self.anchor_term)
    }

    pub fn sample_prompt(&self) -> String {
        format!("photo of {} {}", self.modifier_token, self.anchor_term)
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split('+').map(|p| p.trim().to_string()).collect()
}

impl TrainConfig {
    /// Numeric sanity checks on the run shape.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Zero("batch_size"));
        }
        if self.train_steps == 0 {
            return Err(ConfigError::Zero("train_steps"));
        }
        if self.save_step == 0 {
            return Err(ConfigError::Zero("save_step"));
        }
        Ok(())
    }

    /// Priors are used only when both generic terms and their folders are given.
    pub fn with_prior(&self) -> bool {
        self.term_data.is_some() && self.term.is_some()
    }

    /// Parse the parallel `+`-joined lists into bindings.
    pub fn concept_bindings(&self) -> Result<Vec<ConceptBinding>, ConfigError> {
        let tokens = split_list(self.token.as_deref().ok_or(ConfigError::Missing("token"))?);
        let terms = split_list(self.term.as_deref().ok_or(ConfigError::Missing("term"))?);
        let data = split_list(self.data.as_deref().ok_or(ConfigError::Missing("data"))?);
        if tokens.len() != terms.len() || tokens.len() != data.len() {
            return Err(ConfigError::CountMismatch {
                tokens: tokens.len(),
                terms: terms.len(),
                data: data.len(),
            });
        }

        let priors = match (&self.term_data, self.with_prior()) {
            (Some(term_data), true) => {
                let priors = split_list(term_data);
                if priors.len() != tokens.len() {
                    return Err(ConfigError::PriorCountMismatch {
                        tokens: tokens.len(),
                        priors: priors.len(),
                    });
                }
                priors.into_iter().map(|p| Some(PathBuf::from(p))).collect()
            }
            _ => vec![None; tokens.len()],
        };

        let mut bindings: Vec<ConceptBinding> = Vec::with_capacity(tokens.len());
        for (((name, term), dir), prior) in tokens.into_iter().zip(terms).zip(data).zip(priors) {
            let modifier_token = format!("<{}>", name);
            if bindings.iter().any(|b| b.modifier_token == modifier_token) {
                return Err(ConfigError::DuplicateToken(modifier_token));
            }
            bindings.push(ConceptBinding {
                name,
                modifier_token,
                anchor_term: term,
                data_dir: PathBuf::from(dir),
                prior_dir: prior,
            });
        }
        Ok(bindings)
    }

    /// Label used in checkpoint file names: the raw token list.
    pub fn token_label(&self) -> String {
        self.token.clone().unwrap_or_default()
    }
}

pub fn load_config(path: &Path) -> Result<TrainConfig> {
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: TrainConfig =
        serde_yaml::from_str(&config_str).with_context(|| "Failed to parse YAML config")?;

    Ok(config)
}

/// Write the run configuration next to the training artifacts.
pub fn save_config(config: &TrainConfig, out_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create output dir: {}", out_dir.display()))?;
    let path = out_dir.join("config.yaml");
    fs::write(&path, serde_yaml::to_string(config)?)
        .with_context(|| format!("Failed to write config: {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(token: &str, term: &str, data: &str) -> TrainConfig {
        TrainConfig {
            token: Some(token.into()),
            term: Some(term.into()),
            data: Some(data.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_bindings_parse_parallel_lists() {
        let bindings = config("cat+toy", "cat+toy", "a+b").concept_bindings().unwrap();
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].modifier_token, "<cat>");
        assert_eq!(bindings[1].data_dir, PathBuf::from("b"));
        assert_eq!(bindings[1].instance_caption(), "<toy> toy");
        assert!(bindings.iter().all(|b| b.prior_dir.is_none()));
    }

    #[test]
    fn test_mismatched_counts_fail() {
        let err = config("cat+toy", "cat", "a+b").concept_bindings().unwrap_err();
        assert_eq!(err, ConfigError::CountMismatch { tokens: 2, terms: 1, data: 2 });
        let err = config("cat", "cat", "a+b").concept_bindings().unwrap_err();
        assert!(matches!(err, ConfigError::CountMismatch { .. }));
    }

    #[test]
    fn test_prior_count_must_match() {
        let mut c = config("cat+toy", "cat+toy", "a+b");
        c.term_data = Some("p".into());
        assert_eq!(
            c.concept_bindings().unwrap_err(),
            ConfigError::PriorCountMismatch { tokens: 2, priors: 1 }
        );
        c.term_data = Some("p+q".into());
        let bindings = c.concept_bindings().unwrap();
        assert_eq!(bindings[1].prior_dir, Some(PathBuf::from("q")));
    }

    #[test]
    fn test_duplicate_and_missing() {
        assert_eq!(
            config("cat+cat", "a+b", "x+y").concept_bindings().unwrap_err(),
            ConfigError::DuplicateToken("<cat>".into())
        );
        let c = TrainConfig::default();
        assert_eq!(c.concept_bindings().unwrap_err(), ConfigError::Missing("token"));
    }

    #[test]
    fn test_cli_defaults_match_yaml_defaults() {
        let cli = TrainConfig::parse_from(["trainer", "-t", "cat", "--term", "cat", "--data", "d"]);
        assert_eq!(cli.freeze_model, FreezeModel::CrossAttnKv);
        assert_eq!(cli.model, ModelVariant::V15);
        assert!(cli.scale_lr);
        assert_eq!(cli.train_steps, TrainConfig::default().train_steps);

        let cli = TrainConfig::parse_from(["trainer", "--type", "text", "--scale_lr", "false", "-m", "21v"]);
        assert_eq!(cli.finetune_type, FinetuneType::Text);
        assert!(!cli.scale_lr);
        assert_eq!(cli.model.family_dir(), "v2v");
    }

    #[test]
    fn test_abbreviated_long_flags() {
        let cli = TrainConfig::parse_from([
            "trainer", "--st", "--md", "/sd", "--ts", "7", "--lo", "--lr", "0.5",
        ]);
        assert!(cli.style);
        assert_eq!(cli.maindir, PathBuf::from("/sd"));
        assert_eq!(cli.train_steps, 7);
        assert!(cli.low_mem);
        assert_eq!(cli.lr, 0.5);
    }

    #[test]
    fn test_yaml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = config("cat", "cat", "d");
        c.freeze_model = FreezeModel::CrossAttn;
        c.seed = Some(3);
        let path = save_config(&c, dir.path()).unwrap();
        let back = load_config(&path).unwrap();
        assert_eq!(back.freeze_model, FreezeModel::CrossAttn);
        assert_eq!(back.seed, Some(3));
        assert_eq!(back.token.as_deref(), Some("cat"));

        let partial: TrainConfig = serde_yaml::from_str("type: text\ntrain_steps: 7\n").unwrap();
        assert_eq!(partial.finetune_type, FinetuneType::Text);
        assert_eq!(partial.train_steps, 7);
        assert_eq!(partial.save_step, 500);
    }
}
