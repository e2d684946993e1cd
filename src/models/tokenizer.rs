//! Tokenizer contract plus the CLIP tokenizer adapter.

use anyhow::{Context, Error as E, Result};
use std::path::Path;
use tokenizers::{AddedToken, Tokenizer};

/// The tokenizer surface the trainer needs: lookup, growth and encoding.
pub trait Vocabulary {
    /// Number of ids in use, including added tokens.
    fn vocab_size(&self) -> usize;
    fn token_to_id(&self, token: &str) -> Option<u32>;
    /// Register `token` as one atomic entry and return its id.
    fn add_token(&mut self, token: &str) -> Result<u32>;
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>>;
    /// Fixed sequence length every prompt is padded to.
    fn max_length(&self) -> usize;
    fn pad_id(&self) -> u32;

    /// Encode with special tokens, truncate to [`Self::max_length`] and pad.
    fn encode_padded(&self, text: &str) -> Result<Vec<u32>> {
        let mut ids = self.encode(text, true)?;
        let max_length = self.max_length();
        ids.truncate(max_length);
        ids.resize(max_length, self.pad_id());
        Ok(ids)
    }
}

/// `tokenizers` tokenizer loaded from a `tokenizer.json`.
pub struct ClipTokenizer {
    inner: Tokenizer,
    max_length: usize,
    pad_id: u32,
}

impl ClipTokenizer {
    pub fn from_file(path: &Path, max_length: usize) -> Result<Self> {
        let inner = Tokenizer::from_file(path)
            .map_err(E::msg)
            .with_context(|| format!("Failed to load tokenizer: {}", path.display()))?;
        let pad_id = match inner.get_padding() {
            Some(padding) => padding.pad_id,
            None => inner
                .token_to_id("<|endoftext|>")
                .context("tokenizer has neither padding config nor <|endoftext|>")?,
        };
        Ok(Self {
            inner,
            max_length,
            pad_id,
        })
    }

    /// Pad with `token` instead of the default (SD 2.x pads with `!`).
    pub fn with_pad_token(mut self, token: &str) -> Result<Self> {
        self.pad_id = self
            .inner
            .token_to_id(token)
            .with_context(|| format!("pad token {} not in vocabulary", token))?;
        Ok(self)
    }
}

impl Vocabulary for ClipTokenizer {
    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }

    fn add_token(&mut self, token: &str) -> Result<u32> {
        self.inner.add_tokens(&[AddedToken::from(token, false)]);
        self.inner
            .token_to_id(token)
            .with_context(|| format!("tokenizer refused to add {}", token))
    }

    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        Ok(self
            .inner
            .encode(text, add_special_tokens)
            .map_err(E::msg)?
            .get_ids()
            .to_vec())
    }

    fn max_length(&self) -> usize {
        self.max_length
    }

    fn pad_id(&self) -> u32 {
        self.pad_id
    }
}
