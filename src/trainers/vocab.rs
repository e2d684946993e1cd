//! Vocabulary extension: register modifier tokens and seed their embedding
//! rows from the anchor terms.

use anyhow::{bail, Result};
use candle_core::{Tensor, D};
use log::info;

use crate::error::ConfigError;
use crate::models::{ParamRole, ParamStore, Vocabulary};
use crate::trainers::config::ConceptBinding;

/// Ids of one learned token and the term it starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenPair {
    pub new_id: u32,
    pub anchor_id: u32,
}

/// Add every binding's modifier token and initialise its row to the anchor's.
///
/// Nothing is mutated unless all bindings validate.
pub fn extend_vocabulary(
    tokenizer: &mut dyn Vocabulary,
    text_params: &mut ParamStore,
    bindings: &[ConceptBinding],
) -> Result<Vec<TokenPair>> {
    let mut anchors = Vec::with_capacity(bindings.len());
    for (i, binding) in bindings.iter().enumerate() {
        if bindings[..i].iter().any(|b| b.modifier_token == binding.modifier_token) {
            return Err(ConfigError::DuplicateToken(binding.modifier_token.clone()).into());
        }
        if tokenizer.token_to_id(&binding.modifier_token).is_some() {
            return Err(ConfigError::TokenExists(binding.modifier_token.clone()).into());
        }
        let ids = tokenizer.encode(&binding.anchor_term, false)?;
        match ids.first() {
            Some(&id) => anchors.push(id),
            None => return Err(ConfigError::EmptyAnchor(binding.anchor_term.clone()).into()),
        }
    }

    let mut pairs = Vec::with_capacity(bindings.len());
    for (binding, anchor_id) in bindings.iter().zip(anchors) {
        let new_id = tokenizer.add_token(&binding.modifier_token)?;
        pairs.push(TokenPair { new_id, anchor_id });
    }

    resize_token_embeddings(text_params, tokenizer.vocab_size())?;
    let key = text_params.unique_key(ParamRole::TokenEmbedding)?;
    let table = text_params.get(&key)?;
    let ids: Vec<u32> = pairs.iter().map(|p| p.new_id).collect();
    let anchor_ids: Vec<u32> = pairs.iter().map(|p| p.anchor_id).collect();
    let anchor_ids = Tensor::from_vec(anchor_ids, pairs.len(), table.device())?;
    let rows = table.index_select(&anchor_ids, 0)?;
    text_params.replace(&key, overwrite_rows(&table, &ids, &rows)?)?;

    for (binding, pair) in bindings.iter().zip(&pairs) {
        info!(
            "Added token {} (id {}) initialised from '{}' (id {})",
            binding.modifier_token, pair.new_id, binding.anchor_term, pair.anchor_id
        );
    }
    Ok(pairs)
}

/// Grow the token-embedding table to `vocab_size` rows, appending zero rows.
/// A table that is already large enough is left alone.
pub fn resize_token_embeddings(text_params: &mut ParamStore, vocab_size: usize) -> Result<()> {
    let key = text_params.unique_key(ParamRole::TokenEmbedding)?;
    let table = text_params.get(&key)?;
    let (rows, dim) = table.dims2()?;
    if vocab_size <= rows {
        return Ok(());
    }
    let pad = Tensor::zeros((vocab_size - rows, dim), table.dtype(), table.device())?;
    let grown = Tensor::cat(&[&table, &pad], 0)?;
    text_params.replace(&key, grown)
}

/// Copy of `table` with row `ids[i]` replaced by row `i` of `rows`.
pub fn overwrite_rows(table: &Tensor, ids: &[u32], rows: &Tensor) -> Result<Tensor> {
    let n = table.dim(0)?;
    if rows.dim(0)? != ids.len() || rows.dim(D::Minus1)? != table.dim(D::Minus1)? {
        bail!(
            "cannot write {:?} rows into table {:?} at {} ids",
            rows.dims(),
            table.dims(),
            ids.len()
        );
    }
    let mut index: Vec<u32> = (0..n as u32).collect();
    for (i, &id) in ids.iter().enumerate() {
        let slot = index
            .get_mut(id as usize)
            .ok_or_else(|| anyhow::anyhow!("row {} out of range for table of {} rows", id, n))?;
        *slot = (n + i) as u32;
    }
    let stacked = Tensor::cat(&[table, &rows.to_dtype(table.dtype())?], 0)?;
    let index = Tensor::from_vec(index, n, table.device())?;
    Ok(stacked.index_select(&index, 0)?)
}
