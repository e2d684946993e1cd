//! Typed failures the caller is expected to act on.
//!
//! Everything else travels as `anyhow::Error` with context attached.

use thiserror::Error;

/// Invocation mistakes. These are raised before any model is loaded
/// wherever the information is available that early.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required option --{0}")]
    Missing(&'static str),

    #[error(
        "provide equal num of tokens, terms and data folders (separated by '+'): \
         {tokens} tokens, {terms} terms, {data} data folders"
    )]
    CountMismatch { tokens: usize, terms: usize, data: usize },

    #[error("provide one prior folder per token (separated by '+'): {tokens} tokens, {priors} prior folders")]
    PriorCountMismatch { tokens: usize, priors: usize },

    #[error("token {0} already exists in the vocabulary")]
    TokenExists(String),

    #[error("token {0} is listed more than once")]
    DuplicateToken(String),

    #[error("term '{0}' does not tokenize to any known sub-unit")]
    EmptyAnchor(String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Malformed checkpoint contents. Resuming never falls back to a partial load.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint has no metadata header")]
    NoMetadata,

    #[error("unknown checkpoint format '{0}'")]
    UnknownFormat(String),

    #[error("checkpoint entry {name} has shape {got:?}, expected {expected}")]
    BadShape {
        name: String,
        got: Vec<usize>,
        expected: String,
    },

    #[error("checkpoint delta targets unknown parameter {0}")]
    UnknownParam(String),
}
