//! Error types for Cinder

use thiserror::Error;

/// Result type alias using Cinder's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Cinder operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to load model: {0}")]
    Load(String),

    #[error("failed to create context: {0}")]
    CreateContext(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("invalid session state: {0}")]
    InvalidState(String),

    #[error("invalid sampler config: {0}")]
    InvalidConfig(String),

    #[error("batch capacity exceeded: capacity is {capacity}")]
    CapacityExceeded { capacity: usize },

    #[error("batch index {index} out of range (len {len})")]
    InvalidBatchIndex { index: usize, len: usize },

    #[error("prompt produced no tokens")]
    EmptyPrompt,

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error leaves the runtime context in an unknown state.
    ///
    /// A failed decode may have written part of a batch into KV memory, so
    /// the owning session must be reset before it is reused.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Decode(_))
    }
}
