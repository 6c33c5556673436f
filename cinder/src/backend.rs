//! Runtime adapter traits for the external model runtime.
//!
//! Cinder never computes probabilities itself. A [`Backend`] loads models and
//! creates contexts; a [`ModelContext`] owns the KV memory for one session
//! and exposes the handful of calls the generation loop needs.
//!
//! # Design notes
//!
//! - **Ownership replaces handles.** Models and contexts are plain owned
//!   values. Releasing them is `Drop`, so every exit path (including a failed
//!   prompt decode) frees them exactly once.
//! - **Sampling is not part of the contract.** The runtime only hands back
//!   the output logits of the last decoded batch; the
//!   [`SamplerChain`](crate::sampling::SamplerChain) turns them into a token.
//! - **`init` is process-wide.** Backends that forward their own log output
//!   or configure NUMA do it once from `init`, not per context.

use std::path::Path;
use std::thread;

use serde::{Deserialize, Serialize};

use crate::batch::{Batch, TokenId};
use crate::Result;

/// Default context length when none is configured.
pub const DEFAULT_N_CTX: usize = 2048;

/// Upper bound for the derived worker-thread count.
const MAX_DEFAULT_THREADS: usize = 8;

/// Cores left free for the host application when deriving thread count.
const RESERVED_CORES: usize = 2;

/// Parameters used when creating a [`ModelContext`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextParams {
    /// Context length (KV memory size in tokens).
    pub n_ctx: usize,
    /// Worker threads for the runtime's tensor math. `None` derives a value
    /// from the available hardware concurrency.
    pub n_threads: Option<usize>,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            n_ctx: DEFAULT_N_CTX,
            n_threads: None,
        }
    }
}

impl ContextParams {
    /// Thread count to hand to the runtime.
    #[must_use]
    pub fn effective_threads(&self) -> usize {
        self.n_threads.unwrap_or_else(default_thread_count).max(1)
    }
}

/// Thread count derived from the host: all cores but two, between 1 and 8.
#[must_use]
pub fn default_thread_count() -> usize {
    let cores = thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    thread_count_for(cores)
}

fn thread_count_for(cores: usize) -> usize {
    cores
        .saturating_sub(RESERVED_CORES)
        .clamp(1, MAX_DEFAULT_THREADS)
}

/// Loads models and creates contexts for one model runtime.
pub trait Backend {
    /// Loaded model weights.
    type Model;

    /// Per-session context created from a model.
    type Context: ModelContext;

    /// One-time process-wide initialisation (log forwarding, NUMA, ...).
    ///
    /// # Errors
    /// Returns an error if the runtime cannot be initialised.
    fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Human-readable description of the runtime and host capabilities.
    fn system_info(&self) -> String {
        String::new()
    }

    /// Load a model from a file.
    ///
    /// # Errors
    /// Returns [`Error::Load`](crate::Error::Load) if the file is invalid or unreadable.
    fn load_model(&self, path: &Path) -> Result<Self::Model>;

    /// Create a fresh context for `model`.
    ///
    /// # Errors
    /// Returns [`Error::CreateContext`](crate::Error::CreateContext) if allocation fails.
    fn create_context(&self, model: &Self::Model, params: &ContextParams) -> Result<Self::Context>;
}

/// A runtime context: KV memory plus the model it decodes with.
///
/// Calls are blocking and must not overlap; the context is mutated in place
/// by every [`decode`](Self::decode).
pub trait ModelContext {
    /// Configured context length in tokens.
    fn n_ctx(&self) -> usize;

    /// Tokenize `text`.
    ///
    /// `parse_special` controls whether control-token markup in the text is
    /// mapped to special tokens.
    ///
    /// # Errors
    /// Returns an error if tokenization fails.
    fn tokenize(&self, text: &str, add_bos: bool, parse_special: bool) -> Result<Vec<TokenId>>;

    /// Raw bytes of a token. May be an incomplete UTF-8 sequence.
    ///
    /// # Errors
    /// Returns an error if the token is not in the vocabulary.
    fn token_to_piece(&self, token: TokenId) -> Result<Vec<u8>>;

    /// Run the model over `batch`, updating KV memory.
    ///
    /// # Errors
    /// Returns [`Error::Decode`](crate::Error::Decode) on failure. The KV
    /// memory may be partially written afterwards.
    fn decode(&mut self, batch: &Batch) -> Result<()>;

    /// Logits of the last slot flagged for output in the most recent decode.
    ///
    /// # Errors
    /// Returns an error if nothing has been decoded yet.
    fn output_logits(&self) -> Result<&[f32]>;

    /// Whether `token` ends generation (EOS, EOT, ...).
    fn is_end_of_generation(&self, token: TokenId) -> bool;

    /// Drop all KV memory for this context.
    fn clear_memory(&mut self);
}
