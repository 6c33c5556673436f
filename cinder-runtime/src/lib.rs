//! Cinder Runtime: streaming generation over an external model runtime
//!
//! This crate provides the [`GenerationSession`] (token-level state machine),
//! the [`Engine`] (worker thread streaming text fragments) and the
//! [`Runtime`] (text in, text out) built on the core `cinder` types.
//!
//! # Architecture
//!
//! ```text
//! Runtime<B>                ← text in, text out (owns Engine + model)
//!   └── Engine              ← worker thread, streams GenerationEvents
//!         └── GenerationSession<C>  ← batch + sampler + UTF-8 reassembly
//!               └── C: ModelContext ← decode / logits / KV memory
//! ```

#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod config;
mod engine;
pub mod logging;
mod runtime;
mod session;
mod usage;

pub use config::{RuntimeConfig, DEFAULT_TARGET_LENGTH};
pub use engine::{
    collect_completion, Completion, Engine, FinishReason, GenerateOptions, GenerationEvent,
    TokenSender, DEFAULT_MAX_NEW_TOKENS,
};
pub use runtime::Runtime;
pub use session::{CapacityWarning, GenerationSession, SessionState, StopCause};
pub use usage::{TokenStatus, TokenUsage};
