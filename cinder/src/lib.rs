//! Cinder: streaming text generation on top of an external model runtime
//!
//! This crate provides the core types: the [`Batch`] submitted per decode,
//! the [`SamplerChain`] that picks tokens, the [`Utf8Reassembler`] that turns
//! token bytes into text, and the [`Backend`] / [`ModelContext`] traits a
//! model runtime implements. Sessions and streaming live in
//! `cinder-runtime`.

#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

pub mod backend;
pub mod batch;
pub mod chat_template;
pub mod error;
pub mod sampling;
pub mod testing;
pub mod utf8;

pub use backend::{default_thread_count, Backend, ContextParams, ModelContext};
pub use batch::{Batch, BatchSlot, Pos, SeqId, TokenId};
pub use chat_template::{ChatMessage, ChatMlTemplate, ChatTemplate};
pub use error::{Error, Result};
pub use sampling::{SamplerChain, SamplerChainBuilder, SamplerStage, SamplingParams};
pub use utf8::{Utf8Reassembler, Utf8Scan};
