//! Text-level inference runtime
//!
//! The [`Runtime`] loads a model through a [`Backend`], wraps the context in
//! an [`Engine`], and provides a text-in, text-out interface with an optional
//! system prompt and running token usage.

use std::path::Path;

use cinder::{
    Backend, ChatMessage, ChatMlTemplate, ChatTemplate, Error, Result, SamplerChain,
    SamplingParams,
};

use crate::config::RuntimeConfig;
use crate::engine::{collect_completion, Completion, Engine, GenerateOptions};
use crate::session::GenerationSession;
use crate::usage::TokenUsage;

/// Text-level inference runtime.
///
/// Each Runtime instance serves one model. Dropping it stops the engine
/// worker, which releases the context, and then releases the model.
pub struct Runtime<B: Backend> {
    // Declared before `model` so the context is released first.
    engine: Engine,
    model: B::Model,
    config: RuntimeConfig,
    system_prompt: Option<String>,
    used_tokens: usize,
}

impl<B: Backend> Runtime<B>
where
    B::Context: Send + 'static,
{
    /// Load the model at `path` and create a context for it.
    ///
    /// # Errors
    /// - [`Error::InvalidConfig`] if the sampling parameters are out of range
    /// - [`Error::Load`] if the file is missing or the backend rejects it
    /// - [`Error::CreateContext`] if the backend cannot create a context
    pub fn load(backend: &B, path: impl AsRef<Path>, config: &RuntimeConfig) -> Result<Self> {
        let path = path.as_ref();
        let sampler = SamplerChain::from_params(&config.sampling)?;

        if !path.exists() {
            return Err(Error::Load(format!("model not found: {}", path.display())));
        }
        let model = backend.load_model(path)?;
        tracing::info!(path = %path.display(), "model loaded");

        let mut context_params = config.context.clone();
        context_params.n_threads = Some(context_params.effective_threads());
        let context = backend.create_context(&model, &context_params)?;
        tracing::info!(
            n_ctx = context_params.n_ctx,
            n_threads = ?context_params.n_threads,
            target_length = config.target_length,
            "context created"
        );

        let session = GenerationSession::new(context, sampler, config.target_length);
        Ok(Self {
            engine: Engine::new(session),
            model,
            config: config.clone(),
            system_prompt: None,
            used_tokens: 0,
        })
    }
}

impl<B: Backend> Runtime<B> {
    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    #[must_use]
    pub fn model(&self) -> &B::Model {
        &self.model
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The rendered system prompt prepended to every message, if any.
    #[must_use]
    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    /// Start a new conversation, optionally with a system prompt.
    ///
    /// The prompt is rendered as a ChatML system turn. A blank prompt clears
    /// it. Token usage restarts from zero.
    pub fn reset_session(&mut self, system_prompt: Option<&str>) {
        self.system_prompt = system_prompt
            .filter(|p| !p.trim().is_empty())
            .map(|p| ChatMlTemplate.apply(&[ChatMessage::system(p)]));
        self.used_tokens = 0;
        tracing::debug!(
            has_system_prompt = self.system_prompt.is_some(),
            "session reset"
        );
    }

    /// Send a message and wait for the full reply.
    ///
    /// # Errors
    /// Returns the first error the engine reports for this request.
    pub fn send(&mut self, message: &str) -> Result<Completion> {
        self.stream(message, |_| {})
    }

    /// Send a message, calling `on_fragment` with each piece of text as it
    /// is produced.
    ///
    /// # Errors
    /// Returns the first error the engine reports for this request.
    pub fn stream(&mut self, message: &str, on_fragment: impl FnMut(&str)) -> Result<Completion> {
        let prompt = match &self.system_prompt {
            Some(system) => format!("{system}{message}"),
            None => message.to_owned(),
        };
        let options = GenerateOptions {
            max_new_tokens: self.config.target_length,
            format_chat: self.config.format_chat,
        };

        let completion = self
            .engine
            .generate_stream(&prompt, &options, |rx| collect_completion(rx, on_fragment))?;

        self.used_tokens += completion.prompt_tokens + completion.generated_tokens;
        tracing::debug!(
            prompt_tokens = completion.prompt_tokens,
            generated_tokens = completion.generated_tokens,
            used = self.used_tokens,
            "message complete"
        );
        Ok(completion)
    }

    /// Tokens used since the last [`reset_session`](Self::reset_session),
    /// measured against the per-request token budget.
    #[must_use]
    pub fn usage(&self) -> TokenUsage {
        TokenUsage::new(self.used_tokens, self.config.target_length)
    }

    /// Replace the sampling parameters for later requests.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] if the parameters are out of range;
    /// the current sampler is kept.
    pub fn set_sampling(&mut self, params: SamplingParams) -> Result<()> {
        self.engine.set_sampling(&params)?;
        tracing::info!(?params, "sampling parameters updated");
        self.config.sampling = params;
        Ok(())
    }
}
