//! Streaming engine over a generation session
//!
//! The [`Engine`] moves a [`GenerationSession`] onto a long-lived worker
//! thread. Callers submit prompts via [`Engine::submit`] and receive text
//! fragments through a [`TokenSender`] implementation of their choice, so a
//! UI thread never blocks on the runtime.
//!
//! Requests run one at a time. After each request the worker resets the
//! session, clearing the runtime's KV memory, so requests are independent.

use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use cinder::{ModelContext, Result, SamplerChain, SamplingParams};

use crate::session::{CapacityWarning, GenerationSession, SessionState, StopCause};

/// Default new-token budget per request.
pub const DEFAULT_MAX_NEW_TOKENS: usize = 4096;

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// Model produced the end-of-sequence token.
    Stop,
    /// Reached the maximum number of tokens.
    Length,
    /// The receiver was dropped (client disconnect).
    Cancelled,
}

/// An event produced by the engine during generation.
///
/// Sent through a single channel so ordering is guaranteed: one `Prompt`
/// (unless the prompt itself fails), zero or more `Fragment`s, then exactly
/// one terminal event (`Finished` or `Error`).
#[derive(Debug)]
pub enum GenerationEvent {
    /// The prompt was decoded.
    Prompt {
        tokens: usize,
        capacity_warning: Option<CapacityWarning>,
    },
    /// Newly completed text. Never empty.
    Fragment(String),
    /// An error occurred during generation.
    Error(cinder::Error),
    /// Generation completed.
    Finished {
        reason: FinishReason,
        generated: usize,
    },
}

/// Trait for sending generation events from the engine to the caller.
///
/// Return `false` to signal that the receiver has been dropped and
/// generation should stop.
pub trait TokenSender: Send {
    /// Send a generation event to the receiver.
    ///
    /// Returns `false` if the receiver has been dropped, signalling the
    /// engine to abort generation early.
    fn send(&self, event: GenerationEvent) -> bool;
}

impl TokenSender for mpsc::Sender<GenerationEvent> {
    fn send(&self, event: GenerationEvent) -> bool {
        mpsc::Sender::send(self, event).is_ok()
    }
}

/// Options for one generation request.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    /// Maximum number of new tokens to generate.
    pub max_new_tokens: usize,
    /// Parse control-token markup in the prompt into special tokens.
    pub format_chat: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            format_chat: false,
        }
    }
}

/// Result of a blocking [`Engine::generate`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Generated text (prompt excluded).
    pub text: String,
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub reason: FinishReason,
    pub capacity_warning: Option<CapacityWarning>,
}

/// A generation request submitted to the engine's worker thread.
struct GenerationRequest {
    prompt: String,
    options: GenerateOptions,
    token_tx: Box<dyn TokenSender>,
}

enum WorkerMessage {
    Generate(GenerationRequest),
    SetSampler(SamplerChain),
}

/// Handle to the engine's worker thread.
///
/// The worker owns the session (and with it the runtime context) and
/// processes requests sequentially. Dropping the engine closes the request
/// channel and joins the worker once the current request finishes.
pub struct Engine {
    request_tx: Option<mpsc::Sender<WorkerMessage>>,
    worker: Option<JoinHandle<()>>,
}

impl Engine {
    /// Spawn the worker thread and hand it `session`.
    ///
    /// The session should be awaiting a prompt; any other state is reset
    /// before the first request.
    pub fn new<C: ModelContext + Send + 'static>(session: GenerationSession<C>) -> Self {
        let (request_tx, request_rx) = mpsc::channel::<WorkerMessage>();

        let worker = thread::Builder::new()
            .name("cinder-engine".into())
            .spawn(move || worker_loop(session, request_rx))
            .ok();
        if worker.is_none() {
            tracing::error!("failed to spawn engine worker thread");
        }

        Self {
            request_tx: Some(request_tx),
            worker,
        }
    }

    /// Submit a generation request with a caller-provided token sender.
    ///
    /// Events are sent through `token_tx` as they are produced. Generation
    /// stops on end-of-sequence, when `max_new_tokens` is reached, or when
    /// the sender returns `false` (receiver dropped).
    pub fn submit(
        &self,
        prompt: impl Into<String>,
        options: GenerateOptions,
        token_tx: impl TokenSender + 'static,
    ) {
        let request = GenerationRequest {
            prompt: prompt.into(),
            options,
            token_tx: Box::new(token_tx),
        };
        // If the worker thread is gone, the send fails and the request's
        // sender is dropped, which closes the caller's receiver.
        if let Some(tx) = &self.request_tx {
            let _ = tx.send(WorkerMessage::Generate(request));
        }
    }

    /// Rebuild the sampler chain from `params`.
    ///
    /// The worker swaps the chain in between requests, so a request already
    /// running keeps its sampler.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`](cinder::Error::InvalidConfig) if the
    /// parameters are out of range.
    pub fn set_sampling(&self, params: &SamplingParams) -> Result<()> {
        let sampler = SamplerChain::from_params(params)?;
        if let Some(tx) = &self.request_tx {
            let _ = tx.send(WorkerMessage::SetSampler(sampler));
        }
        Ok(())
    }

    /// Generate a completion, blocking until done.
    ///
    /// # Errors
    /// Returns the first error reported by the worker, or
    /// [`Error::Other`](cinder::Error::Other) if the worker is gone.
    pub fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<Completion> {
        self.generate_stream(prompt, options, |rx| collect_completion(rx, |_| {}))
    }

    /// Generate with streaming via a channel.
    ///
    /// The provided `consumer` closure receives a [`mpsc::Receiver`] and is
    /// called on the current thread while the worker produces events.
    pub fn generate_stream<F, R>(&self, prompt: &str, options: &GenerateOptions, consumer: F) -> R
    where
        F: FnOnce(mpsc::Receiver<GenerationEvent>) -> R,
    {
        let (tx, rx) = mpsc::channel();
        self.submit(prompt, options.clone(), tx);
        consumer(rx)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.request_tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Drain `rx` into a [`Completion`], calling `on_fragment` for each fragment.
///
/// # Errors
/// Returns the worker's error event, or an error if the channel closes
/// before a terminal event.
pub fn collect_completion(
    rx: mpsc::Receiver<GenerationEvent>,
    mut on_fragment: impl FnMut(&str),
) -> Result<Completion> {
    let mut text = String::new();
    let mut prompt_tokens = 0;
    let mut capacity_warning = None;
    for event in rx {
        match event {
            GenerationEvent::Prompt {
                tokens,
                capacity_warning: warning,
            } => {
                prompt_tokens = tokens;
                capacity_warning = warning;
            }
            GenerationEvent::Fragment(fragment) => {
                on_fragment(&fragment);
                text.push_str(&fragment);
            }
            GenerationEvent::Error(e) => return Err(e),
            GenerationEvent::Finished { reason, generated } => {
                return Ok(Completion {
                    text,
                    prompt_tokens,
                    generated_tokens: generated,
                    reason,
                    capacity_warning,
                });
            }
        }
    }
    Err(cinder::Error::Other(
        "engine worker stopped before finishing the request".into(),
    ))
}

/// The worker thread's main loop. Processes requests sequentially.
#[allow(clippy::needless_pass_by_value)]
fn worker_loop<C: ModelContext>(
    mut session: GenerationSession<C>,
    request_rx: mpsc::Receiver<WorkerMessage>,
) {
    if session.state() != SessionState::AwaitingPrompt {
        session.reset();
    }
    while let Ok(message) = request_rx.recv() {
        match message {
            WorkerMessage::Generate(request) => process_request(&mut session, &request),
            WorkerMessage::SetSampler(sampler) => {
                session.replace_sampler(sampler);
                tracing::info!("sampler chain replaced");
            }
        }
    }
    tracing::debug!("engine worker exiting");
}

/// Run one request to completion and reset the session.
fn process_request<C: ModelContext>(session: &mut GenerationSession<C>, request: &GenerationRequest) {
    let tx = &*request.token_tx;
    let mut run = || -> Result<FinishReason> {
        session.set_target_length(request.options.max_new_tokens);
        let tokens = session.init_prompt(&request.prompt, request.options.format_chat)?;
        let event = GenerationEvent::Prompt {
            tokens,
            capacity_warning: session.capacity_warning(),
        };
        if !tx.send(event) {
            return Ok(FinishReason::Cancelled);
        }

        while let Some(fragment) = session.step()? {
            if !fragment.is_empty() && !tx.send(GenerationEvent::Fragment(fragment)) {
                return Ok(FinishReason::Cancelled);
            }
        }

        if let Some(rest) = session.flush_pending() {
            if !tx.send(GenerationEvent::Fragment(rest)) {
                return Ok(FinishReason::Cancelled);
            }
        }

        Ok(match session.state() {
            SessionState::Terminated(StopCause::EndOfSequence) => FinishReason::Stop,
            _ => FinishReason::Length,
        })
    };

    match run() {
        Ok(reason) => {
            tracing::debug!(?reason, generated = session.generated(), "request finished");
            let _ = tx.send(GenerationEvent::Finished {
                reason,
                generated: session.generated(),
            });
        }
        Err(e) => {
            tracing::error!(error = %e, terminal = e.is_terminal(), "request failed");
            let _ = tx.send(GenerationEvent::Error(e));
        }
    }
    session.reset();
}
