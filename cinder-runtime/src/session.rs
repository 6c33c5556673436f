//! Generation session: prompt ingestion and the per-token decode loop.
//!
//! A [`GenerationSession`] owns one runtime context together with the batch,
//! sampler chain and UTF-8 reassembler used to drive it. It moves through
//!
//! ```text
//! AwaitingPrompt --init_prompt--> Generating --step*--> Terminated
//!        ^                                                  |
//!        +---------------------- reset ---------------------+
//! ```
//!
//! Every call blocks on the runtime, and the runtime's KV memory is mutated
//! in place, so steps are strictly sequential. Stopping between steps is
//! always safe; [`GenerationSession::reset`] is the only way to reuse the
//! context for a new prompt.

use cinder::{Batch, Error, ModelContext, Result, SamplerChain, SeqId, Utf8Reassembler};

/// The only sequence this session decodes into.
const SEQ: [SeqId; 1] = [0];

/// Why a session stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    /// The sampler produced an end-of-generation token.
    EndOfSequence,
    /// The new-token budget was used up.
    LengthBudget,
    /// A decode call failed; KV memory may be inconsistent.
    DecodeFailed,
}

/// Lifecycle state of a [`GenerationSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingPrompt,
    Generating,
    Terminated(StopCause),
}

/// Prompt plus budget does not fit the context.
///
/// Recorded and logged, never raised: the decode is attempted anyway and the
/// runtime decides what happens when memory runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityWarning {
    /// Prompt tokens plus target length.
    pub required: usize,
    /// Context length of the runtime context.
    pub available: usize,
}

/// One prompt/completion exchange over an exclusively owned context.
pub struct GenerationSession<C: ModelContext> {
    context: C,
    batch: Batch,
    sampler: SamplerChain,
    reassembler: Utf8Reassembler,
    state: SessionState,
    cursor: usize,
    prompt_len: usize,
    target_length: usize,
    capacity_warning: Option<CapacityWarning>,
}

impl<C: ModelContext> GenerationSession<C> {
    /// Create a session that generates at most `target_length` new tokens
    /// per prompt.
    ///
    /// The batch starts at the context length and grows at
    /// [`init_prompt`](Self::init_prompt) to hold the prompt plus the budget.
    pub fn new(context: C, sampler: SamplerChain, target_length: usize) -> Self {
        let batch = Batch::new(context.n_ctx());
        Self {
            context,
            batch,
            sampler,
            reassembler: Utf8Reassembler::new(),
            state: SessionState::AwaitingPrompt,
            cursor: 0,
            prompt_len: 0,
            target_length,
            capacity_warning: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Position at which the next token will be inserted.
    #[must_use]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Number of tokens submitted for the current prompt.
    #[must_use]
    pub fn prompt_len(&self) -> usize {
        self.prompt_len
    }

    /// Tokens generated and submitted since the prompt.
    #[must_use]
    pub fn generated(&self) -> usize {
        self.cursor - self.prompt_len
    }

    #[must_use]
    pub fn target_length(&self) -> usize {
        self.target_length
    }

    /// Change the new-token budget. Takes effect on the next step.
    pub fn set_target_length(&mut self, target_length: usize) {
        self.target_length = target_length;
    }

    /// Capacity warning recorded by the last [`init_prompt`](Self::init_prompt).
    #[must_use]
    pub fn capacity_warning(&self) -> Option<CapacityWarning> {
        self.capacity_warning
    }

    #[must_use]
    pub fn context(&self) -> &C {
        &self.context
    }

    #[must_use]
    pub fn sampler(&self) -> &SamplerChain {
        &self.sampler
    }

    /// Swap in a new sampler chain, returning the old one.
    pub fn replace_sampler(&mut self, sampler: SamplerChain) -> SamplerChain {
        std::mem::replace(&mut self.sampler, sampler)
    }

    /// Tokenize `text` and decode it as the start of a new sequence.
    ///
    /// With `format_chat`, control-token markup in `text` is parsed into
    /// special tokens. Returns the number of prompt tokens.
    ///
    /// # Errors
    /// - [`Error::InvalidState`] unless the session is awaiting a prompt.
    /// - [`Error::EmptyPrompt`] if tokenization yields nothing.
    /// - [`Error::Decode`] if the runtime rejects the prompt; the session is
    ///   then terminated and must be reset.
    pub fn init_prompt(&mut self, text: &str, format_chat: bool) -> Result<usize> {
        if self.state != SessionState::AwaitingPrompt {
            return Err(Error::InvalidState(format!(
                "init_prompt called in state {:?}",
                self.state
            )));
        }
        self.reassembler.clear();
        self.capacity_warning = None;

        let tokens = self.context.tokenize(text, true, format_chat)?;
        let Some(last) = tokens.len().checked_sub(1) else {
            return Err(Error::EmptyPrompt);
        };

        let n_ctx = self.context.n_ctx();
        let required = tokens.len() + self.target_length;
        tracing::info!(
            n_len = self.target_length,
            n_ctx,
            n_kv_req = required,
            "initialising prompt"
        );
        if required > n_ctx {
            tracing::warn!(
                required,
                available = n_ctx,
                "required KV cache size exceeds the context length"
            );
            self.capacity_warning = Some(CapacityWarning {
                required,
                available: n_ctx,
            });
        }
        tracing::debug!(?tokens, "prompt tokens");

        self.batch.clear();
        self.batch.ensure_capacity(required);
        for (pos, &token) in tokens.iter().enumerate() {
            self.batch.add(token, pos, &SEQ, false)?;
        }
        self.batch.mark_output(last)?;

        if let Err(e) = self.context.decode(&self.batch) {
            tracing::error!(error = %e, "prompt decode failed");
            self.state = SessionState::Terminated(StopCause::DecodeFailed);
            return Err(as_decode_error(e));
        }

        self.prompt_len = tokens.len();
        self.cursor = tokens.len();
        self.state = SessionState::Generating;
        Ok(tokens.len())
    }

    /// Sample, commit and decode one token.
    ///
    /// Returns `Some(text)` while generating; `text` is empty when the token
    /// ended mid-character (or decoded to nothing) and the bytes are held
    /// for the next step. Returns `None` once the session stops on
    /// end-of-sequence or the length budget.
    ///
    /// # Errors
    /// - [`Error::InvalidState`] unless the session is generating.
    /// - [`Error::Tokenizer`] if the sampled token has no piece; nothing is
    ///   committed and the session keeps generating.
    /// - [`Error::Decode`] if the runtime fails; the session is terminated.
    pub fn step(&mut self) -> Result<Option<String>> {
        if self.state != SessionState::Generating {
            return Err(Error::InvalidState(format!(
                "step called in state {:?}",
                self.state
            )));
        }

        let token = self.sampler.sample(&self.context)?;

        if self.context.is_end_of_generation(token) {
            self.sampler.accept(token);
            tracing::debug!(token, cursor = self.cursor, "end of sequence");
            self.state = SessionState::Terminated(StopCause::EndOfSequence);
            return Ok(None);
        }
        if self.generated() >= self.target_length {
            self.sampler.accept(token);
            tracing::debug!(cursor = self.cursor, "length budget reached");
            self.state = SessionState::Terminated(StopCause::LengthBudget);
            return Ok(None);
        }

        // History only records tokens that go on to be decoded.
        let piece = self.context.token_to_piece(token)?;
        self.sampler.accept(token);
        self.reassembler.append(&piece);
        let fragment = self.reassembler.try_drain().unwrap_or_default();
        tracing::trace!(token, cursor = self.cursor, fragment = %fragment, "sampled");

        self.batch.clear();
        self.batch.add(token, self.cursor, &SEQ, true)?;
        if let Err(e) = self.context.decode(&self.batch) {
            tracing::error!(error = %e, cursor = self.cursor, "decode failed");
            self.state = SessionState::Terminated(StopCause::DecodeFailed);
            return Err(as_decode_error(e));
        }
        self.cursor += 1;

        Ok(Some(fragment))
    }

    /// Bytes still held by the reassembler, replacing invalid sequences.
    ///
    /// Useful once generation stops, when no further token can complete a
    /// pending character.
    pub fn flush_pending(&mut self) -> Option<String> {
        self.reassembler.drain_lossy()
    }

    /// Clear KV memory and return to [`SessionState::AwaitingPrompt`].
    ///
    /// The sampler's history is cleared and its RNG restarted from its seed.
    pub fn reset(&mut self) {
        self.context.clear_memory();
        self.sampler.reset();
        self.reassembler.clear();
        self.batch.clear();
        self.cursor = 0;
        self.prompt_len = 0;
        self.capacity_warning = None;
        self.state = SessionState::AwaitingPrompt;
    }

    /// Give back the context.
    pub fn into_context(self) -> C {
        self.context
    }
}

fn as_decode_error(e: Error) -> Error {
    match e {
        Error::Decode(_) => e,
        other => Error::Decode(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder::testing::{ScriptedContext, ScriptedModel};
    use cinder::{SamplerStage, SamplingParams};

    fn greedy() -> SamplerChain {
        SamplerChain::builder()
            .stage(SamplerStage::Greedy)
            .build()
            .unwrap()
    }

    /// Vocabulary where "Hello" tokenizes to BOS + "He" + "llo".
    fn hello_model(reply: Vec<u32>, fallback: Option<u32>) -> ScriptedModel {
        ScriptedModel {
            pieces: vec![
                Vec::new(),
                b"He".to_vec(),
                b"llo".to_vec(),
                b"!".to_vec(),
                Vec::new(),
                b" ".to_vec(),
            ],
            special: Vec::new(),
            bos: Some(0),
            eos: 4,
            reply,
            fallback,
        }
    }

    fn session(model: ScriptedModel, n_ctx: usize, target: usize) -> GenerationSession<ScriptedContext> {
        GenerationSession::new(ScriptedContext::new(model, n_ctx), greedy(), target)
    }

    #[test]
    fn hello_scenario() {
        let mut s = session(hello_model(vec![3], None), 64, 16);
        assert_eq!(s.init_prompt("Hello", false).unwrap(), 3);
        assert_eq!(s.state(), SessionState::Generating);
        assert_eq!(s.cursor(), 3);

        assert_eq!(s.step().unwrap().as_deref(), Some("!"));
        assert_eq!(s.cursor(), 4);
    }

    #[test]
    fn prompt_batch_marks_only_last_token() {
        let mut s = session(hello_model(vec![3], None), 64, 16);
        s.init_prompt("Hello", false).unwrap();

        let prompt = &s.context().decoded()[0];
        assert_eq!(prompt.len(), 3);
        for (i, slot) in prompt.iter().enumerate() {
            assert_eq!(slot.pos, i);
            assert_eq!(slot.seq_ids, vec![0]);
            assert_eq!(slot.output, i == 2);
        }
    }

    #[test]
    fn step_submits_exactly_the_new_token() {
        let mut s = session(hello_model(vec![3, 5], None), 64, 16);
        s.init_prompt("Hello", false).unwrap();
        s.step().unwrap();
        s.step().unwrap();

        let decoded = s.context().decoded();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[1].len(), 1);
        assert_eq!(decoded[1][0].token, 3);
        assert_eq!(decoded[1][0].pos, 3);
        assert!(decoded[1][0].output);
        assert_eq!(decoded[2][0].token, 5);
        assert_eq!(decoded[2][0].pos, 4);
    }

    #[test]
    fn cursor_is_prompt_plus_steps() {
        let mut s = session(hello_model(Vec::new(), Some(5)), 64, 100);
        let n = s.init_prompt("Hello", false).unwrap();
        for i in 1..=10 {
            assert_eq!(s.step().unwrap().as_deref(), Some(" "));
            assert_eq!(s.cursor(), n + i);
            assert_eq!(s.generated(), i);
        }
    }

    #[test]
    fn length_budget_terminates() {
        let mut s = session(hello_model(Vec::new(), Some(3)), 64, 5);
        s.init_prompt("Hello", false).unwrap();

        for _ in 0..5 {
            assert_eq!(s.step().unwrap().as_deref(), Some("!"));
        }
        assert_eq!(s.step().unwrap(), None);
        assert_eq!(s.state(), SessionState::Terminated(StopCause::LengthBudget));
        assert!(matches!(s.step(), Err(Error::InvalidState(_))));
        assert_eq!(s.cursor(), 8);
    }

    #[test]
    fn end_of_sequence_terminates() {
        let mut s = session(ScriptedModel::byte_level("ab"), 64, 100);
        s.init_prompt("x", false).unwrap();

        assert_eq!(s.step().unwrap().as_deref(), Some("a"));
        assert_eq!(s.step().unwrap().as_deref(), Some("b"));
        assert_eq!(s.step().unwrap(), None);
        assert_eq!(s.state(), SessionState::Terminated(StopCause::EndOfSequence));
    }

    #[test]
    fn split_characters_are_reassembled() {
        let reply = "n\u{e9}\u{20ac}\u{1f600}!";
        let mut s = session(ScriptedModel::byte_level(reply), 64, 100);
        s.init_prompt("q", false).unwrap();

        let mut fragments = Vec::new();
        while let Some(f) = s.step().unwrap() {
            fragments.push(f);
        }
        // one step per byte
        assert_eq!(fragments.len(), reply.len());
        assert_eq!(fragments.concat(), reply);
        assert_eq!(fragments[1], "");
        assert_eq!(fragments[2], "\u{e9}");
        assert!(fragments.iter().all(|f| f.chars().count() <= 1));
    }

    #[test]
    fn capacity_warning_is_recorded_and_decode_attempted() {
        let mut s = session(ScriptedModel::byte_level("z"), 10, 5);
        // BOS + 7 bytes = 8 tokens, 8 + 5 > 10
        let n = s.init_prompt("abcdefg", false).unwrap();
        assert_eq!(n, 8);
        assert_eq!(
            s.capacity_warning(),
            Some(CapacityWarning {
                required: 13,
                available: 10
            })
        );
        assert_eq!(s.context().decoded().len(), 1);
        assert_eq!(s.state(), SessionState::Generating);
    }

    #[test]
    fn no_warning_when_it_fits() {
        let mut s = session(ScriptedModel::byte_level("z"), 64, 5);
        s.init_prompt("abc", false).unwrap();
        assert_eq!(s.capacity_warning(), None);
    }

    #[test]
    fn step_before_prompt_is_invalid() {
        let mut s = session(hello_model(vec![3], None), 64, 5);
        assert!(matches!(s.step(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn second_prompt_needs_reset() {
        let mut s = session(hello_model(vec![3], None), 64, 5);
        s.init_prompt("Hello", false).unwrap();
        assert!(matches!(
            s.init_prompt("Hello", false),
            Err(Error::InvalidState(_))
        ));

        s.reset();
        assert_eq!(s.state(), SessionState::AwaitingPrompt);
        assert_eq!(s.cursor(), 0);
        assert_eq!(s.context().memory_clears(), 1);
        assert_eq!(s.init_prompt("Hello", false).unwrap(), 3);
        assert_eq!(s.context().decoded().last().unwrap()[0].pos, 0);
    }

    #[test]
    fn prompt_decode_failure_terminates() {
        let ctx = ScriptedContext::new(hello_model(vec![3], None), 64).fail_decode_at(0);
        let mut s = GenerationSession::new(ctx, greedy(), 5);

        assert!(matches!(s.init_prompt("Hello", false), Err(Error::Decode(_))));
        assert_eq!(s.state(), SessionState::Terminated(StopCause::DecodeFailed));
        assert!(matches!(s.step(), Err(Error::InvalidState(_))));

        s.reset();
        assert_eq!(s.state(), SessionState::AwaitingPrompt);
    }

    #[test]
    fn step_decode_failure_terminates() {
        let ctx = ScriptedContext::new(hello_model(Vec::new(), Some(3)), 64).fail_decode_at(2);
        let mut s = GenerationSession::new(ctx, greedy(), 10);
        s.init_prompt("Hello", false).unwrap();

        assert!(s.step().unwrap().is_some());
        assert!(matches!(s.step(), Err(Error::Decode(_))));
        assert_eq!(s.state(), SessionState::Terminated(StopCause::DecodeFailed));
        assert_eq!(s.cursor(), 4);
        assert!(matches!(s.step(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn empty_prompt_is_rejected() {
        let mut model = hello_model(vec![3], None);
        model.bos = None;
        let mut s = session(model, 64, 5);
        assert!(matches!(s.init_prompt("", false), Err(Error::EmptyPrompt)));
        assert_eq!(s.state(), SessionState::AwaitingPrompt);
    }

    #[test]
    fn prompt_longer_than_context_is_still_decoded() {
        let mut s = session(ScriptedModel::byte_level("z"), 4, 1);
        assert_eq!(s.init_prompt("abcdef", false).unwrap(), 7);
        assert_eq!(
            s.capacity_warning(),
            Some(CapacityWarning {
                required: 8,
                available: 4
            })
        );
        assert_eq!(s.context().decoded().len(), 1);
        assert_eq!(s.context().decoded()[0].len(), 7);
        assert_eq!(s.state(), SessionState::Generating);
    }

    #[test]
    fn missing_piece_commits_nothing() {
        let ctx = ScriptedContext::new(ScriptedModel::byte_level("ab"), 64)
            .fail_piece(u32::from(b'a'));
        let mut s = GenerationSession::new(ctx, greedy(), 8);
        s.init_prompt("q", false).unwrap();

        assert!(matches!(s.step(), Err(Error::Tokenizer(_))));
        assert!(s.sampler().history().is_empty());
        assert_eq!(s.cursor(), 2);
        assert_eq!(s.state(), SessionState::Generating);
        assert_eq!(s.context().decoded().len(), 1);
    }

    #[test]
    fn pending_bytes_flush_after_stop() {
        // "é" cut after its first byte by the length budget
        let mut s = session(ScriptedModel::byte_level("\u{e9}"), 64, 1);
        s.init_prompt("q", false).unwrap();
        assert_eq!(s.step().unwrap().as_deref(), Some(""));
        assert_eq!(s.step().unwrap(), None);
        assert_eq!(s.flush_pending().as_deref(), Some("\u{fffd}"));
        assert_eq!(s.flush_pending(), None);
    }

    #[test]
    fn sampler_history_tracks_committed_tokens() {
        let params = SamplingParams {
            seed: Some(5),
            ..SamplingParams::default()
        };
        let chain = SamplerChain::from_params(&params).unwrap();
        let ctx = ScriptedContext::new(ScriptedModel::byte_level("hey"), 64);
        let mut s = GenerationSession::new(ctx, chain, 100);
        s.init_prompt("q", false).unwrap();
        while s.step().unwrap().is_some() {}

        let history: Vec<u32> = s.sampler().history().iter().copied().collect();
        assert_eq!(history, vec![u32::from(b'h'), u32::from(b'e'), u32::from(b'y'), 257]);

        s.reset();
        assert!(s.sampler().history().is_empty());
    }
}
