//! Scripted model runtime for tests and demos.
//!
//! [`ScriptedBackend`] loads a [`ScriptedModel`] from a JSON file. The model
//! has a tiny piece vocabulary and a fixed reply: after every decode the
//! output logits put all mass on the next reply token, then on the fallback
//! token (EOS unless overridden). Contexts record every submitted batch so
//! tests can check positions and output flags.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::backend::{Backend, ContextParams, ModelContext};
use crate::batch::{Batch, BatchSlot, TokenId};
use crate::{Error, Result};

/// Logit given to the scripted token; every other token gets zero.
const SCRIPTED_LOGIT: f32 = 30.0;

/// Vocabulary and reply script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptedModel {
    /// Byte piece for each token id.
    pub pieces: Vec<Vec<u8>>,
    /// Token ids only produced by tokenize when special parsing is on.
    #[serde(default)]
    pub special: Vec<TokenId>,
    pub bos: Option<TokenId>,
    pub eos: TokenId,
    /// Tokens favoured after each decode, in order.
    pub reply: Vec<TokenId>,
    /// Token favoured once `reply` is exhausted. Defaults to `eos`.
    #[serde(default)]
    pub fallback: Option<TokenId>,
}

impl ScriptedModel {
    /// Byte-level model: ids `0..256` are single bytes, then BOS and EOS.
    ///
    /// The reply spells `reply` one byte per token, so multi-byte characters
    /// arrive split across tokens.
    #[must_use]
    pub fn byte_level(reply: &str) -> Self {
        let mut pieces: Vec<Vec<u8>> = (0..=255u8).map(|b| vec![b]).collect();
        pieces.push(Vec::new());
        pieces.push(Vec::new());
        Self {
            pieces,
            special: Vec::new(),
            bos: Some(256),
            eos: 257,
            reply: reply.bytes().map(TokenId::from).collect(),
            fallback: None,
        }
    }

    /// Read a model from a JSON file.
    ///
    /// # Errors
    /// Returns [`Error::Load`] if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read(path).map_err(|e| Error::Load(format!("{}: {e}", path.display())))?;
        let model: Self = serde_json::from_slice(&data)
            .map_err(|e| Error::Load(format!("{}: {e}", path.display())))?;
        model.check()?;
        Ok(model)
    }

    /// Write the model as JSON.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    fn check(&self) -> Result<()> {
        let n = self.pieces.len();
        let ids = self
            .reply
            .iter()
            .chain(self.special.iter())
            .chain(self.bos.iter())
            .chain(self.fallback.iter())
            .chain(std::iter::once(&self.eos));
        for &id in ids {
            if id as usize >= n {
                return Err(Error::Load(format!(
                    "token {id} outside vocabulary of {n}"
                )));
            }
        }
        Ok(())
    }
}

/// Backend that loads [`ScriptedModel`] JSON files.
#[derive(Debug, Default, Clone)]
pub struct ScriptedBackend {
    /// Make `create_context` fail.
    pub fail_create: bool,
}

impl Backend for ScriptedBackend {
    type Model = ScriptedModel;
    type Context = ScriptedContext;

    fn system_info(&self) -> String {
        "scripted runtime (no compute)".into()
    }

    fn load_model(&self, path: &Path) -> Result<ScriptedModel> {
        ScriptedModel::from_file(path)
    }

    fn create_context(&self, model: &ScriptedModel, params: &ContextParams) -> Result<ScriptedContext> {
        if self.fail_create {
            return Err(Error::CreateContext("scripted failure".into()));
        }
        Ok(ScriptedContext::new(model.clone(), params.n_ctx))
    }
}

/// Context over a [`ScriptedModel`].
#[derive(Debug, Clone)]
pub struct ScriptedContext {
    model: ScriptedModel,
    n_ctx: usize,
    kv_len: usize,
    next_reply: usize,
    logits: Option<Vec<f32>>,
    decoded: Vec<Vec<BatchSlot>>,
    memory_clears: usize,
    fail_decode_at: Option<usize>,
    fail_piece: Option<TokenId>,
}

impl ScriptedContext {
    #[must_use]
    pub fn new(model: ScriptedModel, n_ctx: usize) -> Self {
        Self {
            model,
            n_ctx,
            kv_len: 0,
            next_reply: 0,
            logits: None,
            decoded: Vec::new(),
            memory_clears: 0,
            fail_decode_at: None,
            fail_piece: None,
        }
    }

    /// Fail the `n`-th decode call (0-based, counted since creation).
    #[must_use]
    pub fn fail_decode_at(mut self, n: usize) -> Self {
        self.fail_decode_at = Some(n);
        self
    }

    /// Make `token_to_piece` fail for `token`.
    #[must_use]
    pub fn fail_piece(mut self, token: TokenId) -> Self {
        self.fail_piece = Some(token);
        self
    }

    /// Every batch passed to `decode`, in call order.
    #[must_use]
    pub fn decoded(&self) -> &[Vec<BatchSlot>] {
        &self.decoded
    }

    /// Tokens currently held in KV memory.
    #[must_use]
    pub fn kv_len(&self) -> usize {
        self.kv_len
    }

    #[must_use]
    pub fn memory_clears(&self) -> usize {
        self.memory_clears
    }

    #[must_use]
    pub fn model(&self) -> &ScriptedModel {
        &self.model
    }

    fn scripted_token(&self) -> TokenId {
        self.model
            .reply
            .get(self.next_reply)
            .copied()
            .unwrap_or_else(|| self.model.fallback.unwrap_or(self.model.eos))
    }
}

impl ModelContext for ScriptedContext {
    fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    fn tokenize(&self, text: &str, add_bos: bool, parse_special: bool) -> Result<Vec<TokenId>> {
        let mut ids = Vec::new();
        if add_bos {
            if let Some(bos) = self.model.bos {
                ids.push(bos);
            }
        }

        let bytes = text.as_bytes();
        let mut at = 0;
        while at < bytes.len() {
            let rest = &bytes[at..];
            let best = self
                .model
                .pieces
                .iter()
                .enumerate()
                .filter(|(_, p)| !p.is_empty() && rest.starts_with(p))
                .filter(|(id, _)| {
                    #[allow(clippy::cast_possible_truncation)]
                    let id = *id as TokenId;
                    parse_special || !self.model.special.contains(&id)
                })
                .max_by_key(|(_, p)| p.len());
            let Some((id, piece)) = best else {
                return Err(Error::Tokenizer(format!(
                    "no piece matches input at byte {at}"
                )));
            };
            #[allow(clippy::cast_possible_truncation)]
            ids.push(id as TokenId);
            at += piece.len();
        }
        Ok(ids)
    }

    fn token_to_piece(&self, token: TokenId) -> Result<Vec<u8>> {
        if self.fail_piece == Some(token) {
            return Err(Error::Tokenizer(format!("scripted failure for token {token}")));
        }
        self.model
            .pieces
            .get(token as usize)
            .cloned()
            .ok_or_else(|| Error::Tokenizer(format!("unknown token {token}")))
    }

    fn decode(&mut self, batch: &Batch) -> Result<()> {
        let call = self.decoded.len();
        self.decoded.push(batch.slots().to_vec());

        if self.fail_decode_at == Some(call) {
            return Err(Error::Decode(format!("scripted failure on call {call}")));
        }
        if batch.is_empty() {
            return Err(Error::Decode("empty batch".into()));
        }
        for (i, slot) in batch.slots().iter().enumerate() {
            if slot.pos != self.kv_len + i {
                return Err(Error::Decode(format!(
                    "position {} does not follow KV length {}",
                    slot.pos,
                    self.kv_len + i
                )));
            }
        }
        self.kv_len += batch.len();

        if batch.output_index().is_some() {
            let mut logits = vec![0.0; self.model.pieces.len()];
            logits[self.scripted_token() as usize] = SCRIPTED_LOGIT;
            self.logits = Some(logits);
            self.next_reply += 1;
        } else {
            self.logits = None;
        }
        Ok(())
    }

    fn output_logits(&self) -> Result<&[f32]> {
        self.logits
            .as_deref()
            .ok_or_else(|| Error::Other("no output logits: nothing decoded with an output slot".into()))
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == self.model.eos
    }

    fn clear_memory(&mut self) {
        self.kv_len = 0;
        self.next_reply = 0;
        self.logits = None;
        self.memory_clears += 1;
    }
}
