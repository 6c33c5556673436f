//! Reusable token batch submitted to the model runtime in one decode call.
//!
//! A [`Batch`] is allocated once per session with a fixed capacity and then
//! cleared and refilled before every decode. Clearing keeps the slot storage,
//! so steady-state generation never reallocates.

use crate::{Error, Result};

/// Vocabulary index produced by the runtime's tokenizer.
pub type TokenId = u32;

/// Absolute position of a token within a sequence.
pub type Pos = usize;

/// Identifier of a sequence stored in the runtime's KV memory.
pub type SeqId = u32;

/// One pending token in a [`Batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSlot {
    /// Token to feed.
    pub token: TokenId,
    /// Absolute position of the token.
    pub pos: Pos,
    /// Sequences this token belongs to.
    pub seq_ids: Vec<SeqId>,
    /// Whether the runtime should compute the output distribution here.
    pub output: bool,
}

/// Fixed-capacity container of token slots for one decode call.
#[derive(Debug, Clone)]
pub struct Batch {
    slots: Vec<BatchSlot>,
    capacity: usize,
}

impl Batch {
    /// Allocate an empty batch that holds at most `capacity` tokens.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Maximum number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently filled.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Filled slots in insertion order.
    #[must_use]
    pub fn slots(&self) -> &[BatchSlot] {
        &self.slots
    }

    /// Reset the count to zero. Slot storage is kept.
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Raise the capacity to at least `capacity`. Never shrinks.
    pub fn ensure_capacity(&mut self, capacity: usize) {
        if capacity > self.capacity {
            self.slots.reserve(capacity - self.slots.len());
            self.capacity = capacity;
        }
    }

    /// Append one slot.
    ///
    /// # Errors
    /// Returns [`Error::CapacityExceeded`] if the batch is full.
    pub fn add(&mut self, token: TokenId, pos: Pos, seq_ids: &[SeqId], output: bool) -> Result<()> {
        if self.slots.len() == self.capacity {
            return Err(Error::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        self.slots.push(BatchSlot {
            token,
            pos,
            seq_ids: seq_ids.to_vec(),
            output,
        });
        Ok(())
    }

    /// Request the output distribution for slot `index`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidBatchIndex`] if `index` is not a filled slot.
    pub fn mark_output(&mut self, index: usize) -> Result<()> {
        let len = self.slots.len();
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(Error::InvalidBatchIndex { index, len })?;
        slot.output = true;
        Ok(())
    }

    /// Index of the last slot flagged for output, if any.
    ///
    /// This is the slot whose distribution the sampler reads after decode.
    #[must_use]
    pub fn output_index(&self) -> Option<usize> {
        self.slots.iter().rposition(|s| s.output)
    }

    /// Number of slots flagged for output.
    #[must_use]
    pub fn num_outputs(&self) -> usize {
        self.slots.iter().filter(|s| s.output).count()
    }
}
