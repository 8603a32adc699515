//! Bounded decode batches.
//!
//! A [`Batch`] is the unit of work handed to [`LlamaContext::decode`](crate::LlamaContext::decode).
//! Storage is allocated once at construction: `clear()` only resets the count,
//! and every write is checked against the fixed capacity before it happens.

use crate::{LlamaError, Position, Result, SeqId, TokenId};

/// Read-only view of one batch entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry<'a> {
    pub token: TokenId,
    pub position: Position,
    pub seq_ids: &'a [SeqId],
    pub logits: bool,
}

/// Fixed-capacity set of `(token, position, seq_ids, logits)` entries.
///
/// # Invariants
/// - `len() <= capacity()` at all times
/// - every entry has between 1 and `n_seq_max` sequence ids
/// - backing storage is never reallocated after construction
#[derive(Debug, Clone)]
pub struct Batch {
    tokens: Vec<TokenId>,
    positions: Vec<Position>,
    seq_ids: Vec<Vec<SeqId>>,
    logits: Vec<bool>,
    n_tokens: usize,
    n_seq_max: usize,
}

impl Batch {
    /// Allocate a batch for up to `capacity` tokens, each belonging to at most
    /// `n_seq_max` sequences.
    pub fn new(capacity: usize, n_seq_max: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(LlamaError::InvalidBatch("capacity must be > 0".into()));
        }
        if n_seq_max == 0 {
            return Err(LlamaError::InvalidBatch("n_seq_max must be > 0".into()));
        }

        Ok(Self {
            tokens: vec![0; capacity],
            positions: vec![0; capacity],
            seq_ids: (0..capacity).map(|_| Vec::with_capacity(n_seq_max)).collect(),
            logits: vec![false; capacity],
            n_tokens: 0,
            n_seq_max,
        })
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.tokens.len()
    }

    /// Number of entries currently in the batch.
    pub fn len(&self) -> usize {
        self.n_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.n_tokens == 0
    }

    /// Free slots left before `add` starts failing.
    pub fn remaining(&self) -> usize {
        self.capacity() - self.n_tokens
    }

    /// Reset the entry count. Storage is kept for the next step.
    pub fn clear(&mut self) {
        self.n_tokens = 0;
    }

    /// Append one entry.
    ///
    /// # Errors
    /// - `BatchCapacityExceeded`: the batch is already full (nothing is written)
    /// - `InvalidBatch`: empty or oversized `seq_ids`, or a negative position
    pub fn add(
        &mut self,
        token: TokenId,
        position: Position,
        seq_ids: &[SeqId],
        logits: bool,
    ) -> Result<()> {
        if self.n_tokens == self.capacity() {
            return Err(LlamaError::BatchCapacityExceeded {
                capacity: self.capacity(),
            });
        }
        self.validate_entry(position, seq_ids)?;

        let i = self.n_tokens;
        self.tokens[i] = token;
        self.positions[i] = position;
        self.seq_ids[i].clear();
        self.seq_ids[i].extend_from_slice(seq_ids);
        self.logits[i] = logits;
        self.n_tokens += 1;

        Ok(())
    }

    /// Append a run of tokens of one sequence at consecutive positions starting
    /// at `start_pos`. When `logits_last` is set only the final entry requests
    /// logits.
    ///
    /// The whole run is checked against the remaining capacity first, so a failed
    /// call leaves the batch untouched.
    pub fn add_sequence(
        &mut self,
        tokens: &[TokenId],
        start_pos: Position,
        seq_id: SeqId,
        logits_last: bool,
    ) -> Result<()> {
        if tokens.len() > self.remaining() {
            return Err(LlamaError::BatchCapacityExceeded {
                capacity: self.capacity(),
            });
        }
        self.validate_entry(start_pos, &[seq_id])?;

        let last = tokens.len().saturating_sub(1);
        for (i, &token) in tokens.iter().enumerate() {
            let pos = start_pos + i as Position;
            self.add(token, pos, &[seq_id], logits_last && i == last)?;
        }
        Ok(())
    }

    fn validate_entry(&self, position: Position, seq_ids: &[SeqId]) -> Result<()> {
        if position < 0 {
            return Err(LlamaError::InvalidBatch(format!(
                "negative position {position}"
            )));
        }
        if seq_ids.is_empty() {
            return Err(LlamaError::InvalidBatch(
                "entry must belong to at least one sequence".into(),
            ));
        }
        if seq_ids.len() > self.n_seq_max {
            return Err(LlamaError::InvalidBatch(format!(
                "entry belongs to {} sequences, batch allows {}",
                seq_ids.len(),
                self.n_seq_max
            )));
        }
        Ok(())
    }

    /// Entry at `index`, if it has been written since the last `clear()`.
    pub fn get(&self, index: usize) -> Option<BatchEntry<'_>> {
        if index >= self.n_tokens {
            return None;
        }
        Some(BatchEntry {
            token: self.tokens[index],
            position: self.positions[index],
            seq_ids: &self.seq_ids[index],
            logits: self.logits[index],
        })
    }

    /// Iterate over the live entries in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = BatchEntry<'_>> + '_ {
        (0..self.n_tokens).filter_map(move |i| self.get(i))
    }

    /// Tokens of the live entries.
    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens[..self.n_tokens]
    }

    /// Positions of the live entries.
    pub fn positions(&self) -> &[Position] {
        &self.positions[..self.n_tokens]
    }

    /// Index of the last entry that requests logits.
    pub fn logits_index(&self) -> Option<usize> {
        self.logits[..self.n_tokens].iter().rposition(|&l| l)
    }

    /// Number of entries that request logits.
    pub fn n_outputs(&self) -> usize {
        self.logits[..self.n_tokens].iter().filter(|&&l| l).count()
    }
}
