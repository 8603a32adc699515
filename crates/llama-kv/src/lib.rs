//! # llama-kv
//!
//! KV cache accounting for llama-gen.
//!
//! The cache itself lives inside the model provider and is opaque to the engine.
//! What the engine owns is the bookkeeping: how many cells a context has and how
//! many of them earlier batches already filled. Every decode is gated on that
//! count.
//!
//! Supports:
//! - **Gating**: `check()` answers "does a batch of `n` still fit?" without mutating
//! - **Commit**: `commit()` records a successfully decoded batch
//! - **Session lifetime**: cells accumulate across calls; only `reset()` (a new
//!   session) returns them. There is no sliding-window eviction.

use std::fmt;

use llama_engine::LlamaError;

/// Error type for KV cache accounting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KVError {
    #[error("KV cache capacity exceeded: {used} + {incoming} > {capacity}")]
    CapacityExceeded {
        used: usize,
        incoming: usize,
        capacity: usize,
    },
}

pub type KVResult<T> = Result<T, KVError>;

impl From<KVError> for LlamaError {
    fn from(err: KVError) -> Self {
        match err {
            KVError::CapacityExceeded {
                used,
                incoming,
                capacity,
            } => LlamaError::ContextOverflow {
                used,
                incoming,
                capacity,
            },
        }
    }
}

/// Used vs. total KV cache cells of one context.
///
/// # Invariants
/// - `used_cells() <= capacity()` at all times
/// - `used_cells()` only grows between `reset()` calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextWindow {
    capacity: usize,
    used_cells: usize,
}

impl ContextWindow {
    /// Track a context with `capacity` cells, none of them used.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used_cells: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used_cells(&self) -> usize {
        self.used_cells
    }

    /// Cells still free.
    pub fn remaining(&self) -> usize {
        self.capacity - self.used_cells
    }

    pub fn is_empty(&self) -> bool {
        self.used_cells == 0
    }

    /// Verify that a batch of `incoming` tokens fits.
    ///
    /// # Errors
    /// - `CapacityExceeded`: `used_cells + incoming > capacity`
    pub fn check(&self, incoming: usize) -> KVResult<()> {
        let fits = self
            .used_cells
            .checked_add(incoming)
            .is_some_and(|total| total <= self.capacity);
        if fits {
            Ok(())
        } else {
            Err(KVError::CapacityExceeded {
                used: self.used_cells,
                incoming,
                capacity: self.capacity,
            })
        }
    }

    /// Record `decoded` cells as filled. Call only after the decode succeeded.
    ///
    /// Re-checks capacity so the invariant holds even if the caller skipped
    /// `check()`.
    pub fn commit(&mut self, decoded: usize) -> KVResult<()> {
        self.check(decoded)?;
        self.used_cells += decoded;
        Ok(())
    }

    /// Return every cell. Only valid when a new session begins.
    pub fn reset(&mut self) {
        self.used_cells = 0;
    }
}

impl fmt::Display for ContextWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}]", self.used_cells, self.capacity)
    }
}
