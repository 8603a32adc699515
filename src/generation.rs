//! Generation results and per-call state.

use std::fmt;

use llama_engine::{DecodeError, LlamaError, TokenId};

use crate::stats::GenerationStats;

/// Why a generation call stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// The model sampled an end-of-generation token (not included in the output).
    EndOfGeneration,
    /// The token budget reached zero, or the call was interrupted.
    BudgetExhausted,
    /// The next batch would not fit in the context window; decode was not called.
    ContextOverflow {
        used: usize,
        incoming: usize,
        capacity: usize,
    },
    /// The model failed to decode. The session must be reset before reuse.
    DecodeFailure(DecodeError),
}

impl TerminationReason {
    /// Classify an error raised after the model was touched.
    ///
    /// Context and decode failures become a termination reason; anything else is
    /// handed back unchanged.
    pub fn from_error(err: LlamaError) -> std::result::Result<Self, LlamaError> {
        match err {
            LlamaError::ContextOverflow {
                used,
                incoming,
                capacity,
            } => Ok(TerminationReason::ContextOverflow {
                used,
                incoming,
                capacity,
            }),
            LlamaError::DecodeFailure(e) => Ok(TerminationReason::DecodeFailure(e)),
            other => Err(other),
        }
    }

    /// Whether the session can keep generating after this reason.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            TerminationReason::EndOfGeneration | TerminationReason::BudgetExhausted
        )
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::EndOfGeneration => write!(f, "end of generation"),
            TerminationReason::BudgetExhausted => write!(f, "budget exhausted"),
            TerminationReason::ContextOverflow {
                used,
                incoming,
                capacity,
            } => write!(
                f,
                "context overflow ({used} used + {incoming} incoming > {capacity})"
            ),
            TerminationReason::DecodeFailure(e) => write!(f, "decode failure: {e}"),
        }
    }
}

/// Output of one generation call: every emitted token plus the reason it stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    /// Emitted tokens, in sampling order. Never contains the end-of-generation token.
    pub tokens: Vec<TokenId>,
    pub reason: TerminationReason,
    /// Set when the call stopped because its interrupt handle was raised.
    pub cancelled: bool,
    pub stats: GenerationStats,
}

impl Generation {
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Mutable state of one call, owned by the session while it runs.
#[derive(Debug)]
pub(crate) struct GenerationState {
    pub(crate) prompt_tokens: Vec<TokenId>,
    pub(crate) generated_tokens: Vec<TokenId>,
    pub(crate) remaining_budget: usize,
    pub(crate) cancelled: bool,
}

impl GenerationState {
    pub(crate) fn new(prompt_tokens: Vec<TokenId>, n_predict: usize) -> Self {
        Self {
            prompt_tokens,
            generated_tokens: Vec::with_capacity(n_predict.min(4096)),
            remaining_budget: n_predict,
            cancelled: false,
        }
    }

    /// Record an emitted token. Budget is checked by the caller first.
    pub(crate) fn emit(&mut self, token: TokenId) {
        self.generated_tokens.push(token);
        self.remaining_budget = self.remaining_budget.saturating_sub(1);
    }

    /// Cooperative cancellation: drop the remaining budget.
    pub(crate) fn cancel(&mut self) {
        self.remaining_budget = 0;
        self.cancelled = true;
    }

    pub(crate) fn finish(self, reason: TerminationReason, stats: GenerationStats) -> Generation {
        Generation {
            tokens: self.generated_tokens,
            reason,
            cancelled: self.cancelled,
            stats,
        }
    }
}
