//! # llama-sampling
//!
//! Sampling chain for llama-gen.
//!
//! A [`SamplerChain`] is an ordered list of [`Stage`]s. Every stage but the last
//! narrows or reweights the candidate set; the last one selects exactly one token.
//!
//! Supports:
//! - Repetition / frequency / presence penalties (stateful, fed by `accept`)
//! - Top-k truncation
//! - Top-p (nucleus) filtering
//! - Min-p filtering
//! - Temperature scaling (`t <= 0` degenerates to argmax)
//! - Greedy or seeded distribution sampling as the terminal stage
//!
//! ## Sampling Pipeline
//!
//! ```text
//! Logits [n_vocab] (last decoded position)
//!     │
//!     ▼ penalties (optional)
//!     ▼ top-k     (optional)
//!     ▼ top-p     (optional)
//!     ▼ min-p     (optional)
//!     ▼ temperature
//!     │
//!     ▼ dist (seeded) | greedy
//! Selected token
//! ```

pub mod candidates;
pub mod chain;
pub mod config;
pub mod stage;

pub use candidates::{Candidates, TokenData};
pub use chain::SamplerChain;
pub use config::SamplingConfig;
pub use stage::{Dist, Penalties, Stage};

use llama_engine::LlamaError;

/// Sampling error type.
#[derive(Debug, Clone, PartialEq)]
pub enum SamplingError {
    InvalidLogits,
    NoValidTokens,
    EmptyChain,
    MissingTerminal,
    MultipleTerminals,
    TerminalNotLast { index: usize },
    InvalidParameter(String),
}

impl SamplingError {
    /// Errors detectable when the chain is built, before any decode.
    pub fn is_misconfiguration(&self) -> bool {
        matches!(
            self,
            SamplingError::EmptyChain
                | SamplingError::MissingTerminal
                | SamplingError::MultipleTerminals
                | SamplingError::TerminalNotLast { .. }
                | SamplingError::InvalidParameter(_)
        )
    }
}

impl std::fmt::Display for SamplingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SamplingError::InvalidLogits => write!(f, "Invalid logits array"),
            SamplingError::NoValidTokens => write!(f, "No valid tokens after filtering"),
            SamplingError::EmptyChain => write!(f, "Sampler chain has no stages"),
            SamplingError::MissingTerminal => {
                write!(f, "Sampler chain has no terminal (greedy/dist) stage")
            }
            SamplingError::MultipleTerminals => {
                write!(f, "Sampler chain has more than one terminal stage")
            }
            SamplingError::TerminalNotLast { index } => {
                write!(f, "Terminal stage at index {index} is not last in the chain")
            }
            SamplingError::InvalidParameter(msg) => write!(f, "Invalid sampling parameter: {msg}"),
        }
    }
}

impl std::error::Error for SamplingError {}

impl From<SamplingError> for LlamaError {
    fn from(err: SamplingError) -> Self {
        if err.is_misconfiguration() {
            LlamaError::SamplerMisconfiguration(err.to_string())
        } else {
            LlamaError::Sampling(err.to_string())
        }
    }
}

pub type SamplingResult<T> = std::result::Result<T, SamplingError>;
