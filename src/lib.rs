//! Autoregressive token generation over an opaque model.
//!
//! This crate ties the workspace together: a [`Session`] drives prompt decoding,
//! per-token decode steps and sampling against any [`LlamaModel`] /
//! [`LlamaContext`] pair, tracking the KV cache with a [`ContextWindow`].
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use llama_gen::*;
//! # fn demo<M: LlamaModel, C: LlamaContext>(model: Arc<M>, ctx: C) -> Result<()> {
//! let config = SessionConfig::default()
//!     .with_sampling(SamplingConfig::default().with_seed(1234).with_temperature(0.4));
//! let mut session = Session::new(model, ctx, config)?;
//! let (generation, text) = session.generate_text("Write a short story about a cat.", true, true, 64)?;
//! println!("{text} [{}]", generation.reason);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod generation;
pub mod session;
pub mod stats;

pub use config::SessionConfig;
pub use generation::{Generation, TerminationReason};
pub use session::{InterruptHandle, Session};
pub use stats::GenerationStats;

pub use llama_engine::{
    Batch, DecodeError, LlamaContext, LlamaError, LlamaModel, Position, Result, SeqId, TokenId,
};
pub use llama_kv::ContextWindow;
pub use llama_sampling::{SamplerChain, SamplingConfig, Stage};
pub use llama_tokenizer::{DecodingState, FixedVocab, Tokenizer};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
