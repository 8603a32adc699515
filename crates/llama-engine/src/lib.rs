//! # llama-engine
//!
//! The "narrow waist" of the llama-gen stack. Defines the model provider traits,
//! the decode [`Batch`] and the error taxonomy that every other crate depends on.
//! Implementations can swap CPU/Metal/FFI backends without changing the
//! generation loop.
//!
//! ## Design Notes
//!
//! ### Model vs. Context
//! The provider is split in two. [`LlamaModel`] is the read-only half (vocabulary,
//! special tokens, weights) and takes `&self`, so one model can be shared across
//! sessions behind an `Arc`. [`LlamaContext`] holds the mutable KV cache and takes
//! `&mut self` for every state-advancing call; a session owns its context by value,
//! which makes sharing one KV cache between two sessions impossible to express.
//!
//! ### Buffer protocol
//! `tokenize_into` / `detokenize_into` follow the two-phase convention of C
//! inference libraries: a non-negative return is the number of items written, a
//! negative return `-n` means the buffer was too small and `n` items are required.
//! Callers should not use these directly; `llama-tokenizer` wraps them in a
//! size-then-fill helper that returns owned, correctly sized results.
//!
//! ### Token Type
//! `TokenId` is aliased as `i32` for FFI compatibility, though token IDs are logically
//! non-negative.

pub mod batch;

pub use batch::{Batch, BatchEntry};

pub type Result<T> = std::result::Result<T, LlamaError>;

/// Token ID type (i32 for FFI compat; logically non-negative).
pub type TokenId = i32;

/// Position of a token inside a sequence (monotonic within a session).
pub type Position = i32;

/// Identifier of a sequence sharing the KV cache.
pub type SeqId = i32;

/// Status code returned by a successful `decode` / `encode` call.
pub const DECODE_OK: i32 = 0;

/// Why a decode step produced nothing usable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("decode returned status {0}")]
    Status(i32),
    #[error("encode returned status {0}")]
    EncoderStatus(i32),
    #[error("no logits available for batch index {index}")]
    MissingLogits { index: usize },
    #[error("logits buffer has {got} entries, expected {expected}")]
    MalformedLogits { expected: usize, got: usize },
    #[error("logits row for batch index {index} has no sampleable entries")]
    UnusableLogits { index: usize },
}

impl DecodeError {
    /// Convert a raw decode status into a result.
    pub fn check(status: i32) -> std::result::Result<(), DecodeError> {
        if status == DECODE_OK {
            Ok(())
        } else {
            Err(DecodeError::Status(status))
        }
    }

    /// Convert a raw encode status into a result.
    pub fn check_encoder(status: i32) -> std::result::Result<(), DecodeError> {
        if status == DECODE_OK {
            Ok(())
        } else {
            Err(DecodeError::EncoderStatus(status))
        }
    }
}

/// Top-level error type for all engine operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LlamaError {
    #[error("Tokenization failed: {0}")]
    Tokenization(String),
    #[error("empty prompt")]
    EmptyPrompt,
    #[error("batch capacity exceeded: batch holds at most {capacity} tokens")]
    BatchCapacityExceeded { capacity: usize },
    #[error("invalid batch: {0}")]
    InvalidBatch(String),
    #[error("context overflow: {used} used + {incoming} incoming > {capacity} cells")]
    ContextOverflow {
        used: usize,
        incoming: usize,
        capacity: usize,
    },
    #[error("decode failed: {0}")]
    DecodeFailure(#[from] DecodeError),
    #[error("sampler misconfiguration: {0}")]
    SamplerMisconfiguration(String),
    #[error("sampling failed: {0}")]
    Sampling(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl LlamaError {
    /// Errors that end a generation gracefully (partial output is kept)
    /// rather than aborting before any model interaction.
    pub fn is_session_recoverable(&self) -> bool {
        matches!(
            self,
            LlamaError::ContextOverflow { .. } | LlamaError::DecodeFailure(_)
        )
    }
}

/// Read-only half of the model provider.
///
/// Holds the vocabulary and weights. Methods take `&self` so one model can back
/// any number of sessions; it must never carry per-session state.
pub trait LlamaModel: Send + Sync {
    /// Number of entries in the vocabulary (and in every logits row).
    fn n_vocab(&self) -> usize;

    /// Tokenize `text` into `buf`.
    ///
    /// Returns the number of tokens written, or `-required` if `buf` is too small.
    fn tokenize_into(
        &self,
        text: &str,
        add_special: bool,
        parse_special: bool,
        buf: &mut [TokenId],
    ) -> i32;

    /// Render `tokens` as UTF-8 bytes into `buf`.
    ///
    /// Returns the number of bytes written, or `-required` if `buf` is too small.
    fn detokenize_into(
        &self,
        tokens: &[TokenId],
        remove_special: bool,
        unparse_special: bool,
        buf: &mut [u8],
    ) -> i32;

    /// Whether `token` ends generation (EOS, EOT, ...).
    fn is_end_of_generation(&self, token: TokenId) -> bool;

    /// Encoder-decoder models need a non-causal encode pass over the prompt
    /// before decoding starts.
    fn has_encoder(&self) -> bool {
        false
    }

    /// Beginning-of-sequence token, if the vocabulary has one.
    fn bos_token(&self) -> Option<TokenId> {
        None
    }

    /// First token fed to the decoder of an encoder-decoder model.
    fn decoder_start_token(&self) -> Option<TokenId> {
        self.bos_token()
    }
}

/// Mutable half of the model provider: one KV cache, one owner.
pub trait LlamaContext: Send {
    /// Total KV cache cells.
    fn n_ctx(&self) -> usize;

    /// Run the causal forward pass over `batch`, appending to the KV cache.
    ///
    /// Returns `0` on success. Any other value is an opaque failure.
    fn decode(&mut self, batch: &Batch) -> i32;

    /// Non-causal encoder pass for encoder-decoder models.
    fn encode(&mut self, _batch: &Batch) -> i32 {
        -1
    }

    /// Logits for the entry at `batch_index` of the last decoded batch.
    ///
    /// Only entries added with `logits = true` have a row.
    fn logits(&self, batch_index: usize) -> Option<&[f32]>;

    /// Drop every cached cell.
    fn clear_kv(&mut self);
}
