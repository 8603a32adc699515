//! # llama-tokenizer
//!
//! Text ⇄ token conversion on top of any [`LlamaModel`].
//!
//! This crate provides:
//! - [`size_then_fill`], which hides the two-phase buffer protocol of
//!   `tokenize_into` / `detokenize_into`
//! - A [`Tokenizer`] extension trait implemented for every model
//! - Streaming decoding with UTF-8 handling ([`DecodingState`])
//! - [`FixedVocab`], a reference model vocabulary for tests and demos
//!
//! ## Whitespace
//!
//! Vocabularies with a space prefix (SentencePiece style) drop the leading space
//! of the first rendered piece. Decoding tokens one at a time with
//! [`Tokenizer::token_to_piece`] therefore loses the space in front of every
//! word, while [`Tokenizer::decode`] and [`Tokenizer::decode_token`] agree with
//! each other byte for byte.

mod vocab;

pub use vocab::{FixedVocab, BOS_ID, EOS_ID, UNK_ID};

use llama_engine::{LlamaError, LlamaModel, TokenId};

/// Error type for tokenization operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenizerError {
    #[error("Invalid token ID: {0}")]
    InvalidToken(TokenId),
    #[error("Encoding error: {0}")]
    EncodingError(String),
    #[error("Decoding error: {0}")]
    DecodingError(String),
    #[error("buffer still too small after resize: required {required}, provider returned {returned}")]
    BufferSizing { required: usize, returned: i32 },
}

pub type TokenizerResult<T> = std::result::Result<T, TokenizerError>;

impl From<TokenizerError> for LlamaError {
    fn from(err: TokenizerError) -> Self {
        LlamaError::Tokenization(err.to_string())
    }
}

/// Run a two-phase sizing call and return an owned, exactly sized result.
///
/// `fill` writes into the buffer and returns the item count, or `-required` when
/// the buffer is too small. On a negative return the buffer is resized and
/// `fill` is called exactly once more; a second shortfall is an error.
pub fn size_then_fill<T, F>(initial: usize, mut fill: F) -> TokenizerResult<Vec<T>>
where
    T: Copy + Default,
    F: FnMut(&mut [T]) -> i32,
{
    let mut buf = vec![T::default(); initial];
    let n = fill(&mut buf);
    if n >= 0 {
        return finish(buf, n);
    }

    let required = n.unsigned_abs() as usize;
    buf.resize(required, T::default());
    let n = fill(&mut buf);
    if n < 0 {
        return Err(TokenizerError::BufferSizing {
            required,
            returned: n,
        });
    }
    finish(buf, n)
}

fn finish<T>(mut buf: Vec<T>, n: i32) -> TokenizerResult<Vec<T>> {
    let n = n as usize;
    if n > buf.len() {
        return Err(TokenizerError::BufferSizing {
            required: buf.len(),
            returned: n as i32,
        });
    }
    buf.truncate(n);
    Ok(buf)
}

/// Tokenization helpers available on every [`LlamaModel`].
pub trait Tokenizer: LlamaModel {
    /// Encode text into a sequence of token IDs.
    fn encode(
        &self,
        text: &str,
        add_special: bool,
        parse_special: bool,
    ) -> TokenizerResult<Vec<TokenId>> {
        let hint = text.len() + if add_special { 2 } else { 0 };
        size_then_fill(hint, |buf| {
            self.tokenize_into(text, add_special, parse_special, buf)
        })
    }

    /// Decode tokens into raw bytes. Token boundaries may split UTF-8 sequences.
    fn decode_bytes(
        &self,
        tokens: &[TokenId],
        remove_special: bool,
        unparse_special: bool,
    ) -> TokenizerResult<Vec<u8>> {
        let n_vocab = self.n_vocab();
        if let Some(&bad) = tokens
            .iter()
            .find(|&&t| t < 0 || t as usize >= n_vocab)
        {
            return Err(TokenizerError::InvalidToken(bad));
        }
        size_then_fill(tokens.len(), |buf| {
            self.detokenize_into(tokens, remove_special, unparse_special, buf)
        })
    }

    /// Decode a complete sequence of tokens into text.
    ///
    /// Invalid UTF-8 is replaced with U+FFFD.
    fn decode(
        &self,
        tokens: &[TokenId],
        remove_special: bool,
        unparse_special: bool,
    ) -> TokenizerResult<String> {
        let bytes = self.decode_bytes(tokens, remove_special, unparse_special)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Bytes of a single token decoded on its own (special tokens rendered).
    fn token_to_piece(&self, token: TokenId) -> TokenizerResult<Vec<u8>> {
        self.decode_bytes(&[token], false, true)
    }

    /// Decode one more token of a stream.
    ///
    /// Returns the newly printable text. Bytes of an incomplete UTF-8 sequence are
    /// held in `state` until a later token completes them.
    ///
    /// Every call re-decodes the whole stream so that joined output matches a
    /// joint [`Tokenizer::decode`] exactly; streaming `n` tokens costs O(n²)
    /// detokenized bytes. Call [`DecodingState::clear`] between unrelated
    /// streams.
    fn decode_token(&self, token: TokenId, state: &mut DecodingState) -> TokenizerResult<String> {
        state.tokens.push(token);
        let bytes = match self.decode_bytes(&state.tokens, false, state.unparse_special) {
            Ok(bytes) => bytes,
            Err(e) => {
                state.tokens.pop();
                return Err(e);
            }
        };

        let fresh = bytes.get(state.consumed..).ok_or_else(|| {
            TokenizerError::DecodingError(format!(
                "stream shrank from {} to {} bytes",
                state.consumed,
                bytes.len()
            ))
        })?;
        state.pending_utf8.extend_from_slice(fresh);
        state.consumed = bytes.len();

        let emitted = state.drain_utf8();
        state.buffer.push_str(&emitted);
        Ok(emitted)
    }
}

impl<M: LlamaModel + ?Sized> Tokenizer for M {}

/// Streaming decoding state for handling partial UTF-8 sequences.
#[derive(Debug, Clone, Default)]
pub struct DecodingState {
    tokens: Vec<TokenId>,
    consumed: usize,
    buffer: String,
    pending_utf8: Vec<u8>,
    unparse_special: bool,
}

impl DecodingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render control tokens as text while streaming.
    pub fn with_special(mut self, unparse_special: bool) -> Self {
        self.unparse_special = unparse_special;
        self
    }

    /// Everything emitted so far.
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    /// Bytes held back waiting for the rest of a UTF-8 sequence.
    pub fn pending_bytes(&self) -> usize {
        self.pending_utf8.len()
    }

    /// End the stream, emitting U+FFFD for any incomplete trailing sequence.
    pub fn flush(&mut self) -> String {
        if self.pending_utf8.is_empty() {
            return String::new();
        }
        self.pending_utf8.clear();
        let tail = char::REPLACEMENT_CHARACTER.to_string();
        self.buffer.push_str(&tail);
        tail
    }

    pub fn clear(&mut self) {
        self.tokens.clear();
        self.consumed = 0;
        self.buffer.clear();
        self.pending_utf8.clear();
    }

    /// Move every complete character out of `pending_utf8`. Invalid sequences
    /// become U+FFFD; a truncated sequence at the end stays pending.
    fn drain_utf8(&mut self) -> String {
        let mut out = String::new();
        let mut start = 0;
        loop {
            match std::str::from_utf8(&self.pending_utf8[start..]) {
                Ok(s) => {
                    out.push_str(s);
                    start = self.pending_utf8.len();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    // valid_up_to bytes were just validated
                    out.push_str(&String::from_utf8_lossy(
                        &self.pending_utf8[start..start + valid],
                    ));
                    start += valid;
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            start += len;
                        }
                        None => break,
                    }
                }
            }
        }
        self.pending_utf8.drain(..start);
        out
    }
}
