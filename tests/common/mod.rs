//! Mock model provider shared by the integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use llama_gen::{Batch, FixedVocab, LlamaContext, LlamaModel, Position, TokenId};
use llama_tokenizer::EOS_ID;

pub const STORY_PIECES: [&str; 11] = [
    " Write", " a", " short", " story", " about", " cat", ".", " The", " sat", " on", " mat",
];

/// Fixed-vocabulary model, optionally posing as an encoder-decoder.
pub struct MockModel {
    pub vocab: FixedVocab,
    encoder: bool,
    decoder_start: Option<TokenId>,
}

impl MockModel {
    pub fn new() -> Self {
        Self {
            vocab: FixedVocab::new(STORY_PIECES).with_space_prefix(true),
            encoder: false,
            decoder_start: None,
        }
    }

    pub fn encoder_decoder(decoder_start: Option<TokenId>) -> Self {
        Self {
            encoder: true,
            decoder_start,
            ..Self::new()
        }
    }

    pub fn token(&self, piece: &str) -> TokenId {
        self.vocab
            .token_for(piece.as_bytes())
            .unwrap_or_else(|| panic!("{piece:?} not in vocab"))
    }
}

impl LlamaModel for MockModel {
    fn n_vocab(&self) -> usize {
        self.vocab.n_vocab()
    }

    fn tokenize_into(&self, text: &str, add: bool, parse: bool, buf: &mut [TokenId]) -> i32 {
        self.vocab.tokenize_into(text, add, parse, buf)
    }

    fn detokenize_into(&self, tokens: &[TokenId], rm: bool, unparse: bool, buf: &mut [u8]) -> i32 {
        self.vocab.detokenize_into(tokens, rm, unparse, buf)
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == EOS_ID
    }

    fn has_encoder(&self) -> bool {
        self.encoder
    }

    fn bos_token(&self) -> Option<TokenId> {
        self.vocab.bos_token()
    }

    fn decoder_start_token(&self) -> Option<TokenId> {
        self.decoder_start
    }
}

/// Logits row favouring `token` heavily.
pub fn one_hot(n_vocab: usize, token: TokenId) -> Vec<f32> {
    let mut row = vec![0.0; n_vocab];
    row[token as usize] = 20.0;
    row
}

/// What a [`MockContext`] saw, kept outside the context so tests can inspect it
/// after the context has moved into a session.
#[derive(Debug, Default)]
pub struct CallLog {
    /// One entry per decode call: `(token, position, wants_logits)`.
    pub decodes: Vec<Vec<(TokenId, Position, bool)>>,
    pub encodes: Vec<Vec<TokenId>>,
    pub clears: usize,
}

impl CallLog {
    pub fn decoded_tokens(&self) -> Vec<TokenId> {
        self.decodes.iter().flatten().map(|e| e.0).collect()
    }
}

/// Context returning scripted logits: decode call `i` yields `script[i]`
/// (the last row repeats).
pub struct MockContext {
    n_ctx: usize,
    script: Vec<Vec<f32>>,
    calls: usize,
    current: Vec<f32>,
    outputs: Vec<bool>,
    fail_on: Option<(usize, i32)>,
    encode_status: i32,
    pub log: Arc<Mutex<CallLog>>,
}

impl MockContext {
    pub fn new(n_ctx: usize, script: Vec<Vec<f32>>) -> Self {
        Self {
            n_ctx,
            script,
            calls: 0,
            current: Vec::new(),
            outputs: Vec::new(),
            fail_on: None,
            encode_status: 0,
            log: Arc::new(Mutex::new(CallLog::default())),
        }
    }

    pub fn fixed(n_ctx: usize, logits: Vec<f32>) -> Self {
        Self::new(n_ctx, vec![logits])
    }

    /// Make decode call number `call` (0-based) return `status`.
    pub fn failing_on(mut self, call: usize, status: i32) -> Self {
        self.fail_on = Some((call, status));
        self
    }

    pub fn with_encode_status(mut self, status: i32) -> Self {
        self.encode_status = status;
        self
    }

    pub fn log(&self) -> Arc<Mutex<CallLog>> {
        Arc::clone(&self.log)
    }
}

impl LlamaContext for MockContext {
    fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    fn decode(&mut self, batch: &Batch) -> i32 {
        self.log
            .lock()
            .unwrap()
            .decodes
            .push(batch.entries().map(|e| (e.token, e.position, e.logits)).collect());

        let call = self.calls;
        self.calls += 1;
        if let Some((fail_call, status)) = self.fail_on {
            if fail_call == call {
                return status;
            }
        }

        let row = call.min(self.script.len() - 1);
        self.current = self.script[row].clone();
        self.outputs = batch.entries().map(|e| e.logits).collect();
        0
    }

    fn encode(&mut self, batch: &Batch) -> i32 {
        self.log.lock().unwrap().encodes.push(batch.tokens().to_vec());
        self.encode_status
    }

    fn logits(&self, batch_index: usize) -> Option<&[f32]> {
        match self.outputs.get(batch_index) {
            Some(true) => Some(&self.current),
            _ => None,
        }
    }

    fn clear_kv(&mut self) {
        self.log.lock().unwrap().clears += 1;
    }
}
