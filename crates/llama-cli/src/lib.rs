//! # llama-cli
//!
//! Demo pipeline for llama-gen.
//!
//! Wires: tokenizer → session (prompt decode, decode steps, sampling) → streaming
//! detokenizer. The model behind it is a tiny deterministic stand-in: a fixed
//! English vocabulary and a context that hashes what it has seen into
//! pseudo-logits, so runs are reproducible without any weights on disk.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use llama_gen::{
    Batch, DecodingState, FixedVocab, Generation, LlamaContext, LlamaError, LlamaModel, Position,
    Session, SessionConfig, TokenId, Tokenizer,
};

/// Errors from the demo pipeline.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Llama(#[from] LlamaError),
    #[error("writing output: {0}")]
    Io(#[from] std::io::Error),
}

/// Word pieces of the demo vocabulary, on top of the 256 byte tokens.
pub const TINY_PIECES: [&str; 30] = [
    " the", " The", " a", " cat", " dog", " sat", " ran", " on", " mat", " and", " to", " in",
    " was", " it", " little", " big", " house", " garden", " sun", " day", " Write", " short",
    " story", " about", " Once", " upon", " time", ".", ",", "\n",
];

/// Read-only half of the demo model.
#[derive(Debug, Clone)]
pub struct TinyModel {
    vocab: FixedVocab,
}

impl TinyModel {
    pub fn new() -> Self {
        Self {
            vocab: FixedVocab::new(TINY_PIECES).with_space_prefix(true),
        }
    }

    pub fn vocab(&self) -> &FixedVocab {
        &self.vocab
    }
}

impl Default for TinyModel {
    fn default() -> Self {
        Self::new()
    }
}

impl LlamaModel for TinyModel {
    fn n_vocab(&self) -> usize {
        self.vocab.n_vocab()
    }

    fn tokenize_into(
        &self,
        text: &str,
        add_special: bool,
        parse_special: bool,
        buf: &mut [TokenId],
    ) -> i32 {
        self.vocab.tokenize_into(text, add_special, parse_special, buf)
    }

    fn detokenize_into(
        &self,
        tokens: &[TokenId],
        remove_special: bool,
        unparse_special: bool,
        buf: &mut [u8],
    ) -> i32 {
        self.vocab
            .detokenize_into(tokens, remove_special, unparse_special, buf)
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        self.vocab.is_end_of_generation(token)
    }

    fn bos_token(&self) -> Option<TokenId> {
        self.vocab.bos_token()
    }
}

fn mix(state: u64, token: TokenId, position: Position) -> u64 {
    let mut z = state ^ ((token as u32 as u64) << 32) ^ position as u32 as u64;
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Mutable half of the demo model: a KV cache of `(token, position)` cells and
/// the logits of the last decode call.
///
/// Each logits row is a function of every cell up to and including the entry
/// that requested it, so the same history always yields the same row.
pub struct TinyContext {
    n_ctx: usize,
    bias: Vec<f32>,
    eos: Option<usize>,
    cells: Vec<(TokenId, Position)>,
    history: u64,
    rows: Vec<Option<Vec<f32>>>,
}

impl TinyContext {
    pub fn new(model: &TinyModel, n_ctx: usize) -> Self {
        let vocab = model.vocab();
        let bias = (0..model.n_vocab() as TokenId)
            .map(|token| match vocab.piece(token) {
                _ if model.is_end_of_generation(token) => -3.0,
                _ if vocab.is_control(token) => f32::NEG_INFINITY,
                Some([b]) if b.is_ascii_lowercase() => -1.0,
                Some([_]) | None => -6.0,
                Some(_) => 3.0,
            })
            .collect();
        let eos = (0..model.n_vocab()).find(|&t| model.is_end_of_generation(t as TokenId));
        Self {
            n_ctx,
            bias,
            eos,
            cells: Vec::new(),
            history: 0,
            rows: Vec::new(),
        }
    }

    /// Cells currently held in the KV cache.
    pub fn n_cells(&self) -> usize {
        self.cells.len()
    }

    fn row(&self, state: u64, position: Position) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(state);
        // Ending grows likelier the longer the sequence runs.
        let eos_drift = position as f32 * 0.05;
        self.bias
            .iter()
            .enumerate()
            .map(|(token, &bias)| {
                let noise: f32 = rng.gen_range(-2.0..2.0);
                if self.eos == Some(token) {
                    bias + noise + eos_drift
                } else {
                    bias + noise
                }
            })
            .collect()
    }
}

impl LlamaContext for TinyContext {
    fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    fn decode(&mut self, batch: &Batch) -> i32 {
        if batch.is_empty() {
            return -1;
        }
        if self.cells.len() + batch.len() > self.n_ctx {
            // No free KV slot.
            return 1;
        }
        let mut expected = self.cells.len() as Position;
        for &position in batch.positions() {
            if position != expected {
                return -1;
            }
            expected += 1;
        }

        self.rows.clear();
        for entry in batch.entries() {
            self.history = mix(self.history, entry.token, entry.position);
            self.cells.push((entry.token, entry.position));
            let row = entry.logits.then(|| self.row(self.history, entry.position));
            self.rows.push(row);
        }
        0
    }

    fn logits(&self, batch_index: usize) -> Option<&[f32]> {
        self.rows.get(batch_index)?.as_deref()
    }

    fn clear_kv(&mut self) {
        self.cells.clear();
        self.history = 0;
        self.rows.clear();
    }
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub n_predict: Option<usize>,
    pub n_batch: Option<usize>,
    pub seed: Option<u64>,
    pub temperature: Option<f32>,
    pub top_k: Option<usize>,
    pub top_p: Option<f32>,
    pub min_p: Option<f32>,
}

impl Overrides {
    pub fn apply(&self, mut config: SessionConfig) -> SessionConfig {
        if let Some(n) = self.n_predict {
            config.n_predict = n;
        }
        if let Some(n) = self.n_batch {
            config.n_batch = n;
        }
        let sampling = &mut config.sampling;
        if let Some(seed) = self.seed {
            sampling.seed = Some(seed);
        }
        if let Some(t) = self.temperature {
            sampling.temperature = t;
        }
        if let Some(k) = self.top_k {
            sampling.top_k = k;
        }
        if let Some(p) = self.top_p {
            sampling.top_p = p;
        }
        if let Some(p) = self.min_p {
            sampling.min_p = p;
        }
        config
    }
}

/// Everything one `generate` run needs.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub prompt: String,
    pub config_path: Option<PathBuf>,
    pub overrides: Overrides,
    pub ctx_size: usize,
    /// Parse control text such as `</s>` in the prompt into control tokens.
    pub parse_special: bool,
}

impl GenerateOptions {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            config_path: None,
            overrides: Overrides::default(),
            ctx_size: 512,
            parse_special: true,
        }
    }

    /// File config (or defaults) with command-line overrides applied.
    pub fn session_config(&self) -> Result<SessionConfig, LlamaError> {
        let base = match &self.config_path {
            Some(path) => SessionConfig::from_file(path)?,
            None => SessionConfig::default(),
        };
        let config = self.overrides.apply(base);
        config.validate()?;
        Ok(config)
    }
}

/// Result of a generation run.
#[derive(Debug)]
pub struct GenerateResult {
    pub prompt_tokens: Vec<TokenId>,
    pub generation: Generation,
    pub text: String,
}

/// Run one generation, streaming text to `out` as tokens arrive.
pub fn generate<W: Write>(options: &GenerateOptions, out: &mut W) -> Result<GenerateResult, CliError> {
    let config = options.session_config()?;
    let n_predict = config.n_predict;
    let model = Arc::new(TinyModel::new());
    let context = TinyContext::new(&model, options.ctx_size);
    let mut session = Session::new(Arc::clone(&model), context, config)?;

    let prompt_tokens = model.encode(&options.prompt, true, options.parse_special).map_err(LlamaError::from)?;
    tracing::debug!(tokens = ?prompt_tokens, "prompt tokenized");

    let mut stream = DecodingState::new();
    let mut stream_error: Option<CliError> = None;
    let generation = session.generate_with(&prompt_tokens, n_predict, |token| {
        if stream_error.is_some() {
            return;
        }
        let piece = match model.decode_token(token, &mut stream) {
            Ok(piece) => piece,
            Err(e) => {
                stream_error = Some(LlamaError::from(e).into());
                return;
            }
        };
        if let Err(e) = out.write_all(piece.as_bytes()).and_then(|()| out.flush()) {
            stream_error = Some(e.into());
        }
    })?;
    if let Some(e) = stream_error {
        return Err(e);
    }
    let tail = stream.flush();
    out.write_all(tail.as_bytes())?;
    out.flush()?;

    Ok(GenerateResult {
        prompt_tokens,
        generation,
        text: stream.buffer().to_string(),
    })
}
