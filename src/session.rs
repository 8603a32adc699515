//! Generation sessions.
//!
//! A [`Session`] ties one exclusively owned [`LlamaContext`] (and its KV cache)
//! to a shared, read-only [`LlamaModel`], together with the context window, the
//! decode batch and the sampler chain. Everything mutable lives here, so two
//! sessions can never advance the same cache.
//!
//! Each call runs the state machine
//!
//! ```text
//! Init ─▶ PromptDecode ─▶ GenerateStep* ─▶ Terminated
//! ```
//!
//! - **PromptDecode** submits the prompt (in `n_batch` chunks, only the final
//!   entry requesting logits) and samples the first token from its logits.
//! - **GenerateStep** checks the interrupt flag and the window, decodes the last
//!   emitted token and samples the next one.
//!
//! Context and decode failures end the call with a [`TerminationReason`] and
//! every token emitted so far. Setup errors (empty prompt, tokenization, bad
//! configuration) are returned before the model is touched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use llama_engine::{
    Batch, DecodeError, LlamaContext, LlamaError, LlamaModel, Position, Result, SeqId, TokenId,
};
use llama_kv::ContextWindow;
use llama_sampling::{SamplerChain, SamplingError};
use llama_tokenizer::Tokenizer;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::generation::{Generation, GenerationState, TerminationReason};
use crate::stats::StatsTimer;

/// Sessions decode a single sequence.
const SEQ: SeqId = 0;

/// Cooperative cancellation flag for a running generation.
///
/// Cloned handles share the flag. It is checked at the top of every generate
/// step and cleared when the next call starts.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the running call to stop after its current step.
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    fn clear(&self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// One generation session over a shared model and an owned context.
pub struct Session<M: LlamaModel + ?Sized, C: LlamaContext> {
    id: Uuid,
    model: Arc<M>,
    context: C,
    window: ContextWindow,
    batch: Batch,
    sampler: SamplerChain,
    config: SessionConfig,
    /// Last emitted token not yet decoded; it opens the next call's prompt batch.
    carried: Option<TokenId>,
    /// Set by a decode failure; the session refuses work until `reset`.
    failed: Option<DecodeError>,
    interrupt: InterruptHandle,
}

impl<M: LlamaModel + ?Sized, C: LlamaContext> Session<M, C> {
    /// Create a session. The sampler chain is built and validated here, so a
    /// misconfigured chain is reported before any decode.
    pub fn new(model: Arc<M>, context: C, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let sampler = config.sampling.build()?;
        let window = ContextWindow::new(context.n_ctx());
        // A batch can never hold more cells than the context has.
        let batch = Batch::new(config.n_batch.min(window.capacity()).max(1), 1)?;
        let id = Uuid::new_v4();

        tracing::info!(
            session = %id,
            n_ctx = window.capacity(),
            n_batch = batch.capacity(),
            sampler = %sampler,
            "session created"
        );

        Ok(Session {
            id,
            model,
            context,
            window,
            batch,
            sampler,
            config,
            carried: None,
            failed: None,
            interrupt: InterruptHandle::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn model(&self) -> &Arc<M> {
        &self.model
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Effective batch capacity: `n_batch` capped at the context size.
    pub fn n_batch(&self) -> usize {
        self.batch.capacity()
    }

    pub fn window(&self) -> &ContextWindow {
        &self.window
    }

    pub fn sampler(&self) -> &SamplerChain {
        &self.sampler
    }

    /// Token emitted by the previous call that has not been decoded yet.
    pub fn carried_token(&self) -> Option<TokenId> {
        self.carried
    }

    /// Whether a decode failure has ended this session.
    pub fn is_failed(&self) -> bool {
        self.failed.is_some()
    }

    /// Handle that can interrupt this session from another thread.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    /// Generate up to `n_predict` tokens after `prompt`.
    pub fn generate(&mut self, prompt: &[TokenId], n_predict: usize) -> Result<Generation> {
        self.generate_with(prompt, n_predict, |_| {})
    }

    /// Like [`Session::generate`], calling `on_token` for every emitted token in
    /// emission order.
    pub fn generate_with<F>(
        &mut self,
        prompt: &[TokenId],
        n_predict: usize,
        mut on_token: F,
    ) -> Result<Generation>
    where
        F: FnMut(TokenId),
    {
        if let Some(err) = &self.failed {
            return Err(LlamaError::DecodeFailure(err.clone()));
        }
        self.check_vocab(prompt)?;

        let encoder = self.model.has_encoder();
        let pending: Vec<TokenId> = if encoder {
            if prompt.is_empty() {
                return Err(LlamaError::EmptyPrompt);
            }
            let start = self.model.decoder_start_token().ok_or_else(|| {
                LlamaError::Config("encoder-decoder model has no decoder start token".into())
            })?;
            // A new input replaces the previous one: the decoder starts over.
            self.reset();
            vec![start]
        } else {
            self.carried.iter().chain(prompt).copied().collect()
        };
        if pending.is_empty() {
            return Err(LlamaError::EmptyPrompt);
        }

        self.interrupt.clear();
        let mut state = GenerationState::new(prompt.to_vec(), n_predict);
        let mut timer = StatsTimer::start(pending.len());

        tracing::info!(
            session = %self.id,
            prompt_tokens = state.prompt_tokens.len(),
            carried = self.carried.is_some(),
            n_predict,
            window = %self.window,
            "generation started"
        );

        let outcome = self.run(&pending, encoder, &mut state, &mut timer, &mut on_token);
        let reason = match outcome {
            Ok(reason) => reason,
            Err(err) => TerminationReason::from_error(err)?,
        };

        match &reason {
            TerminationReason::ContextOverflow { .. } => {
                tracing::warn!(session = %self.id, window = %self.window, "{reason}");
            }
            TerminationReason::DecodeFailure(e) => {
                tracing::warn!(session = %self.id, window = %self.window, "{reason}");
                self.failed = Some(e.clone());
            }
            _ => {}
        }

        let generation = state.finish(reason, timer.finish());
        tracing::info!(
            session = %self.id,
            generated = generation.tokens.len(),
            reason = %generation.reason,
            cancelled = generation.cancelled,
            tokens_per_second = generation.stats.tokens_per_second,
            "generation finished"
        );
        Ok(generation)
    }

    /// Tokenize `text`, generate, and detokenize the output.
    pub fn generate_text(
        &mut self,
        text: &str,
        add_special: bool,
        parse_special: bool,
        n_predict: usize,
    ) -> Result<(Generation, String)> {
        let tokens = self.model.encode(text, add_special, parse_special)?;
        let generation = self.generate(&tokens, n_predict)?;
        let text = self.detokenize(&generation.tokens)?;
        Ok((generation, text))
    }

    /// Render tokens as text, special tokens omitted.
    pub fn detokenize(&self, tokens: &[TokenId]) -> Result<String> {
        Ok(self.model.decode(tokens, false, false)?)
    }

    /// Start a new session on the same context: clears the KV cache, the window,
    /// sampler state and any carried token.
    pub fn reset(&mut self) {
        self.context.clear_kv();
        self.window.reset();
        self.sampler.reset();
        self.batch.clear();
        self.carried = None;
        self.failed = None;
        tracing::debug!(session = %self.id, "session reset");
    }

    fn run<F>(
        &mut self,
        pending: &[TokenId],
        encoder: bool,
        state: &mut GenerationState,
        timer: &mut StatsTimer,
        on_token: &mut F,
    ) -> Result<TerminationReason>
    where
        F: FnMut(TokenId),
    {
        // PromptDecode
        if encoder {
            self.encode_prompt(&state.prompt_tokens)?;
        }
        self.decode_prompt(pending)?;
        self.carried = None;
        timer.mark_prompt_done();

        let mut logits_index = self.batch.logits_index().ok_or(DecodeError::MissingLogits {
            index: self.batch.len().saturating_sub(1),
        })?;

        loop {
            if state.remaining_budget == 0 {
                return Ok(TerminationReason::BudgetExhausted);
            }

            let token = self.sample(logits_index)?;
            if self.model.is_end_of_generation(token) {
                tracing::debug!(session = %self.id, token, "end of generation");
                return Ok(TerminationReason::EndOfGeneration);
            }

            state.emit(token);
            self.sampler.accept(token);
            self.carried = Some(token);
            timer.mark_token();
            on_token(token);
            tracing::debug!(
                session = %self.id,
                token,
                remaining = state.remaining_budget,
                window = %self.window,
                "token emitted"
            );

            // GenerateStep
            if state.remaining_budget == 0 {
                return Ok(TerminationReason::BudgetExhausted);
            }
            if self.interrupt.is_interrupted() {
                tracing::debug!(session = %self.id, "interrupted");
                state.cancel();
                return Ok(TerminationReason::BudgetExhausted);
            }

            let pos = self.next_position()?;
            self.batch.clear();
            self.batch.add(token, pos, &[SEQ], true)?;
            self.decode_batch()?;
            self.carried = None;
            logits_index = 0;
        }
    }

    /// Non-causal encoder pass; does not occupy decoder cells.
    ///
    /// The encoder sees the whole input in one call, so it gets a batch sized
    /// to the prompt instead of the `n_batch` decode batch.
    fn encode_prompt(&mut self, prompt: &[TokenId]) -> Result<()> {
        let mut batch = Batch::new(prompt.len(), 1)?;
        batch.add_sequence(prompt, 0, SEQ, false)?;
        DecodeError::check_encoder(self.context.encode(&batch))?;
        tracing::debug!(session = %self.id, tokens = prompt.len(), "encoder pass done");
        Ok(())
    }

    /// Decode `tokens` in batch-sized chunks. Only the last entry of the last
    /// chunk requests logits.
    fn decode_prompt(&mut self, tokens: &[TokenId]) -> Result<()> {
        self.window.check(tokens.len())?;

        let chunk_size = self.batch.capacity();
        let n_chunks = tokens.len().div_ceil(chunk_size);
        for (i, chunk) in tokens.chunks(chunk_size).enumerate() {
            let pos = self.next_position()?;
            self.batch.clear();
            self.batch.add_sequence(chunk, pos, SEQ, i + 1 == n_chunks)?;
            self.decode_batch()?;
            tracing::debug!(
                session = %self.id,
                chunk = i,
                tokens = chunk.len(),
                window = %self.window,
                "prompt chunk decoded"
            );
        }
        Ok(())
    }

    /// Gate on the window, decode the current batch, then record its cells.
    fn decode_batch(&mut self) -> Result<()> {
        let n = self.batch.len();
        self.window.check(n)?;
        DecodeError::check(self.context.decode(&self.batch))?;
        self.window.commit(n)?;
        Ok(())
    }

    fn sample(&mut self, index: usize) -> Result<TokenId> {
        let n_vocab = self.model.n_vocab();
        let logits = self
            .context
            .logits(index)
            .ok_or(DecodeError::MissingLogits { index })?;
        if logits.len() != n_vocab {
            return Err(DecodeError::MalformedLogits {
                expected: n_vocab,
                got: logits.len(),
            }
            .into());
        }

        match self.sampler.sample(logits) {
            Ok(token) => Ok(token),
            Err(SamplingError::InvalidLogits | SamplingError::NoValidTokens) => {
                Err(DecodeError::UnusableLogits { index }.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn next_position(&self) -> Result<Position> {
        Position::try_from(self.window.used_cells()).map_err(|_| {
            LlamaError::InvalidBatch(format!(
                "position {} exceeds the position range",
                self.window.used_cells()
            ))
        })
    }

    fn check_vocab(&self, tokens: &[TokenId]) -> Result<()> {
        let n_vocab = self.model.n_vocab();
        match tokens.iter().find(|&&t| t < 0 || t as usize >= n_vocab) {
            Some(bad) => Err(LlamaError::Tokenization(format!(
                "token {bad} is outside the vocabulary of {n_vocab}"
            ))),
            None => Ok(()),
        }
    }
}
