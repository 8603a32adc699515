//! Ordered sampler chain.

use std::fmt;

use llama_engine::TokenId;

use crate::{Candidates, SamplingError, SamplingResult, Stage};

/// Stages applied in insertion order; the last one selects.
///
/// The chain is owned by one session and mutated by `accept`, so it is not
/// shared between concurrent generations.
#[derive(Debug, Clone)]
pub struct SamplerChain {
    stages: Vec<Stage>,
}

impl SamplerChain {
    /// Validate and assemble a chain.
    ///
    /// Exactly one terminal stage is allowed and it must be last.
    pub fn new(stages: Vec<Stage>) -> SamplingResult<Self> {
        if stages.is_empty() {
            return Err(SamplingError::EmptyChain);
        }

        let terminals: Vec<usize> = stages
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_terminal())
            .map(|(i, _)| i)
            .collect();

        match terminals.as_slice() {
            [] => Err(SamplingError::MissingTerminal),
            [i] if *i + 1 == stages.len() => Ok(Self { stages }),
            [i] => Err(SamplingError::TerminalNotLast { index: *i }),
            _ => Err(SamplingError::MultipleTerminals),
        }
    }

    /// A chain that always picks the highest logit.
    pub fn greedy() -> Self {
        Self {
            stages: vec![Stage::Greedy],
        }
    }

    /// Sample one token from a logits row.
    pub fn sample(&mut self, logits: &[f32]) -> SamplingResult<TokenId> {
        if logits.is_empty() {
            return Err(SamplingError::InvalidLogits);
        }

        let mut candidates = Candidates::from_logits(logits);
        if candidates.is_empty() {
            return Err(SamplingError::NoValidTokens);
        }

        let (terminal, narrowing) = self
            .stages
            .split_last_mut()
            .ok_or(SamplingError::EmptyChain)?;

        for stage in narrowing {
            stage.narrow(&mut candidates);
            if candidates.is_empty() {
                return Err(SamplingError::NoValidTokens);
            }
        }

        terminal.select(&mut candidates)
    }

    /// Feed an emitted token to stateful stages.
    pub fn accept(&mut self, token: TokenId) {
        for stage in &mut self.stages {
            stage.accept(token);
        }
    }

    pub fn reset(&mut self) {
        for stage in &mut self.stages {
            stage.reset();
        }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(Stage::name).collect()
    }
}

impl fmt::Display for SamplerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.stage_names().join(" -> "))
    }
}
