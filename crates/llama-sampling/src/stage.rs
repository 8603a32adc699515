//! Individual sampling stages.
//!
//! A [`Stage`] is either *narrowing* (edits or shrinks the candidate set) or
//! *terminal* (picks one token). Only stateful stages do anything in
//! [`Stage::accept`].

use std::collections::{HashMap, VecDeque};

use llama_engine::TokenId;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::{Candidates, SamplingError, SamplingResult};

/// Repetition, frequency and presence penalties over the last `last_n`
/// accepted tokens.
#[derive(Debug, Clone)]
pub struct Penalties {
    last_n: usize,
    repeat: f32,
    frequency: f32,
    presence: f32,
    history: VecDeque<TokenId>,
}

impl Penalties {
    pub fn new(last_n: usize, repeat: f32, frequency: f32, presence: f32) -> Self {
        Self {
            last_n,
            repeat,
            frequency,
            presence,
            history: VecDeque::with_capacity(last_n),
        }
    }

    /// Tokens currently penalized, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &TokenId> {
        self.history.iter()
    }

    fn is_noop(&self) -> bool {
        self.last_n == 0
            || (self.repeat == 1.0 && self.frequency == 0.0 && self.presence == 0.0)
    }

    fn apply(&self, candidates: &mut Candidates) {
        if self.is_noop() || self.history.is_empty() {
            return;
        }

        let mut counts: HashMap<TokenId, usize> = HashMap::new();
        for &t in &self.history {
            *counts.entry(t).or_default() += 1;
        }

        // Divide positive logits, multiply negative ones: repeated tokens always
        // become less likely regardless of sign.
        candidates.map_logits(|id, logit| match counts.get(&id) {
            Some(&count) => {
                let scaled = if logit <= 0.0 {
                    logit * self.repeat
                } else {
                    logit / self.repeat
                };
                scaled - count as f32 * self.frequency - self.presence
            }
            None => logit,
        });
    }

    fn accept(&mut self, token: TokenId) {
        if self.last_n == 0 {
            return;
        }
        if self.history.len() == self.last_n {
            self.history.pop_front();
        }
        self.history.push_back(token);
    }

    fn reset(&mut self) {
        self.history.clear();
    }
}

/// Seeded draw from the final distribution.
#[derive(Debug, Clone)]
pub struct Dist {
    seed: u64,
    rng: StdRng,
}

impl Dist {
    /// `None` picks a random seed; [`Dist::seed`] reports it either way.
    pub fn new(seed: Option<u64>) -> Self {
        let seed = seed.unwrap_or_else(rand::random);
        Self {
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    fn select(&mut self, candidates: &mut Candidates) -> SamplingResult<TokenId> {
        // A single survivor needs no randomness.
        if candidates.len() == 1 {
            return Ok(candidates.as_slice()[0].id);
        }

        candidates.softmax();
        let dist = WeightedIndex::new(candidates.as_slice().iter().map(|c| c.p))
            .map_err(|_| SamplingError::NoValidTokens)?;
        let idx = dist.sample(&mut self.rng);
        Ok(candidates.as_slice()[idx].id)
    }

    fn reset(&mut self) {
        self.rng = StdRng::seed_from_u64(self.seed);
    }
}

/// One step of the sampling pipeline.
#[derive(Debug, Clone)]
pub enum Stage {
    Penalties(Penalties),
    /// Keep the `k` highest-logit candidates (`k == 0` disables).
    TopK { k: usize, min_keep: usize },
    /// Keep the smallest prefix whose cumulative probability reaches `p`.
    TopP { p: f32, min_keep: usize },
    /// Drop candidates with probability below `p * max_probability`.
    MinP { p: f32, min_keep: usize },
    /// Divide logits by `t`; `t <= 0` keeps only the argmax.
    Temperature(f32),
    Greedy,
    Dist(Dist),
}

impl Stage {
    pub fn top_k(k: usize) -> Self {
        Stage::TopK { k, min_keep: 1 }
    }

    pub fn top_p(p: f32, min_keep: usize) -> Self {
        Stage::TopP {
            p,
            min_keep: min_keep.max(1),
        }
    }

    pub fn min_p(p: f32, min_keep: usize) -> Self {
        Stage::MinP {
            p,
            min_keep: min_keep.max(1),
        }
    }

    pub fn temperature(t: f32) -> Self {
        Stage::Temperature(t)
    }

    pub fn dist(seed: Option<u64>) -> Self {
        Stage::Dist(Dist::new(seed))
    }

    pub fn penalties(last_n: usize, repeat: f32, frequency: f32, presence: f32) -> Self {
        Stage::Penalties(Penalties::new(last_n, repeat, frequency, presence))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Penalties(_) => "penalties",
            Stage::TopK { .. } => "top-k",
            Stage::TopP { .. } => "top-p",
            Stage::MinP { .. } => "min-p",
            Stage::Temperature(_) => "temp",
            Stage::Greedy => "greedy",
            Stage::Dist(_) => "dist",
        }
    }

    /// Whether this stage draws the final token.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Greedy | Stage::Dist(_))
    }

    /// Narrow or reweight `candidates` in place. No-op for terminal stages.
    pub fn narrow(&mut self, candidates: &mut Candidates) {
        match self {
            Stage::Penalties(p) => p.apply(candidates),
            Stage::TopK { k, min_keep } => apply_top_k(candidates, *k, *min_keep),
            Stage::TopP { p, min_keep } => apply_top_p(candidates, *p, *min_keep),
            Stage::MinP { p, min_keep } => apply_min_p(candidates, *p, *min_keep),
            Stage::Temperature(t) => apply_temperature(candidates, *t),
            Stage::Greedy | Stage::Dist(_) => {}
        }
    }

    /// Draw one token. Only terminal stages select.
    pub fn select(&mut self, candidates: &mut Candidates) -> SamplingResult<TokenId> {
        match self {
            Stage::Greedy => candidates
                .argmax()
                .map(|c| c.id)
                .ok_or(SamplingError::NoValidTokens),
            Stage::Dist(d) => {
                if candidates.is_empty() {
                    return Err(SamplingError::NoValidTokens);
                }
                d.select(candidates)
            }
            _ => Err(SamplingError::MissingTerminal),
        }
    }

    /// Record an emitted token.
    pub fn accept(&mut self, token: TokenId) {
        if let Stage::Penalties(p) = self {
            p.accept(token);
        }
    }

    /// Forget per-session state: penalty history and RNG position.
    pub fn reset(&mut self) {
        match self {
            Stage::Penalties(p) => p.reset(),
            Stage::Dist(d) => d.reset(),
            _ => {}
        }
    }
}

fn apply_top_k(candidates: &mut Candidates, k: usize, min_keep: usize) {
    if k == 0 {
        return;
    }
    let k = k.max(min_keep);
    if k >= candidates.len() {
        return;
    }
    candidates.sort_desc();
    candidates.truncate(k);
}

fn apply_top_p(candidates: &mut Candidates, p: f32, min_keep: usize) {
    if p >= 1.0 {
        return;
    }
    candidates.sort_desc();
    candidates.softmax();

    let mut cumsum = 0.0f32;
    let mut keep = candidates.len();
    for (i, c) in candidates.as_slice().iter().enumerate() {
        cumsum += c.p;
        if cumsum >= p && i + 1 >= min_keep {
            keep = i + 1;
            break;
        }
    }
    candidates.truncate(keep);
}

fn apply_min_p(candidates: &mut Candidates, p: f32, min_keep: usize) {
    if p <= 0.0 || candidates.is_empty() {
        return;
    }
    candidates.softmax();
    let max_p = candidates
        .as_slice()
        .iter()
        .map(|c| c.p)
        .fold(0.0f32, f32::max);
    let threshold = p * max_p;

    let surviving = candidates
        .as_slice()
        .iter()
        .filter(|c| c.p >= threshold)
        .count();
    if surviving >= min_keep {
        candidates.retain(|c| c.p >= threshold);
    } else {
        candidates.sort_desc();
        candidates.truncate(min_keep);
    }
}

fn apply_temperature(candidates: &mut Candidates, t: f32) {
    if t <= 0.0 {
        if let Some(best) = candidates.argmax() {
            candidates.retain(|c| c.id == best.id);
        }
        return;
    }
    if t == 1.0 {
        return;
    }
    // Clamp so a tiny temperature cannot turn finite logits into infinities.
    candidates.map_logits(|_, l| (l / t).clamp(-f32::MAX, f32::MAX));
}
