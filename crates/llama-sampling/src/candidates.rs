//! Candidate set handed from stage to stage.

use llama_engine::TokenId;

/// One candidate token with its current logit and probability.
///
/// `p` is only meaningful right after [`Candidates::softmax`]; stages that edit
/// logits leave it stale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenData {
    pub id: TokenId,
    pub logit: f32,
    pub p: f32,
}

/// Candidate tokens for one position.
#[derive(Debug, Clone, Default)]
pub struct Candidates {
    data: Vec<TokenData>,
    sorted: bool,
}

impl Candidates {
    /// Build candidates from a logits row, one per vocabulary entry.
    ///
    /// NaN and `-inf` logits can never be drawn and are dropped; `+inf` is
    /// clamped to `f32::MAX`.
    pub fn from_logits(logits: &[f32]) -> Self {
        let data = logits
            .iter()
            .enumerate()
            .filter(|(_, l)| !l.is_nan() && **l != f32::NEG_INFINITY)
            .map(|(i, &l)| TokenData {
                id: i as TokenId,
                logit: l.min(f32::MAX),
                p: 0.0,
            })
            .collect();
        Self {
            data,
            sorted: false,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[TokenData] {
        &self.data
    }

    pub fn ids(&self) -> Vec<TokenId> {
        self.data.iter().map(|c| c.id).collect()
    }

    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    /// Sort by logit, descending. Stable, so equal logits keep id order.
    pub fn sort_desc(&mut self) {
        if self.sorted {
            return;
        }
        self.data
            .sort_by(|a, b| b.logit.partial_cmp(&a.logit).unwrap_or(std::cmp::Ordering::Equal));
        self.sorted = true;
    }

    /// Recompute `p` from the current logits (numerically stable softmax).
    pub fn softmax(&mut self) {
        let max_logit = self
            .data
            .iter()
            .map(|c| c.logit)
            .fold(f32::NEG_INFINITY, f32::max);

        let mut sum = 0.0f32;
        for c in &mut self.data {
            c.p = (c.logit - max_logit).exp();
            sum += c.p;
        }

        if sum > 0.0 {
            for c in &mut self.data {
                c.p /= sum;
            }
        } else {
            let uniform = 1.0 / self.data.len().max(1) as f32;
            for c in &mut self.data {
                c.p = uniform;
            }
        }
    }

    /// Keep the first `n` candidates. Order is preserved.
    pub fn truncate(&mut self, n: usize) {
        self.data.truncate(n);
    }

    /// Keep candidates matching `keep`. Order is preserved.
    pub fn retain(&mut self, keep: impl FnMut(&TokenData) -> bool) {
        self.data.retain(keep);
    }

    /// Apply `f` to every logit. Sort order is no longer guaranteed.
    pub fn map_logits(&mut self, mut f: impl FnMut(TokenId, f32) -> f32) {
        for c in &mut self.data {
            c.logit = f(c.id, c.logit);
        }
        self.sorted = false;
    }

    /// Highest-logit candidate; the earliest one wins ties.
    pub fn argmax(&self) -> Option<TokenData> {
        self.data.iter().copied().fold(None, |best, c| match best {
            Some(b) if b.logit >= c.logit => Some(b),
            _ => Some(c),
        })
    }
}
