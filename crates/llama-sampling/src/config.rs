//! Sampling configuration.

use serde::Deserialize;

use crate::{SamplerChain, SamplingError, SamplingResult, Stage};

/// Sampling parameters, deserializable from a session config file.
///
/// [`SamplingConfig::build`] turns this into a [`SamplerChain`] with the fixed
/// stage order penalties → top-k → top-p → min-p → temperature → dist.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SamplingConfig {
    /// Temperature for logit scaling.
    /// - 0.0 or below: greedy (argmax, no randomness consumed)
    /// - 0.1-0.5: focused
    /// - 0.7-1.0: balanced
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Keep the K most likely tokens. 0 = disabled.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Nucleus threshold. 1.0 = disabled.
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Relative probability floor. 0.0 = disabled.
    #[serde(default = "default_min_p")]
    pub min_p: f32,

    /// Lower bound on candidates kept by any narrowing stage.
    #[serde(default = "default_min_keep")]
    pub min_keep: usize,

    /// Repetition penalty (1.0 = none).
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,

    /// How many recent tokens the penalties look at.
    #[serde(default = "default_repeat_last_n")]
    pub repeat_last_n: usize,

    #[serde(default)]
    pub frequency_penalty: f32,

    #[serde(default)]
    pub presence_penalty: f32,

    /// RNG seed for the dist stage. `None` draws one from entropy.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_temperature() -> f32 {
    0.8
}
fn default_top_k() -> usize {
    40
}
fn default_top_p() -> f32 {
    0.95
}
fn default_min_p() -> f32 {
    0.05
}
fn default_min_keep() -> usize {
    1
}
fn default_repeat_penalty() -> f32 {
    1.0
}
fn default_repeat_last_n() -> usize {
    64
}

impl Default for SamplingConfig {
    fn default() -> Self {
        SamplingConfig {
            temperature: default_temperature(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            min_p: default_min_p(),
            min_keep: default_min_keep(),
            repeat_penalty: default_repeat_penalty(),
            repeat_last_n: default_repeat_last_n(),
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            seed: None,
        }
    }
}

impl SamplingConfig {
    /// Greedy sampling: no truncation, no penalties, argmax.
    pub fn greedy() -> Self {
        SamplingConfig {
            temperature: 0.0,
            top_k: 0,
            top_p: 1.0,
            min_p: 0.0,
            repeat_penalty: 1.0,
            ..Default::default()
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_min_p(mut self, min_p: f32) -> Self {
        self.min_p = min_p;
        self
    }

    pub fn with_min_keep(mut self, min_keep: usize) -> Self {
        self.min_keep = min_keep;
        self
    }

    pub fn with_repeat_penalty(mut self, penalty: f32, last_n: usize) -> Self {
        self.repeat_penalty = penalty;
        self.repeat_last_n = last_n;
        self
    }

    pub fn with_frequency_penalty(mut self, penalty: f32) -> Self {
        self.frequency_penalty = penalty;
        self
    }

    pub fn with_presence_penalty(mut self, penalty: f32) -> Self {
        self.presence_penalty = penalty;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Disable top-k, top-p and min-p, leaving temperature and dist.
    pub fn without_truncation(mut self) -> Self {
        self.top_k = 0;
        self.top_p = 1.0;
        self.min_p = 0.0;
        self
    }

    pub fn validate(&self) -> SamplingResult<()> {
        let finite = [
            ("temperature", self.temperature),
            ("top_p", self.top_p),
            ("min_p", self.min_p),
            ("repeat_penalty", self.repeat_penalty),
            ("frequency_penalty", self.frequency_penalty),
            ("presence_penalty", self.presence_penalty),
        ];
        for (name, value) in finite {
            if !value.is_finite() {
                return Err(SamplingError::InvalidParameter(format!(
                    "{name} must be finite, got {value}"
                )));
            }
        }
        if self.top_p <= 0.0 {
            return Err(SamplingError::InvalidParameter(format!(
                "top_p must be > 0, got {}",
                self.top_p
            )));
        }
        if self.min_p > 1.0 {
            return Err(SamplingError::InvalidParameter(format!(
                "min_p must be <= 1, got {}",
                self.min_p
            )));
        }
        if self.repeat_penalty <= 0.0 {
            return Err(SamplingError::InvalidParameter(format!(
                "repeat_penalty must be > 0, got {}",
                self.repeat_penalty
            )));
        }
        Ok(())
    }

    fn has_penalties(&self) -> bool {
        self.repeat_last_n > 0
            && (self.repeat_penalty != 1.0
                || self.frequency_penalty != 0.0
                || self.presence_penalty != 0.0)
    }

    /// Validate and build the chain.
    pub fn build(&self) -> SamplingResult<SamplerChain> {
        self.validate()?;

        let mut stages = Vec::new();
        if self.has_penalties() {
            stages.push(Stage::penalties(
                self.repeat_last_n,
                self.repeat_penalty,
                self.frequency_penalty,
                self.presence_penalty,
            ));
        }

        if self.temperature <= 0.0 {
            stages.push(Stage::Greedy);
            return SamplerChain::new(stages);
        }

        if self.top_k > 0 {
            stages.push(Stage::TopK {
                k: self.top_k,
                min_keep: self.min_keep.max(1),
            });
        }
        if self.top_p < 1.0 {
            stages.push(Stage::top_p(self.top_p, self.min_keep));
        }
        if self.min_p > 0.0 {
            stages.push(Stage::min_p(self.min_p, self.min_keep));
        }
        stages.push(Stage::temperature(self.temperature));
        stages.push(Stage::dist(self.seed));

        SamplerChain::new(stages)
    }
}
