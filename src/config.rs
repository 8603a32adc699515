//! Session configuration.

use std::path::Path;

use serde::Deserialize;

use crate::{LlamaError, Result, SamplingConfig};

/// Configuration for creating a [`Session`](crate::Session).
///
/// Every field has a default, so a config file only needs the values it
/// changes:
///
/// ```json
/// { "n_predict": 64, "sampling": { "temperature": 0.4, "seed": 1234 } }
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SessionConfig {
    /// Batch capacity. Prompts longer than this are decoded in chunks.
    #[serde(default = "default_n_batch")]
    pub n_batch: usize,

    /// Token budget for callers that do not pick their own.
    #[serde(default = "default_n_predict")]
    pub n_predict: usize,

    /// Sampling configuration.
    #[serde(default)]
    pub sampling: SamplingConfig,
}

fn default_n_batch() -> usize {
    512
}
fn default_n_predict() -> usize {
    128
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            n_batch: default_n_batch(),
            n_predict: default_n_predict(),
            sampling: SamplingConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Load a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| LlamaError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: SessionConfig =
            serde_json::from_str(raw).map_err(|e| LlamaError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_n_batch(mut self, n_batch: usize) -> Self {
        self.n_batch = n_batch;
        self
    }

    pub fn with_n_predict(mut self, n_predict: usize) -> Self {
        self.n_predict = n_predict;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingConfig) -> Self {
        self.sampling = sampling;
        self
    }

    /// Check ranges. Sampling parameters are checked too, so a bad chain is
    /// reported before a session touches the model.
    pub fn validate(&self) -> Result<()> {
        if self.n_batch == 0 {
            return Err(LlamaError::Config("n_batch must be > 0".into()));
        }
        self.sampling.validate()?;
        Ok(())
    }
}
