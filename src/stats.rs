//! Timing for one generation call.

use std::time::Instant;

/// Statistics from a generation run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationStats {
    /// Number of tokens submitted in the prompt phase (including a carried token).
    pub prompt_tokens: usize,

    /// Number of tokens emitted.
    pub generated_tokens: usize,

    /// Time for the prompt decode in milliseconds.
    pub prompt_time_ms: f64,

    /// Time for the generate steps in milliseconds.
    pub decode_time_ms: f64,

    /// Tokens per second during the generate steps.
    pub tokens_per_second: f64,
}

/// Records timestamps during a generation call.
///
/// 1. [`StatsTimer::start`] before the prompt is submitted
/// 2. [`StatsTimer::mark_prompt_done`] after the prompt decode
/// 3. [`StatsTimer::mark_token`] per emitted token
/// 4. [`StatsTimer::finish`]
#[derive(Debug)]
pub(crate) struct StatsTimer {
    prompt_tokens: usize,
    start: Instant,
    prompt_end: Option<Instant>,
    token_count: usize,
}

impl StatsTimer {
    pub(crate) fn start(prompt_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            start: Instant::now(),
            prompt_end: None,
            token_count: 0,
        }
    }

    pub(crate) fn mark_prompt_done(&mut self) {
        self.prompt_end = Some(Instant::now());
    }

    pub(crate) fn mark_token(&mut self) {
        self.token_count += 1;
    }

    pub(crate) fn finish(&self) -> GenerationStats {
        let total_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        let prompt_time_ms = self
            .prompt_end
            .map(|t| t.duration_since(self.start).as_secs_f64() * 1000.0)
            .unwrap_or(total_ms);

        let decode_time_ms = (total_ms - prompt_time_ms).max(0.0);
        let tokens_per_second = if decode_time_ms > 0.0 && self.token_count > 0 {
            self.token_count as f64 / (decode_time_ms / 1000.0)
        } else {
            0.0
        };

        GenerationStats {
            prompt_tokens: self.prompt_tokens,
            generated_tokens: self.token_count,
            prompt_time_ms,
            decode_time_ms,
            tokens_per_second,
        }
    }
}
