use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::provider::{FinishReason, GenerationResponse};

/// Tunable constants for the response quality heuristic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub baseline: f64,
    /// Content shorter than this many characters is penalized.
    pub min_content_chars: usize,
    pub short_content_penalty: f64,
    pub truncation_penalty: f64,
    pub completion_bonus: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            baseline: 1.0,
            min_content_chars: 10,
            short_content_penalty: 0.3,
            truncation_penalty: 0.2,
            completion_bonus: 0.1,
        }
    }
}

impl QualityConfig {
    pub fn validate(&self) -> Result<()> {
        let weights = [
            self.baseline,
            self.short_content_penalty,
            self.truncation_penalty,
            self.completion_bonus,
        ];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(Error::validation("Quality weights must be finite and non-negative"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct QualityScorer {
    config: QualityConfig,
}

impl QualityScorer {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    /// Score in `[0, 1]` from cheap response heuristics.
    pub fn score(&self, response: &GenerationResponse) -> f64 {
        self.score_parts(&response.content, response.finish_reason)
    }

    pub fn score_parts(&self, content: &str, finish_reason: FinishReason) -> f64 {
        let mut score = self.config.baseline;

        if content.chars().count() < self.config.min_content_chars {
            score -= self.config.short_content_penalty;
        }

        match finish_reason {
            FinishReason::Truncated => score -= self.config.truncation_penalty,
            FinishReason::Completed => score += self.config.completion_bonus,
            FinishReason::Other => {}
        }

        score.clamp(0.0, 1.0)
    }
}
