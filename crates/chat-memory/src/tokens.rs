//! Token estimation used to bound each user's working set.
//!
//! Word-based heuristic: cheap enough to run on every interaction and
//! deterministic, unlike a real tokenizer it needs no model vocabulary.

use crate::types::{ConversationState, Turn};

/// Approximates the size of a block of text in model tokens.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
}

/// `ceil(words * tokens_per_word)`; empty text is 0 tokens.
#[derive(Debug, Clone, Copy)]
pub struct WordEstimator {
    tokens_per_word: f64,
}

impl WordEstimator {
    /// Mixed-language prose averages ~1.3 tokens per word
    pub const DEFAULT_TOKENS_PER_WORD: f64 = 1.3;

    pub fn new(tokens_per_word: f64) -> Self {
        Self { tokens_per_word }
    }
}

impl Default for WordEstimator {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TOKENS_PER_WORD)
    }
}

impl TokenEstimator for WordEstimator {
    fn estimate(&self, text: &str) -> usize {
        let words = text.split_whitespace().count();
        if words == 0 {
            return 0;
        }
        (words as f64 * self.tokens_per_word).ceil() as usize
    }
}

pub fn estimate_turns(estimator: &dyn TokenEstimator, turns: &[Turn]) -> usize {
    turns.iter().map(|turn| estimator.estimate(&turn.content)).sum()
}

/// Summary plus every verbatim turn.
pub fn estimate_state(estimator: &dyn TokenEstimator, state: &ConversationState) -> usize {
    estimator.estimate(&state.summary) + estimate_turns(estimator, &state.turns)
}
