//! Error types for nano-genai.

use thiserror::Error;

/// Result type alias for nano-genai operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nano-genai.
#[derive(Error, Debug)]
pub enum Error {
    /// The prompt alone does not fit in one scheduling step.
    ///
    /// Rejected at admission and never retried.
    #[error("prompt of {prompt_len} tokens exceeds max_num_batched_tokens ({max})")]
    PromptTooLong { prompt_len: usize, max: usize },

    /// Block allocation failed.
    ///
    /// Transient inside the scheduler (it drives preemption). Surfaced to a caller only
    /// when a single request needs more blocks than the whole cache holds.
    #[error("out of KV cache blocks: requested {requested}, available {available}")]
    OutOfCache { requested: usize, available: usize },

    /// Re-tokenized chat history diverged from the cached tokens.
    ///
    /// Recovered locally by trimming the cache.
    #[error("tokenized history diverges from cached history at token {index}")]
    TokenizationMismatch { index: usize },

    /// Configuration rejected before scheduling begins.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The compute backend failed during a step.
    #[error("compute backend failed: {0}")]
    Backend(String),

    /// Sequence not found in the arena.
    #[error("sequence {0} not found")]
    SequenceNotFound(usize),

    /// Request not known to the scheduler.
    #[error("request {0} not found")]
    RequestNotFound(u64),

    /// Invalid sequence state transition.
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },

    /// Logical block index beyond the end of a block table.
    #[error("logical block {logical_idx} out of bounds ({num_blocks} blocks)")]
    BlockIndexOutOfBounds {
        logical_idx: usize,
        num_blocks: usize,
    },

    /// Tokenization error.
    #[error("tokenization error: {0}")]
    Tokenization(String),

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The engine loop is gone.
    #[error("engine has shut down")]
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::PromptTooLong {
            prompt_len: 40,
            max: 32,
        };
        assert_eq!(
            e.to_string(),
            "prompt of 40 tokens exceeds max_num_batched_tokens (32)"
        );

        let e = Error::OutOfCache {
            requested: 3,
            available: 1,
        };
        assert_eq!(
            e.to_string(),
            "out of KV cache blocks: requested 3, available 1"
        );
    }
}
