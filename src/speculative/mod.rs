//! Speculative decoding.
//!
//! A cheap proposer drafts K tokens; the target model scores all K+1
//! positions in one step; the verifier keeps the longest acceptable prefix
//! plus one corrected or bonus token.
//!
//! ## Example
//!
//! ```text
//! Draft (K=4):     [prompt] -> t1 -> t2 -> t3 -> t4
//! Target verify:   [prompt, t1, t2, t3, t4] -> logits for all 5 positions
//! Rejection:       Accept t1, t2, reject t3, resample -> final: t1, t2, t3'
//! ```
//!
//! Drafts come from a [`DraftSource`]: [`PromptLookup`] for n-gram matching
//! over the request itself, or any external draft model.

pub mod config;
pub mod prompt_lookup;
pub mod sampler;

use candle_core::Tensor;

use crate::error::Result;

pub use config::DecodingStrategy;
pub use prompt_lookup::PromptLookup;
pub use sampler::{RejectionSampler, Verification};

/// Tokens proposed for one speculative step.
#[derive(Debug, Clone, Default)]
pub struct Draft {
    pub tokens: Vec<u32>,
    /// Draft distribution per proposed token [K, vocab_size], when known.
    pub logits: Option<Tensor>,
}

impl Draft {
    pub fn tokens_only(tokens: Vec<u32>) -> Self {
        Self {
            tokens,
            logits: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Something that proposes draft tokens for a sequence.
pub trait DraftSource: Send {
    /// Propose up to `max` tokens continuing `tokens`.
    fn propose(&mut self, tokens: &[u32], max: usize) -> Result<Draft>;
}
