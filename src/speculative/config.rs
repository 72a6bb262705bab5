//! Decoding strategy selection.

use serde::{Deserialize, Serialize};

use crate::config::GenerationConfig;

/// How an engine produces tokens.
///
/// The engine is built with one strategy; each request then resolves the
/// strategy it actually runs with [`DecodingStrategy::for_request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodingStrategy {
    /// One sampled token per step.
    #[default]
    Standard,
    /// Drafts proposed by n-gram matching over the request's own tokens.
    PromptLookup,
    /// Drafts proposed by an attached [`DraftSource`](super::DraftSource).
    Draft,
}

impl DecodingStrategy {
    /// The strategy a request with `config` runs under on this engine.
    ///
    /// Beam search and non-speculative requests always decode one token per
    /// step. Prompt lookup needs no extra model, so it is available on every
    /// engine; draft-model speculation needs a `Draft` engine.
    pub fn for_request(self, config: &GenerationConfig) -> Self {
        if config.is_beam_search() || !config.is_speculative() {
            Self::Standard
        } else if config.is_prompt_lookup() {
            Self::PromptLookup
        } else if self == Self::Draft {
            Self::Draft
        } else {
            Self::Standard
        }
    }

    pub fn is_speculative(&self) -> bool {
        !matches!(self, Self::Standard)
    }
}
