//! Chat history versus materialized cache.
//!
//! Between turns the cache holds every token of the conversation except the
//! last sampled one, which was never fed back (the "disappeared" token).
//! A new turn either re-tokenizes the whole templated history (text input)
//! or appends raw ids (token input). Re-tokenization can drift near the end
//! of the previous answer, so the cached prefix is only reused up to the
//! first index where the old and new tokenizations disagree.
//!
//! ```text
//! cached:      [p p p p a a a]·d          L = 7, d = disappeared token
//! re-encoded:  [p p p p a a b b ...]      P = 6
//! plan:        trim L - P = 1, feed from index 6
//! ```

use tracing::debug;

use crate::error::Error;

/// Turn input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatInput {
    /// A user message, templated into the history.
    Text(String),
    /// Raw ids appended after the cached conversation.
    Tokens(Vec<u32>),
}

impl From<&str> for ChatInput {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for ChatInput {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Vec<u32>> for ChatInput {
    fn from(tokens: Vec<u32>) -> Self {
        Self::Tokens(tokens)
    }
}

/// What a turn does to the session cache before generating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnPlan {
    /// Full prompt of the turn, cached prefix included.
    pub prompt_tokens: Vec<u32>,
    /// Cached tokens kept.
    pub reuse_len: usize,
    /// Cached tokens discarded from the end.
    pub trim: usize,
    /// The whole cache is dropped.
    pub reset: bool,
}

/// Tokenized history and how much of it is in the cache.
#[derive(Debug, Clone, Default)]
pub struct ChatState {
    /// Every token of the conversation so far, last sampled token included.
    tokenized: Vec<u32>,
    /// Tokens whose KV state is in the session cache.
    materialized_len: usize,
    /// Last sampled token of the previous turn, absent from the cache.
    last_disappeared_token: Option<u32>,
    /// Trim decided by the last `prepare_*` call.
    pending_trim: usize,
}

impl ChatState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Length of the common prefix of `a` and `b`.
    pub fn first_divergence(a: &[u32], b: &[u32]) -> usize {
        a.iter().zip(b).take_while(|(x, y)| x == y).count()
    }

    /// Plan a turn from a re-tokenized full history.
    pub fn prepare_text_turn(&mut self, new_tokens: Vec<u32>) -> TurnPlan {
        let divergence = Self::first_divergence(&self.tokenized, &new_tokens);
        if divergence < self.materialized_len {
            debug!(
                error = %Error::TokenizationMismatch { index: divergence },
                trim = self.materialized_len - divergence,
                "trimming chat cache"
            );
        }
        // At least one prompt token must be fed to get logits.
        let reuse_len = divergence
            .min(self.materialized_len)
            .min(new_tokens.len().saturating_sub(1));
        self.plan(new_tokens, reuse_len)
    }

    /// Plan a turn that appends `input` to the cached conversation.
    ///
    /// Everything past the cached prefix is fed ahead of `input`: normally
    /// just the disappeared token, the whole history after a release.
    pub fn prepare_token_turn(&mut self, input: Vec<u32>) -> TurnPlan {
        let mut prompt = self.tokenized.clone();
        prompt.extend(input);
        let reuse_len = self
            .materialized_len
            .min(prompt.len().saturating_sub(1));
        self.plan(prompt, reuse_len)
    }

    fn plan(&mut self, prompt_tokens: Vec<u32>, reuse_len: usize) -> TurnPlan {
        let trim = self.materialized_len - reuse_len;
        self.pending_trim = trim;
        TurnPlan {
            reset: reuse_len == 0 && self.materialized_len > 0,
            prompt_tokens,
            reuse_len,
            trim,
        }
    }

    /// Record a finished turn.
    ///
    /// `materialized_len` is what the cache holds afterwards: normally all
    /// of `prompt + output` but the last token, 0 if the cache was released.
    pub fn complete_turn(&mut self, prompt_tokens: &[u32], output_tokens: &[u32], materialized_len: usize) {
        self.tokenized = prompt_tokens.to_vec();
        self.tokenized.extend_from_slice(output_tokens);
        self.materialized_len = materialized_len.min(self.tokenized.len());
        self.last_disappeared_token = if self.materialized_len < self.tokenized.len() {
            self.tokenized.last().copied()
        } else {
            None
        };
        self.pending_trim = 0;
    }

    /// Forget the conversation.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn tokenized(&self) -> &[u32] {
        &self.tokenized
    }

    pub fn materialized_len(&self) -> usize {
        self.materialized_len
    }

    pub fn last_disappeared_token(&self) -> Option<u32> {
        self.last_disappeared_token
    }

    pub fn pending_trim(&self) -> usize {
        self.pending_trim
    }
}
