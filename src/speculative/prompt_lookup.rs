//! Prompt-lookup drafting.
//!
//! Proposes draft tokens by finding the current tail n-gram earlier in the
//! sequence and copying what followed it. Cheap, model-free, and effective
//! on inputs that repeat themselves (summaries, code edits, chat quoting).

use super::{Draft, DraftSource};
use crate::error::Result;

/// N-gram matcher over a sequence's own tokens.
#[derive(Debug, Clone)]
pub struct PromptLookup {
    max_ngram_size: usize,
    num_assistant_tokens: usize,
}

impl PromptLookup {
    pub fn new(max_ngram_size: usize, num_assistant_tokens: usize) -> Self {
        Self {
            max_ngram_size,
            num_assistant_tokens,
        }
    }

    pub fn max_ngram_size(&self) -> usize {
        self.max_ngram_size
    }

    pub fn num_assistant_tokens(&self) -> usize {
        self.num_assistant_tokens
    }

    /// Candidate continuation of `tokens`.
    ///
    /// Tries n from `max_ngram_size` down to 1: the earliest earlier
    /// occurrence of the last n tokens wins, and the tokens that followed it
    /// are proposed, up to `max` of them and never past the start of the
    /// matched tail. Empty when nothing matches.
    pub fn find_candidates(&self, tokens: &[u32], max: usize) -> Vec<u32> {
        let len = tokens.len();
        let max = max.min(self.num_assistant_tokens);
        if max == 0 {
            return Vec::new();
        }

        for n in (1..=self.max_ngram_size).rev() {
            if n >= len {
                continue;
            }
            let tail_start = len - n;
            let tail = &tokens[tail_start..];

            let found = tokens[..len - 1].windows(n).position(|window| window == tail);
            if let Some(start) = found {
                let from = start + n;
                let to = (from + max).min(tail_start);
                if from < to {
                    return tokens[from..to].to_vec();
                }
            }
        }
        Vec::new()
    }
}

impl DraftSource for PromptLookup {
    fn propose(&mut self, tokens: &[u32], max: usize) -> Result<Draft> {
        Ok(Draft::tokens_only(self.find_candidates(tokens, max)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefers_longest_ngram() {
        let lookup = PromptLookup::new(2, 4);
        // Bigram [1, 2] matches at 0; unigram [2] would also match at 1.
        let tokens = [1, 2, 3, 4, 2, 5, 1, 2];
        assert_eq!(lookup.find_candidates(&tokens, 4), vec![3, 4, 2, 5]);
    }

    #[test]
    fn test_no_match() {
        let lookup = PromptLookup::new(3, 4);
        assert!(lookup.find_candidates(&[1, 2, 3, 4], 4).is_empty());
        assert!(lookup.find_candidates(&[], 4).is_empty());
    }
}
