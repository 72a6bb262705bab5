//! Configuration types for nano-genai.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How a preempted group gives up its blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreemptionMode {
    /// Move the group's blocks to the host pool and resume later.
    Swap,
    /// Free the group's blocks and recompute its KV state from tokens.
    Recompute,
}

/// Which running group is evicted first under cache pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VictimPolicy {
    /// Most recently admitted group first.
    Fifo,
    /// Lowest priority first, most recently admitted among equals.
    LowestPriority,
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum tokens across all sequences in one step.
    pub max_num_batched_tokens: usize,
    /// Maximum number of sequences running at once.
    pub max_num_seqs: usize,
    /// Tokens per KV cache block.
    pub block_size: usize,
    /// Number of device KV cache blocks.
    pub cache_size: usize,
    /// Number of host blocks available for swapped-out groups.
    pub swap_space: usize,
    /// Share computed prompt blocks between requests.
    pub enable_prefix_caching: bool,
    /// Swap or recompute on preemption.
    pub preemption_mode: PreemptionMode,
    /// Victim selection order.
    pub victim_policy: VictimPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_num_batched_tokens: 2048,
            max_num_seqs: 256,
            block_size: 16,
            cache_size: 1024,
            swap_space: 1024,
            enable_prefix_caching: false,
            preemption_mode: PreemptionMode::Swap,
            victim_policy: VictimPolicy::Fifo,
        }
    }
}

impl SchedulerConfig {
    /// Reject configurations the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::InvalidConfig("block_size must be positive".into()));
        }
        if self.cache_size == 0 {
            return Err(Error::InvalidConfig("cache_size must be positive".into()));
        }
        if self.max_num_seqs == 0 {
            return Err(Error::InvalidConfig("max_num_seqs must be positive".into()));
        }
        if self.max_num_batched_tokens == 0 {
            return Err(Error::InvalidConfig(
                "max_num_batched_tokens must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Set the per-step token budget.
    pub fn with_max_num_batched_tokens(mut self, n: usize) -> Self {
        self.max_num_batched_tokens = n;
        self
    }

    /// Set the running sequence limit.
    pub fn with_max_num_seqs(mut self, n: usize) -> Self {
        self.max_num_seqs = n;
        self
    }

    /// Set the block size.
    pub fn with_block_size(mut self, n: usize) -> Self {
        self.block_size = n;
        self
    }

    /// Set the number of device blocks.
    pub fn with_cache_size(mut self, n: usize) -> Self {
        self.cache_size = n;
        self
    }

    /// Set the number of host blocks.
    pub fn with_swap_space(mut self, n: usize) -> Self {
        self.swap_space = n;
        self
    }

    /// Enable or disable prefix caching.
    pub fn with_prefix_caching(mut self, enabled: bool) -> Self {
        self.enable_prefix_caching = enabled;
        self
    }

    /// Set the preemption mode.
    pub fn with_preemption_mode(mut self, mode: PreemptionMode) -> Self {
        self.preemption_mode = mode;
        self
    }

    /// Set the victim policy.
    pub fn with_victim_policy(mut self, policy: VictimPolicy) -> Self {
        self.victim_policy = policy;
        self
    }
}

/// Per-request generation parameters.
///
/// One config drives every decoding mode: greedy when `temperature == 0`,
/// multinomial otherwise, beam search when `num_beams > 1`, and speculative
/// decoding when `num_assistant_tokens > 0` (prompt lookup when
/// `max_ngram_size > 0`, the engine's draft source otherwise).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Maximum tokens to generate.
    pub max_new_tokens: usize,
    /// End-of-sequence token. Falls back to the tokenizer's when unset.
    pub eos_token_id: Option<u32>,
    /// Tokens that end generation in addition to eos.
    pub stop_token_ids: BTreeSet<u32>,
    /// Keep generating past eos (stop tokens still apply).
    pub ignore_eos: bool,
    /// Draft tokens proposed per speculative step (0 = disabled).
    pub num_assistant_tokens: usize,
    /// Longest n-gram matched by prompt lookup (0 = disabled).
    pub max_ngram_size: usize,
    /// Temperature for sampling (0.0 = greedy).
    pub temperature: f32,
    /// Top-k sampling (0 = disabled).
    pub top_k: usize,
    /// Top-p (nucleus) sampling (1.0 = disabled).
    pub top_p: f32,
    /// Beam width (1 = no beam search).
    pub num_beams: usize,
    /// Finished beams reported back.
    pub num_return_sequences: usize,
    /// Exponent applied to the length when scoring finished beams.
    pub length_penalty: f32,
    /// Sampling seed. Unset means seeded from entropy.
    pub seed: Option<u64>,
    /// Abort the request after this many milliseconds.
    pub timeout_ms: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 256,
            eos_token_id: None,
            stop_token_ids: BTreeSet::new(),
            ignore_eos: false,
            num_assistant_tokens: 0,
            max_ngram_size: 0,
            temperature: 0.0,
            top_k: 0,
            top_p: 1.0,
            num_beams: 1,
            num_return_sequences: 1,
            length_penalty: 1.0,
            seed: None,
            timeout_ms: None,
        }
    }
}

impl GenerationConfig {
    /// Greedy decoding capped at `max_new_tokens`.
    pub fn greedy(max_new_tokens: usize) -> Self {
        Self {
            max_new_tokens,
            ..Default::default()
        }
    }

    /// Multinomial sampling at `temperature`.
    pub fn multinomial(max_new_tokens: usize, temperature: f32) -> Self {
        Self {
            max_new_tokens,
            temperature,
            ..Default::default()
        }
    }

    /// Beam search with `num_beams` beams.
    pub fn beam_search(max_new_tokens: usize, num_beams: usize) -> Self {
        Self {
            max_new_tokens,
            num_beams,
            ..Default::default()
        }
    }

    /// Greedy prompt-lookup decoding.
    pub fn prompt_lookup(
        max_new_tokens: usize,
        num_assistant_tokens: usize,
        max_ngram_size: usize,
    ) -> Self {
        Self {
            max_new_tokens,
            num_assistant_tokens,
            max_ngram_size,
            ..Default::default()
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature == 0.0
    }

    pub fn is_beam_search(&self) -> bool {
        self.num_beams > 1
    }

    pub fn is_speculative(&self) -> bool {
        self.num_assistant_tokens > 0
    }

    pub fn is_prompt_lookup(&self) -> bool {
        self.num_assistant_tokens > 0 && self.max_ngram_size > 0
    }

    /// Whether `token` ends generation for this request.
    pub fn is_stop_token(&self, token: u32) -> bool {
        (!self.ignore_eos && self.eos_token_id == Some(token)) || self.stop_token_ids.contains(&token)
    }

    /// Set the eos token.
    pub fn with_eos_token_id(mut self, token: u32) -> Self {
        self.eos_token_id = Some(token);
        self
    }

    /// Add a stop token.
    pub fn with_stop_token(mut self, token: u32) -> Self {
        self.stop_token_ids.insert(token);
        self
    }

    /// Keep generating past eos.
    pub fn with_ignore_eos(mut self, ignore: bool) -> Self {
        self.ignore_eos = ignore;
        self
    }

    /// Set the sampling seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set top-k.
    pub fn with_top_k(mut self, k: usize) -> Self {
        self.top_k = k;
        self
    }

    /// Set top-p.
    pub fn with_top_p(mut self, p: f32) -> Self {
        self.top_p = p;
        self
    }

    /// Set the timeout.
    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    /// Set the number of returned beams.
    pub fn with_num_return_sequences(mut self, n: usize) -> Self {
        self.num_return_sequences = n;
        self
    }

    /// Reject parameter combinations before any scheduling happens.
    pub fn validate(&self) -> Result<()> {
        if self.max_new_tokens == 0 {
            return Err(Error::InvalidConfig("max_new_tokens must be positive".into()));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "temperature must be >= 0, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if self.num_beams == 0 {
            return Err(Error::InvalidConfig("num_beams must be positive".into()));
        }
        if self.num_return_sequences == 0 || self.num_return_sequences > self.num_beams {
            return Err(Error::InvalidConfig(format!(
                "num_return_sequences ({}) must be in 1..={}",
                self.num_return_sequences, self.num_beams
            )));
        }
        if self.is_beam_search() {
            if self.temperature > 0.0 || self.top_k > 0 || self.top_p < 1.0 {
                return Err(Error::InvalidConfig(
                    "beam search cannot be combined with multinomial sampling".into(),
                ));
            }
            if self.num_assistant_tokens > 0 {
                return Err(Error::InvalidConfig(
                    "beam search cannot be combined with speculative decoding".into(),
                ));
            }
        }
        if self.max_ngram_size > 0 && self.num_assistant_tokens == 0 {
            return Err(Error::InvalidConfig(
                "max_ngram_size requires num_assistant_tokens > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Engine configuration, loadable from JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Scheduler and cache settings.
    pub scheduler: SchedulerConfig,
    /// Default turn settings of chat sessions; its seed also seeds draft verification.
    pub generation: GenerationConfig,
}

impl EngineConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;
        self.generation.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(SchedulerConfig::default().validate().is_ok());
        assert!(GenerationConfig::default().validate().is_ok());
        assert!(GenerationConfig::default().is_greedy());
    }

    #[test]
    fn test_stop_token() {
        let cfg = GenerationConfig::greedy(8).with_eos_token_id(2).with_stop_token(9);
        assert!(cfg.is_stop_token(2));
        assert!(cfg.is_stop_token(9));
        assert!(!cfg.is_stop_token(3));

        let cfg = cfg.with_ignore_eos(true);
        assert!(!cfg.is_stop_token(2));
        assert!(cfg.is_stop_token(9));
    }

    #[test]
    fn test_serde_defaults() {
        let cfg: SchedulerConfig =
            serde_json::from_str(r#"{"block_size": 4, "preemption_mode": "recompute"}"#).unwrap();
        assert_eq!(cfg.block_size, 4);
        assert_eq!(cfg.preemption_mode, PreemptionMode::Recompute);
        assert_eq!(cfg.victim_policy, VictimPolicy::Fifo);
    }
}
