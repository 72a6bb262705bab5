//! Token sampling strategies.
//!
//! This module provides sampling methods for selecting the next token
//! from a probability distribution:
//!
//! - **Greedy**: temperature 0 picks the argmax
//! - **Temperature**: Controls randomness (lower = more deterministic)
//! - **Top-k**: Limits choices to k most likely tokens
//! - **Top-p (nucleus)**: Limits choices to tokens covering p probability mass
//! - **Beam search**: [`BeamSearch`] ranks expansions of every live beam
//!
//! ## Sampling Pipeline
//!
//! ```text
//! Logits [vocab_size]
//!     │
//!     ▼ Temperature scaling
//! Logits / temperature
//!     │
//!     ▼ Top-k filtering (optional)
//! Keep top k tokens
//!     │
//!     ▼ Softmax
//! Probabilities
//!     │
//!     ▼ Top-p filtering (optional)
//! Cumulative prob ≤ p
//!     │
//!     ▼ Renormalize + Sample
//! Selected token
//! ```

use std::cmp::Ordering;

use candle_core::{DType, IndexOp, Result, Tensor, D};
use rand::distributions::Distribution;
use rand::SeedableRng;

use crate::config::GenerationConfig;
use crate::core::sequence::{FinishReason, SequenceId};

/// Token sampler with configurable sampling strategies.
#[derive(Debug, Clone)]
pub struct Sampler {
    /// Temperature for scaling logits.
    temperature: f32,
    /// Top-k value (0 = disabled).
    top_k: usize,
    /// Top-p value (1.0 = disabled).
    top_p: f32,
    /// Random number generator.
    rng: rand::rngs::StdRng,
}

impl Sampler {
    /// Creates a sampler seeded from `config.seed`, or from entropy when unset.
    pub fn new(config: &GenerationConfig) -> Self {
        match config.seed {
            Some(seed) => Self::with_seed(config, seed),
            None => Self {
                temperature: config.temperature,
                top_k: config.top_k,
                top_p: config.top_p,
                rng: rand::rngs::StdRng::from_entropy(),
            },
        }
    }

    /// Creates a new sampler with a specific seed for reproducibility.
    pub fn with_seed(config: &GenerationConfig, seed: u64) -> Self {
        Self {
            temperature: config.temperature,
            top_k: config.top_k,
            top_p: config.top_p,
            rng: rand::rngs::StdRng::seed_from_u64(seed),
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature == 0.0
    }

    /// Sample a token from logits.
    ///
    /// # Arguments
    ///
    /// * `logits` - Raw logits from the model [vocab_size] or [batch, vocab_size]
    ///
    /// # Returns
    ///
    /// Sampled token ID(s)
    pub fn sample(&mut self, logits: &Tensor) -> Result<Vec<u32>> {
        let dims = logits.dims();

        match dims.len() {
            1 => Ok(vec![self.sample_single(logits)?]),
            2 => {
                let batch_size = dims[0];
                let mut tokens = Vec::with_capacity(batch_size);
                for i in 0..batch_size {
                    tokens.push(self.sample_single(&logits.i(i)?)?);
                }
                Ok(tokens)
            }
            _ => Err(candle_core::Error::Msg(format!(
                "Expected 1D or 2D logits, got {}D",
                dims.len()
            ))),
        }
    }

    /// Sample one token from 1D logits together with its log-probability.
    ///
    /// The log-probability is taken from the temperature-scaled distribution
    /// before top-k/top-p filtering (the raw distribution when greedy).
    pub fn sample_with_logprob(&mut self, logits: &Tensor) -> Result<(u32, f32)> {
        let token = self.sample_single(logits)?;
        let scaled = self.scale(logits)?;
        let log_probs = log_softmax(&scaled)?;
        let logprob = log_probs
            .get(token as usize)
            .copied()
            .unwrap_or(f32::NEG_INFINITY);
        Ok((token, logprob))
    }

    /// Sample a single token from 1D logits.
    fn sample_single(&mut self, logits: &Tensor) -> Result<u32> {
        if self.is_greedy() {
            return argmax(logits);
        }
        let probs = self.probabilities(logits)?;
        self.sample_from_probs(&probs)
    }

    fn scale(&self, logits: &Tensor) -> Result<Tensor> {
        let logits = logits.to_dtype(DType::F32)?;
        if self.temperature > 0.0 && self.temperature != 1.0 {
            logits / self.temperature as f64
        } else {
            Ok(logits)
        }
    }

    /// The distribution this sampler draws from, over the full vocabulary.
    ///
    /// Greedy samplers return a one-hot vector at the argmax.
    pub fn probabilities(&self, logits: &Tensor) -> Result<Vec<f32>> {
        let vocab_size = logits.dim(0)?;
        let mut full = vec![0.0f32; vocab_size];

        if self.is_greedy() {
            let token = argmax(logits)? as usize;
            if let Some(p) = full.get_mut(token) {
                *p = 1.0;
            }
            return Ok(full);
        }

        let device = logits.device();
        let logits = self.scale(logits)?;

        // Apply top-k filtering
        let (logits, indices) = if self.top_k > 0 && self.top_k < vocab_size {
            self.apply_top_k(&logits, self.top_k)?
        } else {
            let indices: Vec<u32> = (0..vocab_size as u32).collect();
            (logits, Tensor::from_vec(indices, vocab_size, device)?)
        };

        let probs = candle_nn::ops::softmax(&logits, D::Minus1)?;

        // Apply top-p filtering
        let (probs, indices) = if self.top_p < 1.0 && self.top_p > 0.0 {
            self.apply_top_p(&probs, &indices, self.top_p)?
        } else {
            (probs, indices)
        };

        let probs_vec: Vec<f32> = probs.to_vec1()?;
        let indices_vec: Vec<u32> = indices.to_vec1()?;
        let sum: f32 = probs_vec.iter().sum();
        for (p, idx) in probs_vec.into_iter().zip(indices_vec) {
            if let Some(slot) = full.get_mut(idx as usize) {
                *slot = p / sum;
            }
        }
        Ok(full)
    }

    /// Apply top-k filtering: keep only the k tokens with highest logits.
    fn apply_top_k(&self, logits: &Tensor, k: usize) -> Result<(Tensor, Tensor)> {
        let device = logits.device();
        let vocab_size = logits.dim(0)?;
        let k = k.min(vocab_size);

        let logits_vec: Vec<f32> = logits.to_vec1()?;
        let mut indexed: Vec<(usize, f32)> = logits_vec.iter().copied().enumerate().collect();
        indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

        let top_k: Vec<(usize, f32)> = indexed.into_iter().take(k).collect();
        let indices: Vec<u32> = top_k.iter().map(|(i, _)| *i as u32).collect();
        let values: Vec<f32> = top_k.iter().map(|(_, v)| *v).collect();

        Ok((
            Tensor::from_vec(values, k, device)?,
            Tensor::from_vec(indices, k, device)?,
        ))
    }

    /// Apply top-p (nucleus) filtering: keep tokens until cumulative probability exceeds p.
    fn apply_top_p(&self, probs: &Tensor, indices: &Tensor, p: f32) -> Result<(Tensor, Tensor)> {
        let device = probs.device();
        let n = probs.dim(0)?;

        let probs_vec: Vec<f32> = probs.to_vec1()?;
        let indices_vec: Vec<u32> = indices.to_vec1()?;

        let mut indexed: Vec<(usize, f32)> = probs_vec.iter().copied().enumerate().collect();
        indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

        // Include the token that pushes the mass over p
        let mut cumulative = 0.0f32;
        let mut cutoff_idx = n;
        for (i, (_, prob)) in indexed.iter().enumerate() {
            cumulative += prob;
            if cumulative > p {
                cutoff_idx = i + 1;
                break;
            }
        }

        let selected: Vec<(usize, f32)> = indexed.into_iter().take(cutoff_idx).collect();
        let new_probs: Vec<f32> = selected.iter().map(|(_, v)| *v).collect();
        let new_indices: Vec<u32> = selected.iter().map(|(i, _)| indices_vec[*i]).collect();

        Ok((
            Tensor::from_vec(new_probs, cutoff_idx, device)?,
            Tensor::from_vec(new_indices, cutoff_idx, device)?,
        ))
    }

    /// Sample an index from a full-vocabulary distribution using the stored RNG.
    pub fn sample_from_probs(&mut self, probs: &[f32]) -> Result<u32> {
        let dist = rand::distributions::WeightedIndex::new(probs)
            .map_err(|e| candle_core::Error::Msg(format!("Failed to create distribution: {e}")))?;
        Ok(dist.sample(&mut self.rng) as u32)
    }

    /// Draw a uniform number in `[0, 1)` from the stored RNG.
    pub fn uniform(&mut self) -> f32 {
        rand::Rng::gen(&mut self.rng)
    }
}

/// Greedy decoding: the token with the highest logit.
pub fn argmax(logits: &Tensor) -> Result<u32> {
    logits.argmax(D::Minus1)?.to_scalar::<u32>()
}

/// Log-softmax of 1D logits as a vector.
pub fn log_softmax(logits: &Tensor) -> Result<Vec<f32>> {
    let logits = logits.to_dtype(DType::F32)?;
    candle_nn::ops::log_softmax(&logits, D::Minus1)?.to_vec1()
}

/// Why generation ends after `token`, if it does.
///
/// Checked in order: eos (unless `ignore_eos`), stop tokens, then the
/// `max_new_tokens` limit counting `token` as the `num_generated`-th token.
pub fn check_stop(
    config: &GenerationConfig,
    token: u32,
    num_generated: usize,
) -> Option<FinishReason> {
    if !config.ignore_eos && config.eos_token_id == Some(token) {
        Some(FinishReason::EndOfSequence)
    } else if config.stop_token_ids.contains(&token) {
        Some(FinishReason::StopToken)
    } else if num_generated >= config.max_new_tokens {
        Some(FinishReason::MaxTokens)
    } else {
        None
    }
}

// ========== Beam Search ==========

/// A live beam offered to [`BeamSearch::select`].
#[derive(Debug, Clone)]
pub struct BeamInput {
    pub seq_id: SequenceId,
    /// Birth order of the sequence, for tie breaks.
    pub ordinal: u64,
    pub cumulative_logprob: f32,
    /// Log-probabilities over the vocabulary for the next token.
    pub log_probs: Vec<f32>,
}

/// One expansion of a beam.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamCandidate {
    pub parent: SequenceId,
    pub parent_ordinal: u64,
    pub token: u32,
    pub logprob: f32,
    pub cumulative_logprob: f32,
}

/// Result of one beam step.
#[derive(Debug, Clone, Default)]
pub struct BeamStep {
    /// Beams to keep decoding, best first.
    pub continuing: Vec<BeamCandidate>,
    /// Expansions that ended on a stop token.
    pub finished: Vec<BeamCandidate>,
}

/// Beam search over the live sequences of one group.
#[derive(Debug, Clone)]
pub struct BeamSearch {
    num_beams: usize,
    length_penalty: f32,
}

impl BeamSearch {
    pub fn new(num_beams: usize, length_penalty: f32) -> Self {
        Self {
            num_beams: num_beams.max(1),
            length_penalty,
        }
    }

    pub fn from_config(config: &GenerationConfig) -> Self {
        Self::new(config.num_beams, config.length_penalty)
    }

    pub fn num_beams(&self) -> usize {
        self.num_beams
    }

    /// Expand every beam by its top `num_beams` tokens and keep the global best.
    ///
    /// Candidates rank by cumulative log-probability; ties go to the earliest
    /// parent ordinal, then the lowest token id. A stop-token candidate ranked
    /// within the first `num_beams` becomes a finished hypothesis; the rest of
    /// the ranking fills `continuing` up to `num_beams`.
    pub fn select(&self, beams: &[BeamInput], config: &GenerationConfig) -> BeamStep {
        let mut candidates = Vec::with_capacity(beams.len() * self.num_beams);
        for beam in beams {
            let mut order: Vec<usize> = (0..beam.log_probs.len()).collect();
            order.sort_by(|&a, &b| {
                beam.log_probs[b]
                    .partial_cmp(&beam.log_probs[a])
                    .unwrap_or(Ordering::Equal)
                    .then(a.cmp(&b))
            });
            for token in order.into_iter().take(self.num_beams) {
                let logprob = beam.log_probs[token];
                candidates.push(BeamCandidate {
                    parent: beam.seq_id,
                    parent_ordinal: beam.ordinal,
                    token: token as u32,
                    logprob,
                    cumulative_logprob: beam.cumulative_logprob + logprob,
                });
            }
        }

        candidates.sort_by(|a, b| {
            b.cumulative_logprob
                .partial_cmp(&a.cumulative_logprob)
                .unwrap_or(Ordering::Equal)
                .then(a.parent_ordinal.cmp(&b.parent_ordinal))
                .then(a.token.cmp(&b.token))
        });

        let mut step = BeamStep::default();
        for (rank, candidate) in candidates.into_iter().enumerate() {
            if step.continuing.len() >= self.num_beams {
                break;
            }
            if config.is_stop_token(candidate.token) {
                if rank < self.num_beams {
                    step.finished.push(candidate);
                }
                continue;
            }
            step.continuing.push(candidate);
        }
        step
    }

    /// Length-normalized score of a finished beam.
    pub fn score(&self, cumulative_logprob: f32, num_tokens: usize) -> f32 {
        cumulative_logprob / (num_tokens.max(1) as f32).powf(self.length_penalty)
    }

    /// Whether search can stop.
    ///
    /// True once `num_beams` hypotheses are kept and the best live beam,
    /// scored at its current length, does not beat the worst of them.
    pub fn is_done(&self, kept_scores: &[f32], best_live: Option<f32>) -> bool {
        if kept_scores.len() < self.num_beams {
            return false;
        }
        let worst = kept_scores.iter().copied().fold(f32::INFINITY, f32::min);
        best_live.map_or(true, |best| best <= worst)
    }
}
