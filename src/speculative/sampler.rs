//! Draft verification.
//!
//! Two ways to decide how much of a draft the target model accepts:
//!
//! - [`RejectionSampler::verify_matching`]: sample from the target at every
//!   position and accept while the sample equals the draft token. Works for
//!   drafts with no distribution attached (prompt lookup).
//! - [`RejectionSampler::verify`]: probabilistic rejection sampling against
//!   the draft's own distribution. Both distributions go through the
//!   request's [`Sampler`], so its filters shape them alike.
//!
//! ```text
//! Draft q(x):    t1   t2   t3   t4
//! Target p(x):   p1   p2   p3   p4   p5      <- K+1 positions
//!
//! for i in 0..K:
//!     r ~ U[0, 1)
//!     if r < min(1, p_i(t_i) / q_i(t_i)):  accept t_i
//!     else:  resample from norm(max(0, p_i - q_i)), stop
//! all accepted:  bonus token from p5
//! ```
//!
//! Both produce token streams distributed exactly as sampling the target
//! directly.

use candle_core::{IndexOp, Result, Tensor};
use rand::distributions::Distribution;
use rand::{Rng, SeedableRng};

use crate::engine::sampler::Sampler;

/// Outcome of verifying one draft.
#[derive(Debug, Clone, PartialEq)]
pub struct Verification {
    /// Draft tokens the target accepted, in order.
    pub accepted: Vec<u32>,
    /// Correction token after a rejection, or the bonus token.
    pub next_token: u32,
    /// Length of `accepted`.
    pub num_accepted: usize,
    /// Target log-probability of every emitted token (`num_accepted + 1`).
    pub logprobs: Vec<f32>,
}

impl Verification {
    /// Every token this step emits: the accepted prefix plus `next_token`.
    pub fn tokens(&self) -> Vec<u32> {
        let mut tokens = self.accepted.clone();
        tokens.push(self.next_token);
        tokens
    }
}

/// Verifies speculative drafts against target logits.
#[derive(Debug, Clone)]
pub struct RejectionSampler {
    rng: rand::rngs::StdRng,
}

impl Default for RejectionSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl RejectionSampler {
    pub fn new() -> Self {
        Self {
            rng: rand::rngs::StdRng::from_entropy(),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: rand::rngs::StdRng::seed_from_u64(seed),
        }
    }

    /// Probabilistic rejection sampling.
    ///
    /// # Arguments
    ///
    /// * `draft_tokens` - K proposed tokens
    /// * `draft_logits` - Draft logits [K, vocab_size]
    /// * `target_logits` - Target logits [K+1, vocab_size]
    /// * `sampler` - The request's sampler; its filtered distribution is used
    ///   for both draft and target (greedy samplers match the argmax)
    pub fn verify(
        &mut self,
        draft_tokens: &[u32],
        draft_logits: &Tensor,
        target_logits: &Tensor,
        sampler: &Sampler,
    ) -> Result<Verification> {
        let k = draft_tokens.len();
        let (draft_rows, draft_vocab) = draft_logits.dims2()?;
        let (target_rows, vocab_size) = target_logits.dims2()?;
        if draft_rows != k || target_rows != k + 1 || draft_vocab != vocab_size {
            return Err(candle_core::Error::Msg(format!(
                "shape mismatch: {k} draft tokens, draft logits [{draft_rows}, {draft_vocab}], \
                 target logits [{target_rows}, {vocab_size}]"
            )));
        }

        let mut accepted = Vec::with_capacity(k);
        let mut logprobs = Vec::with_capacity(k + 1);

        for (i, &token) in draft_tokens.iter().enumerate() {
            let p = sampler.probabilities(&target_logits.i(i)?)?;
            let q = sampler.probabilities(&draft_logits.i(i)?)?;
            let p_tok = p.get(token as usize).copied().unwrap_or(0.0);
            let q_tok = q.get(token as usize).copied().unwrap_or(0.0);

            // q_tok == 0 means the draft could not have produced the token
            let alpha = if q_tok > 0.0 { (p_tok / q_tok).min(1.0) } else { 0.0 };
            let r: f32 = self.rng.gen();
            if r < alpha {
                accepted.push(token);
                logprobs.push(p_tok.ln());
                continue;
            }

            let residual: Vec<f32> = p.iter().zip(&q).map(|(p, q)| (p - q).max(0.0)).collect();
            let next_token = if residual.iter().sum::<f32>() > 0.0 {
                self.sample(&residual)?
            } else {
                self.sample(&p)?
            };
            logprobs.push(p.get(next_token as usize).copied().unwrap_or(0.0).ln());
            let num_accepted = accepted.len();
            return Ok(Verification {
                accepted,
                next_token,
                num_accepted,
                logprobs,
            });
        }

        let p = sampler.probabilities(&target_logits.i(k)?)?;
        let next_token = self.sample(&p)?;
        logprobs.push(p.get(next_token as usize).copied().unwrap_or(0.0).ln());
        Ok(Verification {
            accepted,
            next_token,
            num_accepted: k,
            logprobs,
        })
    }

    /// Exact-match verification for drafts without a distribution.
    ///
    /// `sampler` draws the target token at each of the K+1 positions, so the
    /// emitted stream matches what `sampler` alone would produce.
    pub fn verify_matching(
        &mut self,
        draft_tokens: &[u32],
        target_logits: &Tensor,
        sampler: &mut Sampler,
    ) -> Result<Verification> {
        let k = draft_tokens.len();
        let (target_rows, _) = target_logits.dims2()?;
        if target_rows != k + 1 {
            return Err(candle_core::Error::Msg(format!(
                "expected {} target rows for {k} draft tokens, got {target_rows}",
                k + 1
            )));
        }

        let mut accepted = Vec::with_capacity(k);
        let mut logprobs = Vec::with_capacity(k + 1);
        for i in 0..=k {
            let (token, logprob) = sampler.sample_with_logprob(&target_logits.i(i)?)?;
            logprobs.push(logprob);
            if i < k && token == draft_tokens[i] {
                accepted.push(token);
                continue;
            }
            let num_accepted = accepted.len();
            return Ok(Verification {
                accepted,
                next_token: token,
                num_accepted,
                logprobs,
            });
        }
        // The loop always returns at i == k.
        Err(candle_core::Error::Msg("empty verification".to_string()))
    }

    fn sample(&mut self, weights: &[f32]) -> Result<u32> {
        let dist = rand::distributions::WeightedIndex::new(weights)
            .map_err(|e| candle_core::Error::Msg(format!("Failed to create distribution: {e}")))?;
        Ok(dist.sample(&mut self.rng) as u32)
    }
}
