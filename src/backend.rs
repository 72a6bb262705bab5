//! Compute backend interface.
//!
//! The engine never runs a model itself. Each step it hands the scheduled
//! sequences to a [`ComputeBackend`], which applies the step's cache
//! operations and returns logits for the positions the engine samples from.
//!
//! ```text
//! SchedulerOutputs ──► materialize(cache_ops) ──► infer(ModelInput) ──► logits
//!                        copies / swaps             [num_logits, vocab] per sequence
//! ```

use candle_core::{Device, Tensor};

use crate::core::block_manager::CacheOps;
use crate::error::{Error, Result};
use crate::scheduler::ScheduledSequence;

/// Everything the backend runs in one step.
#[derive(Debug, Clone, Default)]
pub struct ModelInput {
    pub sequences: Vec<ScheduledSequence>,
}

impl ModelInput {
    pub fn new(sequences: Vec<ScheduledSequence>) -> Self {
        Self { sequences }
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// Tokens fed across the batch.
    pub fn num_tokens(&self) -> usize {
        self.sequences.iter().map(ScheduledSequence::num_tokens).sum()
    }
}

/// A stateless tensor-execution engine.
///
/// Implementations own the KV payload; the engine owns the bookkeeping.
pub trait ComputeBackend: Send {
    /// Run one step.
    ///
    /// Returns one logits tensor per input sequence, in input order, shaped
    /// `[num_logits, vocab_size]`: one row per draft token plus one for the
    /// token after the last fed position.
    fn infer(&mut self, input: &ModelInput) -> Result<Vec<Tensor>>;

    /// Drop any state held between steps.
    fn reset_state(&mut self) -> Result<()> {
        Ok(())
    }

    /// Apply block copies and swaps before the next `infer`.
    fn materialize(&mut self, _ops: &CacheOps) -> Result<()> {
        Ok(())
    }

    fn vocab_size(&self) -> usize;
}

type Successor = Box<dyn Fn(u32) -> u32 + Send>;

/// Deterministic stand-in for a model.
///
/// The logits after token `t` are seeded noise in `[-1, 1)` with a peak on
/// `successor(t)`, so greedy decoding follows the successor function while
/// sampling still sees a full distribution. The output depends only on the
/// fed token, never on earlier steps.
pub struct SyntheticBackend {
    vocab_size: usize,
    seed: u64,
    peak: f32,
    successor: Successor,
    fail_at_step: Option<usize>,
    steps: usize,
    device: Device,
}

impl SyntheticBackend {
    /// Successor defaults to `(t + 1) % vocab_size`.
    pub fn new(vocab_size: usize, seed: u64) -> Self {
        let vocab = vocab_size.max(1) as u32;
        Self {
            vocab_size: vocab_size.max(1),
            seed,
            peak: 8.0,
            successor: Box::new(move |t| (t + 1) % vocab),
            fail_at_step: None,
            steps: 0,
            device: Device::Cpu,
        }
    }

    /// Replace the greedy successor function.
    pub fn with_successor(mut self, successor: impl Fn(u32) -> u32 + Send + 'static) -> Self {
        self.successor = Box::new(successor);
        self
    }

    /// Logit margin of the successor over the noise.
    pub fn with_peak(mut self, peak: f32) -> Self {
        self.peak = peak;
        self
    }

    /// Fail the `step`-th call to `infer` (0-based).
    pub fn with_failure_at(mut self, step: usize) -> Self {
        self.fail_at_step = Some(step);
        self
    }

    /// Calls to `infer` so far.
    pub fn num_steps(&self) -> usize {
        self.steps
    }

    /// Logits for the position after `token`.
    pub fn logits_after(&self, token: u32) -> Vec<f32> {
        let next = (self.successor)(token) as usize % self.vocab_size;
        (0..self.vocab_size)
            .map(|v| {
                let noise = unit_noise(self.seed, token, v as u32);
                if v == next {
                    noise + self.peak
                } else {
                    noise
                }
            })
            .collect()
    }
}

impl ComputeBackend for SyntheticBackend {
    fn infer(&mut self, input: &ModelInput) -> Result<Vec<Tensor>> {
        let step = self.steps;
        self.steps += 1;
        if self.fail_at_step == Some(step) {
            return Err(Error::Backend(format!("injected failure at step {step}")));
        }

        input
            .sequences
            .iter()
            .map(|seq| {
                let num_logits = seq.num_logits().min(seq.num_tokens());
                let fed = &seq.token_ids[seq.num_tokens() - num_logits..];
                let mut rows = Vec::with_capacity(num_logits * self.vocab_size);
                for &token in fed {
                    rows.extend(self.logits_after(token));
                }
                Ok(Tensor::from_vec(rows, (num_logits, self.vocab_size), &self.device)?)
            })
            .collect()
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }
}

/// SplitMix64 of `(seed, token, v)` mapped to `[-1, 1)`.
fn unit_noise(seed: u64, token: u32, v: u32) -> f32 {
    let mut z = seed
        ^ ((u64::from(token) << 32) | u64::from(v)).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    ((z >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
}
