//! Per-request performance metrics.

use std::time::{Duration, Instant};

use serde::Serialize;

/// Timing and token counts for one finished request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerfMetrics {
    pub num_input_tokens: usize,
    pub num_generated_tokens: usize,
    /// Submission to first generated token.
    pub ttft: Option<Duration>,
    /// Submission to finish.
    pub total_time: Duration,
    /// Engine steps in which the request produced tokens.
    pub num_steps: usize,
    pub num_draft_tokens: usize,
    pub num_accepted_draft_tokens: usize,
    /// Prompt tokens served from the cache instead of computed.
    pub num_cached_tokens: usize,
}

impl PerfMetrics {
    pub fn ttft_ms(&self) -> Option<f64> {
        self.ttft.map(|d| d.as_secs_f64() * 1000.0)
    }

    /// Mean time per output token after the first.
    pub fn mean_tpot_ms(&self) -> Option<f64> {
        let ttft = self.ttft?;
        if self.num_generated_tokens < 2 {
            return None;
        }
        let decode = self.total_time.saturating_sub(ttft);
        Some(decode.as_secs_f64() * 1000.0 / (self.num_generated_tokens - 1) as f64)
    }

    /// Generated tokens per second.
    pub fn throughput(&self) -> f64 {
        let secs = self.total_time.as_secs_f64();
        if secs > 0.0 {
            self.num_generated_tokens as f64 / secs
        } else {
            0.0
        }
    }

    /// Fraction of proposed draft tokens the target accepted.
    pub fn acceptance_rate(&self) -> Option<f64> {
        (self.num_draft_tokens > 0)
            .then(|| self.num_accepted_draft_tokens as f64 / self.num_draft_tokens as f64)
    }
}

/// Accumulates [`PerfMetrics`] while a request runs.
#[derive(Debug, Clone)]
pub struct MetricsRecorder {
    start: Instant,
    first_token: Option<Instant>,
    metrics: PerfMetrics,
}

impl MetricsRecorder {
    pub fn start(num_input_tokens: usize) -> Self {
        Self {
            start: Instant::now(),
            first_token: None,
            metrics: PerfMetrics {
                num_input_tokens,
                ..Default::default()
            },
        }
    }

    /// Time since submission.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Record tokens produced in one step.
    pub fn record_step(&mut self, num_tokens: usize) {
        if num_tokens == 0 {
            return;
        }
        if self.first_token.is_none() {
            let now = Instant::now();
            self.first_token = Some(now);
            self.metrics.ttft = Some(now.duration_since(self.start));
        }
        self.metrics.num_generated_tokens += num_tokens;
        self.metrics.num_steps += 1;
    }

    pub fn record_draft(&mut self, proposed: usize, accepted: usize) {
        self.metrics.num_draft_tokens += proposed;
        self.metrics.num_accepted_draft_tokens += accepted;
    }

    pub fn record_cached(&mut self, num_cached_tokens: usize) {
        self.metrics.num_cached_tokens += num_cached_tokens;
    }

    pub fn finish(mut self) -> PerfMetrics {
        self.metrics.total_time = self.start.elapsed();
        self.metrics
    }
}
