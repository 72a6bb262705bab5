//! LLM inference engine.
//!
//! - `llm`: the continuous batching loop and request intake
//! - `sampler`: token sampling, beam search and stop criteria
//! - `streaming`: per-request fragment channels and cancellation
//! - `metrics`: per-request timing

pub mod llm;
pub mod metrics;
pub mod sampler;
pub mod streaming;

pub use llm::{
    BeamOutput, GenerationOutput, GenerationRequest, LLMEngine, Prompt, Submitter,
};
pub use metrics::PerfMetrics;
pub use sampler::{BeamSearch, Sampler};
pub use streaming::{RequestHandle, StreamEvent, StreamStatus, TextStreamer};
