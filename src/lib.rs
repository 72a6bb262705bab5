//! nano-genai: a continuous-batching generation runtime in Rust.
//!
//! This crate implements the serving side of LLM generation:
//! - Paged KV cache bookkeeping with copy-on-write, swapping and prefix caching
//! - Continuous batching with preemption under cache pressure
//! - Greedy, multinomial and beam search sampling
//! - Speculative decoding (prompt lookup or an external draft source)
//! - Multi-turn chat sessions that keep their cache between turns
//!
//! Tensor execution and tokenization sit behind the [`ComputeBackend`] and
//! [`Tokenizer`] traits.

pub mod config;
pub mod error;

pub mod backend;
pub mod chat;
pub mod core;
pub mod engine;
pub mod scheduler;
pub mod speculative;
pub mod tokenizer;

pub use backend::{ComputeBackend, ModelInput, SyntheticBackend};
pub use chat::{apply_chat_template, ChatInput, ChatMessage, ChatSession, ChatState, Role};
pub use config::{EngineConfig, GenerationConfig, PreemptionMode, SchedulerConfig, VictimPolicy};
pub use core::block::{Block, BlockTable};
pub use core::block_manager::{BlockManager, CacheOps};
pub use core::sequence::{
    FinishReason, RequestId, Sequence, SequenceArena, SequenceGroup, SequenceId, SequenceStatus,
};
pub use engine::{
    BeamOutput, BeamSearch, GenerationOutput, GenerationRequest, LLMEngine, PerfMetrics, Prompt,
    RequestHandle, Sampler, StreamEvent, StreamStatus, Submitter, TextStreamer,
};
pub use error::{Error, Result};
pub use scheduler::{ScheduledSequence, Scheduler, SchedulerOutputs};
pub use speculative::{
    DecodingStrategy, Draft, DraftSource, PromptLookup, RejectionSampler, Verification,
};
pub use tokenizer::{ByteTokenizer, HfTokenizer, Tokenizer};

/// Re-exported so callers can cancel without depending on tokio-util directly.
pub use tokio_util::sync::CancellationToken;
