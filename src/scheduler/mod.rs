//! Batch scheduling for continuous batching.
//!
//! This module handles:
//! - FIFO admission under a per-step token budget
//! - Continuous batching (iteration-level scheduling)
//! - Preemption by swapping or recomputation under cache pressure

pub mod batch;

pub use batch::{ScheduledSequence, Scheduler, SchedulerOutputs};
