//! Core infrastructure for nano-genai.
//!
//! This module contains the fundamental building blocks:
//! - Block and BlockTable for the paged KV cache
//! - BlockManager for allocation, copy-on-write, swapping and prefix caching
//! - Sequence, SequenceGroup and SequenceArena for request tracking

pub mod block;
pub mod block_manager;
pub mod sequence;
