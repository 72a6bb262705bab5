//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use nano_genai::{
    ByteTokenizer, EngineConfig, Error, GenerationOutput, LLMEngine, RequestHandle,
    SchedulerConfig, StreamEvent, SyntheticBackend,
};

/// Engine over a synthetic byte-level model.
pub fn engine_with(backend: SyntheticBackend, scheduler: SchedulerConfig) -> LLMEngine {
    let config = EngineConfig {
        scheduler,
        ..Default::default()
    };
    LLMEngine::new(Box::new(backend), Arc::new(ByteTokenizer), config).unwrap()
}

/// Greedy decoding on this engine continues every byte with the next byte value.
pub fn byte_engine() -> LLMEngine {
    engine_with(
        SyntheticBackend::new(ByteTokenizer::VOCAB_SIZE, 0),
        SchedulerConfig::default().with_block_size(4).with_cache_size(64),
    )
}

/// Everything a handle has received so far.
pub struct Collected {
    pub fragments: Vec<String>,
    pub output: Option<GenerationOutput>,
    pub error: Option<Error>,
}

pub fn drain(handle: &RequestHandle) -> Collected {
    let mut collected = Collected {
        fragments: Vec::new(),
        output: None,
        error: None,
    };
    while let Some(event) = handle.try_recv() {
        match event {
            StreamEvent::Fragment(text) => collected.fragments.push(text),
            StreamEvent::Finished(output) => collected.output = Some(output),
            StreamEvent::Error(e) => collected.error = Some(e),
        }
    }
    collected
}

/// The text greedy decoding produces after `last`: the following bytes.
pub fn successor_text(last: u8, n: usize) -> String {
    (1..=n).map(|i| char::from(last + i as u8)).collect()
}
