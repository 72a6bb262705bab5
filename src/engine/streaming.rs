//! Per-request streaming.
//!
//! Every submitted request gets a fragment channel and a cancellation token.
//! The engine pushes [`StreamEvent`]s as tokens are produced; the caller
//! reads them from its [`RequestHandle`] on any thread and may cancel at
//! any time. Cancellation takes effect at the top of the engine's next step.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::llm::GenerationOutput;
use crate::core::sequence::RequestId;
use crate::error::{Error, Result};
use crate::tokenizer::Tokenizer;

/// What a streaming callback asks of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// Keep generating.
    Running,
    /// Finish the request normally with what it has.
    Stop,
    /// Abort the request.
    Cancel,
}

/// Callback invoked with each decoded text fragment.
pub type StreamCallback = Box<dyn FnMut(&str) -> StreamStatus + Send>;

/// Events delivered on a request's channel.
#[derive(Debug)]
pub enum StreamEvent {
    /// Newly decoded text.
    Fragment(String),
    /// The request finished; no further events follow.
    Finished(GenerationOutput),
    /// The request failed; no further events follow.
    Error(Error),
}

/// Caller side of a submitted request.
#[derive(Debug)]
pub struct RequestHandle {
    request_id: RequestId,
    events: flume::Receiver<StreamEvent>,
    cancel: CancellationToken,
}

impl RequestHandle {
    pub(crate) fn new(
        request_id: RequestId,
        events: flume::Receiver<StreamEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            request_id,
            events,
            cancel,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Block until the next event. `None` once the engine dropped the request.
    pub fn recv(&self) -> Option<StreamEvent> {
        self.events.recv().ok()
    }

    pub fn try_recv(&self) -> Option<StreamEvent> {
        self.events.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<StreamEvent> {
        self.events.recv_timeout(timeout).ok()
    }

    /// The raw event channel.
    pub fn events(&self) -> &flume::Receiver<StreamEvent> {
        &self.events
    }

    /// Ask the engine to abort this request.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A token that cancels this request when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Block until the request finishes, discarding fragments.
    ///
    /// # Errors
    ///
    /// The request's error, or [`Error::Shutdown`] if the engine went away
    /// before finishing it.
    pub fn wait(self) -> Result<GenerationOutput> {
        while let Ok(event) = self.events.recv() {
            match event {
                StreamEvent::Fragment(_) => {}
                StreamEvent::Finished(output) => return Ok(output),
                StreamEvent::Error(e) => return Err(e),
            }
        }
        Err(Error::Shutdown)
    }
}

/// Incremental detokenizer.
///
/// Decodes only the tokens since the previous emission, plus the window
/// before it for context, and emits the new suffix. Text ending in U+FFFD
/// is held back, since the next token may complete a multi-byte character.
#[derive(Debug, Clone, Default)]
pub struct TextStreamer {
    tokens: Vec<u32>,
    /// Start of the context window decoded with new tokens.
    prefix_offset: usize,
    /// Tokens already emitted.
    read_offset: usize,
}

impl TextStreamer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a token; returns newly printable text, if any.
    pub fn push(&mut self, token: u32, tokenizer: &dyn Tokenizer) -> Result<Option<String>> {
        self.tokens.push(token);
        self.take_new(tokenizer, true)
    }

    /// Emit whatever is still held back.
    pub fn flush(&mut self, tokenizer: &dyn Tokenizer) -> Result<Option<String>> {
        self.take_new(tokenizer, false)
    }

    fn take_new(&mut self, tokenizer: &dyn Tokenizer, hold_partial: bool) -> Result<Option<String>> {
        let prefix = tokenizer.decode(&self.tokens[self.prefix_offset..self.read_offset])?;
        let text = tokenizer.decode(&self.tokens[self.prefix_offset..])?;
        if hold_partial && text.ends_with('\u{FFFD}') {
            return Ok(None);
        }
        if text.len() <= prefix.len() || !text.is_char_boundary(prefix.len()) {
            return Ok(None);
        }
        let fragment = text[prefix.len()..].to_string();
        self.prefix_offset = self.read_offset;
        self.read_offset = self.tokens.len();
        Ok(Some(fragment))
    }
}
