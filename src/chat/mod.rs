//! Multi-turn chat on top of the engine.
//!
//! A [`ChatSession`] owns an engine and keeps the KV cache of the
//! conversation between turns, so each turn only computes its new tokens.
//!
//! - `template`: chat messages and the ChatML template
//! - `state`: tokenized history and the cache reuse plan of a turn

pub mod state;
pub mod template;

pub use state::{ChatInput, ChatState, TurnPlan};
pub use template::{apply_chat_template, ChatMessage, Role};

use tracing::{debug, info};

use crate::config::GenerationConfig;
use crate::core::block::BlockTable;
use crate::engine::streaming::{StreamCallback, StreamStatus};
use crate::engine::{GenerationOutput, GenerationRequest, LLMEngine, Prompt};
use crate::error::Result;

/// A conversation with a cached prefix.
///
/// ```no_run
/// # use nano_genai::{ChatSession, LLMEngine};
/// # fn demo(engine: LLMEngine) -> nano_genai::Result<()> {
/// let mut chat = ChatSession::new(engine);
/// chat.start_chat(Some("You are terse."));
/// let first = chat.generate("Hello", None)?;
/// let second = chat.generate("And again?", None)?;
/// # let _ = (first, second);
/// chat.finish_chat();
/// # Ok(())
/// # }
/// ```
pub struct ChatSession {
    engine: LLMEngine,
    state: ChatState,
    history: Vec<ChatMessage>,
    /// Materialized conversation, owned between turns.
    cache: Option<BlockTable>,
    config: GenerationConfig,
}

impl ChatSession {
    pub fn new(engine: LLMEngine) -> Self {
        let config = engine.config().generation.clone();
        Self {
            engine,
            state: ChatState::new(),
            history: Vec::new(),
            cache: None,
            config,
        }
    }

    /// Default configuration of every turn.
    pub fn with_config(mut self, config: GenerationConfig) -> Self {
        self.config = config;
        self
    }

    /// Begin a new conversation, dropping any previous one.
    pub fn start_chat(&mut self, system_message: Option<&str>) {
        self.finish_chat();
        if let Some(system) = system_message {
            self.history.push(ChatMessage::system(system));
        }
    }

    /// Run one turn to completion.
    ///
    /// On failure the conversation is reset and its cache released.
    pub fn generate(
        &mut self,
        input: impl Into<ChatInput>,
        config: Option<GenerationConfig>,
    ) -> Result<GenerationOutput> {
        self.turn(input.into(), config, None)
    }

    /// Like [`generate`](Self::generate), calling `streamer` with each fragment.
    pub fn generate_with_streamer(
        &mut self,
        input: impl Into<ChatInput>,
        config: Option<GenerationConfig>,
        streamer: impl FnMut(&str) -> StreamStatus + Send + 'static,
    ) -> Result<GenerationOutput> {
        self.turn(input.into(), config, Some(Box::new(streamer)))
    }

    fn turn(
        &mut self,
        input: ChatInput,
        config: Option<GenerationConfig>,
        streamer: Option<StreamCallback>,
    ) -> Result<GenerationOutput> {
        let config = config.unwrap_or_else(|| self.config.clone());
        let is_text = matches!(input, ChatInput::Text(_));

        let plan = match input {
            ChatInput::Text(text) => {
                self.history.push(ChatMessage::user(text));
                let templated = apply_chat_template(&self.history, true);
                match self.engine.tokenizer().encode(&templated) {
                    Ok(tokens) => self.state.prepare_text_turn(tokens),
                    Err(e) => {
                        self.history.pop();
                        return Err(e);
                    }
                }
            }
            ChatInput::Tokens(tokens) => self.state.prepare_token_turn(tokens),
        };
        debug!(
            prompt_len = plan.prompt_tokens.len(),
            reuse = plan.reuse_len,
            trim = plan.trim,
            "chat turn planned"
        );

        if let Some(mut table) = self.cache.take() {
            if plan.reuse_len == 0 {
                self.engine.release_cache(&mut table);
            } else {
                self.engine.truncate_cache(&mut table, plan.reuse_len);
                self.cache = Some(table);
            }
        }

        // Beam groups fork and prune sequences; their caches are not kept.
        let keep_cache = !config.is_beam_search();
        let request = GenerationRequest::new(Prompt::Tokens(plan.prompt_tokens.clone()))
            .config(config);
        let handle = self
            .engine
            .enqueue(request, streamer, self.cache.take(), keep_cache);
        let request_id = handle.request_id();

        let result = self
            .engine
            .run_until_idle()
            .and_then(|_| handle.wait());
        let output = match result {
            Ok(output) => output,
            Err(e) => {
                if let Some(mut table) = self.engine.take_kept_cache(request_id) {
                    self.engine.release_cache(&mut table);
                }
                self.state.reset();
                if is_text {
                    self.history.pop();
                }
                return Err(e);
            }
        };

        self.cache = self.engine.take_kept_cache(request_id);
        let materialized = self.cache.as_ref().map_or(0, BlockTable::num_tokens);
        self.state
            .complete_turn(&plan.prompt_tokens, &output.output_tokens, materialized);
        if is_text {
            self.history.push(ChatMessage::assistant(output.output_text.clone()));
        }
        info!(
            request_id,
            materialized,
            history_len = self.state.tokenized().len(),
            "chat turn done"
        );
        Ok(output)
    }

    /// End the conversation and release its cache.
    pub fn finish_chat(&mut self) {
        if let Some(mut table) = self.cache.take() {
            self.engine.release_cache(&mut table);
        }
        self.state.reset();
        self.history.clear();
    }

    /// Tokens currently held in the session cache.
    pub fn cached_tokens(&self) -> Vec<u32> {
        self.cache
            .as_ref()
            .map(|table| self.engine.scheduler().block_manager().read_tokens(table))
            .unwrap_or_default()
    }

    pub fn state(&self) -> &ChatState {
        &self.state
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn engine(&self) -> &LLMEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut LLMEngine {
        &mut self.engine
    }

    /// Release the cache and hand the engine back.
    pub fn into_engine(mut self) -> LLMEngine {
        self.finish_chat();
        self.engine
    }
}
