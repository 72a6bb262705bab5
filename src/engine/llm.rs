//! LLM Inference Engine.
//!
//! The LLMEngine runs the continuous batching loop:
//! - Submitters feed requests through a multi-producer channel
//! - Scheduler decides which sequences run each step
//! - Backend computes logits for the scheduled tokens
//! - Sampler (or beam search, or draft verification) picks tokens
//! - Tokenizer turns tokens into streamed text fragments
//!
//! ## Engine Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      LLMEngine::step                        │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!   Submitter::submit()      │
//!          │                 ▼
//!          │         ┌──────────────┐
//!          └───────► │ drain channel│  tokenize, validate, queue
//!                    └──────────────┘
//!                            │
//!                            ▼
//!                    ┌──────────────┐
//!                    │ cancel/time  │  abort flagged requests
//!                    └──────────────┘
//!                            │
//!                            ▼
//!                    ┌──────────────┐
//!                    │  Scheduler   │  reclaim, decode, resume, admit
//!                    └──────────────┘
//!                            │
//!                            ▼
//!                    ┌──────────────┐
//!                    │   Backend    │  materialize(cache_ops), infer
//!                    └──────────────┘
//!                            │
//!                            ▼
//!                    ┌──────────────┐
//!                    │   Sampler    │  sample / verify drafts / beams
//!                    └──────────────┘
//!                            │
//!                            ▼
//!                    ┌──────────────┐
//!                    │   Stream     │  fragments, finish, next drafts
//!                    └──────────────┘
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use candle_core::{IndexOp, Tensor};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::metrics::{MetricsRecorder, PerfMetrics};
use super::sampler::{check_stop, log_softmax, BeamInput, BeamSearch, Sampler};
use super::streaming::{RequestHandle, StreamCallback, StreamEvent, StreamStatus, TextStreamer};
use crate::backend::{ComputeBackend, ModelInput};
use crate::config::{EngineConfig, GenerationConfig};
use crate::core::block::BlockTable;
use crate::core::sequence::{
    FinishReason, Priority, RequestId, Sequence, SequenceId, DEFAULT_PRIORITY,
};
use crate::error::{Error, Result};
use crate::scheduler::{ScheduledSequence, Scheduler};
use crate::speculative::{DecodingStrategy, Draft, DraftSource, PromptLookup, RejectionSampler};
use crate::tokenizer::Tokenizer;

/// Prompt of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prompt {
    /// Encoded with the engine's tokenizer on intake.
    Text(String),
    /// Used as is.
    Tokens(Vec<u32>),
}

impl From<&str> for Prompt {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for Prompt {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Vec<u32>> for Prompt {
    fn from(tokens: Vec<u32>) -> Self {
        Self::Tokens(tokens)
    }
}

/// Request for text generation.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: Prompt,
    /// Generation configuration for this request.
    pub config: GenerationConfig,
    /// Priority (higher = more important).
    pub priority: Priority,
}

impl GenerationRequest {
    /// Create a new generation request with default settings.
    pub fn new(prompt: impl Into<Prompt>) -> Self {
        Self {
            prompt: prompt.into(),
            config: GenerationConfig::default(),
            priority: DEFAULT_PRIORITY,
        }
    }

    pub fn config(mut self, config: GenerationConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the maximum tokens to generate.
    pub fn max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.config.max_new_tokens = max_new_tokens;
        self
    }

    /// Set the temperature for sampling.
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.config.temperature = temperature;
        self
    }

    /// Set top-k sampling parameter.
    pub fn top_k(mut self, top_k: usize) -> Self {
        self.config.top_k = top_k;
        self
    }

    /// Set top-p (nucleus) sampling parameter.
    pub fn top_p(mut self, top_p: f32) -> Self {
        self.config.top_p = top_p;
        self
    }

    /// Set request priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// One finished beam.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamOutput {
    pub output_tokens: Vec<u32>,
    pub output_text: String,
    pub cumulative_logprob: f32,
    /// Length-normalized score.
    pub score: f32,
}

/// Output from a generation request.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub request_id: RequestId,
    pub prompt_tokens: Vec<u32>,
    /// Generated output text.
    pub output_text: String,
    /// Generated token IDs, including a final stop token.
    pub output_tokens: Vec<u32>,
    pub finish_reason: FinishReason,
    pub cumulative_logprob: f32,
    /// Best `num_return_sequences` beams, best first. Empty without beam search.
    pub beams: Vec<BeamOutput>,
    pub metrics: PerfMetrics,
}

/// Request sent to the engine loop.
pub(crate) struct Submission {
    pub request_id: RequestId,
    pub request: GenerationRequest,
    pub events: flume::Sender<StreamEvent>,
    pub cancel: CancellationToken,
    pub streamer: Option<StreamCallback>,
    /// Materialized prefix of the prompt, owned by the caller until now.
    pub cache: Option<BlockTable>,
    /// Detach the finished sequence's cache instead of releasing it.
    pub keep_cache: bool,
}

pub(crate) enum EngineCommand {
    Submit(Box<Submission>),
    Cancel(RequestId),
}

/// Cloneable, thread-safe entry point for requests.
#[derive(Clone)]
pub struct Submitter {
    commands: flume::Sender<EngineCommand>,
    next_request_id: Arc<AtomicU64>,
}

impl Submitter {
    /// Submit a prompt; the handle streams fragments and the final output.
    ///
    /// # Errors
    ///
    /// [`Error::Shutdown`] once the engine is gone.
    pub fn submit(
        &self,
        prompt: impl Into<Prompt>,
        config: GenerationConfig,
    ) -> Result<RequestHandle> {
        self.submit_request(GenerationRequest::new(prompt).config(config))
    }

    pub fn submit_request(&self, request: GenerationRequest) -> Result<RequestHandle> {
        self.send(request, None)
    }

    /// Submit with a callback run on the engine thread for every fragment.
    pub fn submit_with_streamer(
        &self,
        prompt: impl Into<Prompt>,
        config: GenerationConfig,
        streamer: impl FnMut(&str) -> StreamStatus + Send + 'static,
    ) -> Result<RequestHandle> {
        let request = GenerationRequest::new(prompt).config(config);
        self.send(request, Some(Box::new(streamer)))
    }

    /// Cancel a request by id.
    pub fn cancel(&self, request_id: RequestId) -> Result<()> {
        self.commands
            .send(EngineCommand::Cancel(request_id))
            .map_err(|_| Error::Shutdown)
    }

    fn send(
        &self,
        request: GenerationRequest,
        streamer: Option<StreamCallback>,
    ) -> Result<RequestHandle> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (events, receiver) = flume::unbounded();
        let cancel = CancellationToken::new();
        let submission = Submission {
            request_id,
            request,
            events,
            cancel: cancel.clone(),
            streamer,
            cache: None,
            keep_cache: false,
        };
        self.commands
            .send(EngineCommand::Submit(Box::new(submission)))
            .map_err(|_| Error::Shutdown)?;
        Ok(RequestHandle::new(request_id, receiver, cancel))
    }
}

/// Beam search bookkeeping of one request.
struct BeamState {
    search: BeamSearch,
    /// Best finished hypotheses, best first: tokens, cumulative log-probability, score.
    hypotheses: Vec<(Vec<u32>, f32, f32)>,
    finish_reason: FinishReason,
}

impl BeamState {
    /// Record a finished hypothesis, keeping only the best `num_beams`.
    fn add_hypothesis(&mut self, tokens: Vec<u32>, cumulative_logprob: f32) {
        let score = self.search.score(cumulative_logprob, tokens.len());
        self.hypotheses.push((tokens, cumulative_logprob, score));
        self.hypotheses
            .sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
        self.hypotheses.truncate(self.search.num_beams());
    }
}

/// Engine-side state of one live request.
struct RequestState {
    prompt_tokens: Vec<u32>,
    config: GenerationConfig,
    strategy: DecodingStrategy,
    sampler: Sampler,
    beam: Option<BeamState>,
    /// Draft distribution of the pending draft tokens, when the source has one.
    draft_logits: Option<Tensor>,
    events: flume::Sender<StreamEvent>,
    cancel: CancellationToken,
    streamer: Option<StreamCallback>,
    text: TextStreamer,
    recorder: MetricsRecorder,
    deadline: Option<Instant>,
    keep_cache: bool,
}

/// LLM Inference Engine.
///
/// Single owner of the scheduler, block manager and request state; nothing
/// here is shared across threads except the inbound channel.
pub struct LLMEngine {
    backend: Box<dyn ComputeBackend>,
    tokenizer: Arc<dyn Tokenizer>,
    scheduler: Scheduler,
    config: EngineConfig,
    strategy: DecodingStrategy,
    draft_source: Option<Box<dyn DraftSource>>,
    rejection_sampler: RejectionSampler,
    requests: HashMap<RequestId, RequestState>,
    commands: flume::Receiver<EngineCommand>,
    command_tx: flume::Sender<EngineCommand>,
    next_request_id: Arc<AtomicU64>,
    /// Caches detached from finished requests, waiting to be claimed.
    kept_caches: HashMap<RequestId, BlockTable>,
    num_steps: u64,
}

impl LLMEngine {
    /// Create a new LLMEngine.
    ///
    /// # Arguments
    ///
    /// * `backend` - Tensor execution for every step
    /// * `tokenizer` - Tokenizer for text encoding/decoding
    /// * `config` - Scheduler limits and default generation settings
    pub fn new(
        backend: Box<dyn ComputeBackend>,
        tokenizer: Arc<dyn Tokenizer>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let scheduler = Scheduler::new(config.scheduler.clone())?;
        let (command_tx, commands) = flume::unbounded();
        let rejection_sampler = match config.generation.seed {
            Some(seed) => RejectionSampler::with_seed(seed),
            None => RejectionSampler::new(),
        };

        info!(
            cache_size = config.scheduler.cache_size,
            block_size = config.scheduler.block_size,
            vocab_size = backend.vocab_size(),
            "engine ready"
        );
        Ok(Self {
            backend,
            tokenizer,
            scheduler,
            config,
            strategy: DecodingStrategy::Standard,
            draft_source: None,
            rejection_sampler,
            requests: HashMap::new(),
            commands,
            command_tx,
            next_request_id: Arc::new(AtomicU64::new(1)),
            kept_caches: HashMap::new(),
            num_steps: 0,
        })
    }

    /// Attach a draft model; speculative requests then verify its drafts.
    pub fn with_draft_source(mut self, source: Box<dyn DraftSource>) -> Self {
        self.draft_source = Some(source);
        self.strategy = DecodingStrategy::Draft;
        self
    }

    /// A handle for submitting requests from any thread.
    pub fn submitter(&self) -> Submitter {
        Submitter {
            commands: self.command_tx.clone(),
            next_request_id: Arc::clone(&self.next_request_id),
        }
    }

    pub fn submit(
        &self,
        prompt: impl Into<Prompt>,
        config: GenerationConfig,
    ) -> Result<RequestHandle> {
        self.submitter().submit(prompt, config)
    }

    pub fn submit_request(&self, request: GenerationRequest) -> Result<RequestHandle> {
        self.submitter().submit_request(request)
    }

    pub fn submit_with_streamer(
        &self,
        prompt: impl Into<Prompt>,
        config: GenerationConfig,
        streamer: impl FnMut(&str) -> StreamStatus + Send + 'static,
    ) -> Result<RequestHandle> {
        self.submitter().submit_with_streamer(prompt, config, streamer)
    }

    /// Queue a request directly, bypassing the channel.
    pub(crate) fn enqueue(
        &mut self,
        request: GenerationRequest,
        streamer: Option<StreamCallback>,
        cache: Option<BlockTable>,
        keep_cache: bool,
    ) -> RequestHandle {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (events, receiver) = flume::unbounded();
        let cancel = CancellationToken::new();
        self.intake(Submission {
            request_id,
            request,
            events,
            cancel: cancel.clone(),
            streamer,
            cache,
            keep_cache,
        });
        RequestHandle::new(request_id, receiver, cancel)
    }

    /// Generate text from a single prompt, running the loop until idle.
    pub fn generate(
        &mut self,
        prompt: impl Into<Prompt>,
        config: GenerationConfig,
    ) -> Result<(String, PerfMetrics)> {
        let handle = self.submit(prompt, config)?;
        self.run_until_idle()?;
        let output = handle.wait()?;
        Ok((output.output_text, output.metrics))
    }

    /// Step until no request is queued or running.
    pub fn run_until_idle(&mut self) -> Result<Vec<GenerationOutput>> {
        let mut outputs = Vec::new();
        loop {
            outputs.extend(self.step()?);
            if !self.has_unfinished_requests() && self.commands.is_empty() {
                break;
            }
        }
        Ok(outputs)
    }

    /// Serve requests until `shutdown` is cancelled.
    ///
    /// Blocks on the inbound channel while idle. Requests still live at
    /// shutdown receive [`Error::Shutdown`].
    pub fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        while !shutdown.is_cancelled() {
            if !self.has_unfinished_requests() {
                match self.commands.recv_timeout(Duration::from_millis(10)) {
                    Ok(command) => self.handle_command(command),
                    Err(flume::RecvTimeoutError::Timeout) => continue,
                    Err(flume::RecvTimeoutError::Disconnected) => break,
                }
            }
            self.step()?;
        }
        self.fail_all(|| Error::Shutdown);
        Ok(())
    }

    /// Run one iteration of the loop.
    ///
    /// Returns outputs of requests that finished (or were cancelled) in this
    /// step. Backend failures are reported to the affected requests, not
    /// returned.
    pub fn step(&mut self) -> Result<Vec<GenerationOutput>> {
        while let Ok(command) = self.commands.try_recv() {
            self.handle_command(command);
        }

        let mut completed = self.reap_cancelled();
        let mut outputs = self.scheduler.schedule();
        self.num_steps += 1;

        for (request_id, error) in std::mem::take(&mut outputs.rejected) {
            if let Some(state) = self.requests.remove(&request_id) {
                let _ = state.events.send(StreamEvent::Error(error));
            }
        }
        if outputs.scheduled.is_empty() {
            return Ok(completed);
        }

        let request_ids = outputs.scheduled_request_ids();
        let input = ModelInput::new(outputs.scheduled);
        let logits = self
            .backend
            .materialize(&outputs.cache_ops)
            .and_then(|()| self.backend.infer(&input))
            .and_then(|logits| {
                if logits.len() == input.sequences.len() {
                    Ok(logits)
                } else {
                    Err(Error::Backend(format!(
                        "expected logits for {} sequences, got {}",
                        input.sequences.len(),
                        logits.len()
                    )))
                }
            });
        let logits = match logits {
            Ok(logits) => logits,
            Err(e) => {
                let message = match e {
                    Error::Backend(message) => message,
                    other => other.to_string(),
                };
                warn!(step = self.num_steps, error = %message, "backend step failed");
                for request_id in request_ids {
                    self.fail_request(request_id, Error::Backend(message.clone()));
                }
                return Ok(completed);
            }
        };

        let mut by_request: Vec<(RequestId, Vec<(ScheduledSequence, Tensor)>)> = Vec::new();
        for (scheduled, logits) in input.sequences.into_iter().zip(logits) {
            match by_request.iter_mut().find(|(id, _)| *id == scheduled.request_id) {
                Some((_, entries)) => entries.push((scheduled, logits)),
                None => by_request.push((scheduled.request_id, vec![(scheduled, logits)])),
            }
        }

        for (request_id, entries) in by_request {
            let is_beam = self
                .requests
                .get(&request_id)
                .is_some_and(|state| state.beam.is_some());
            let result = if is_beam {
                self.commit_beams(request_id, entries)
            } else {
                entries
                    .into_iter()
                    .try_for_each(|(scheduled, logits)| self.commit_sequence(&scheduled, &logits))
            };
            if let Err(e) = result {
                warn!(request_id, error = %e, "request failed during commit");
                self.fail_request(request_id, e);
                continue;
            }

            if self
                .scheduler
                .get_group(request_id)
                .is_some_and(|group| group.is_finished())
            {
                if let Some(output) = self.finalize(request_id)? {
                    completed.push(output);
                }
            }
        }

        debug!(
            step = self.num_steps,
            live = self.requests.len(),
            completed = completed.len(),
            "engine step done"
        );
        Ok(completed)
    }

    fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Submit(submission) => self.intake(*submission),
            EngineCommand::Cancel(request_id) => {
                if let Some(state) = self.requests.get(&request_id) {
                    state.cancel.cancel();
                }
            }
        }
    }

    fn intake(&mut self, submission: Submission) {
        let Submission {
            request_id,
            request,
            events,
            cancel,
            streamer,
            cache,
            keep_cache,
        } = submission;

        match self.admit(request_id, request, cache) {
            Ok((prompt_tokens, config)) => {
                let strategy = self.strategy.for_request(&config);
                let beam = config.is_beam_search().then(|| BeamState {
                    search: BeamSearch::from_config(&config),
                    hypotheses: Vec::new(),
                    finish_reason: FinishReason::MaxTokens,
                });
                let deadline = config
                    .timeout_ms
                    .map(|ms| Instant::now() + Duration::from_millis(ms));
                info!(
                    request_id,
                    prompt_len = prompt_tokens.len(),
                    strategy = ?strategy,
                    "request queued"
                );
                self.requests.insert(
                    request_id,
                    RequestState {
                        recorder: MetricsRecorder::start(prompt_tokens.len()),
                        prompt_tokens,
                        sampler: Sampler::new(&config),
                        config,
                        strategy,
                        beam,
                        draft_logits: None,
                        events,
                        cancel,
                        streamer,
                        text: TextStreamer::new(),
                        deadline,
                        keep_cache,
                    },
                );
            }
            Err(e) => {
                warn!(request_id, error = %e, "request refused");
                let _ = events.send(StreamEvent::Error(e));
            }
        }
    }

    fn admit(
        &mut self,
        request_id: RequestId,
        request: GenerationRequest,
        cache: Option<BlockTable>,
    ) -> Result<(Vec<u32>, GenerationConfig)> {
        let mut config = request.config;
        if config.eos_token_id.is_none() {
            config.eos_token_id = self.tokenizer.eos_token_id();
        }
        let scheduler = &self.config.scheduler;
        let checked = config.validate().and_then(|()| {
            if config.num_beams > scheduler.max_num_seqs {
                Err(Error::InvalidConfig(format!(
                    "num_beams ({}) exceeds max_num_seqs ({})",
                    config.num_beams, scheduler.max_num_seqs
                )))
            } else if config.num_beams > scheduler.max_num_batched_tokens {
                // Every beam decodes one token per step.
                Err(Error::InvalidConfig(format!(
                    "num_beams ({}) exceeds max_num_batched_tokens ({})",
                    config.num_beams, scheduler.max_num_batched_tokens
                )))
            } else {
                Ok(())
            }
        });
        let prompt_tokens = checked.and_then(|()| match request.prompt {
            Prompt::Text(text) => self.tokenizer.encode(&text),
            Prompt::Tokens(tokens) => Ok(tokens),
        });
        let mut cache =
            cache.unwrap_or_else(|| BlockTable::new(self.config.scheduler.block_size));
        let prompt_tokens = prompt_tokens.and_then(|tokens| {
            if tokens.is_empty() {
                Err(Error::Tokenization("empty prompt".into()))
            } else if cache.num_tokens() >= tokens.len() {
                Err(Error::InvalidConfig(format!(
                    "cached prefix ({}) must be shorter than the prompt ({})",
                    cache.num_tokens(),
                    tokens.len()
                )))
            } else {
                Ok(tokens)
            }
        });
        let tokens = match prompt_tokens {
            Ok(tokens) => tokens,
            Err(e) => {
                self.scheduler.release_block_table(&mut cache);
                return Err(e);
            }
        };

        self.scheduler.add_request_with_cache(
            request_id,
            tokens.clone(),
            config.clone(),
            request.priority,
            cache,
        )?;
        Ok((tokens, config))
    }

    /// Abort requests whose token was cancelled or whose deadline passed.
    fn reap_cancelled(&mut self) -> Vec<GenerationOutput> {
        let now = Instant::now();
        let cancelled: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|(_, state)| {
                state.cancel.is_cancelled() || state.deadline.is_some_and(|d| now >= d)
            })
            .map(|(&id, _)| id)
            .collect();

        let mut outputs = Vec::with_capacity(cancelled.len());
        for request_id in cancelled {
            let Some(state) = self.requests.remove(&request_id) else {
                continue;
            };
            let timed_out = !state.cancel.is_cancelled();
            if timed_out {
                info!(request_id, "request timed out");
            } else {
                info!(request_id, "request cancelled");
            }

            let (output_tokens, cumulative_logprob) = self
                .scheduler
                .live_seq_ids(request_id)
                .first()
                .and_then(|&id| self.scheduler.get_sequence(id))
                .map(|seq| (seq.output_token_ids().to_vec(), seq.cumulative_logprob()))
                .unwrap_or_default();
            self.scheduler.abort(request_id);

            let output_text = self.tokenizer.decode(&output_tokens).unwrap_or_default();
            let output = GenerationOutput {
                request_id,
                prompt_tokens: state.prompt_tokens,
                output_text,
                output_tokens,
                finish_reason: FinishReason::Aborted,
                cumulative_logprob,
                beams: Vec::new(),
                metrics: state.recorder.finish(),
            };
            let _ = state.events.send(StreamEvent::Finished(output.clone()));
            outputs.push(output);
        }
        outputs
    }

    fn fail_request(&mut self, request_id: RequestId, error: Error) {
        self.scheduler.abort(request_id);
        if let Some(mut table) = self.kept_caches.remove(&request_id) {
            self.scheduler.release_block_table(&mut table);
        }
        if let Some(state) = self.requests.remove(&request_id) {
            let _ = state.events.send(StreamEvent::Error(error));
        }
    }

    fn fail_all(&mut self, error: impl Fn() -> Error) {
        let ids: Vec<RequestId> = self.requests.keys().copied().collect();
        for request_id in ids {
            self.fail_request(request_id, error());
        }
    }

    /// Sample, verify drafts, append, and check stops for one sequence.
    fn commit_sequence(&mut self, scheduled: &ScheduledSequence, logits: &Tensor) -> Result<()> {
        let request_id = scheduled.request_id;
        let seq_id = scheduled.seq_id;
        let state = self
            .requests
            .get_mut(&request_id)
            .ok_or(Error::RequestNotFound(request_id))?;
        if scheduled.is_prefill {
            state.recorder.record_cached(scheduled.start_pos);
        }

        let k = scheduled.num_draft_tokens;
        let (tokens, logprobs) = if k == 0 {
            state.draft_logits = None;
            let (token, logprob) = state.sampler.sample_with_logprob(&logits.i(0)?)?;
            (vec![token], vec![logprob])
        } else {
            let drafts = &scheduled.token_ids[scheduled.num_tokens() - k..];
            let verification = match (state.strategy, state.draft_logits.take()) {
                (DecodingStrategy::Draft, Some(draft_logits)) => self.rejection_sampler.verify(
                    drafts,
                    &draft_logits,
                    logits,
                    &state.sampler,
                )?,
                _ => self
                    .rejection_sampler
                    .verify_matching(drafts, logits, &mut state.sampler)?,
            };
            state.recorder.record_draft(k, verification.num_accepted);
            (verification.tokens(), verification.logprobs)
        };

        let mut finish = None;
        let mut emitted = 0;
        for (token, logprob) in tokens.into_iter().zip(logprobs) {
            self.scheduler.append_token(seq_id, token, logprob)?;
            emitted += 1;
            let num_generated = self
                .scheduler
                .get_sequence(seq_id)
                .map_or(0, Sequence::output_len);

            let status = match state.text.push(token, self.tokenizer.as_ref())? {
                Some(fragment) => emit_fragment(state, fragment),
                None => StreamStatus::Running,
            };
            if let Some(reason) = check_stop(&state.config, token, num_generated) {
                finish = Some(reason);
                break;
            }
            match status {
                StreamStatus::Running => {}
                StreamStatus::Stop => {
                    finish = Some(FinishReason::Stopped);
                    break;
                }
                StreamStatus::Cancel => {
                    state.cancel.cancel();
                    break;
                }
            }
        }
        state.recorder.record_step(emitted);
        self.scheduler.finish_step(seq_id, scheduled.is_prefill)?;

        if let Some(reason) = finish {
            if state.keep_cache {
                if let Some(table) = self.scheduler.detach_block_table(seq_id) {
                    self.kept_caches.insert(request_id, table);
                }
            }
            self.scheduler.finish_sequence(seq_id, reason);
            return Ok(());
        }
        if state.cancel.is_cancelled() || !state.strategy.is_speculative() {
            return Ok(());
        }

        let (context, max) = {
            let seq = self
                .scheduler
                .get_sequence(seq_id)
                .ok_or(Error::SequenceNotFound(seq_id))?;
            let remaining = state.config.max_new_tokens.saturating_sub(seq.output_len());
            let max = state
                .config
                .num_assistant_tokens
                .min(remaining.saturating_sub(1));
            (seq.all_token_ids(), max)
        };
        if max == 0 {
            return Ok(());
        }
        let proposed = match state.strategy {
            DecodingStrategy::PromptLookup => PromptLookup::new(
                state.config.max_ngram_size,
                state.config.num_assistant_tokens,
            )
            .propose(&context, max),
            DecodingStrategy::Draft => match self.draft_source.as_mut() {
                Some(source) => source.propose(&context, max),
                None => Ok(Draft::default()),
            },
            DecodingStrategy::Standard => Ok(Draft::default()),
        };
        match proposed.and_then(|draft| clamp_draft(draft, max)) {
            Ok(draft) if !draft.is_empty() => {
                state.draft_logits = draft.logits;
                self.scheduler.set_draft_tokens(seq_id, draft.tokens)?;
            }
            Ok(_) => {}
            Err(e) => warn!(request_id, error = %e, "draft proposal failed"),
        }
        Ok(())
    }

    /// One beam search step over every live beam of a group.
    fn commit_beams(
        &mut self,
        request_id: RequestId,
        entries: Vec<(ScheduledSequence, Tensor)>,
    ) -> Result<()> {
        let state = self
            .requests
            .get_mut(&request_id)
            .ok_or(Error::RequestNotFound(request_id))?;
        let Some(beam) = state.beam.as_mut() else {
            return Ok(());
        };

        let mut inputs = Vec::with_capacity(entries.len());
        let mut was_prefill = false;
        for (scheduled, logits) in &entries {
            let seq = self
                .scheduler
                .get_sequence(scheduled.seq_id)
                .ok_or(Error::SequenceNotFound(scheduled.seq_id))?;
            was_prefill |= scheduled.is_prefill;
            inputs.push(BeamInput {
                seq_id: scheduled.seq_id,
                ordinal: seq.ordinal(),
                cumulative_logprob: seq.cumulative_logprob(),
                log_probs: log_softmax(&logits.i(0)?)?,
            });
        }
        if was_prefill {
            if let Some((scheduled, _)) = entries.first() {
                state.recorder.record_cached(scheduled.start_pos);
            }
        }

        let step = beam.search.select(&inputs, &state.config);
        for candidate in &step.finished {
            let mut tokens = self
                .scheduler
                .get_sequence(candidate.parent)
                .map(|seq| seq.output_token_ids().to_vec())
                .unwrap_or_default();
            tokens.push(candidate.token);
            beam.add_hypothesis(tokens, candidate.cumulative_logprob);
        }

        for input in &inputs {
            let children: Vec<_> = step
                .continuing
                .iter()
                .filter(|c| c.parent == input.seq_id)
                .collect();
            let Some((first, rest)) = children.split_first() else {
                self.scheduler.prune_sequence(request_id, input.seq_id);
                continue;
            };
            for extra in rest {
                let child = self.scheduler.fork_sequence(request_id, input.seq_id)?;
                self.scheduler.append_token(child, extra.token, extra.logprob)?;
                self.scheduler.finish_step(child, false)?;
            }
            self.scheduler
                .append_token(input.seq_id, first.token, first.logprob)?;
            self.scheduler.finish_step(input.seq_id, was_prefill)?;
        }
        state.recorder.record_step(1);

        let live = self.scheduler.live_seq_ids(request_id);
        let output_len = live
            .first()
            .and_then(|&id| self.scheduler.get_sequence(id))
            .map_or(0, Sequence::output_len);
        let best_live = live
            .iter()
            .filter_map(|&id| self.scheduler.get_sequence(id))
            .map(|seq| beam.search.score(seq.cumulative_logprob(), seq.output_len()))
            .reduce(f32::max);
        let kept: Vec<f32> = beam.hypotheses.iter().map(|h| h.2).collect();
        let done = if beam.search.is_done(&kept, best_live) {
            Some(FinishReason::EndOfSequence)
        } else if output_len >= state.config.max_new_tokens || live.is_empty() {
            for &seq_id in &live {
                if let Some(seq) = self.scheduler.get_sequence(seq_id) {
                    beam.add_hypothesis(seq.output_token_ids().to_vec(), seq.cumulative_logprob());
                }
            }
            Some(FinishReason::MaxTokens)
        } else {
            None
        };

        if let Some(reason) = done {
            beam.finish_reason = reason;
            debug!(request_id, hypotheses = beam.hypotheses.len(), "beam search done");
            self.scheduler.finish_group(request_id, reason);
        }
        Ok(())
    }

    /// Collect a finished group, flush its stream and send the final output.
    fn finalize(&mut self, request_id: RequestId) -> Result<Option<GenerationOutput>> {
        let Some((_, seqs)) = self.scheduler.take_finished_group(request_id) else {
            return Ok(None);
        };
        let Some(mut state) = self.requests.remove(&request_id) else {
            return Ok(None);
        };

        let (output_tokens, cumulative_logprob, finish_reason, beams) = match state.beam.take() {
            Some(mut beam) => {
                beam.hypotheses
                    .sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
                beam.hypotheses.truncate(state.config.num_return_sequences);
                let mut beams = Vec::with_capacity(beam.hypotheses.len());
                for (tokens, cumulative_logprob, score) in beam.hypotheses {
                    beams.push(BeamOutput {
                        output_text: self.tokenizer.decode(&tokens)?,
                        output_tokens: tokens,
                        cumulative_logprob,
                        score,
                    });
                }
                let best = beams.first().cloned();
                let (tokens, logprob) = best
                    .map(|b| (b.output_tokens, b.cumulative_logprob))
                    .unwrap_or_default();
                (tokens, logprob, beam.finish_reason, beams)
            }
            None => {
                let seq = seqs.first().ok_or(Error::RequestNotFound(request_id))?;
                (
                    seq.output_token_ids().to_vec(),
                    seq.cumulative_logprob(),
                    seq.finish_reason().unwrap_or(FinishReason::Stopped),
                    Vec::new(),
                )
            }
        };

        let output_text = self.tokenizer.decode(&output_tokens)?;
        if beams.is_empty() {
            if let Some(rest) = state.text.flush(self.tokenizer.as_ref())? {
                emit_fragment(&mut state, rest);
            }
        } else if !output_text.is_empty() {
            emit_fragment(&mut state, output_text.clone());
        }

        let output = GenerationOutput {
            request_id,
            prompt_tokens: state.prompt_tokens,
            output_text,
            output_tokens,
            finish_reason,
            cumulative_logprob,
            beams,
            metrics: state.recorder.finish(),
        };
        info!(
            request_id,
            finish_reason = finish_reason.as_str(),
            num_tokens = output.output_tokens.len(),
            "request finished"
        );
        let _ = state.events.send(StreamEvent::Finished(output.clone()));
        Ok(Some(output))
    }

    // ========== Cache hand-off for chat sessions ==========

    /// Claim the cache detached from a finished request.
    pub(crate) fn take_kept_cache(&mut self, request_id: RequestId) -> Option<BlockTable> {
        self.kept_caches.remove(&request_id)
    }

    pub(crate) fn release_cache(&mut self, table: &mut BlockTable) {
        self.scheduler.release_block_table(table);
    }

    pub(crate) fn truncate_cache(&mut self, table: &mut BlockTable, len: usize) {
        self.scheduler.truncate_block_table(table, len);
    }

    // ========== Accessors ==========

    /// Check if any request is queued, running, or awaiting reclamation.
    pub fn has_unfinished_requests(&self) -> bool {
        !self.requests.is_empty() || self.scheduler.has_unfinished_requests()
    }

    /// Live requests.
    pub fn num_requests(&self) -> usize {
        self.requests.len()
    }

    pub fn num_steps(&self) -> u64 {
        self.num_steps
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Get reference to the tokenizer.
    pub fn tokenizer(&self) -> &dyn Tokenizer {
        self.tokenizer.as_ref()
    }

    pub fn strategy(&self) -> DecodingStrategy {
        self.strategy
    }

    /// Drop every request and cache, and reset the backend.
    pub fn reset(&mut self) -> Result<()> {
        self.fail_all(|| Error::Shutdown);
        self.kept_caches.clear();
        self.scheduler.reset();
        self.backend.reset_state()
    }
}

/// Deliver a fragment to the channel and the callback.
fn emit_fragment(state: &mut RequestState, fragment: String) -> StreamStatus {
    let status = match state.streamer.as_mut() {
        Some(callback) => callback(&fragment),
        None => StreamStatus::Running,
    };
    let _ = state.events.send(StreamEvent::Fragment(fragment));
    status
}

/// Cut a draft to `max` tokens, keeping its logits aligned.
fn clamp_draft(mut draft: Draft, max: usize) -> Result<Draft> {
    if draft.tokens.len() > max {
        draft.tokens.truncate(max);
        draft.logits = draft
            .logits
            .map(|logits| logits.narrow(0, 0, max))
            .transpose()?;
    }
    Ok(draft)
}
