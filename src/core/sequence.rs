//! Sequence tracking for inference requests.
//!
//! A [`Sequence`] is one token stream with its own KV cache block table. A
//! [`SequenceGroup`] is everything forked from one request's prompt: a single
//! sequence for greedy or sampled decoding, up to `num_beams` for beam search.
//! Sequences live in a [`SequenceArena`] and are addressed by index handles so
//! forks and pruning never move data.

use crate::config::GenerationConfig;
use crate::core::block::{BlockTable, DEFAULT_BLOCK_SIZE};
use crate::error::{Error, Result};

/// Arena index of a sequence. Reused after the sequence is removed.
pub type SequenceId = usize;

/// Caller-visible request identifier.
pub type RequestId = u64;

/// Status of a sequence in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceStatus {
    /// Waiting in queue to be scheduled.
    Waiting,
    /// Currently running (prefill or decode).
    Running,
    /// Swapped out to host memory (preempted).
    Swapped,
    /// Finished generation (stop criterion met).
    Finished,
    /// Cancelled, timed out, or failed.
    Aborted,
}

impl SequenceStatus {
    /// Check if the sequence is active (waiting or running).
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Waiting | Self::Running)
    }

    /// Check if the sequence reached a terminal state.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished | Self::Aborted)
    }

    /// Get the status name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Running => "Running",
            Self::Swapped => "Swapped",
            Self::Finished => "Finished",
            Self::Aborted => "Aborted",
        }
    }
}

/// Reason for sequence completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// End-of-sequence token generated.
    EndOfSequence,
    /// A configured stop token was generated.
    StopToken,
    /// Maximum token limit reached.
    MaxTokens,
    /// The streaming callback asked to stop; output so far is kept.
    Stopped,
    /// Cancelled, timed out, or failed.
    Aborted,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EndOfSequence => "eos",
            Self::StopToken => "stop_token",
            Self::MaxTokens => "length",
            Self::Stopped => "stopped",
            Self::Aborted => "aborted",
        }
    }
}

/// Priority level for scheduling.
///
/// Higher values mean higher priority.
pub type Priority = i32;

/// Default priority for new requests.
pub const DEFAULT_PRIORITY: Priority = 0;

/// A single token stream.
///
/// It tracks:
/// - Input prompt tokens
/// - Generated output tokens and their cumulative log-probability
/// - KV cache block allocation (via BlockTable)
/// - Draft tokens awaiting verification
///
/// The block table's token count is the number of tokens whose KV state is
/// materialized. The most recently sampled token is never materialized until
/// the next step feeds it back.
///
/// # Example
///
/// ```
/// use nano_genai::core::sequence::{Sequence, SequenceStatus};
///
/// let mut seq = Sequence::new(1, vec![1, 2, 3, 4]);
/// assert_eq!(seq.status(), SequenceStatus::Waiting);
/// assert_eq!(seq.prompt_len(), 4);
/// assert_eq!(seq.output_len(), 0);
///
/// seq.append_token(5, -0.5);
/// assert_eq!(seq.output_len(), 1);
/// assert_eq!(seq.total_len(), 5);
/// ```
#[derive(Debug, Clone)]
pub struct Sequence {
    /// Arena handle.
    seq_id: SequenceId,
    /// Birth order, used to break ties deterministically.
    ordinal: u64,
    /// Prompt token IDs.
    prompt_token_ids: Vec<u32>,
    /// Generated output token IDs.
    output_token_ids: Vec<u32>,
    /// Sum of log-probabilities of the output tokens.
    cumulative_logprob: f32,
    /// Block table for KV cache mapping.
    block_table: BlockTable,
    /// Current status.
    status: SequenceStatus,
    /// Reason for finishing (if finished).
    finish_reason: Option<FinishReason>,
    /// Sequence this one was forked from.
    parent: Option<SequenceId>,
    /// Speculative tokens to verify in the next step.
    draft_tokens: Vec<u32>,
}

impl Sequence {
    /// Create a new sequence with the given prompt tokens.
    pub fn new(seq_id: SequenceId, prompt_token_ids: Vec<u32>) -> Self {
        Self::with_block_size(seq_id, prompt_token_ids, DEFAULT_BLOCK_SIZE)
    }

    /// Create a new sequence whose block table uses `block_size`.
    pub fn with_block_size(seq_id: SequenceId, prompt_token_ids: Vec<u32>, block_size: usize) -> Self {
        Self {
            seq_id,
            ordinal: seq_id as u64,
            prompt_token_ids,
            output_token_ids: Vec::new(),
            cumulative_logprob: 0.0,
            block_table: BlockTable::new(block_size),
            status: SequenceStatus::Waiting,
            finish_reason: None,
            parent: None,
            draft_tokens: Vec::new(),
        }
    }

    // ========== Getters ==========

    pub fn seq_id(&self) -> SequenceId {
        self.seq_id
    }

    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }

    pub fn parent(&self) -> Option<SequenceId> {
        self.parent
    }

    pub fn prompt_token_ids(&self) -> &[u32] {
        &self.prompt_token_ids
    }

    pub fn output_token_ids(&self) -> &[u32] {
        &self.output_token_ids
    }

    /// Get all token IDs (prompt + output).
    pub fn all_token_ids(&self) -> Vec<u32> {
        let mut tokens = self.prompt_token_ids.clone();
        tokens.extend(&self.output_token_ids);
        tokens
    }

    /// Token IDs from position `start` to the end.
    pub fn token_ids_from(&self, start: usize) -> Vec<u32> {
        let prompt_len = self.prompt_len();
        if start >= prompt_len {
            let skip = (start - prompt_len).min(self.output_len());
            return self.output_token_ids[skip..].to_vec();
        }
        let mut tokens = self.prompt_token_ids[start..].to_vec();
        tokens.extend(&self.output_token_ids);
        tokens
    }

    pub fn cumulative_logprob(&self) -> f32 {
        self.cumulative_logprob
    }

    pub fn block_table(&self) -> &BlockTable {
        &self.block_table
    }

    pub fn block_table_mut(&mut self) -> &mut BlockTable {
        &mut self.block_table
    }

    pub fn status(&self) -> SequenceStatus {
        self.status
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    pub fn draft_tokens(&self) -> &[u32] {
        &self.draft_tokens
    }

    // ========== Length queries ==========

    pub fn prompt_len(&self) -> usize {
        self.prompt_token_ids.len()
    }

    pub fn output_len(&self) -> usize {
        self.output_token_ids.len()
    }

    /// Get the total length (prompt + output).
    pub fn total_len(&self) -> usize {
        self.prompt_len() + self.output_len()
    }

    /// Tokens whose KV state is materialized.
    pub fn num_computed_tokens(&self) -> usize {
        self.block_table.num_tokens()
    }

    /// Tokens the next step has to feed, not counting drafts.
    pub fn num_uncomputed_tokens(&self) -> usize {
        self.total_len().saturating_sub(self.num_computed_tokens())
    }

    /// Check if some prompt token still lacks KV state.
    pub fn is_prefill(&self) -> bool {
        self.num_computed_tokens() < self.prompt_len()
    }

    // ========== Token operations ==========

    /// Append a generated token with its log-probability.
    pub fn append_token(&mut self, token_id: u32, logprob: f32) {
        self.output_token_ids.push(token_id);
        self.cumulative_logprob += logprob;
    }

    /// Get the last token ID.
    pub fn last_token_id(&self) -> Option<u32> {
        self.output_token_ids
            .last()
            .copied()
            .or_else(|| self.prompt_token_ids.last().copied())
    }

    /// Set the draft tokens verified in the next step.
    pub fn set_draft_tokens(&mut self, tokens: Vec<u32>) {
        self.draft_tokens = tokens;
    }

    /// Take the draft tokens, leaving none.
    pub fn take_draft_tokens(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.draft_tokens)
    }

    // ========== State transitions ==========

    /// Transition to running state.
    ///
    /// # Errors
    ///
    /// Returns error if current state doesn't allow this transition.
    pub fn set_running(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Waiting | SequenceStatus::Swapped => {
                self.status = SequenceStatus::Running;
                Ok(())
            }
            _ => Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Running",
            }),
        }
    }

    /// Transition to waiting state (recompute preemption).
    ///
    /// # Errors
    ///
    /// Returns error if current state doesn't allow this transition.
    pub fn set_waiting(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Running => {
                self.status = SequenceStatus::Waiting;
                Ok(())
            }
            _ => Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Waiting",
            }),
        }
    }

    /// Transition to swapped state (preempted).
    ///
    /// # Errors
    ///
    /// Returns error if current state doesn't allow this transition.
    pub fn set_swapped(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Running => {
                self.status = SequenceStatus::Swapped;
                Ok(())
            }
            _ => Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Swapped",
            }),
        }
    }

    /// Mark the sequence as finished. `Aborted` moves it to the aborted state.
    pub fn set_finished(&mut self, reason: FinishReason) {
        self.status = match reason {
            FinishReason::Aborted => SequenceStatus::Aborted,
            _ => SequenceStatus::Finished,
        };
        self.finish_reason = Some(reason);
        self.draft_tokens.clear();
    }
}

/// All sequences forked from one request's prompt.
#[derive(Debug, Clone)]
pub struct SequenceGroup {
    request_id: RequestId,
    config: GenerationConfig,
    /// Live and finished sequences still held in the arena.
    seq_ids: Vec<SequenceId>,
    priority: Priority,
    /// Submission order.
    arrival: u64,
    /// Order of the most recent admission to RUNNING.
    admitted_at: Option<u64>,
    status: SequenceStatus,
}

impl SequenceGroup {
    pub fn new(
        request_id: RequestId,
        seq_id: SequenceId,
        config: GenerationConfig,
        priority: Priority,
        arrival: u64,
    ) -> Self {
        Self {
            request_id,
            config,
            seq_ids: vec![seq_id],
            priority,
            arrival,
            admitted_at: None,
            status: SequenceStatus::Waiting,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    pub fn seq_ids(&self) -> &[SequenceId] {
        &self.seq_ids
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn arrival(&self) -> u64 {
        self.arrival
    }

    pub fn admitted_at(&self) -> Option<u64> {
        self.admitted_at
    }

    pub fn status(&self) -> SequenceStatus {
        self.status
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    /// Upper bound on concurrently live sequences.
    pub fn max_num_seqs(&self) -> usize {
        self.config.num_beams.max(1)
    }

    pub(crate) fn set_status(&mut self, status: SequenceStatus) {
        self.status = status;
    }

    pub(crate) fn set_admitted_at(&mut self, order: u64) {
        self.admitted_at = Some(order);
    }

    pub(crate) fn add_seq(&mut self, seq_id: SequenceId) {
        self.seq_ids.push(seq_id);
    }

    pub(crate) fn remove_seq(&mut self, seq_id: SequenceId) {
        self.seq_ids.retain(|&id| id != seq_id);
    }
}

/// Slot storage for sequences with index handles and a free-list.
///
/// Forking allocates a new slot that records its parent; removing a sequence
/// returns its slot for reuse.
#[derive(Debug, Default)]
pub struct SequenceArena {
    slots: Vec<Option<Sequence>>,
    free: Vec<SequenceId>,
    next_ordinal: u64,
    block_size: usize,
}

impl SequenceArena {
    pub fn new(block_size: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            next_ordinal: 0,
            block_size,
        }
    }

    fn place(&mut self, mut seq: Sequence) -> SequenceId {
        let seq_id = match self.free.pop() {
            Some(id) => id,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        seq.seq_id = seq_id;
        seq.ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        self.slots[seq_id] = Some(seq);
        seq_id
    }

    /// Create a root sequence for `prompt_token_ids`.
    pub fn insert(&mut self, prompt_token_ids: Vec<u32>) -> SequenceId {
        let seq = Sequence::with_block_size(0, prompt_token_ids, self.block_size);
        self.place(seq)
    }

    /// Clone a sequence's tokens and score into a new child.
    ///
    /// The child starts with an empty block table; the caller shares the
    /// parent's blocks through the block manager.
    pub fn fork(&mut self, parent_id: SequenceId) -> Result<SequenceId> {
        let parent = self.get(parent_id).ok_or(Error::SequenceNotFound(parent_id))?;
        let child = Sequence {
            seq_id: 0,
            ordinal: 0,
            prompt_token_ids: parent.prompt_token_ids.clone(),
            output_token_ids: parent.output_token_ids.clone(),
            cumulative_logprob: parent.cumulative_logprob,
            block_table: BlockTable::new(self.block_size),
            status: parent.status,
            finish_reason: None,
            parent: Some(parent_id),
            draft_tokens: Vec::new(),
        };
        Ok(self.place(child))
    }

    pub fn get(&self, seq_id: SequenceId) -> Option<&Sequence> {
        self.slots.get(seq_id).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, seq_id: SequenceId) -> Option<&mut Sequence> {
        self.slots.get_mut(seq_id).and_then(Option::as_mut)
    }

    /// Remove a sequence and recycle its slot.
    pub fn remove(&mut self, seq_id: SequenceId) -> Option<Sequence> {
        let seq = self.slots.get_mut(seq_id)?.take()?;
        self.free.push(seq_id);
        Some(seq)
    }

    pub fn contains(&self, seq_id: SequenceId) -> bool {
        self.get(seq_id).is_some()
    }

    /// Number of live slots.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sequence> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
    }
}
