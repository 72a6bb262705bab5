//! Continuous batching scheduler.
//!
//! The scheduler manages the lifecycle of request groups, deciding each
//! iteration which sequences run, which wait, and which give up their KV cache
//! blocks under memory pressure.
//!
//! ## Scheduling Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        Scheduler Flow                               │
//! └─────────────────────────────────────────────────────────────────────┘
//!
//!   add_request()                                   schedule()
//!        │                                              │
//!        ▼                                              ▼
//!   ┌─────────┐   admit (FIFO, token + block budget)  ┌─────────┐
//!   │ Waiting │ ────────────────────────────────────► │ Running │──► Finished
//!   │  Queue  │                                       │  Groups │
//!   └─────────┘ ◄──────── preempt (recompute) ─────── └─────────┘
//!                                                      │     ▲
//!                                   preempt (swap)     │     │ resume (FIFO)
//!                                                      ▼     │
//!                                                   ┌─────────┐
//!                                                   │ Swapped │
//!                                                   └─────────┘
//! ```
//!
//! Each step first reclaims groups aborted since the previous step, then
//! resumes swapped groups, admits waiting groups, and finally grows every
//! remaining running group by its decode tokens.
//!
//! - Swapped groups resume only when the running groups' next decode still
//!   fits afterwards.
//! - Waiting groups are admitted only while nothing is swapped. A group that
//!   never ran may preempt running groups (per [`VictimPolicy`]) to get its
//!   blocks and sequence slots.
//! - A running group short of blocks preempts the groups queued behind it,
//!   or itself when none is left.
//!
//! ## Example
//!
//! ```
//! use nano_genai::scheduler::batch::Scheduler;
//! use nano_genai::{GenerationConfig, SchedulerConfig};
//!
//! let config = SchedulerConfig::default().with_block_size(4).with_cache_size(64);
//! let mut scheduler = Scheduler::new(config).unwrap();
//!
//! scheduler.add_request(1, vec![1, 2, 3, 4], GenerationConfig::greedy(8), 0).unwrap();
//! scheduler.add_request(2, vec![5, 6, 7, 8], GenerationConfig::greedy(8), 0).unwrap();
//!
//! let outputs = scheduler.schedule();
//! assert_eq!(outputs.prefill_groups, vec![1, 2]);
//! assert_eq!(outputs.num_batched_tokens(), 8);
//! ```

use std::collections::{HashMap, VecDeque};

use tracing::{debug, info, warn};

use crate::config::{GenerationConfig, PreemptionMode, SchedulerConfig, VictimPolicy};
use crate::core::block::{compute_num_blocks, hash_full_blocks, BlockTable};
use crate::core::block_manager::{BlockManager, CacheOps, PrefixHit};
use crate::core::sequence::{
    FinishReason, Priority, RequestId, Sequence, SequenceArena, SequenceGroup, SequenceId,
    SequenceStatus,
};
use crate::error::{Error, Result};

/// One sequence's work in a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledSequence {
    pub request_id: RequestId,
    pub seq_id: SequenceId,
    /// Tokens fed this step: uncomputed tokens followed by draft tokens.
    pub token_ids: Vec<u32>,
    /// Position of the first fed token.
    pub start_pos: usize,
    /// Draft tokens at the end of `token_ids`.
    pub num_draft_tokens: usize,
    pub is_prefill: bool,
    /// Physical blocks after this step's writes.
    pub block_table: Vec<usize>,
    /// Physical slot of each fed token.
    pub slot_mapping: Vec<usize>,
}

impl ScheduledSequence {
    pub fn num_tokens(&self) -> usize {
        self.token_ids.len()
    }

    /// Positions whose logits the step needs: the last fed token plus one per draft.
    pub fn num_logits(&self) -> usize {
        self.num_draft_tokens + 1
    }
}

/// Output of a scheduling step.
#[derive(Debug, Default)]
pub struct SchedulerOutputs {
    /// Every scheduled sequence, in scheduling order.
    pub scheduled: Vec<ScheduledSequence>,
    /// Groups admitted (or re-admitted after recompute) this step.
    pub prefill_groups: Vec<RequestId>,
    /// Running and resumed groups decoding this step.
    pub decode_groups: Vec<RequestId>,
    /// Groups brought back from the host pool this step.
    pub swapped_in: Vec<RequestId>,
    /// Groups preempted this step.
    pub preempted: Vec<RequestId>,
    /// Groups rejected or failed; never retried.
    pub rejected: Vec<(RequestId, Error)>,
    /// Aborted groups whose blocks were reclaimed this step.
    pub reclaimed: Vec<RequestId>,
    /// Copies and swaps the backend applies before running the step.
    pub cache_ops: CacheOps,
    pub num_prefill_tokens: usize,
    pub num_decode_tokens: usize,
}

impl SchedulerOutputs {
    /// Create empty scheduler outputs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if there are any sequences to process.
    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty()
    }

    /// Total number of sequences to process.
    pub fn num_sequences(&self) -> usize {
        self.scheduled.len()
    }

    /// Tokens fed to the backend this step.
    pub fn num_batched_tokens(&self) -> usize {
        self.num_prefill_tokens + self.num_decode_tokens
    }

    /// Groups with work this step, decodes first.
    pub fn scheduled_request_ids(&self) -> Vec<RequestId> {
        let mut ids = self.decode_groups.clone();
        ids.extend(&self.prefill_groups);
        ids
    }
}

/// Continuous batching scheduler.
///
/// Owns the block manager and the sequence arena; every cache mutation goes
/// through it so block accounting stays consistent with sequence state.
pub struct Scheduler {
    /// Configuration.
    config: SchedulerConfig,
    /// Block manager for KV cache allocation.
    block_manager: BlockManager,
    /// All live sequences.
    arena: SequenceArena,
    /// All unfinished or not yet collected groups.
    groups: HashMap<RequestId, SequenceGroup>,
    /// Waiting groups, FIFO.
    waiting: VecDeque<RequestId>,
    /// Running groups in admission order.
    running: Vec<RequestId>,
    /// Swapped groups, FIFO.
    swapped: VecDeque<RequestId>,
    /// Aborted groups awaiting reclamation, with whether their blocks are on the host.
    aborted: Vec<(RequestId, bool)>,
    /// Counter for submission ordering.
    arrival_counter: u64,
    /// Counter for admission ordering.
    admission_counter: u64,
}

impl Scheduler {
    /// Create a new scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration is unusable.
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            block_manager: BlockManager::with_swap_space(
                config.cache_size,
                config.block_size,
                config.swap_space,
            ),
            arena: SequenceArena::new(config.block_size),
            config,
            groups: HashMap::new(),
            waiting: VecDeque::new(),
            running: Vec::new(),
            swapped: VecDeque::new(),
            aborted: Vec::new(),
            arrival_counter: 0,
            admission_counter: 0,
        })
    }

    /// Queue a new request.
    ///
    /// The group starts `Waiting` with a single sequence.
    pub fn add_request(
        &mut self,
        request_id: RequestId,
        prompt_token_ids: Vec<u32>,
        config: GenerationConfig,
        priority: Priority,
    ) -> Result<SequenceId> {
        self.add_request_with_cache(
            request_id,
            prompt_token_ids,
            config,
            priority,
            BlockTable::new(self.config.block_size),
        )
    }

    /// Queue a request whose first `cache.num_tokens()` tokens are already materialized.
    ///
    /// The table's block references move into the new sequence.
    pub fn add_request_with_cache(
        &mut self,
        request_id: RequestId,
        prompt_token_ids: Vec<u32>,
        config: GenerationConfig,
        priority: Priority,
        cache: BlockTable,
    ) -> Result<SequenceId> {
        if self.groups.contains_key(&request_id) {
            return Err(Error::InvalidConfig(format!(
                "request {request_id} already exists"
            )));
        }
        if prompt_token_ids.is_empty() {
            return Err(Error::InvalidConfig("prompt must not be empty".into()));
        }
        if cache.num_tokens() >= prompt_token_ids.len() {
            return Err(Error::InvalidConfig(format!(
                "cached prefix ({}) must be shorter than the prompt ({})",
                cache.num_tokens(),
                prompt_token_ids.len()
            )));
        }

        let seq_id = self.arena.insert(prompt_token_ids);
        if !cache.is_empty() {
            if let Some(seq) = self.arena.get_mut(seq_id) {
                *seq.block_table_mut() = cache;
            }
        }

        let group = SequenceGroup::new(request_id, seq_id, config, priority, self.arrival_counter);
        self.arrival_counter += 1;
        self.groups.insert(request_id, group);
        self.waiting.push_back(request_id);
        Ok(seq_id)
    }

    /// Mark a group aborted. Its blocks are reclaimed at the next `schedule()`.
    ///
    /// # Returns
    ///
    /// `false` if the request is unknown or already finished.
    pub fn abort(&mut self, request_id: RequestId) -> bool {
        let Some(group) = self.groups.get_mut(&request_id) else {
            return false;
        };
        if group.is_finished() {
            return false;
        }

        let on_host = group.status() == SequenceStatus::Swapped;
        group.set_status(SequenceStatus::Aborted);
        for &seq_id in group.seq_ids() {
            if let Some(seq) = self.arena.get_mut(seq_id) {
                if !seq.status().is_finished() {
                    seq.set_finished(FinishReason::Aborted);
                }
            }
        }

        self.waiting.retain(|&id| id != request_id);
        self.running.retain(|&id| id != request_id);
        self.swapped.retain(|&id| id != request_id);
        self.aborted.push((request_id, on_host));
        debug!(request_id, "marked request aborted");
        true
    }

    /// Schedule the next iteration.
    pub fn schedule(&mut self) -> SchedulerOutputs {
        let mut outputs = SchedulerOutputs::new();

        self.reclaim_aborted(&mut outputs);
        self.schedule_swapped(&mut outputs);
        self.schedule_waiting(&mut outputs);
        self.schedule_running(&mut outputs);
        outputs.cache_ops = self.block_manager.take_ops();

        debug!(
            num_prefill_tokens = outputs.num_prefill_tokens,
            num_decode_tokens = outputs.num_decode_tokens,
            num_preempted = outputs.preempted.len(),
            free_blocks = self.block_manager.num_free_blocks(),
            "scheduled step"
        );
        outputs
    }

    fn reclaim_aborted(&mut self, outputs: &mut SchedulerOutputs) {
        for (request_id, on_host) in std::mem::take(&mut self.aborted) {
            if let Some(group) = self.groups.remove(&request_id) {
                for &seq_id in group.seq_ids() {
                    self.release_sequence(seq_id, on_host);
                }
                outputs.reclaimed.push(request_id);
            }
        }
    }

    fn release_sequence(&mut self, seq_id: SequenceId, on_host: bool) {
        if let Some(mut seq) = self.arena.remove(seq_id) {
            if on_host {
                self.block_manager.free_host_table(seq.block_table_mut());
            } else {
                self.block_manager.free_table(seq.block_table_mut());
            }
        }
    }

    /// Sequences of a group that have not finished.
    pub fn live_seq_ids(&self, request_id: RequestId) -> Vec<SequenceId> {
        self.groups
            .get(&request_id)
            .map(|group| {
                group
                    .seq_ids()
                    .iter()
                    .copied()
                    .filter(|&id| {
                        self.arena
                            .get(id)
                            .is_some_and(|seq| !seq.status().is_finished())
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Tokens and blocks a group needs for its next decode.
    fn decode_demand(&self, request_id: RequestId) -> (usize, usize) {
        self.live_seq_ids(request_id)
            .into_iter()
            .filter_map(|id| self.arena.get(id))
            .fold((0, 0), |(tokens, blocks), seq| {
                let n = seq.num_uncomputed_tokens() + seq.draft_tokens().len();
                (
                    tokens + n,
                    blocks + self.block_manager.blocks_needed(seq.block_table(), n),
                )
            })
    }

    fn drop_drafts(&mut self, request_id: RequestId) -> bool {
        let mut dropped = false;
        for seq_id in self.live_seq_ids(request_id) {
            if let Some(seq) = self.arena.get_mut(seq_id) {
                dropped |= !seq.take_draft_tokens().is_empty();
            }
        }
        dropped
    }

    /// Whether the group already got work this step.
    fn is_scheduled(outputs: &SchedulerOutputs, request_id: RequestId) -> bool {
        outputs.prefill_groups.contains(&request_id) || outputs.decode_groups.contains(&request_id)
    }

    fn schedule_running(&mut self, outputs: &mut SchedulerOutputs) {
        let budget = self.config.max_num_batched_tokens;
        let (resumed, earlier): (Vec<RequestId>, Vec<RequestId>) =
            std::mem::take(&mut self.running)
                .into_iter()
                .partition(|&id| Self::is_scheduled(outputs, id));
        let mut queue: VecDeque<RequestId> = earlier.into();
        let mut kept = Vec::with_capacity(queue.len() + resumed.len());

        while let Some(request_id) = queue.pop_front() {
            let remaining = budget.saturating_sub(outputs.num_batched_tokens());
            if self.decode_demand(request_id).0 > remaining {
                self.drop_drafts(request_id);
                let (tokens, _) = self.decode_demand(request_id);
                if tokens > budget {
                    let error = Error::InvalidConfig(format!(
                        "decode of {tokens} tokens exceeds max_num_batched_tokens ({budget})"
                    ));
                    self.fail_group(request_id, error, outputs);
                    continue;
                }
                if tokens > remaining {
                    kept.push(request_id);
                    continue;
                }
            }

            let mut preempted_self = false;
            loop {
                let (_, blocks) = self.decode_demand(request_id);
                if self.block_manager.can_allocate(blocks) {
                    break;
                }
                if self.drop_drafts(request_id) {
                    continue;
                }
                match self.pick_victim(queue.iter().copied()) {
                    Some(victim) => {
                        queue.retain(|&id| id != victim);
                        self.preempt(victim, outputs);
                    }
                    None if kept.is_empty() && outputs.scheduled.is_empty() => {
                        self.fail_group(
                            request_id,
                            Error::OutOfCache {
                                requested: blocks,
                                available: self.block_manager.num_free_blocks(),
                            },
                            outputs,
                        );
                        preempted_self = true;
                        break;
                    }
                    None => {
                        self.preempt(request_id, outputs);
                        preempted_self = true;
                        break;
                    }
                }
            }
            if preempted_self {
                continue;
            }

            match self.schedule_group_tokens(request_id, false, outputs) {
                Ok(()) => {
                    outputs.decode_groups.push(request_id);
                    kept.push(request_id);
                }
                Err(e) => self.fail_group(request_id, e, outputs),
            }
        }

        // Groups resumed or admitted this step were admitted last.
        kept.extend(resumed.into_iter().filter(|id| self.groups.contains_key(id)));
        self.running = kept;
    }

    fn pick_victim(&self, candidates: impl IntoIterator<Item = RequestId>) -> Option<RequestId> {
        let admitted = |id: &RequestId| {
            self.groups
                .get(id)
                .and_then(SequenceGroup::admitted_at)
                .unwrap_or(0)
        };
        let candidates = candidates.into_iter();
        match self.config.victim_policy {
            VictimPolicy::Fifo => candidates.max_by_key(admitted),
            VictimPolicy::LowestPriority => candidates.min_by_key(|id| {
                let priority = self.groups.get(id).map_or(0, SequenceGroup::priority);
                (priority, std::cmp::Reverse(admitted(id)))
            }),
        }
    }

    fn preempt(&mut self, request_id: RequestId, outputs: &mut SchedulerOutputs) {
        let live = self.live_seq_ids(request_id);
        for &seq_id in &live {
            if let Some(seq) = self.arena.get_mut(seq_id) {
                seq.take_draft_tokens();
            }
        }

        let recompute = self.config.preemption_mode == PreemptionMode::Recompute && live.len() == 1;
        if !recompute && self.swap_out_group(request_id, &live) {
            info!(request_id, "preempted request by swapping");
            outputs.preempted.push(request_id);
            return;
        }

        match live.as_slice() {
            [seq_id] => {
                if let Some(seq) = self.arena.get_mut(*seq_id) {
                    self.block_manager.free_table(seq.block_table_mut());
                    let _ = seq.set_waiting();
                }
                if let Some(group) = self.groups.get_mut(&request_id) {
                    group.set_status(SequenceStatus::Waiting);
                }
                self.waiting.push_front(request_id);
                info!(request_id, "preempted request for recompute");
                outputs.preempted.push(request_id);
            }
            _ => {
                warn!(request_id, "host pool full, cannot preempt beam group");
                self.fail_group(
                    request_id,
                    Error::OutOfCache {
                        requested: self.block_manager.num_blocks(),
                        available: self.block_manager.num_free_host_blocks(),
                    },
                    outputs,
                );
            }
        }
    }

    fn take_tables(&mut self, seq_ids: &[SequenceId]) -> Vec<BlockTable> {
        seq_ids
            .iter()
            .map(|&id| {
                self.arena
                    .get_mut(id)
                    .map(|seq| std::mem::take(seq.block_table_mut()))
                    .unwrap_or_default()
            })
            .collect()
    }

    fn restore_tables(&mut self, seq_ids: &[SequenceId], tables: Vec<BlockTable>) {
        for (&id, table) in seq_ids.iter().zip(tables) {
            if let Some(seq) = self.arena.get_mut(id) {
                *seq.block_table_mut() = table;
            }
        }
    }

    fn swap_out_group(&mut self, request_id: RequestId, live: &[SequenceId]) -> bool {
        let mut tables = self.take_tables(live);
        let swapped = self.block_manager.can_swap_out(&tables)
            && self.block_manager.swap_out(&mut tables).is_ok();
        self.restore_tables(live, tables);
        if !swapped {
            return false;
        }

        for &seq_id in live {
            if let Some(seq) = self.arena.get_mut(seq_id) {
                let _ = seq.set_swapped();
            }
        }
        if let Some(group) = self.groups.get_mut(&request_id) {
            group.set_status(SequenceStatus::Swapped);
        }
        self.swapped.push_back(request_id);
        true
    }

    /// Abort a group immediately and report it as rejected.
    fn fail_group(&mut self, request_id: RequestId, error: Error, outputs: &mut SchedulerOutputs) {
        warn!(request_id, error = %error, "rejecting request");
        let on_host = self
            .groups
            .get(&request_id)
            .is_some_and(|group| group.status() == SequenceStatus::Swapped);
        if let Some(group) = self.groups.remove(&request_id) {
            for &seq_id in group.seq_ids() {
                self.release_sequence(seq_id, on_host);
            }
        }
        self.waiting.retain(|&id| id != request_id);
        self.running.retain(|&id| id != request_id);
        self.swapped.retain(|&id| id != request_id);
        outputs.rejected.push((request_id, error));
    }

    /// Write every live sequence's pending tokens into its block table.
    fn schedule_group_tokens(
        &mut self,
        request_id: RequestId,
        is_prefill: bool,
        outputs: &mut SchedulerOutputs,
    ) -> Result<()> {
        for seq_id in self.live_seq_ids(request_id) {
            let seq = self
                .arena
                .get_mut(seq_id)
                .ok_or(Error::SequenceNotFound(seq_id))?;
            let start_pos = seq.num_computed_tokens();
            let mut token_ids = seq.token_ids_from(start_pos);
            let num_draft_tokens = seq.draft_tokens().len();
            token_ids.extend_from_slice(seq.draft_tokens());

            for &token in &token_ids {
                self.block_manager
                    .append_token(seq.block_table_mut(), token)?;
            }

            let table = seq.block_table();
            let scheduled = ScheduledSequence {
                request_id,
                seq_id,
                start_pos,
                num_draft_tokens,
                is_prefill,
                block_table: table.get_physical_block_ids().to_vec(),
                slot_mapping: table.slot_mapping_range(start_pos, start_pos + token_ids.len()),
                token_ids,
            };
            if is_prefill {
                outputs.num_prefill_tokens += scheduled.num_tokens();
            } else {
                outputs.num_decode_tokens += scheduled.num_tokens();
            }
            outputs.scheduled.push(scheduled);
        }
        Ok(())
    }

    /// Sequence slots reserved by running groups (beam groups reserve all beams).
    pub fn num_reserved_seqs(&self) -> usize {
        self.running
            .iter()
            .filter_map(|id| self.groups.get(id))
            .map(SequenceGroup::max_num_seqs)
            .sum()
    }

    fn mark_admitted(&mut self, request_id: RequestId) {
        if let Some(group) = self.groups.get_mut(&request_id) {
            group.set_status(SequenceStatus::Running);
            group.set_admitted_at(self.admission_counter);
            self.admission_counter += 1;
        }
        self.running.push(request_id);
    }

    fn schedule_swapped(&mut self, outputs: &mut SchedulerOutputs) {
        // Running groups keep room for their next decode.
        let running_growth: usize = self
            .running
            .iter()
            .map(|&id| self.decode_demand(id).1)
            .sum();

        while let Some(&request_id) = self.swapped.front() {
            let reserve = self.groups.get(&request_id).map_or(1, SequenceGroup::max_num_seqs);
            if self.num_reserved_seqs() + reserve > self.config.max_num_seqs {
                break;
            }

            let live = self.live_seq_ids(request_id);
            let (tables, new_tokens): (Vec<BlockTable>, Vec<usize>) = live
                .iter()
                .filter_map(|&id| self.arena.get(id))
                .map(|seq| (seq.block_table().clone(), seq.num_uncomputed_tokens()))
                .unzip();
            let tokens: usize = new_tokens.iter().sum();
            let needed = self.block_manager.swap_in_demand(&tables, &new_tokens);
            if outputs.num_batched_tokens() + tokens > self.config.max_num_batched_tokens
                || !self.block_manager.can_allocate(needed + running_growth)
            {
                break;
            }

            self.swapped.pop_front();
            let mut tables = self.take_tables(&live);
            let swapped_in = self.block_manager.swap_in(&mut tables);
            self.restore_tables(&live, tables);
            if let Err(e) = swapped_in {
                warn!(request_id, error = %e, "swap-in failed");
                self.swapped.push_front(request_id);
                break;
            }

            for &seq_id in &live {
                if let Some(seq) = self.arena.get_mut(seq_id) {
                    let _ = seq.set_running();
                }
            }
            self.mark_admitted(request_id);
            info!(request_id, "resumed swapped request");

            match self.schedule_group_tokens(request_id, false, outputs) {
                Ok(()) => {
                    outputs.swapped_in.push(request_id);
                    outputs.decode_groups.push(request_id);
                }
                Err(e) => self.fail_group(request_id, e, outputs),
            }
        }
    }

    /// Why a waiting group can never run, if it cannot.
    fn admission_error(&self, reserve: usize, num_new: usize, total_len: usize) -> Option<Error> {
        let budget = self.config.max_num_batched_tokens;
        let footprint = compute_num_blocks(total_len, self.config.block_size);
        if num_new > budget {
            Some(Error::PromptTooLong {
                prompt_len: num_new,
                max: budget,
            })
        } else if footprint > self.block_manager.num_blocks() {
            Some(Error::OutOfCache {
                requested: footprint,
                available: self.block_manager.num_blocks(),
            })
        } else if reserve > self.config.max_num_seqs {
            Some(Error::InvalidConfig(format!(
                "group needs {reserve} sequences, max_num_seqs is {}",
                self.config.max_num_seqs
            )))
        } else if reserve > budget {
            Some(Error::InvalidConfig(format!(
                "group decodes {reserve} tokens per step, max_num_batched_tokens is {budget}"
            )))
        } else {
            None
        }
    }

    /// Running groups a new prefill may preempt: not yet scheduled this step
    /// and, under [`VictimPolicy::LowestPriority`], not above `priority`.
    fn preemptible(&self, outputs: &SchedulerOutputs, priority: Priority) -> Vec<RequestId> {
        self.running
            .iter()
            .copied()
            .filter(|&id| !Self::is_scheduled(outputs, id))
            .filter(|id| {
                self.config.victim_policy == VictimPolicy::Fifo
                    || self.groups.get(id).is_some_and(|g| g.priority() <= priority)
            })
            .collect()
    }

    /// Device blocks and sequence slots preempting `candidates` would free.
    fn reclaimable(&self, candidates: &[RequestId]) -> (usize, usize) {
        candidates.iter().fold((0, 0), |(blocks, seats), &id| {
            let tables: Vec<BlockTable> = self
                .live_seq_ids(id)
                .into_iter()
                .filter_map(|seq_id| self.arena.get(seq_id))
                .map(|seq| seq.block_table().clone())
                .collect();
            let reserve = self.groups.get(&id).map_or(0, SequenceGroup::max_num_seqs);
            (
                blocks + self.block_manager.num_distinct_blocks(&tables),
                seats + reserve,
            )
        })
    }

    /// Blocks a waiting group needs for its prefill.
    fn prefill_demand(&self, seq_id: SequenceId, hashes: &[u64]) -> (usize, PrefixHit) {
        let hit = self.block_manager.peek_prefix(hashes);
        let needed = match self.arena.get(seq_id) {
            Some(seq) if !seq.block_table().is_empty() => self
                .block_manager
                .blocks_needed(seq.block_table(), seq.num_uncomputed_tokens()),
            Some(seq) => {
                compute_num_blocks(seq.total_len(), self.config.block_size) - hit.num_in_use
            }
            None => 0,
        };
        (needed, hit)
    }

    fn schedule_waiting(&mut self, outputs: &mut SchedulerOutputs) {
        let block_size = self.config.block_size;

        // Swapped groups go first; new prefills wait until they are back.
        while self.swapped.is_empty() {
            let Some(request_id) = self.waiting.pop_front() else {
                break;
            };
            let Some(group) = self.groups.get(&request_id) else {
                continue;
            };
            let reserve = group.max_num_seqs();
            let priority = group.priority();
            let never_ran = group.admitted_at().is_none();
            let Some(seq) = group.seq_ids().first().and_then(|&id| self.arena.get(id)) else {
                continue;
            };
            let seq_id = seq.seq_id();
            let num_new = seq.num_uncomputed_tokens();

            if let Some(error) = self.admission_error(reserve, num_new, seq.total_len()) {
                self.fail_group(request_id, error, outputs);
                continue;
            }

            let hashes = if self.config.enable_prefix_caching && seq.block_table().is_empty() {
                let cacheable = (seq.total_len() - 1) / block_size * block_size;
                hash_full_blocks(&seq.all_token_ids()[..cacheable], block_size)
            } else {
                Vec::new()
            };
            let (needed, hit) = self.prefill_demand(seq_id, &hashes);
            let to_compute = num_new - hit.num_blocks * block_size;
            if outputs.num_batched_tokens() + to_compute > self.config.max_num_batched_tokens {
                self.waiting.push_front(request_id);
                break;
            }

            let fits = |this: &Self, needed: usize| {
                this.num_reserved_seqs() + reserve <= this.config.max_num_seqs
                    && this.block_manager.can_allocate(needed)
            };
            if !fits(self, needed) {
                // Only a group that never ran takes the place of running ones.
                let mut candidates = if never_ran {
                    self.preemptible(outputs, priority)
                } else {
                    Vec::new()
                };
                let (blocks, seats) = self.reclaimable(&candidates);
                let possible = self.block_manager.num_free_blocks() + blocks >= needed
                    && self.num_reserved_seqs().saturating_sub(seats) + reserve
                        <= self.config.max_num_seqs;
                if !possible {
                    self.waiting.push_front(request_id);
                    break;
                }

                let mut admitted = false;
                while let Some(victim) = self.pick_victim(candidates.iter().copied()) {
                    candidates.retain(|&id| id != victim);
                    self.running.retain(|&id| id != victim);
                    info!(request_id, victim, "preempting for prefill");
                    self.preempt(victim, outputs);
                    if fits(self, self.prefill_demand(seq_id, &hashes).0) {
                        admitted = true;
                        break;
                    }
                }
                if !admitted {
                    self.waiting.push_front(request_id);
                    break;
                }
            }

            let hit = self.block_manager.peek_prefix(&hashes);
            if let Err(e) = self.admit(request_id, seq_id, &hashes[..hit.num_blocks], outputs) {
                self.fail_group(request_id, e, outputs);
            }
        }
    }

    fn admit(
        &mut self,
        request_id: RequestId,
        seq_id: SequenceId,
        cached_hashes: &[u64],
        outputs: &mut SchedulerOutputs,
    ) -> Result<()> {
        let block_size = self.config.block_size;
        let seq = self
            .arena
            .get_mut(seq_id)
            .ok_or(Error::SequenceNotFound(seq_id))?;
        for &hash in cached_hashes {
            let Some(block_id) = self.block_manager.get_cached_block(hash) else {
                break;
            };
            let table = seq.block_table_mut();
            table.append_block(block_id);
            table.set_num_tokens(table.num_tokens() + block_size);
        }
        seq.set_running()?;
        let cached_tokens = seq.num_computed_tokens();

        self.mark_admitted(request_id);
        self.schedule_group_tokens(request_id, true, outputs)?;
        outputs.prefill_groups.push(request_id);
        info!(request_id, cached_tokens, "admitted request");
        Ok(())
    }

    // ========== Step commit ==========

    /// Append a sampled token to a sequence.
    pub fn append_token(&mut self, seq_id: SequenceId, token_id: u32, logprob: f32) -> Result<()> {
        let seq = self
            .arena
            .get_mut(seq_id)
            .ok_or(Error::SequenceNotFound(seq_id))?;
        seq.append_token(token_id, logprob);
        Ok(())
    }

    /// Settle a sequence's cache after its step's tokens were appended.
    ///
    /// Drops KV state of rejected draft tokens so only the last sampled token
    /// is unmaterialized, and registers computed prompt blocks for prefix reuse.
    pub fn finish_step(&mut self, seq_id: SequenceId, was_prefill: bool) -> Result<()> {
        let seq = self
            .arena
            .get_mut(seq_id)
            .ok_or(Error::SequenceNotFound(seq_id))?;
        if seq.status().is_finished() {
            return Ok(());
        }

        seq.take_draft_tokens();
        let keep = seq.total_len().saturating_sub(1);
        self.block_manager.truncate(seq.block_table_mut(), keep);

        if was_prefill && self.config.enable_prefix_caching {
            let block_size = self.config.block_size;
            let hashes = hash_full_blocks(seq.prompt_token_ids(), block_size);
            let table = seq.block_table();
            let materialized = table.num_tokens() / block_size;
            for (idx, hash) in hashes.into_iter().take(materialized).enumerate() {
                if let Ok(block_id) = table.get_block_id(idx) {
                    self.block_manager.cache_block(block_id, hash);
                }
            }
        }
        Ok(())
    }

    /// Set the draft tokens verified with the next decode of `seq_id`.
    pub fn set_draft_tokens(&mut self, seq_id: SequenceId, tokens: Vec<u32>) -> Result<()> {
        let seq = self
            .arena
            .get_mut(seq_id)
            .ok_or(Error::SequenceNotFound(seq_id))?;
        seq.set_draft_tokens(tokens);
        Ok(())
    }

    /// Fork a live sequence, sharing its blocks copy-on-write.
    pub fn fork_sequence(&mut self, request_id: RequestId, parent: SequenceId) -> Result<SequenceId> {
        let group = self
            .groups
            .get_mut(&request_id)
            .ok_or(Error::RequestNotFound(request_id))?;
        let child = self.arena.fork(parent)?;
        let table = match self.arena.get(parent) {
            Some(seq) => self.block_manager.fork(seq.block_table()),
            None => return Err(Error::SequenceNotFound(parent)),
        };
        if let Some(seq) = self.arena.get_mut(child) {
            *seq.block_table_mut() = table;
        }
        group.add_seq(child);
        Ok(child)
    }

    /// Release a pruned beam and recycle its arena slot.
    pub fn prune_sequence(&mut self, request_id: RequestId, seq_id: SequenceId) {
        if let Some(group) = self.groups.get_mut(&request_id) {
            group.remove_seq(seq_id);
        }
        self.release_sequence(seq_id, false);
    }

    /// Mark a sequence finished and release its blocks.
    ///
    /// The group finishes with its last live sequence. Repeated calls are no-ops.
    pub fn finish_sequence(&mut self, seq_id: SequenceId, reason: FinishReason) {
        let Some(seq) = self.arena.get_mut(seq_id) else {
            return;
        };
        if seq.status().is_finished() {
            return;
        }
        let on_host = seq.status() == SequenceStatus::Swapped;
        seq.set_finished(reason);
        if on_host {
            self.block_manager.free_host_table(seq.block_table_mut());
        } else {
            self.block_manager.free_table(seq.block_table_mut());
        }

        let request_id = self
            .groups
            .iter()
            .find(|(_, group)| group.seq_ids().contains(&seq_id))
            .map(|(&id, _)| id);
        if let Some(request_id) = request_id {
            if self.live_seq_ids(request_id).is_empty() {
                if let Some(group) = self.groups.get_mut(&request_id) {
                    group.set_status(SequenceStatus::Finished);
                }
                self.waiting.retain(|&id| id != request_id);
                self.running.retain(|&id| id != request_id);
                self.swapped.retain(|&id| id != request_id);
            }
        }
    }

    /// Finish every live sequence of a group.
    pub fn finish_group(&mut self, request_id: RequestId, reason: FinishReason) {
        for seq_id in self.live_seq_ids(request_id) {
            self.finish_sequence(seq_id, reason);
        }
    }

    /// Take a sequence's block table out of the scheduler.
    ///
    /// The caller owns the block references afterwards and must hand the table
    /// back through [`add_request_with_cache`](Self::add_request_with_cache) or
    /// [`release_block_table`](Self::release_block_table).
    pub fn detach_block_table(&mut self, seq_id: SequenceId) -> Option<BlockTable> {
        let seq = self.arena.get_mut(seq_id)?;
        if seq.status() == SequenceStatus::Swapped {
            return None;
        }
        Some(std::mem::take(seq.block_table_mut()))
    }

    /// Release a detached block table.
    pub fn release_block_table(&mut self, table: &mut BlockTable) {
        self.block_manager.free_table(table);
    }

    /// Shorten a detached block table.
    pub fn truncate_block_table(&mut self, table: &mut BlockTable, len: usize) {
        self.block_manager.truncate(table, len);
    }

    /// Remove a finished group and its sequences.
    pub fn take_finished_group(
        &mut self,
        request_id: RequestId,
    ) -> Option<(SequenceGroup, Vec<Sequence>)> {
        if !self.groups.get(&request_id)?.is_finished() {
            return None;
        }
        let group = self.groups.remove(&request_id)?;
        let mut seqs = Vec::with_capacity(group.seq_ids().len());
        for &seq_id in group.seq_ids() {
            if let Some(mut seq) = self.arena.remove(seq_id) {
                self.block_manager.free_table(seq.block_table_mut());
                seqs.push(seq);
            }
        }
        Some((group, seqs))
    }

    // ========== Accessors ==========

    pub fn get_group(&self, request_id: RequestId) -> Option<&SequenceGroup> {
        self.groups.get(&request_id)
    }

    /// Get a reference to a sequence.
    pub fn get_sequence(&self, seq_id: SequenceId) -> Option<&Sequence> {
        self.arena.get(seq_id)
    }

    pub fn arena(&self) -> &SequenceArena {
        &self.arena
    }

    /// Get number of waiting groups.
    pub fn num_waiting(&self) -> usize {
        self.waiting.len()
    }

    /// Get number of running groups.
    pub fn num_running(&self) -> usize {
        self.running.len()
    }

    /// Get number of swapped groups.
    pub fn num_swapped(&self) -> usize {
        self.swapped.len()
    }

    /// Running groups in admission order.
    pub fn running_request_ids(&self) -> &[RequestId] {
        &self.running
    }

    pub fn waiting_request_ids(&self) -> impl Iterator<Item = &RequestId> {
        self.waiting.iter()
    }

    pub fn swapped_request_ids(&self) -> impl Iterator<Item = &RequestId> {
        self.swapped.iter()
    }

    /// Check if any group still has work or awaits reclamation.
    pub fn has_unfinished_requests(&self) -> bool {
        !self.waiting.is_empty()
            || !self.running.is_empty()
            || !self.swapped.is_empty()
            || !self.aborted.is_empty()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Get block manager reference.
    pub fn block_manager(&self) -> &BlockManager {
        &self.block_manager
    }

    /// Reset the scheduler.
    pub fn reset(&mut self) {
        self.arena.clear();
        self.groups.clear();
        self.waiting.clear();
        self.running.clear();
        self.swapped.clear();
        self.aborted.clear();
        self.block_manager.reset();
        self.arrival_counter = 0;
        self.admission_counter = 0;
    }
}
