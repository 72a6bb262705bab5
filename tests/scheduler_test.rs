//! Integration tests for Scheduler.

use nano_genai::core::sequence::{FinishReason, RequestId, SequenceStatus};
use nano_genai::scheduler::batch::{Scheduler, SchedulerOutputs};
use nano_genai::{Error, GenerationConfig, PreemptionMode, SchedulerConfig, VictimPolicy};

/// Feed every scheduled sequence one sampled token and collect finished groups.
fn commit(scheduler: &mut Scheduler, outputs: &SchedulerOutputs) -> Vec<RequestId> {
    for scheduled in &outputs.scheduled {
        scheduler.append_token(scheduled.seq_id, 100, 0.0).unwrap();
        let max = scheduler
            .get_group(scheduled.request_id)
            .unwrap()
            .config()
            .max_new_tokens;
        let produced = scheduler.get_sequence(scheduled.seq_id).unwrap().output_len();
        if produced >= max {
            scheduler.finish_sequence(scheduled.seq_id, FinishReason::MaxTokens);
        } else {
            scheduler
                .finish_step(scheduled.seq_id, scheduled.is_prefill)
                .unwrap();
        }
    }

    let mut finished = Vec::new();
    for request_id in outputs.scheduled_request_ids() {
        if scheduler.take_finished_group(request_id).is_some() {
            finished.push(request_id);
        }
    }
    finished
}

fn assert_within_cache(scheduler: &Scheduler) {
    let manager = scheduler.block_manager();
    assert!(manager.num_used_blocks() <= scheduler.config().cache_size);
    assert_eq!(
        manager.num_used_blocks() + manager.num_free_blocks(),
        manager.num_blocks()
    );
}

fn four_block_config() -> SchedulerConfig {
    SchedulerConfig::default()
        .with_block_size(4)
        .with_cache_size(4)
        .with_swap_space(8)
        .with_max_num_seqs(2)
        .with_max_num_batched_tokens(64)
}

#[test]
fn test_scheduler_creation() {
    let scheduler = Scheduler::new(four_block_config()).unwrap();
    assert_eq!(scheduler.num_waiting(), 0);
    assert_eq!(scheduler.num_running(), 0);
    assert_eq!(scheduler.num_swapped(), 0);
    assert!(!scheduler.has_unfinished_requests());

    let bad = SchedulerConfig::default().with_block_size(0);
    assert!(matches!(Scheduler::new(bad), Err(Error::InvalidConfig(_))));
}

#[test]
fn test_add_request_validates_prompt() {
    let mut scheduler = Scheduler::new(four_block_config()).unwrap();
    assert!(scheduler
        .add_request(1, vec![], GenerationConfig::greedy(4), 0)
        .is_err());

    scheduler
        .add_request(1, vec![1, 2], GenerationConfig::greedy(4), 0)
        .unwrap();
    // Duplicate id
    assert!(scheduler
        .add_request(1, vec![1, 2], GenerationConfig::greedy(4), 0)
        .is_err());
    assert_eq!(scheduler.num_waiting(), 1);
}

/// Admit two five-token requests that fill all four blocks, then add a third.
fn fill_cache_then_arrive(scheduler: &mut Scheduler) -> SchedulerOutputs {
    for request_id in [1, 2] {
        scheduler
            .add_request(request_id, vec![1, 2, 3, 4, 5], GenerationConfig::greedy(2), 0)
            .unwrap();
    }
    let outputs = scheduler.schedule();
    assert_eq!(outputs.prefill_groups, vec![1, 2]);
    assert!(outputs.preempted.is_empty());
    assert_eq!(scheduler.block_manager().num_free_blocks(), 0);
    commit(scheduler, &outputs);

    scheduler
        .add_request(3, vec![1, 2, 3, 4, 5], GenerationConfig::greedy(2), 0)
        .unwrap();
    scheduler.schedule()
}

#[test]
fn test_third_request_forces_swap_then_resumes() {
    let mut scheduler = Scheduler::new(four_block_config()).unwrap();

    // The newest running group is swapped out to make room for the arrival
    let outputs = fill_cache_then_arrive(&mut scheduler);
    assert_eq!(outputs.preempted, vec![2]);
    assert_eq!(outputs.prefill_groups, vec![3]);
    assert_eq!(outputs.decode_groups, vec![1]);
    assert_eq!(outputs.cache_ops.swap_out.len(), 2);
    assert_eq!(scheduler.num_swapped(), 1);
    assert_eq!(
        scheduler.get_group(2).unwrap().status(),
        SequenceStatus::Swapped
    );
    assert_within_cache(&scheduler);
    assert_eq!(commit(&mut scheduler, &outputs), vec![1]);
    assert_eq!(scheduler.block_manager().num_free_blocks(), 2);

    // Request 1 freed its blocks: request 2 comes back and continues decoding
    let outputs = scheduler.schedule();
    assert_eq!(outputs.swapped_in, vec![2]);
    assert_eq!(outputs.decode_groups, vec![2, 3]);
    assert_eq!(outputs.cache_ops.swap_in.len(), 2);
    assert_eq!(scheduler.num_swapped(), 0);

    let resumed = outputs
        .scheduled
        .iter()
        .find(|s| s.request_id == 2)
        .unwrap();
    assert_eq!(resumed.start_pos, 5);
    let seq = scheduler.get_sequence(resumed.seq_id).unwrap();
    assert_eq!(
        scheduler.block_manager().read_tokens(seq.block_table()),
        vec![1, 2, 3, 4, 5, 100]
    );
    assert_within_cache(&scheduler);
    assert_eq!(commit(&mut scheduler, &outputs), vec![2, 3]);
    assert!(!scheduler.has_unfinished_requests());
}

#[test]
fn test_recompute_preemption_requeues_with_output() {
    let config = four_block_config().with_preemption_mode(PreemptionMode::Recompute);
    let mut scheduler = Scheduler::new(config).unwrap();

    let outputs = fill_cache_then_arrive(&mut scheduler);
    assert_eq!(outputs.preempted, vec![2]);
    assert_eq!(outputs.prefill_groups, vec![3]);
    assert_eq!(scheduler.num_swapped(), 0);
    assert_eq!(scheduler.num_waiting(), 1);
    assert!(outputs.cache_ops.swap_out.is_empty());
    assert_eq!(
        scheduler.get_group(2).unwrap().status(),
        SequenceStatus::Waiting
    );
    commit(&mut scheduler, &outputs);

    // Re-admitted as a prefill over prompt plus the token it already produced
    let outputs = scheduler.schedule();
    assert_eq!(outputs.prefill_groups, vec![2]);
    assert_eq!(outputs.scheduled[0].token_ids, vec![1, 2, 3, 4, 5, 100]);
    assert_eq!(outputs.scheduled[0].start_pos, 0);
    assert!(outputs.scheduled[0].is_prefill);
    assert_within_cache(&scheduler);
}

#[test]
fn test_beams_wider_than_token_budget_are_rejected() {
    let config = SchedulerConfig::default()
        .with_block_size(4)
        .with_max_num_seqs(4)
        .with_max_num_batched_tokens(2);
    let mut scheduler = Scheduler::new(config).unwrap();
    scheduler
        .add_request(1, vec![1], GenerationConfig::beam_search(4, 3), 0)
        .unwrap();
    scheduler
        .add_request(2, vec![1], GenerationConfig::greedy(4), 0)
        .unwrap();

    let outputs = scheduler.schedule();
    assert_eq!(outputs.rejected.len(), 1);
    assert!(matches!(outputs.rejected[0], (1, Error::InvalidConfig(_))));
    assert_eq!(outputs.prefill_groups, vec![2]);
    assert!(scheduler.get_group(1).is_none());
}

#[test]
fn test_decode_wider_than_token_budget_fails_group() {
    let config = SchedulerConfig::default()
        .with_block_size(4)
        .with_max_num_seqs(4)
        .with_max_num_batched_tokens(2);
    let mut scheduler = Scheduler::new(config).unwrap();
    let parent = scheduler
        .add_request(1, vec![1], GenerationConfig::beam_search(4, 2), 0)
        .unwrap();
    let outputs = scheduler.schedule();
    assert_eq!(outputs.prefill_groups, vec![1]);

    // Three live beams need three decode tokens against a budget of two
    for token in [8, 9] {
        let child = scheduler.fork_sequence(1, parent).unwrap();
        scheduler.append_token(child, token, -0.2).unwrap();
        scheduler.finish_step(child, false).unwrap();
    }
    scheduler.append_token(parent, 7, -0.1).unwrap();
    scheduler.finish_step(parent, true).unwrap();
    let outputs = scheduler.schedule();
    assert!(outputs.scheduled.is_empty());
    assert!(matches!(outputs.rejected[0], (1, Error::InvalidConfig(_))));
    assert!(!scheduler.has_unfinished_requests());
    assert_eq!(scheduler.block_manager().num_used_blocks(), 0);
}

#[test]
fn test_victim_policy() {
    fn preempted_with(policy: VictimPolicy) -> Vec<RequestId> {
        let config = SchedulerConfig::default()
            .with_block_size(4)
            .with_cache_size(3)
            .with_victim_policy(policy);
        let mut scheduler = Scheduler::new(config).unwrap();
        scheduler
            .add_request(1, vec![1, 2, 3, 4], GenerationConfig::greedy(8), 0)
            .unwrap();
        scheduler
            .add_request(2, vec![1, 2], GenerationConfig::greedy(8), -1)
            .unwrap();
        scheduler
            .add_request(3, vec![1, 2], GenerationConfig::greedy(8), 5)
            .unwrap();
        let outputs = scheduler.schedule();
        assert_eq!(outputs.prefill_groups, vec![1, 2, 3]);
        commit(&mut scheduler, &outputs);

        // Request 1 needs a fourth block
        scheduler.schedule().preempted
    }

    assert_eq!(preempted_with(VictimPolicy::Fifo), vec![3]);
    assert_eq!(preempted_with(VictimPolicy::LowestPriority), vec![2]);
}

#[test]
fn test_token_budget_per_step() {
    let config = SchedulerConfig::default()
        .with_block_size(4)
        .with_max_num_batched_tokens(8);
    let mut scheduler = Scheduler::new(config).unwrap();
    for request_id in 1..=3 {
        scheduler
            .add_request(request_id, vec![1, 2, 3, 4, 5], GenerationConfig::greedy(16), 0)
            .unwrap();
    }

    let outputs = scheduler.schedule();
    assert_eq!(outputs.prefill_groups, vec![1]);
    assert!(outputs.num_batched_tokens() <= 8);
    commit(&mut scheduler, &outputs);

    let outputs = scheduler.schedule();
    assert_eq!(outputs.decode_groups, vec![1]);
    assert_eq!(outputs.prefill_groups, vec![2]);
    assert_eq!(outputs.num_batched_tokens(), 6);
    commit(&mut scheduler, &outputs);

    let outputs = scheduler.schedule();
    assert_eq!(outputs.prefill_groups, vec![3]);
    assert_eq!(outputs.num_batched_tokens(), 7);
    assert_eq!(scheduler.num_waiting(), 0);
}

#[test]
fn test_prompt_too_long_is_rejected_not_retried() {
    let config = SchedulerConfig::default()
        .with_block_size(4)
        .with_max_num_batched_tokens(8);
    let mut scheduler = Scheduler::new(config).unwrap();
    scheduler
        .add_request(1, (0..9).collect(), GenerationConfig::greedy(4), 0)
        .unwrap();
    scheduler
        .add_request(2, vec![1, 2, 3], GenerationConfig::greedy(4), 0)
        .unwrap();

    let outputs = scheduler.schedule();
    assert_eq!(outputs.rejected.len(), 1);
    assert!(matches!(
        outputs.rejected[0],
        (1, Error::PromptTooLong { prompt_len: 9, max: 8 })
    ));
    // The next request is admitted in the same step
    assert_eq!(outputs.prefill_groups, vec![2]);
    assert!(scheduler.get_group(1).is_none());

    let outputs = scheduler.schedule();
    assert!(outputs.rejected.is_empty());
}

#[test]
fn test_request_larger_than_cache_is_fatal() {
    let config = SchedulerConfig::default().with_block_size(4).with_cache_size(2);
    let mut scheduler = Scheduler::new(config).unwrap();
    scheduler
        .add_request(1, (0..9).collect(), GenerationConfig::greedy(4), 0)
        .unwrap();

    let outputs = scheduler.schedule();
    assert!(matches!(
        outputs.rejected[0],
        (1, Error::OutOfCache { requested: 3, available: 2 })
    ));
    assert!(!scheduler.has_unfinished_requests());
    assert_eq!(scheduler.block_manager().num_free_blocks(), 2);
}

#[test]
fn test_abort_reclaims_at_next_step() {
    let mut scheduler = Scheduler::new(four_block_config()).unwrap();
    scheduler
        .add_request(1, vec![1, 2, 3, 4, 5], GenerationConfig::greedy(4), 0)
        .unwrap();
    scheduler.schedule();
    assert_eq!(scheduler.block_manager().num_used_blocks(), 2);

    assert!(scheduler.abort(1));
    assert!(!scheduler.abort(1));
    assert!(scheduler.live_seq_ids(1).is_empty());
    // Blocks stay until the scheduler reclaims them
    assert_eq!(scheduler.block_manager().num_used_blocks(), 2);
    assert!(scheduler.has_unfinished_requests());

    let outputs = scheduler.schedule();
    assert_eq!(outputs.reclaimed, vec![1]);
    assert!(outputs.scheduled.is_empty());
    assert_eq!(scheduler.block_manager().num_used_blocks(), 0);
    assert!(!scheduler.has_unfinished_requests());
    assert!(!scheduler.abort(99));
}

#[test]
fn test_forked_beams_copy_shared_block_on_write() {
    let mut scheduler = Scheduler::new(four_block_config()).unwrap();
    let parent = scheduler
        .add_request(1, vec![1, 2, 3], GenerationConfig::beam_search(4, 2), 0)
        .unwrap();
    scheduler.schedule();

    let child = scheduler.fork_sequence(1, parent).unwrap();
    scheduler.append_token(child, 7, -0.5).unwrap();
    scheduler.finish_step(child, false).unwrap();
    scheduler.append_token(parent, 8, -0.1).unwrap();
    scheduler.finish_step(parent, true).unwrap();
    assert_eq!(scheduler.block_manager().num_used_blocks(), 1);

    let outputs = scheduler.schedule();
    assert_eq!(outputs.scheduled.len(), 2);
    assert_eq!(outputs.cache_ops.copies.len(), 1);

    let manager = scheduler.block_manager();
    let tokens = |seq_id| {
        manager.read_tokens(scheduler.get_sequence(seq_id).unwrap().block_table())
    };
    assert_eq!(tokens(parent), vec![1, 2, 3, 8]);
    assert_eq!(tokens(child), vec![1, 2, 3, 7]);
    assert_eq!(manager.num_used_blocks(), 2);

    scheduler.prune_sequence(1, child);
    assert_eq!(scheduler.block_manager().num_used_blocks(), 1);
    assert_eq!(scheduler.live_seq_ids(1), vec![parent]);
}

#[test]
fn test_prefix_cache_skips_computed_blocks() {
    let config = SchedulerConfig::default()
        .with_block_size(4)
        .with_cache_size(16)
        .with_prefix_caching(true);
    let mut scheduler = Scheduler::new(config).unwrap();
    let prompt: Vec<u32> = (1..=9).collect();
    scheduler
        .add_request(1, prompt.clone(), GenerationConfig::greedy(8), 0)
        .unwrap();
    let outputs = scheduler.schedule();
    commit(&mut scheduler, &outputs);
    assert_eq!(scheduler.block_manager().num_cached_prefixes(), 2);

    scheduler
        .add_request(2, prompt, GenerationConfig::greedy(8), 0)
        .unwrap();
    let outputs = scheduler.schedule();
    let second = outputs
        .scheduled
        .iter()
        .find(|s| s.request_id == 2)
        .unwrap();
    assert_eq!(second.start_pos, 8);
    assert_eq!(second.token_ids, vec![9]);
    // Two shared prompt blocks plus one private tail block each
    assert_eq!(scheduler.block_manager().num_used_blocks(), 4);
    assert_within_cache(&scheduler);
}

#[test]
fn test_drafts_fed_after_uncomputed_tokens() {
    let mut scheduler = Scheduler::new(four_block_config()).unwrap();
    let seq_id = scheduler
        .add_request(1, vec![1, 2, 3], GenerationConfig::greedy(8), 0)
        .unwrap();
    let outputs = scheduler.schedule();
    commit(&mut scheduler, &outputs);

    scheduler.set_draft_tokens(seq_id, vec![5, 6]).unwrap();
    let outputs = scheduler.schedule();
    let scheduled = &outputs.scheduled[0];
    assert_eq!(scheduled.token_ids, vec![100, 5, 6]);
    assert_eq!(scheduled.num_draft_tokens, 2);
    assert_eq!(scheduled.num_logits(), 3);
    assert_eq!(scheduled.slot_mapping.len(), 3);
    assert_eq!(outputs.num_decode_tokens, 3);
}

#[test]
fn test_finish_releases_blocks_once() {
    let mut scheduler = Scheduler::new(four_block_config()).unwrap();
    let seq_id = scheduler
        .add_request(1, vec![1, 2, 3, 4, 5], GenerationConfig::greedy(4), 0)
        .unwrap();
    scheduler.schedule();

    scheduler.finish_sequence(seq_id, FinishReason::EndOfSequence);
    scheduler.finish_sequence(seq_id, FinishReason::EndOfSequence);
    assert_eq!(scheduler.block_manager().num_free_blocks(), 4);
    assert!(scheduler.get_group(1).unwrap().is_finished());
    assert_eq!(scheduler.num_running(), 0);

    let (_, seqs) = scheduler.take_finished_group(1).unwrap();
    assert_eq!(seqs[0].finish_reason(), Some(FinishReason::EndOfSequence));
    assert!(scheduler.get_group(1).is_none());
}
