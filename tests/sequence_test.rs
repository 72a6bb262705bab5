//! Integration tests for Sequence, SequenceGroup and SequenceArena.

use nano_genai::core::sequence::{
    FinishReason, Sequence, SequenceArena, SequenceGroup, SequenceStatus,
};
use nano_genai::{Error, GenerationConfig};

#[test]
fn test_sequence_creation() {
    let seq = Sequence::new(1, vec![1, 2, 3, 4, 5]);

    assert_eq!(seq.seq_id(), 1);
    assert_eq!(seq.prompt_token_ids(), &[1, 2, 3, 4, 5]);
    assert!(seq.output_token_ids().is_empty());
    assert_eq!(seq.status(), SequenceStatus::Waiting);
    assert_eq!(seq.cumulative_logprob(), 0.0);
    assert!(seq.is_prefill());
    assert_eq!(seq.num_uncomputed_tokens(), 5);
}

#[test]
fn test_append_accumulates_logprob() {
    let mut seq = Sequence::new(1, vec![1, 2, 3]);

    seq.append_token(4, -0.5);
    seq.append_token(5, -1.25);

    assert_eq!(seq.output_token_ids(), &[4, 5]);
    assert_eq!(seq.all_token_ids(), vec![1, 2, 3, 4, 5]);
    assert_eq!(seq.cumulative_logprob(), -1.75);
    assert_eq!(seq.last_token_id(), Some(5));
    assert_eq!(seq.total_len(), 5);
}

#[test]
fn test_state_transitions() {
    let mut seq = Sequence::new(1, vec![1, 2, 3]);

    seq.set_running().unwrap();
    assert_eq!(seq.status(), SequenceStatus::Running);

    seq.set_swapped().unwrap();
    assert_eq!(seq.status(), SequenceStatus::Swapped);

    seq.set_running().unwrap();
    seq.set_waiting().unwrap();
    assert_eq!(seq.status(), SequenceStatus::Waiting);

    seq.set_running().unwrap();
    seq.set_finished(FinishReason::MaxTokens);
    assert_eq!(seq.status(), SequenceStatus::Finished);
    assert_eq!(seq.finish_reason(), Some(FinishReason::MaxTokens));
}

#[test]
fn test_invalid_state_transitions() {
    let mut seq = Sequence::new(1, vec![1, 2, 3]);

    assert!(matches!(
        seq.set_swapped(),
        Err(Error::InvalidStateTransition { from: "Waiting", to: "Swapped" })
    ));
    assert!(seq.set_waiting().is_err());

    seq.set_finished(FinishReason::EndOfSequence);
    assert!(seq.set_running().is_err());
}

#[test]
fn test_draft_tokens_are_taken_once() {
    let mut seq = Sequence::new(0, vec![1]);
    seq.set_draft_tokens(vec![2, 3]);
    assert_eq!(seq.draft_tokens(), &[2, 3]);
    assert_eq!(seq.take_draft_tokens(), vec![2, 3]);
    assert!(seq.take_draft_tokens().is_empty());
}

#[test]
fn test_status_predicates() {
    assert!(SequenceStatus::Waiting.is_active());
    assert!(SequenceStatus::Running.is_active());
    assert!(!SequenceStatus::Swapped.is_active());
    assert!(SequenceStatus::Finished.is_finished());
    assert!(SequenceStatus::Aborted.is_finished());
    assert!(!SequenceStatus::Swapped.is_finished());
}

#[test]
fn test_finish_reason_names() {
    assert_eq!(FinishReason::EndOfSequence.as_str(), "eos");
    assert_eq!(FinishReason::MaxTokens.as_str(), "length");
    assert_eq!(FinishReason::Aborted.as_str(), "aborted");
}

#[test]
fn test_group_reserves_beam_width() {
    let group = SequenceGroup::new(7, 0, GenerationConfig::beam_search(8, 4), 2, 0);
    assert_eq!(group.request_id(), 7);
    assert_eq!(group.seq_ids(), &[0]);
    assert_eq!(group.max_num_seqs(), 4);
    assert_eq!(group.priority(), 2);
    assert_eq!(group.status(), SequenceStatus::Waiting);
    assert!(group.admitted_at().is_none());

    let greedy = SequenceGroup::new(8, 1, GenerationConfig::greedy(8), 0, 1);
    assert_eq!(greedy.max_num_seqs(), 1);
}

#[test]
fn test_arena_fork_copies_tokens_not_blocks() {
    let mut arena = SequenceArena::new(4);
    let parent = arena.insert(vec![1, 2, 3]);
    arena.get_mut(parent).unwrap().append_token(4, -0.5);

    let child = arena.fork(parent).unwrap();
    let forked = arena.get(child).unwrap();
    assert_eq!(forked.all_token_ids(), vec![1, 2, 3, 4]);
    assert_eq!(forked.cumulative_logprob(), -0.5);
    assert_eq!(forked.parent(), Some(parent));
    assert!(forked.block_table().is_empty());
    assert_eq!(forked.block_table().block_size(), 4);

    assert!(matches!(arena.fork(99), Err(Error::SequenceNotFound(99))));
}

#[test]
fn test_arena_ordinals_grow_across_slot_reuse() {
    let mut arena = SequenceArena::new(4);
    let a = arena.insert(vec![1]);
    let b = arena.insert(vec![2]);
    arena.remove(a);
    assert!(!arena.contains(a));

    let c = arena.insert(vec![3]);
    assert_eq!(c, a);
    assert!(arena.get(c).unwrap().ordinal() > arena.get(b).unwrap().ordinal());
    assert_eq!(arena.len(), 2);
    assert_eq!(arena.iter().count(), 2);

    arena.clear();
    assert!(arena.is_empty());
}
