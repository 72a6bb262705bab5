//! Integration tests for ChatSession.

mod common;

use std::sync::{Arc, Mutex};

use nano_genai::{
    apply_chat_template, ByteTokenizer, ChatMessage, ChatSession, Error, FinishReason,
    GenerationConfig, SchedulerConfig, StreamStatus, SyntheticBackend, Tokenizer,
};

use common::{byte_engine, engine_with};

const EOS: u32 = ByteTokenizer::EOS;

/// Chat engine whose greedy answer is fixed by `successor`.
fn chat_with(successor: impl Fn(u32) -> u32 + Send + 'static) -> ChatSession {
    let backend = SyntheticBackend::new(ByteTokenizer::VOCAB_SIZE, 0).with_successor(successor);
    ChatSession::new(engine_with(
        backend,
        SchedulerConfig::default().with_block_size(4).with_cache_size(128),
    ))
}

fn encode(text: &str) -> Vec<u32> {
    ByteTokenizer.encode(text).unwrap()
}

fn used_blocks(chat: &ChatSession) -> usize {
    chat.engine().scheduler().block_manager().num_used_blocks()
}

#[test]
fn test_second_text_turn_reuses_cache() {
    // Every assistant turn answers "ok"
    let mut chat = chat_with(|t| match t {
        10 => u32::from(b'o'),
        111 => u32::from(b'k'),
        _ => EOS,
    });
    chat.start_chat(Some("Be brief."));

    let first = chat.generate("hi", None).unwrap();
    assert_eq!(first.output_text, "ok");
    assert_eq!(first.finish_reason, FinishReason::EndOfSequence);
    assert_eq!(first.metrics.num_cached_tokens, 0);

    let prompt = encode(&apply_chat_template(
        &[ChatMessage::system("Be brief."), ChatMessage::user("hi")],
        true,
    ));
    let mut expected_cache = prompt.clone();
    expected_cache.extend(encode("ok"));
    assert_eq!(chat.cached_tokens(), expected_cache);
    assert_eq!(chat.state().materialized_len(), prompt.len() + 2);
    assert_eq!(chat.state().last_disappeared_token(), Some(EOS));

    let second = chat.generate("again", None).unwrap();
    assert_eq!(second.output_text, "ok");
    // Eos is replaced by the template's end marker; everything before it is reused
    assert_eq!(second.metrics.num_cached_tokens, prompt.len() + 2);
    assert_eq!(chat.history().len(), 5);
}

#[test]
fn test_retokenized_answer_trims_cache() {
    // The answer "a " loses its trailing space when templated back
    let mut chat = chat_with(|t| match t {
        10 => u32::from(b'a'),
        97 => u32::from(b' '),
        _ => EOS,
    });
    chat.start_chat(None);

    let first = chat.generate("hi", None).unwrap();
    assert_eq!(first.output_text, "a ");
    let prompt_len = encode(&apply_chat_template(&[ChatMessage::user("hi")], true)).len();
    assert_eq!(chat.state().materialized_len(), prompt_len + 2);

    let second = chat.generate("yo", None).unwrap();
    assert_eq!(second.output_text, "a ");
    assert_eq!(second.metrics.num_cached_tokens, prompt_len + 1);

    let templated = apply_chat_template(chat.history(), false);
    assert!(templated.contains("assistant\na<|im_end|>"));

    let second_prompt = encode(&apply_chat_template(&chat.history()[..3], true));
    let mut expected_cache = second_prompt.clone();
    expected_cache.extend(encode("a "));
    assert_eq!(chat.cached_tokens(), expected_cache);
    let block_size = chat.engine().config().scheduler.block_size;
    assert_eq!(used_blocks(&chat), expected_cache.len().div_ceil(block_size));
}

#[test]
fn test_token_turns_feed_disappeared_token() {
    let mut chat = ChatSession::new(byte_engine());

    let first = chat
        .generate(vec![10, 20, 30], Some(GenerationConfig::greedy(2)))
        .unwrap();
    assert_eq!(first.output_tokens, vec![31, 32]);
    assert_eq!(chat.state().materialized_len(), 4);
    assert_eq!(chat.state().last_disappeared_token(), Some(32));

    let second = chat
        .generate(vec![40], Some(GenerationConfig::greedy(2)))
        .unwrap();
    assert_eq!(second.output_tokens, vec![41, 42]);
    assert_eq!(second.metrics.num_cached_tokens, 4);
    assert_eq!(second.prompt_tokens, vec![10, 20, 30, 31, 32, 40]);
    assert_eq!(chat.cached_tokens(), vec![10, 20, 30, 31, 32, 40, 41]);
    assert_eq!(chat.state().tokenized(), &[10, 20, 30, 31, 32, 40, 41, 42]);
}

#[test]
fn test_beam_turn_releases_cache() {
    let mut chat = ChatSession::new(byte_engine());
    chat.generate(vec![10, 20, 30], Some(GenerationConfig::greedy(3)))
        .unwrap();
    assert_eq!(chat.state().materialized_len(), 5);

    let beam = GenerationConfig::beam_search(3, 2).with_ignore_eos(true);
    let output = chat.generate(vec![40], Some(beam)).unwrap();
    assert_eq!(output.output_tokens, vec![41, 42, 43]);
    assert_eq!(output.metrics.num_cached_tokens, 5);
    assert!(chat.cached_tokens().is_empty());
    assert_eq!(chat.state().materialized_len(), 0);
    assert_eq!(used_blocks(&chat), 0);

    // Next turn recomputes the whole conversation
    let next = chat
        .generate(vec![50], Some(GenerationConfig::greedy(2)))
        .unwrap();
    assert_eq!(next.metrics.num_cached_tokens, 0);
    assert_eq!(next.output_tokens, vec![51, 52]);
    assert_eq!(next.prompt_tokens.len(), 11);
}

#[test]
fn test_failed_turn_resets_conversation() {
    let backend = SyntheticBackend::new(ByteTokenizer::VOCAB_SIZE, 0).with_failure_at(1);
    let mut chat = ChatSession::new(engine_with(
        backend,
        SchedulerConfig::default().with_block_size(4).with_cache_size(64),
    ));
    chat.start_chat(None);

    let err = chat
        .generate("hi", Some(GenerationConfig::greedy(3)))
        .unwrap_err();
    assert!(matches!(err, Error::Backend(_)));
    assert!(chat.history().is_empty());
    assert!(chat.state().tokenized().is_empty());
    assert!(chat.cached_tokens().is_empty());
    assert_eq!(used_blocks(&chat), 0);

    let output = chat
        .generate(vec![5], Some(GenerationConfig::greedy(2)))
        .unwrap();
    assert_eq!(output.prompt_tokens, vec![5]);
    assert_eq!(output.output_tokens, vec![6, 7]);
}

#[test]
fn test_streamer_sees_every_fragment() {
    let mut chat = ChatSession::new(byte_engine());
    let fragments = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&fragments);

    let output = chat
        .generate_with_streamer(vec![97], Some(GenerationConfig::greedy(4)), move |text| {
            sink.lock().unwrap().push(text.to_string());
            StreamStatus::Running
        })
        .unwrap();
    assert_eq!(output.output_text, "bcde");
    assert_eq!(fragments.lock().unwrap().concat(), "bcde");
}

#[test]
fn test_finish_chat_releases_cache() {
    let mut chat = ChatSession::new(byte_engine());
    chat.generate(vec![1, 2, 3, 4, 5], Some(GenerationConfig::greedy(4)))
        .unwrap();
    assert!(used_blocks(&chat) > 0);

    chat.finish_chat();
    assert_eq!(used_blocks(&chat), 0);
    assert!(chat.history().is_empty());
    assert_eq!(chat.state().materialized_len(), 0);

    let engine = chat.into_engine();
    assert!(!engine.has_unfinished_requests());
}

#[test]
fn test_start_chat_drops_previous_conversation() {
    let mut chat = ChatSession::new(byte_engine());
    chat.generate(vec![1, 2, 3], Some(GenerationConfig::greedy(2)))
        .unwrap();

    chat.start_chat(Some("fresh"));
    assert_eq!(chat.history(), &[ChatMessage::system("fresh")]);
    assert!(chat.cached_tokens().is_empty());
    assert_eq!(used_blocks(&chat), 0);
}
