//! End-to-end tests of the generation loop against a mocked model provider.

mod common;

use std::sync::Arc;

use common::{one_hot, MockContext, MockModel};
use llama_gen::*;
use llama_tokenizer::{BOS_ID, EOS_ID};
use proptest::prelude::*;

fn greedy_config() -> SessionConfig {
    SessionConfig::default().with_sampling(SamplingConfig::greedy())
}

fn session(
    model: &Arc<MockModel>,
    ctx: MockContext,
    config: SessionConfig,
) -> Session<MockModel, MockContext> {
    Session::new(Arc::clone(model), ctx, config).unwrap()
}

fn prompt(model: &MockModel) -> Vec<TokenId> {
    model
        .encode("The cat sat on a mat.", true, false)
        .unwrap()
}

// ===========================================================================
// Budget
// ===========================================================================

#[test]
fn emits_exactly_n_predict_tokens() {
    let model = Arc::new(MockModel::new());
    let cat = model.token(" cat");
    let ctx = MockContext::fixed(64, one_hot(model.n_vocab(), cat));
    let mut s = session(&model, ctx, greedy_config());

    let generation = s.generate(&prompt(&model), 5).unwrap();
    assert_eq!(generation.tokens, vec![cat; 5]);
    assert_eq!(generation.reason, TerminationReason::BudgetExhausted);
    assert!(!generation.cancelled);
    assert_eq!(generation.stats.generated_tokens, 5);
}

#[test]
fn zero_budget_decodes_prompt_only() {
    let model = Arc::new(MockModel::new());
    let ctx = MockContext::fixed(64, one_hot(model.n_vocab(), model.token(" cat")));
    let log = ctx.log();
    let mut s = session(&model, ctx, greedy_config());

    let p = prompt(&model);
    let generation = s.generate(&p, 0).unwrap();
    assert!(generation.is_empty());
    assert_eq!(generation.reason, TerminationReason::BudgetExhausted);
    assert_eq!(log.lock().unwrap().decodes.len(), 1);
    assert_eq!(s.window().used_cells(), p.len());
    assert_eq!(s.carried_token(), None);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn never_exceeds_budget(n_predict in 0usize..24, seed in any::<u64>()) {
        let model = Arc::new(MockModel::new());
        let mut logits = vec![0.0; model.n_vocab()];
        logits[EOS_ID as usize] = f32::NEG_INFINITY;
        let ctx = MockContext::fixed(256, logits);
        let config = SessionConfig::default()
            .with_sampling(SamplingConfig::default().with_seed(seed));
        let mut s = session(&model, ctx, config);

        let generation = s.generate(&prompt(&model), n_predict).unwrap();
        prop_assert_eq!(generation.tokens.len(), n_predict);
        prop_assert_eq!(generation.reason, TerminationReason::BudgetExhausted);
    }
}

// ===========================================================================
// Context window
// ===========================================================================

#[test]
fn prompt_filling_the_window_overflows_on_first_step() {
    let model = Arc::new(MockModel::new());
    let p = prompt(&model);
    let k = p.len();
    let cat = model.token(" cat");
    let ctx = MockContext::fixed(k, one_hot(model.n_vocab(), cat));
    let log = ctx.log();
    let mut s = session(&model, ctx, greedy_config());

    let generation = s.generate(&p, 10).unwrap();

    // The token sampled from the prompt logits survives.
    assert_eq!(generation.tokens, vec![cat]);
    assert_eq!(
        generation.reason,
        TerminationReason::ContextOverflow {
            used: k,
            incoming: 1,
            capacity: k
        }
    );
    // Only the prompt was decoded.
    assert_eq!(log.lock().unwrap().decodes.len(), 1);
    assert_eq!(s.window().used_cells(), k);
}

#[test]
fn prompt_larger_than_window_never_reaches_decode() {
    let model = Arc::new(MockModel::new());
    let p = prompt(&model);
    let ctx = MockContext::fixed(p.len() - 1, one_hot(model.n_vocab(), 10));
    let log = ctx.log();
    let mut s = session(&model, ctx, greedy_config());

    let generation = s.generate(&p, 4).unwrap();
    assert!(generation.is_empty());
    assert!(matches!(
        generation.reason,
        TerminationReason::ContextOverflow { used: 0, .. }
    ));
    assert!(log.lock().unwrap().decodes.is_empty());
}

#[test]
fn window_fills_during_generation() {
    let model = Arc::new(MockModel::new());
    let p = prompt(&model);
    let cat = model.token(" cat");
    let ctx = MockContext::fixed(p.len() + 3, one_hot(model.n_vocab(), cat));
    let mut s = session(&model, ctx, greedy_config());

    let generation = s.generate(&p, 100).unwrap();
    // 1 from the prompt logits, then 3 decoded steps each yielding one more.
    assert_eq!(generation.len(), 4);
    assert!(matches!(generation.reason, TerminationReason::ContextOverflow { .. }));
    assert_eq!(s.window().remaining(), 0);
}

// ===========================================================================
// Decode failures
// ===========================================================================

#[test]
fn decode_failure_keeps_partial_output_and_ends_session() {
    let model = Arc::new(MockModel::new());
    let cat = model.token(" cat");
    let ctx = MockContext::fixed(64, one_hot(model.n_vocab(), cat)).failing_on(2, -7);
    let mut s = session(&model, ctx, greedy_config());

    let p = prompt(&model);
    let generation = s.generate(&p, 10).unwrap();
    assert_eq!(generation.tokens, vec![cat, cat]);
    assert_eq!(
        generation.reason,
        TerminationReason::DecodeFailure(DecodeError::Status(-7))
    );
    assert!(s.is_failed());

    let err = s.generate(&p, 1).unwrap_err();
    assert_eq!(err, LlamaError::DecodeFailure(DecodeError::Status(-7)));

    s.reset();
    assert!(!s.is_failed());
    assert_eq!(s.window().used_cells(), 0);
}

#[test]
fn prompt_decode_failure_returns_no_tokens() {
    let model = Arc::new(MockModel::new());
    let ctx = MockContext::fixed(64, one_hot(model.n_vocab(), 10)).failing_on(0, 1);
    let mut s = session(&model, ctx, greedy_config());

    let generation = s.generate(&prompt(&model), 10).unwrap();
    assert!(generation.is_empty());
    assert_eq!(
        generation.reason,
        TerminationReason::DecodeFailure(DecodeError::Status(1))
    );
    assert_eq!(s.window().used_cells(), 0);
}

#[test]
fn wrong_length_logits_are_a_decode_failure() {
    let model = Arc::new(MockModel::new());
    let ctx = MockContext::fixed(64, vec![0.0; 8]);
    let mut s = session(&model, ctx, greedy_config());

    let generation = s.generate(&prompt(&model), 3).unwrap();
    assert_eq!(
        generation.reason,
        TerminationReason::DecodeFailure(DecodeError::MalformedLogits {
            expected: model.n_vocab(),
            got: 8
        })
    );
}

#[test]
fn nan_logits_are_a_decode_failure() {
    let model = Arc::new(MockModel::new());
    let ctx = MockContext::fixed(64, vec![f32::NAN; model.n_vocab()]);
    let mut s = session(&model, ctx, greedy_config());

    let generation = s.generate(&prompt(&model), 3).unwrap();
    assert!(matches!(
        generation.reason,
        TerminationReason::DecodeFailure(DecodeError::UnusableLogits { .. })
    ));
}

// ===========================================================================
// End of generation
// ===========================================================================

#[test]
fn end_of_generation_is_not_emitted_or_accepted() {
    let model = Arc::new(MockModel::new());
    let cat = model.token(" cat");
    let n = model.n_vocab();
    let ctx = MockContext::new(64, vec![one_hot(n, cat), one_hot(n, EOS_ID)]);
    let config = SessionConfig::default()
        .with_sampling(SamplingConfig::greedy().with_repeat_penalty(1.5, 16));
    let mut s = session(&model, ctx, config);

    let generation = s.generate(&prompt(&model), 10).unwrap();
    assert_eq!(generation.tokens, vec![cat]);
    assert_eq!(generation.reason, TerminationReason::EndOfGeneration);
    assert_eq!(s.carried_token(), None);

    let Stage::Penalties(penalties) = &s.sampler().stages()[0] else {
        panic!("expected penalties first, got {}", s.sampler());
    };
    assert_eq!(penalties.history().copied().collect::<Vec<_>>(), vec![cat]);
}

// ===========================================================================
// Determinism
// ===========================================================================

#[test]
fn zero_temperature_is_reproducible() {
    let model = Arc::new(MockModel::new());
    let n = model.n_vocab();
    let logits: Vec<f32> = (0..n).map(|i| ((i * 37) % 101) as f32 / 10.0).collect();

    let run = |seed: u64| {
        let ctx = MockContext::fixed(128, logits.clone());
        let config = SessionConfig::default()
            .with_sampling(SamplingConfig::default().with_temperature(0.0).with_seed(seed));
        session(&model, ctx, config)
            .generate(&prompt(&model), 8)
            .unwrap()
            .tokens
    };

    let first = run(1);
    assert_eq!(first.len(), 8);
    assert_eq!(first, run(1));
    assert_eq!(first, run(99));
}

#[test]
fn story_prompt_yields_the_seeded_draw() {
    let model = Arc::new(MockModel::new());
    let t0 = model
        .encode("Write a short story about a cat.", true, true)
        .unwrap();
    let expected_prompt: Vec<TokenId> = [
        " Write", " a", " short", " story", " about", " a", " cat", ".",
    ]
    .iter()
    .map(|p| model.token(p))
    .collect();
    assert_eq!(t0[0], BOS_ID);
    assert_eq!(&t0[1..], expected_prompt.as_slice());

    let n = model.n_vocab();
    let mut fixture: Vec<f32> = (0..n).map(|i| ((i * 7919) % 23) as f32 * 0.25).collect();
    fixture[EOS_ID as usize] = f32::NEG_INFINITY;

    let sampling = SamplingConfig::default()
        .without_truncation()
        .with_temperature(0.4)
        .with_seed(1234);
    let expected = sampling.build().unwrap().sample(&fixture).unwrap();
    // Seed 1234 lands on the newline byte, one of the top-logit tokens.
    assert_eq!(expected, 13);

    for _ in 0..2 {
        let ctx = MockContext::fixed(64, fixture.clone());
        let log = ctx.log();
        let config = SessionConfig::default().with_sampling(sampling.clone());
        let mut s = session(&model, ctx, config);

        let generation = s.generate(&t0, 1).unwrap();
        assert_eq!(generation.tokens, vec![expected]);
        assert_eq!(log.lock().unwrap().decoded_tokens(), t0);
    }
}

// ===========================================================================
// Batching and persistence
// ===========================================================================

#[test]
fn long_prompts_are_chunked_by_batch_capacity() {
    let model = Arc::new(MockModel::new());
    let ctx = MockContext::fixed(64, one_hot(model.n_vocab(), model.token(" cat")));
    let log = ctx.log();
    let mut s = session(&model, ctx, greedy_config().with_n_batch(4));

    let p: Vec<TokenId> = (10..20).collect();
    s.generate(&p, 1).unwrap();

    let log = log.lock().unwrap();
    let sizes: Vec<usize> = log.decodes.iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![4, 4, 2]);

    let entries: Vec<_> = log.decodes.iter().flatten().collect();
    for (i, (token, pos, _)) in entries.iter().enumerate() {
        assert_eq!(*token, p[i]);
        assert_eq!(*pos, i as Position);
    }
    let wants: Vec<bool> = entries.iter().map(|e| e.2).collect();
    assert_eq!(wants.iter().filter(|&&w| w).count(), 1);
    assert!(wants[9]);
}

#[test]
fn batch_capacity_is_capped_at_the_context_size() {
    let model = Arc::new(MockModel::new());
    let cat = model.token(" cat");
    let ctx = MockContext::fixed(8, one_hot(model.n_vocab(), cat));
    let log = ctx.log();
    let mut s = session(&model, ctx, greedy_config().with_n_batch(1 << 30));
    assert_eq!(s.n_batch(), 8);

    let generation = s.generate(&[10, 11, 12, 13, 14, 15], 2).unwrap();
    assert_eq!(generation.tokens, vec![cat; 2]);
    assert_eq!(log.lock().unwrap().decodes[0].len(), 6);
}

#[test]
fn sessions_continue_across_calls() {
    let model = Arc::new(MockModel::new());
    let cat = model.token(" cat");
    let ctx = MockContext::fixed(64, one_hot(model.n_vocab(), cat));
    let log = ctx.log();
    let mut s = session(&model, ctx, greedy_config());

    let first = s.generate(&[10, 11, 12], 2).unwrap();
    assert_eq!(first.tokens, vec![cat, cat]);
    // prompt (3) + the first emitted token; the second is carried.
    assert_eq!(s.window().used_cells(), 4);
    assert_eq!(s.carried_token(), Some(cat));

    let second = s.generate(&[13, 14], 1).unwrap();
    assert_eq!(second.stats.prompt_tokens, 3);
    assert_eq!(second.tokens.len(), 1);

    let log = log.lock().unwrap();
    let last_prompt = &log.decodes[log.decodes.len() - 1];
    assert_eq!(
        last_prompt,
        &vec![(cat, 4, false), (13, 5, false), (14, 6, true)]
    );
}

#[test]
fn carried_token_alone_continues_generation() {
    let model = Arc::new(MockModel::new());
    let cat = model.token(" cat");
    let ctx = MockContext::fixed(64, one_hot(model.n_vocab(), cat));
    let mut s = session(&model, ctx, greedy_config());

    s.generate(&[10], 1).unwrap();
    let generation = s.generate(&[], 2).unwrap();
    assert_eq!(generation.tokens, vec![cat, cat]);
}

#[test]
fn reset_replays_a_seeded_session() {
    let model = Arc::new(MockModel::new());
    let n = model.n_vocab();
    let mut logits = vec![0.0; n];
    logits[EOS_ID as usize] = f32::NEG_INFINITY;
    let ctx = MockContext::fixed(128, logits);
    let log = ctx.log();
    let config = SessionConfig::default()
        .with_sampling(SamplingConfig::default().without_truncation().with_seed(7));
    let mut s = session(&model, ctx, config);

    let first = s.generate(&prompt(&model), 6).unwrap();
    s.reset();
    assert_eq!(log.lock().unwrap().clears, 1);
    assert_eq!(s.window().used_cells(), 0);
    assert_eq!(s.carried_token(), None);

    let second = s.generate(&prompt(&model), 6).unwrap();
    assert_eq!(first.tokens, second.tokens);
}

// ===========================================================================
// Cancellation
// ===========================================================================

#[test]
fn interrupt_stops_after_current_step() {
    let model = Arc::new(MockModel::new());
    let cat = model.token(" cat");
    let ctx = MockContext::fixed(256, one_hot(model.n_vocab(), cat));
    let mut s = session(&model, ctx, greedy_config());

    let handle = s.interrupt_handle();
    let mut seen = Vec::new();
    let generation = s
        .generate_with(&prompt(&model), 50, |t| {
            seen.push(t);
            if seen.len() == 3 {
                handle.interrupt();
            }
        })
        .unwrap();

    assert_eq!(generation.tokens.len(), 3);
    assert_eq!(seen, generation.tokens);
    assert_eq!(generation.reason, TerminationReason::BudgetExhausted);
    assert!(generation.cancelled);

    // The flag does not leak into the next call.
    let next = s.generate(&[], 2).unwrap();
    assert_eq!(next.tokens.len(), 2);
    assert!(!next.cancelled);
}

// ===========================================================================
// Setup errors
// ===========================================================================

#[test]
fn empty_prompt_is_rejected_before_decode() {
    let model = Arc::new(MockModel::new());
    let ctx = MockContext::fixed(64, one_hot(model.n_vocab(), 10));
    let log = ctx.log();
    let mut s = session(&model, ctx, greedy_config());

    assert_eq!(s.generate(&[], 4).unwrap_err(), LlamaError::EmptyPrompt);
    assert!(log.lock().unwrap().decodes.is_empty());
}

#[test]
fn out_of_vocab_prompt_is_a_tokenization_error() {
    let model = Arc::new(MockModel::new());
    let ctx = MockContext::fixed(64, one_hot(model.n_vocab(), 10));
    let mut s = session(&model, ctx, greedy_config());

    let bad = model.n_vocab() as TokenId;
    assert!(matches!(
        s.generate(&[10, bad], 4),
        Err(LlamaError::Tokenization(_))
    ));
}

#[test]
fn misconfigured_sampler_fails_at_session_setup() {
    let model = Arc::new(MockModel::new());
    let ctx = MockContext::fixed(64, one_hot(model.n_vocab(), 10));
    let config = SessionConfig::default()
        .with_sampling(SamplingConfig::default().with_top_p(0.0));

    let err = Session::new(model, ctx, config).err().unwrap();
    assert!(matches!(err, LlamaError::SamplerMisconfiguration(_)));
}

// ===========================================================================
// Encoder-decoder models
// ===========================================================================

#[test]
fn encoder_pass_precedes_decoder_start() {
    let model = Arc::new(MockModel::encoder_decoder(Some(BOS_ID)));
    let cat = model.token(" cat");
    let ctx = MockContext::fixed(8, one_hot(model.n_vocab(), cat));
    let log = ctx.log();
    let mut s = session(&model, ctx, greedy_config());

    let p: Vec<TokenId> = (10..22).collect();
    let generation = s.generate(&p, 3).unwrap();
    assert_eq!(generation.tokens, vec![cat; 3]);

    let log = log.lock().unwrap();
    assert_eq!(log.encodes, vec![p.clone()]);
    assert_eq!(log.decodes[0], vec![(BOS_ID, 0, true)]);
    // The encoder input never counts against the decoder window.
    assert_eq!(s.window().used_cells(), 3);
}

#[test]
fn encoder_input_longer_than_the_batch_is_encoded_whole() {
    let model = Arc::new(MockModel::encoder_decoder(Some(BOS_ID)));
    let cat = model.token(" cat");
    let ctx = MockContext::fixed(8, one_hot(model.n_vocab(), cat));
    let log = ctx.log();
    let mut s = session(&model, ctx, greedy_config().with_n_batch(4));

    let p: Vec<TokenId> = (10..20).collect();
    let generation = s.generate(&p, 2).unwrap();
    assert_eq!(generation.tokens, vec![cat; 2]);
    assert_eq!(log.lock().unwrap().encodes, vec![p]);
}

#[test]
fn encoder_setup_errors_leave_the_session_alone() {
    let model = Arc::new(MockModel::encoder_decoder(Some(BOS_ID)));
    let cat = model.token(" cat");
    let ctx = MockContext::fixed(8, one_hot(model.n_vocab(), cat));
    let log = ctx.log();
    let mut s = session(&model, ctx, greedy_config());

    s.generate(&[10, 11], 2).unwrap();
    let clears = log.lock().unwrap().clears;
    let used = s.window().used_cells();

    assert!(matches!(s.generate(&[], 3), Err(LlamaError::EmptyPrompt)));
    assert_eq!(log.lock().unwrap().clears, clears);
    assert_eq!(s.window().used_cells(), used);
    assert_eq!(s.carried_token(), Some(cat));
}

#[test]
fn encoder_failure_ends_the_call() {
    let model = Arc::new(MockModel::encoder_decoder(Some(BOS_ID)));
    let ctx = MockContext::fixed(8, one_hot(model.n_vocab(), 10)).with_encode_status(5);
    let mut s = session(&model, ctx, greedy_config());

    let generation = s.generate(&[10, 11], 3).unwrap();
    assert!(generation.is_empty());
    assert_eq!(
        generation.reason,
        TerminationReason::DecodeFailure(DecodeError::EncoderStatus(5))
    );
}

#[test]
fn encoder_without_start_token_is_a_config_error() {
    let model = Arc::new(MockModel::encoder_decoder(None));
    let ctx = MockContext::fixed(8, one_hot(model.n_vocab(), 10));
    let mut s = session(&model, ctx, greedy_config());
    assert!(matches!(
        s.generate(&[10], 3),
        Err(LlamaError::Config(_))
    ));
}

// ===========================================================================
// Sharing and text
// ===========================================================================

#[test]
fn sessions_share_one_model_across_threads() {
    let model = Arc::new(MockModel::new());
    let cat = model.token(" cat");

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let model = Arc::clone(&model);
            std::thread::spawn(move || {
                let ctx = MockContext::fixed(64, one_hot(model.n_vocab(), cat));
                let mut s = Session::new(model, ctx, greedy_config()).unwrap();
                s.generate(&[10, 11], 4).unwrap().tokens
            })
        })
        .collect();

    for h in handles {
        assert_eq!(h.join().unwrap(), vec![cat; 4]);
    }
}

#[test]
fn generate_text_detokenizes_output() {
    let model = Arc::new(MockModel::new());
    let n = model.n_vocab();
    let script = vec![
        one_hot(n, model.token(" The")),
        one_hot(n, model.token(" cat")),
        one_hot(n, model.token(" sat")),
        one_hot(n, EOS_ID),
    ];
    let ctx = MockContext::new(64, script);
    let mut s = session(&model, ctx, greedy_config());

    let (generation, text) = s
        .generate_text("Write a short story about a cat.", true, true, 16)
        .unwrap();
    assert_eq!(generation.reason, TerminationReason::EndOfGeneration);
    assert_eq!(text, "The cat sat");
}
