mod common;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use common::test_utils::{
    BOS, EOT, HIDDEN, IMAGE_ID, IMAGE_TOKENS, PROMPT, StubEmbedder, StubTokenizer, expected_layout,
    feature_block,
};
use medgemma_core::{
    Assembler, ImageFeatures, PromptTemplate, SpecialTokens, Stage,
    tokenizer::TextTokenizer,
};

fn special_tokens(tokenizer: &dyn TextTokenizer) -> Result<SpecialTokens> {
    Ok(SpecialTokens::resolve(tokenizer, &PromptTemplate::default())?)
}

#[test]
fn special_tokens_resolve_from_the_vocabulary() -> Result<()> {
    let special = special_tokens(&StubTokenizer::new())?;
    assert_eq!(special.bos, BOS);
    assert_eq!(special.image, IMAGE_ID);
    assert_eq!(special.user_turn, vec![10, 11]);
    assert_eq!(special.end_of_turn, vec![EOT]);
    assert_eq!(special.model_turn, vec![20, 21]);
    Ok(())
}

#[test]
fn missing_image_token_fails_before_any_model_runs() {
    let err = special_tokens(&StubTokenizer::without_image_token()).unwrap_err();
    let err = err.downcast::<medgemma_core::EngineError>().expect("engine error");
    assert!(err.is_config());
    assert!(err.to_string().contains("<image>"));
}

#[test]
fn image_features_are_spliced_bit_exact() -> Result<()> {
    let tokenizer = StubTokenizer::new();
    let special = special_tokens(&tokenizer)?;
    let embedder = StubEmbedder::default();
    let features = ImageFeatures::new(feature_block(IMAGE_TOKENS)?)?;

    let assembled =
        Assembler::new(&special, IMAGE_TOKENS).assemble(&tokenizer, &embedder, PROMPT, Some(features))?;
    let expected = expected_layout();
    assert_eq!(assembled.layout.token_ids, expected);
    assert_eq!(assembled.layout.image_span, Some(3..3 + IMAGE_TOKENS));
    assert_eq!(assembled.embeddings.dims(), &[1, expected.len(), HIDDEN]);

    let rows = assembled.embeddings.get(0)?.to_vec2::<f32>()?;
    let block = feature_block(IMAGE_TOKENS)?.to_vec2::<f32>()?;
    assert_eq!(&rows[3..3 + IMAGE_TOKENS], block.as_slice());
    for (idx, row) in rows.iter().enumerate() {
        if (3..3 + IMAGE_TOKENS).contains(&idx) {
            continue;
        }
        let id = expected[idx] as f32;
        assert!(row.iter().all(|v| *v == id), "row {idx} was modified");
    }

    let calls = embedder.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0], expected);
    Ok(())
}

#[test]
fn batched_projector_output_is_accepted() -> Result<()> {
    let features = ImageFeatures::new(feature_block(4)?.unsqueeze(0)?)?;
    assert_eq!(features.len(), 4);
    assert_eq!(features.hidden_size(), HIDDEN);

    let wrong = Tensor::zeros((2, 4, HIDDEN), DType::F32, &Device::Cpu)?;
    assert!(ImageFeatures::new(wrong).unwrap_err().is_config());
    Ok(())
}

#[test]
fn feature_count_mismatch_is_fatal_before_embedding() -> Result<()> {
    let tokenizer = StubTokenizer::new();
    let special = special_tokens(&tokenizer)?;
    let embedder = StubEmbedder::default();
    let features = ImageFeatures::new(feature_block(IMAGE_TOKENS - 1)?)?;

    let err = Assembler::new(&special, IMAGE_TOKENS)
        .assemble(&tokenizer, &embedder, PROMPT, Some(features))
        .unwrap_err();
    assert!(err.is_config());
    assert!(embedder.calls.lock().unwrap().is_empty());
    Ok(())
}

#[test]
fn text_only_requests_omit_the_placeholder_block() -> Result<()> {
    let tokenizer = StubTokenizer::new();
    let special = special_tokens(&tokenizer)?;
    let embedder = StubEmbedder::default();

    let assembled =
        Assembler::new(&special, IMAGE_TOKENS).assemble(&tokenizer, &embedder, PROMPT, None)?;
    assert_eq!(assembled.layout.token_ids, vec![BOS, 10, 11, 55, 56, EOT, 20, 21]);
    assert!(assembled.layout.image_span.is_none());
    assert_eq!(assembled.embeddings.dims(), &[1, 8, HIDDEN]);
    Ok(())
}

#[test]
fn tokenizer_failures_carry_their_stage() -> Result<()> {
    let tokenizer = StubTokenizer::new();
    let special = special_tokens(&tokenizer)?;
    let embedder = StubEmbedder::default();
    let err = Assembler::new(&special, IMAGE_TOKENS)
        .assemble(&tokenizer, &embedder, "unknown words", None)
        .unwrap_err();
    assert_eq!(err.failed_stage(), Some(Stage::Tokenizer));
    Ok(())
}
