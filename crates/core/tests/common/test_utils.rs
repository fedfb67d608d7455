#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::{Result, anyhow, bail};
use candle_core::{DType, Device, Tensor};

use medgemma_core::{
    CacheGeometry, CausalTransformer, Collaborators, Engine, EngineConfig, LayerKv, TokenEmbedder,
    TokenId, TransformerInput, TransformerOutput, VisionEncoder, VisionProjector,
    tokenizer::TextTokenizer,
};

pub const HIDDEN: usize = 8;
pub const IMAGE_TOKENS: usize = 256;
pub const VOCAB: usize = 128;
pub const BOS: TokenId = 2;
pub const IMAGE_ID: TokenId = 99;
pub const EOT: TokenId = 106;
pub const BOS_AS_END: TokenId = 1;

pub const PROMPT: &str = "describe image";
pub const PROMPT_IDS: [TokenId; 2] = [55, 56];

/// `[2, 10, 11, 256 x image, 55, 56, 106, 20, 21]`
pub fn expected_layout() -> Vec<TokenId> {
    let mut ids = vec![BOS, 10, 11];
    ids.extend(std::iter::repeat_n(IMAGE_ID, IMAGE_TOKENS));
    ids.extend_from_slice(&PROMPT_IDS);
    ids.extend_from_slice(&[EOT, 20, 21]);
    ids
}

pub fn geometry() -> CacheGeometry {
    CacheGeometry {
        num_layers: 2,
        kv_heads: 1,
        head_dim: 4,
    }
}

pub fn engine_config() -> EngineConfig {
    EngineConfig {
        cache: geometry(),
        hidden_size: HIDDEN,
        image_tokens: IMAGE_TOKENS,
        image_size: 16,
        ..EngineConfig::default()
    }
}

/// Whole-phrase lookups for the chat markers, whitespace-split words otherwise.
pub struct StubTokenizer {
    phrases: HashMap<String, Vec<TokenId>>,
    vocab: HashMap<String, TokenId>,
    include_image: bool,
}

impl StubTokenizer {
    pub fn new() -> Self {
        let phrases = [
            ("<start_of_turn>user\n", vec![10, 11]),
            ("<end_of_turn>", vec![EOT]),
            ("\n<start_of_turn>model\n", vec![20, 21]),
        ]
        .into_iter()
        .map(|(text, ids)| (text.to_string(), ids))
        .collect();
        let vocab = [
            ("<bos_end>", BOS_AS_END),
            ("<bos>", BOS),
            ("<image>", IMAGE_ID),
            ("<end_of_turn>", EOT),
            ("describe", 55),
            ("image", 56),
            ("normal", 60),
            ("lungs", 61),
            ("END", 62),
            ("heart", 63),
        ]
        .into_iter()
        .map(|(word, id)| (word.to_string(), id))
        .collect();
        Self {
            phrases,
            vocab,
            include_image: true,
        }
    }

    /// A vocabulary without the image placeholder.
    pub fn without_image_token() -> Self {
        Self {
            include_image: false,
            ..Self::new()
        }
    }
}

impl TextTokenizer for StubTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        if let Some(ids) = self.phrases.get(text) {
            return Ok(ids.clone());
        }
        text.split_whitespace()
            .map(|word| {
                self.token_to_id(word)
                    .ok_or_else(|| anyhow!("unknown word {word:?}"))
            })
            .collect()
    }

    fn decode(&self, ids: &[TokenId]) -> Result<String> {
        let words: Vec<String> = ids
            .iter()
            .map(|id| {
                self.vocab
                    .iter()
                    .find(|(_, v)| *v == id)
                    .map(|(word, _)| word.clone())
                    .unwrap_or_else(|| format!("<{id}>"))
            })
            .collect();
        Ok(words.join(" "))
    }

    fn token_to_id(&self, token: &str) -> Option<TokenId> {
        if token == "<image>" && !self.include_image {
            return None;
        }
        self.vocab.get(token).copied()
    }
}

/// Every hidden component of a token's embedding equals its id.
#[derive(Default)]
pub struct StubEmbedder {
    fail_on_call: Option<usize>,
    pub calls: Mutex<Vec<Vec<TokenId>>>,
}

impl StubEmbedder {
    /// Call 0 embeds the assembled prompt, call `n` the `n`-th decode step.
    pub fn failing_on(call: usize) -> Self {
        Self {
            fail_on_call: Some(call),
            ..Self::default()
        }
    }
}

impl TokenEmbedder for StubEmbedder {
    fn embed(&self, ids: &[TokenId]) -> Result<Tensor> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(ids.to_vec());
            calls.len() - 1
        };
        if self.fail_on_call == Some(call) {
            bail!("embedding lookup failed on call {call}");
        }
        let data: Vec<f32> = ids
            .iter()
            .flat_map(|&id| std::iter::repeat_n(id as f32, HIDDEN))
            .collect();
        Ok(Tensor::from_vec(data, (1, ids.len(), HIDDEN), &Device::Cpu)?)
    }
}

/// Row `i` of the block is filled with `1000 + i`.
pub fn feature_block(rows: usize) -> Result<Tensor> {
    let data: Vec<f32> = (0..rows)
        .flat_map(|row| std::iter::repeat_n(1000.0 + row as f32, HIDDEN))
        .collect();
    Ok(Tensor::from_vec(data, (rows, HIDDEN), &Device::Cpu)?)
}

pub struct StubVision;

impl VisionEncoder for StubVision {
    fn encode(&self, pixel_values: &Tensor) -> Result<Tensor> {
        if pixel_values.dims().len() != 4 {
            bail!("expected [1, 3, S, S], got {:?}", pixel_values.dims());
        }
        Ok(Tensor::zeros((1, IMAGE_TOKENS, 4), DType::F32, &Device::Cpu)?)
    }
}

pub struct StubProjector {
    pub rows: usize,
}

impl VisionProjector for StubProjector {
    fn project(&self, _visual_features: &Tensor) -> Result<Tensor> {
        Ok(feature_block(self.rows)?.unsqueeze(0)?)
    }
}

pub struct FailingProjector;

impl VisionProjector for FailingProjector {
    fn project(&self, _visual_features: &Tensor) -> Result<Tensor> {
        bail!("projector session is not initialised")
    }
}

/// What the transformer saw on one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub submitted: usize,
    pub mask_len: usize,
    pub past_len: usize,
}

/// How a [`ScriptedTransformer`] misbehaves on one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Return an error.
    Fail,
    /// Return `[1, vocab]` logits instead of `[1, positions, vocab]`.
    FlatLogits,
    /// Return one cache layer fewer than it received.
    DropLayer,
}

/// Favours `script[call]` on each call, then `fallback` once the script runs out.
pub struct ScriptedTransformer {
    script: Vec<TokenId>,
    fallback: TokenId,
    fault: Option<(usize, Fault)>,
    pub calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedTransformer {
    pub fn new(script: Vec<TokenId>, fallback: TokenId) -> Self {
        Self {
            script,
            fallback,
            fault: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_on(self, call: usize) -> Self {
        self.with_fault(call, Fault::Fail)
    }

    pub fn with_fault(mut self, call: usize, fault: Fault) -> Self {
        self.fault = Some((call, fault));
        self
    }

    pub fn recorded(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl CausalTransformer for ScriptedTransformer {
    fn forward(&self, input: TransformerInput<'_>) -> Result<TransformerOutput> {
        let (_, submitted, _) = input.inputs_embeds.dims3()?;
        let (_, mask_len) = input.attention_mask.dims2()?;
        let past_len = input.past.first().map(|kv| kv.key.dims()[2]).unwrap_or(0);
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(RecordedCall {
                submitted,
                mask_len,
                past_len,
            });
            calls.len() - 1
        };
        let fault = self
            .fault
            .and_then(|(on, fault)| (on == call).then_some(fault));
        if fault == Some(Fault::Fail) {
            bail!("session run failed on call {call}");
        }

        let favoured = self.script.get(call).copied().unwrap_or(self.fallback);
        let mut data = vec![-10f32; submitted * VOCAB];
        data[(submitted - 1) * VOCAB + favoured as usize] = 10.0;
        let logits = if fault == Some(Fault::FlatLogits) {
            Tensor::from_vec(data[(submitted - 1) * VOCAB..].to_vec(), (1, VOCAB), &Device::Cpu)?
        } else {
            Tensor::from_vec(data, (1, submitted, VOCAB), &Device::Cpu)?
        };

        let mut present = input
            .past
            .iter()
            .map(|kv| {
                let (b, h, _, d) = kv.key.dims4()?;
                let fresh = Tensor::zeros((b, h, submitted, d), kv.key.dtype(), kv.key.device())?;
                let key = Tensor::cat(&[&kv.key, &fresh], 2)?;
                let value = Tensor::cat(&[&kv.value, &fresh], 2)?;
                Ok(LayerKv { key, value })
            })
            .collect::<Result<Vec<_>>>()?;
        if fault == Some(Fault::DropLayer) {
            present.pop();
        }
        Ok(TransformerOutput { logits, present })
    }
}

pub struct Harness {
    pub engine: Engine,
    pub transformer: Arc<ScriptedTransformer>,
    pub embedder: Arc<StubEmbedder>,
}

pub fn harness(transformer: ScriptedTransformer) -> Result<Harness> {
    harness_with(transformer, engine_config(), StubTokenizer::new())
}

pub fn harness_with(
    transformer: ScriptedTransformer,
    config: EngineConfig,
    tokenizer: StubTokenizer,
) -> Result<Harness> {
    build_harness(
        transformer,
        config,
        tokenizer,
        StubEmbedder::default(),
        Arc::new(StubProjector { rows: IMAGE_TOKENS }),
    )
}

/// Default engine wiring with a custom embedder and projector.
pub fn harness_with_parts(
    transformer: ScriptedTransformer,
    embedder: StubEmbedder,
    projector: Arc<dyn VisionProjector>,
) -> Result<Harness> {
    build_harness(
        transformer,
        engine_config(),
        StubTokenizer::new(),
        embedder,
        projector,
    )
}

fn build_harness(
    transformer: ScriptedTransformer,
    config: EngineConfig,
    tokenizer: StubTokenizer,
    embedder: StubEmbedder,
    projector: Arc<dyn VisionProjector>,
) -> Result<Harness> {
    let transformer = Arc::new(transformer);
    let embedder = Arc::new(embedder);
    let collaborators = Collaborators {
        vision: Arc::new(StubVision),
        projector,
        embedder: embedder.clone(),
        transformer: transformer.clone(),
        tokenizer: Arc::new(tokenizer),
    };
    let engine = Engine::new(config, collaborators, &Device::Cpu, DType::F32)?;
    Ok(Harness {
        engine,
        transformer,
        embedder,
    })
}
