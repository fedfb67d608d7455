use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use candle_core::{DType, Device, Tensor};
use tracing::{debug, info, trace};

use crate::{
    assembler::AssembledPrompt,
    cache::CacheStore,
    error::{EngineError, Result, Stage, StageContext},
    model::{CausalTransformer, TokenEmbedder, TransformerInput},
    sampling::{Sampler, TokenSelectionParams, validate_sampling},
    streaming::TextStreamer,
    tokenizer::{StopTokens, TextTokenizer, TokenId},
};

pub const DEFAULT_REPETITION_WINDOW: usize = 128;
const STOP_STRING_WINDOW: usize = 64;
/// Report trailers the model spells in varying case and punctuation.
pub const DEFAULT_NORMALIZED_STOP_STRINGS: [&str; 2] = ["END OF REPORT", "Generated by KintaMed"];

/// Per-request decoding controls.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeParameters {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub repetition_penalty: f32,
    pub repetition_window: usize,
    pub seed: Option<u64>,
    /// Submit the prompt in chunks of at most this many positions.
    pub prefill_chunk: Option<usize>,
    pub time_budget: Option<Duration>,
    /// Matched verbatim against the decoded output.
    pub stop_strings: Vec<String>,
    /// Matched after folding both sides to lower-case alphanumerics, so `END OF REPORT` also
    /// stops on `end-of-report`. Only multi-word report trailers belong here.
    pub normalized_stop_strings: Vec<String>,
}

impl Default for DecodeParameters {
    fn default() -> Self {
        Self {
            max_new_tokens: 1024,
            temperature: 0.8,
            top_p: 0.9,
            repetition_penalty: 1.0,
            repetition_window: DEFAULT_REPETITION_WINDOW,
            seed: None,
            prefill_chunk: None,
            time_budget: None,
            stop_strings: Vec::new(),
            normalized_stop_strings: DEFAULT_NORMALIZED_STOP_STRINGS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl DecodeParameters {
    pub fn validate(&self) -> Result<()> {
        validate_sampling(self.temperature, self.top_p)?;
        if !(self.repetition_penalty.is_finite() && self.repetition_penalty > 0.0) {
            return Err(EngineError::config(format!(
                "repetition_penalty must be > 0, got {}",
                self.repetition_penalty
            )));
        }
        if self.prefill_chunk == Some(0) {
            return Err(EngineError::config("prefill_chunk must be at least 1"));
        }
        if self.stop_strings.iter().any(|s| s.is_empty()) {
            return Err(EngineError::config("stop strings must not be empty"));
        }
        if let Some(bad) = self
            .normalized_stop_strings
            .iter()
            .find(|s| fold_alphanumeric(s).is_empty())
        {
            return Err(EngineError::config(format!(
                "normalized stop string {bad:?} has no alphanumeric characters"
            )));
        }
        Ok(())
    }
}

impl TokenSelectionParams for DecodeParameters {
    fn temperature(&self) -> f64 {
        self.temperature
    }

    fn top_p(&self) -> f64 {
        self.top_p
    }

    fn repetition_penalty(&self) -> f32 {
        self.repetition_penalty
    }

    fn repetition_window(&self) -> usize {
        self.repetition_window
    }
}

/// Why a generation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// A stop id was sampled; it is not part of the output.
    StopToken { token_id: TokenId },
    /// The decoded output ended in a configured stop string.
    StopString(String),
    StepBudget,
    TimeBudget,
    Cancelled,
}

impl StopReason {
    pub fn is_budget_exceeded(&self) -> bool {
        matches!(self, StopReason::StepBudget | StopReason::TimeBudget)
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::StopToken { token_id } => write!(f, "stop token {token_id}"),
            StopReason::StopString(s) => write!(f, "stop string {s:?}"),
            StopReason::StepBudget => f.write_str("step budget exceeded"),
            StopReason::TimeBudget => f.write_str("time budget exceeded"),
            StopReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Assembling,
    Decoding,
    Terminated(StopReason),
    /// A stage failed; the cache has been released.
    Failed,
}

/// Final result of one request.
#[derive(Debug, Clone)]
pub struct DecodeOutcome {
    pub text: String,
    pub prompt_tokens: usize,
    pub response_tokens: usize,
    pub generated_tokens: Vec<TokenId>,
    pub stop_reason: StopReason,
}

/// Shared flag checked between steps.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// All-ones attention mask, one entry per position presented to the transformer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttentionMask {
    len: usize,
}

impl AttentionMask {
    pub fn new(len: usize) -> Self {
        Self { len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn extend(&mut self, positions: usize) {
        self.len += positions;
    }

    /// `[1, len]` i64 tensor of ones; `len` may cover only a prefix during chunked prefill.
    pub fn ones(len: usize, device: &Device) -> Result<Tensor> {
        Tensor::ones((1, len), DType::I64, device).at_stage(Stage::Transformer)
    }
}

#[derive(Debug, Clone)]
enum StopPattern {
    Exact(String),
    Folded { raw: String, folded: String },
}

impl StopPattern {
    fn raw(&self) -> &str {
        match self {
            StopPattern::Exact(raw) | StopPattern::Folded { raw, .. } => raw,
        }
    }
}

/// Matches configured stop strings against the tail of the decoded output.
///
/// Exact patterns must appear verbatim. Normalized patterns are compared against the window
/// folded to lower-case alphanumerics, so `END OF REPORT` also matches `endofreport`.
#[derive(Debug, Clone)]
pub struct StopStringMatcher {
    patterns: Vec<StopPattern>,
    window: String,
    capacity: usize,
}

impl StopStringMatcher {
    pub fn new(exact: &[String], normalized: &[String]) -> Self {
        let longest = exact
            .iter()
            .chain(normalized)
            .map(|p| p.chars().count())
            .max()
            .unwrap_or(0);
        let patterns = exact
            .iter()
            .map(|p| StopPattern::Exact(p.clone()))
            .chain(normalized.iter().filter_map(|p| {
                let folded = fold_alphanumeric(p);
                (!folded.is_empty()).then(|| StopPattern::Folded {
                    raw: p.clone(),
                    folded,
                })
            }))
            .collect();
        Self {
            patterns,
            window: String::new(),
            capacity: STOP_STRING_WINDOW.max(longest * 2),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Append `delta` and return the first pattern now present in the window.
    pub fn push(&mut self, delta: &str) -> Option<&str> {
        if delta.is_empty() {
            return None;
        }
        self.window.push_str(delta);
        let excess = self.window.chars().count().saturating_sub(self.capacity);
        if excess > 0 {
            let cut = self
                .window
                .char_indices()
                .nth(excess)
                .map(|(idx, _)| idx)
                .unwrap_or(self.window.len());
            self.window.drain(..cut);
        }
        let mut folded_window = None;
        let window = &self.window;
        self.patterns
            .iter()
            .find(|pattern| match pattern {
                StopPattern::Exact(raw) => window.contains(raw.as_str()),
                StopPattern::Folded { folded, .. } => folded_window
                    .get_or_insert_with(|| fold_alphanumeric(window))
                    .contains(folded.as_str()),
            })
            .map(StopPattern::raw)
    }
}

fn fold_alphanumeric(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Collaborators a generation borrows for its lifetime.
#[derive(Clone, Copy)]
pub struct DecodeContext<'e> {
    pub transformer: &'e dyn CausalTransformer,
    pub embedder: &'e dyn TokenEmbedder,
    pub tokenizer: &'e dyn TextTokenizer,
    pub stop_tokens: &'e StopTokens,
}

enum PendingInput {
    Prompt(Tensor),
    Token(TokenId),
}

/// One request's decoding state machine.
///
/// Starts in [`Phase::Assembling`] holding the assembled prompt; the first [`Generation::step`]
/// resets the cache, prefills the prompt and samples. Every later step submits exactly one
/// position. Iterating yields each emitted id before the next transformer call.
pub struct Generation<'e> {
    ctx: DecodeContext<'e>,
    params: DecodeParameters,
    phase: Phase,
    cache: Option<CacheStore>,
    mask: AttentionMask,
    pending: Option<PendingInput>,
    prompt_tokens: usize,
    generated: Vec<TokenId>,
    sampler: Sampler,
    stop_strings: StopStringMatcher,
    text: TextStreamer,
    cancel: CancelHandle,
    started: Instant,
    steps: usize,
}

impl<'e> Generation<'e> {
    pub fn new(
        ctx: DecodeContext<'e>,
        prompt: AssembledPrompt,
        cache: CacheStore,
        params: DecodeParameters,
    ) -> Result<Self> {
        params.validate()?;
        let prompt_tokens = prompt.layout.len();
        if prompt_tokens == 0 {
            return Err(EngineError::config("assembled prompt is empty"));
        }
        Ok(Self {
            ctx,
            sampler: Sampler::new(params.seed),
            stop_strings: StopStringMatcher::new(
                &params.stop_strings,
                &params.normalized_stop_strings,
            ),
            generated: Vec::with_capacity(params.max_new_tokens.min(4096)),
            params,
            phase: Phase::Assembling,
            cache: Some(cache),
            mask: AttentionMask::default(),
            pending: Some(PendingInput::Prompt(prompt.embeddings)),
            prompt_tokens,
            text: TextStreamer::new(),
            cancel: CancelHandle::new(),
            started: Instant::now(),
            steps: 0,
        })
    }

    pub fn set_cancel_handle(&mut self, cancel: CancelHandle) {
        self.cancel = cancel;
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn stop_reason(&self) -> Option<&StopReason> {
        match &self.phase {
            Phase::Terminated(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn generated(&self) -> &[TokenId] {
        &self.generated
    }

    pub fn prompt_tokens(&self) -> usize {
        self.prompt_tokens
    }

    pub fn mask(&self) -> AttentionMask {
        self.mask
    }

    /// The live cache, absent once the generation has failed.
    pub fn cache(&self) -> Option<&CacheStore> {
        self.cache.as_ref()
    }

    /// Run one transition and return the emitted id, or `None` once terminated.
    pub fn step(&mut self) -> Result<Option<TokenId>> {
        match self.phase {
            Phase::Terminated(_) | Phase::Failed => return Ok(None),
            Phase::Assembling | Phase::Decoding => {}
        }
        match self.advance() {
            Ok(token) => Ok(token),
            Err(err) => {
                self.phase = Phase::Failed;
                self.cache = None;
                self.pending = None;
                debug!(error = %err, "generation failed, cache released");
                Err(err)
            }
        }
    }

    fn advance(&mut self) -> Result<Option<TokenId>> {
        if self.phase == Phase::Assembling {
            self.enter_decoding()?;
        }
        if let Some(reason) = self.budget_exhausted() {
            self.terminate(reason);
            return Ok(None);
        }

        let logits = match self.pending.take() {
            Some(PendingInput::Prompt(embeddings)) => self.prefill(&embeddings)?,
            Some(PendingInput::Token(token)) => {
                let embeddings = self
                    .ctx
                    .embedder
                    .embed(&[token])
                    .at_stage(Stage::Embedding)?;
                self.mask.extend(1);
                self.run_transformer(&embeddings, self.mask.len())?
            }
            None => {
                return Err(EngineError::invariant(
                    Stage::Assembly,
                    "decode step has no pending input",
                ));
            }
        };
        self.steps += 1;

        let token = self.sampler.sample(&logits, &self.params, &self.generated)?;
        if self.ctx.stop_tokens.contains(token) {
            self.terminate(StopReason::StopToken { token_id: token });
            return Ok(None);
        }
        self.generated.push(token);
        trace!(step = self.steps, token, "emitted token");

        if !self.stop_strings.is_empty() {
            let delta = self
                .text
                .push(self.ctx.tokenizer, &self.generated, false)?;
            if let Some(matched) = self.stop_strings.push(&delta) {
                let matched = matched.to_owned();
                self.terminate(StopReason::StopString(matched));
                return Ok(Some(token));
            }
        }
        self.pending = Some(PendingInput::Token(token));
        Ok(Some(token))
    }

    fn enter_decoding(&mut self) -> Result<()> {
        let cache = self.cache_mut()?;
        let geometry = cache.geometry();
        cache.reset(geometry.num_layers, geometry.kv_heads, geometry.head_dim)?;
        self.mask = AttentionMask::new(self.prompt_tokens);
        self.started = Instant::now();
        self.phase = Phase::Decoding;
        debug!(
            prompt_tokens = self.prompt_tokens,
            layers = geometry.num_layers,
            "entering decode phase"
        );
        Ok(())
    }

    fn budget_exhausted(&self) -> Option<StopReason> {
        if self.cancel.is_cancelled() {
            return Some(StopReason::Cancelled);
        }
        if self.generated.len() >= self.params.max_new_tokens {
            return Some(StopReason::StepBudget);
        }
        match self.params.time_budget {
            Some(budget) if self.started.elapsed() >= budget => Some(StopReason::TimeBudget),
            _ => None,
        }
    }

    /// Submit the prompt, whole or in chunks, and return logits for its last position.
    fn prefill(&mut self, embeddings: &Tensor) -> Result<Tensor> {
        let (_, seq_len, _) = embeddings.dims3().at_stage(Stage::Assembly)?;
        if seq_len != self.prompt_tokens {
            return Err(EngineError::invariant(
                Stage::Embedding,
                format!(
                    "prompt embeddings cover {seq_len} positions, layout has {}",
                    self.prompt_tokens
                ),
            ));
        }
        let chunk = self.params.prefill_chunk.unwrap_or(seq_len).min(seq_len);
        let mut offset = 0;
        let mut last_logits = None;
        while offset < seq_len {
            let len = chunk.min(seq_len - offset);
            let part = if len == seq_len {
                embeddings.clone()
            } else {
                embeddings.narrow(1, offset, len).at_stage(Stage::Assembly)?
            };
            offset += len;
            debug!(offset, chunk = len, total = seq_len, "prefill chunk");
            last_logits = Some(self.run_transformer(&part, offset)?);
        }
        last_logits
            .ok_or_else(|| EngineError::invariant(Stage::Assembly, "prefill submitted nothing"))
    }

    /// One transformer call covering `presented` positions in total.
    fn run_transformer(&mut self, inputs_embeds: &Tensor, presented: usize) -> Result<Tensor> {
        let transformer = self.ctx.transformer;
        let (_, submitted, _) = inputs_embeds.dims3().at_stage(Stage::Embedding)?;
        let cache = self.cache.as_mut().ok_or_else(released)?;
        let cached = cache.positions()?;
        if presented != cached + submitted {
            return Err(EngineError::invariant(
                Stage::Embedding,
                format!(
                    "attention mask covers {presented} positions but cache holds {cached} and \
                     {submitted} are submitted"
                ),
            ));
        }
        let attention_mask = AttentionMask::ones(presented, cache.device())?;
        let output = transformer
            .forward(TransformerInput {
                inputs_embeds,
                attention_mask: &attention_mask,
                past: cache.layers(),
            })
            .at_stage(Stage::Transformer)?;

        // A present cache the store rejects is the transformer's fault.
        cache
            .update_all(output.present)
            .map_err(|err| err.blame(Stage::Transformer))?;
        let positions = cache.positions()?;
        if positions != presented {
            return Err(EngineError::invariant(
                Stage::Transformer,
                format!("cache holds {positions} positions after a call presenting {presented}"),
            ));
        }
        trace!(
            cache_positions = positions,
            mask_len = presented,
            cache_bytes = cache.storage_bytes(),
            "transformer step"
        );
        last_position_logits(&output.logits, submitted)
    }

    fn cache_mut(&mut self) -> Result<&mut CacheStore> {
        self.cache.as_mut().ok_or_else(released)
    }

    fn terminate(&mut self, reason: StopReason) {
        info!(
            generated = self.generated.len(),
            steps = self.steps,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            reason = %reason,
            "generation finished"
        );
        self.pending = None;
        self.phase = Phase::Terminated(reason);
    }

    /// Drive the generation to completion and decode the emitted ids.
    pub fn finish(mut self) -> Result<DecodeOutcome> {
        while self.step()?.is_some() {}
        let stop_reason = self
            .stop_reason()
            .cloned()
            .ok_or_else(|| {
                EngineError::invariant(Stage::Sampling, "generation ended without a reason")
            })?;
        let decoded = self
            .ctx
            .tokenizer
            .decode(&self.generated)
            .at_stage(Stage::Tokenizer)?;
        Ok(DecodeOutcome {
            text: normalize_text(&decoded),
            prompt_tokens: self.prompt_tokens,
            response_tokens: self.generated.len(),
            generated_tokens: self.generated,
            stop_reason,
        })
    }
}

impl Iterator for Generation<'_> {
    type Item = Result<TokenId>;

    fn next(&mut self) -> Option<Self::Item> {
        self.step().transpose()
    }
}

fn released() -> EngineError {
    EngineError::invariant(Stage::Cache, "cache was released after a failure")
}

/// Pick the logits row for the final submitted position as a 1-D tensor.
fn last_position_logits(logits: &Tensor, submitted: usize) -> Result<Tensor> {
    let (batch, rows, _) = logits.dims3().map_err(|_| {
        EngineError::invariant(
            Stage::Transformer,
            format!(
                "logits must be [1, positions, vocab], got {:?}",
                logits.dims()
            ),
        )
    })?;
    if batch != 1 || (rows != submitted && rows != 1) {
        return Err(EngineError::invariant(
            Stage::Transformer,
            format!(
                "logits shape {:?} does not match {submitted} submitted positions",
                logits.dims()
            ),
        ));
    }
    logits
        .get(0)
        .and_then(|row| row.get(rows - 1))
        .at_stage(Stage::Sampling)
}

/// Normalise decoder output by stripping turn markers and Windows line-endings.
pub fn normalize_text(s: &str) -> String {
    s.replace("\r\n", "\n")
        .replace("<end_of_turn>", "")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_string_matches_across_deltas() {
        let mut matcher = StopStringMatcher::new(&["END OF REPORT".to_string()], &[]);
        assert_eq!(matcher.push("Impression: clear. END OF"), None);
        assert_eq!(matcher.push(" REPORT"), Some("END OF REPORT"));
    }

    #[test]
    fn normalized_stop_string_matches_folded_form() {
        let mut matcher = StopStringMatcher::new(&[], &["END OF REPORT".to_string()]);
        assert_eq!(matcher.push("...end-of-report"), Some("END OF REPORT"));
    }

    #[test]
    fn exact_stop_strings_ignore_folded_text() {
        let mut matcher = StopStringMatcher::new(&["END OF REPORT".to_string()], &[]);
        assert_eq!(matcher.push("...end-of-report"), None);
    }

    #[test]
    fn short_stop_strings_do_not_match_inside_words() {
        let mut matcher = StopStringMatcher::new(&["END".to_string(), "Note:".to_string()], &[]);
        assert_eq!(matcher.push("We recommend follow-up. "), None);
        assert_eq!(matcher.push("The findings denote a notable effusion."), None);
        assert_eq!(matcher.push(" Note: none"), Some("Note:"));
    }

    #[test]
    fn stop_string_window_is_bounded() {
        let mut matcher = StopStringMatcher::new(&["zz".to_string()], &[]);
        for _ in 0..100 {
            matcher.push("abc");
        }
        assert!(matcher.window.chars().count() <= STOP_STRING_WINDOW);
        assert_eq!(matcher.push("zz"), Some("zz"));
    }

    #[test]
    fn budget_reasons_are_distinct_from_stop_token() {
        assert!(StopReason::StepBudget.is_budget_exceeded());
        assert!(StopReason::TimeBudget.is_budget_exceeded());
        assert!(!StopReason::StopToken { token_id: 106 }.is_budget_exceeded());
        assert!(!StopReason::Cancelled.is_budget_exceeded());
    }

    #[test]
    fn invalid_parameters_are_configuration_errors() {
        for params in [
            DecodeParameters {
                temperature: 0.0,
                ..Default::default()
            },
            DecodeParameters {
                top_p: 1.5,
                ..Default::default()
            },
            DecodeParameters {
                top_p: 0.0,
                ..Default::default()
            },
            DecodeParameters {
                prefill_chunk: Some(0),
                ..Default::default()
            },
            DecodeParameters {
                normalized_stop_strings: vec!["--".into()],
                ..Default::default()
            },
        ] {
            assert!(params.validate().unwrap_err().is_config());
        }
    }
}
