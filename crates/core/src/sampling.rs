use std::{cmp::Ordering, collections::HashSet};

use candle_core::{DType, Tensor};
use rand::{
    SeedableRng,
    distributions::{Distribution, WeightedIndex},
    rngs::StdRng,
};

use crate::{
    error::{EngineError, Result, Stage, StageContext},
    tokenizer::TokenId,
};

/// Parameters consumed by [`Sampler`] for each step.
pub trait TokenSelectionParams {
    fn temperature(&self) -> f64;
    fn top_p(&self) -> f64;
    /// Multiplicative penalty for recently generated ids; `1.0` disables it.
    fn repetition_penalty(&self) -> f32;
    /// Number of most recent generated ids the penalty looks at.
    fn repetition_window(&self) -> usize;
}

/// Create a deterministic RNG when a seed is provided.
pub fn init_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(value) => StdRng::seed_from_u64(value),
        None => StdRng::from_entropy(),
    }
}

/// Reject temperature/top-p combinations the nucleus sampler cannot honour.
pub fn validate_sampling(temperature: f64, top_p: f64) -> Result<()> {
    if !(temperature.is_finite() && temperature > 0.0) {
        return Err(EngineError::config(format!(
            "temperature must be > 0, got {temperature}"
        )));
    }
    if !(top_p > 0.0 && top_p <= 1.0) {
        return Err(EngineError::config(format!(
            "top_p must be in (0, 1], got {top_p}"
        )));
    }
    Ok(())
}

/// Temperature + nucleus token selection with an owned RNG.
#[derive(Debug)]
pub struct Sampler {
    rng: StdRng,
}

impl Sampler {
    pub fn new(seed: Option<u64>) -> Self {
        Self {
            rng: init_rng(seed),
        }
    }

    /// Pick the next token from a 1-D logits tensor.
    ///
    /// `recent` holds the ids generated so far; only the configured window of it feeds the
    /// repetition penalty.
    pub fn sample<P: TokenSelectionParams>(
        &mut self,
        logits: &Tensor,
        params: &P,
        recent: &[TokenId],
    ) -> Result<TokenId> {
        let mut scores = logits
            .to_dtype(DType::F32)
            .and_then(|t| t.flatten_all())
            .and_then(|t| t.to_vec1::<f32>())
            .at_stage(Stage::Sampling)?;
        let window_start = recent.len().saturating_sub(params.repetition_window());
        apply_repetition_penalty(
            &mut scores,
            &recent[window_start..],
            params.repetition_penalty(),
        );
        let index = self.sample_index(&scores, params.temperature(), params.top_p())?;
        TokenId::try_from(index).map_err(|_| {
            EngineError::Numerical(format!("sampled index {index} does not fit a token id"))
        })
    }

    pub fn sample_index(&mut self, scores: &[f32], temperature: f64, top_p: f64) -> Result<usize> {
        let probs = nucleus_distribution(scores, temperature, top_p)?;
        let dist = WeightedIndex::new(&probs).map_err(|err| {
            EngineError::Numerical(format!("cannot build sampling distribution: {err}"))
        })?;
        Ok(dist.sample(&mut self.rng))
    }
}

/// Probability distribution over `scores` after temperature scaling and nucleus truncation.
///
/// Entries outside the nucleus are exactly zero and the remainder sums to one. The nucleus is
/// the smallest prefix of the descending-probability order whose cumulative mass reaches
/// `top_p`; it always holds at least the arg-max. `top_p == 1.0` keeps every entry.
pub fn nucleus_distribution(scores: &[f32], temperature: f64, top_p: f64) -> Result<Vec<f64>> {
    validate_sampling(temperature, top_p)?;
    if scores.is_empty() {
        return Err(EngineError::Numerical("logits are empty".into()));
    }
    if let Some(idx) = scores.iter().position(|v| v.is_nan()) {
        return Err(EngineError::Numerical(format!("logit {idx} is NaN")));
    }

    let scaled: Vec<f64> = scores.iter().map(|&v| v as f64 / temperature).collect();
    let max = scaled.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return Err(EngineError::Numerical(format!(
            "maximum scaled logit is {max}"
        )));
    }
    let weights: Vec<f64> = scaled.iter().map(|v| (v - max).exp()).collect();
    let total: f64 = weights.iter().sum();
    if !(total.is_finite() && total > 0.0) {
        return Err(EngineError::Numerical(format!(
            "softmax normaliser is {total}"
        )));
    }
    let probs: Vec<f64> = weights.iter().map(|w| w / total).collect();
    if top_p >= 1.0 {
        return Ok(probs);
    }

    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs[b].partial_cmp(&probs[a]).unwrap_or(Ordering::Equal));
    let mut cumulative = 0.0;
    let mut keep = order.len();
    for (rank, &idx) in order.iter().enumerate() {
        cumulative += probs[idx];
        if cumulative >= top_p {
            keep = rank + 1;
            break;
        }
    }

    let mut truncated = vec![0.0; probs.len()];
    let mut kept_mass = 0.0;
    for &idx in &order[..keep] {
        truncated[idx] = probs[idx];
        kept_mass += probs[idx];
    }
    if !(kept_mass.is_finite() && kept_mass > 0.0) {
        return Err(EngineError::Numerical(format!(
            "nucleus mass is {kept_mass}"
        )));
    }
    for value in &mut truncated {
        *value /= kept_mass;
    }
    Ok(truncated)
}

/// Divide positive and multiply negative logits of every id in `context` by `penalty`.
pub fn apply_repetition_penalty(scores: &mut [f32], context: &[TokenId], penalty: f32) {
    if penalty <= 0.0 || (penalty - 1.0).abs() <= f32::EPSILON {
        return;
    }
    let mut seen = HashSet::new();
    for &token in context {
        let index = token as usize;
        if index < scores.len() && seen.insert(index) {
            let entry = &mut scores[index];
            if *entry > 0.0 {
                *entry /= penalty;
            } else {
                *entry *= penalty;
            }
        }
    }
}
