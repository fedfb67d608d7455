//! Contracts for the sub-models the engine drives.
//!
//! Each collaborator is invoked through `&self` and may be shared between requests; the engine
//! never locks around them. Failures are reported as `anyhow` errors and tagged with the stage
//! that produced them before reaching the caller.

use anyhow::Result;
use candle_core::Tensor;

use crate::{cache::LayerKv, tokenizer::TokenId};

/// Turns a normalized `[1, 3, S, S]` pixel tensor into raw visual features.
pub trait VisionEncoder: Send + Sync {
    fn encode(&self, pixel_values: &Tensor) -> Result<Tensor>;
}

/// Maps raw visual features into the language model's hidden space.
///
/// The output holds one vector per image placeholder, shaped `[N, hidden]` or `[1, N, hidden]`.
pub trait VisionProjector: Send + Sync {
    fn project(&self, visual_features: &Tensor) -> Result<Tensor>;
}

/// Token embedding lookup returning `[1, ids.len(), hidden]`.
pub trait TokenEmbedder: Send + Sync {
    fn embed(&self, ids: &[TokenId]) -> Result<Tensor>;
}

/// Inputs for one transformer invocation.
#[derive(Debug)]
pub struct TransformerInput<'a> {
    /// Embeddings for the positions submitted this call, `[1, new_positions, hidden]`.
    pub inputs_embeds: &'a Tensor,
    /// `[1, total_positions]` of ones covering cached plus submitted positions.
    pub attention_mask: &'a Tensor,
    /// Per-layer cache in layer order.
    pub past: &'a [LayerKv],
}

#[derive(Debug)]
pub struct TransformerOutput {
    /// `[1, new_positions, vocab]`.
    pub logits: Tensor,
    /// Per-layer cache already extended with the submitted positions.
    pub present: Vec<LayerKv>,
}

/// Causal decoder with an external key/value cache.
pub trait CausalTransformer: Send + Sync {
    fn forward(&self, input: TransformerInput<'_>) -> Result<TransformerOutput>;
}
