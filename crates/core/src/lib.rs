//! Multimodal autoregressive decoding engine.
//!
//! The engine assembles a prompt around projected image features, drives a causal transformer
//! step by step with an external key/value cache, and samples one token per step until a stop
//! condition is reached.

pub mod assembler;
pub mod cache;
pub mod config;
pub mod decode;
pub mod error;
pub mod inference;
pub mod model;
pub mod runtime;
pub mod sampling;
pub mod streaming;
pub mod tokenizer;
pub mod vision;

pub use assembler::{AssembledPrompt, Assembler, ImageFeatures, PromptLayout};
pub use cache::{CacheGeometry, CacheStore, LayerKv};
pub use config::{EngineConfig, PromptTemplate};
pub use decode::{
    AttentionMask, CancelHandle, DecodeOutcome, DecodeParameters, Generation, Phase, StopReason,
};
pub use error::{EngineError, Result, Stage};
pub use inference::{Collaborators, Engine};
pub use model::{
    CausalTransformer, TokenEmbedder, TransformerInput, TransformerOutput, VisionEncoder,
    VisionProjector,
};
pub use streaming::{GenerationStream, StreamEvent, TextStreamer, spawn_generation};
pub use tokenizer::{SpecialTokens, StopTokens, TextTokenizer, TokenId};
