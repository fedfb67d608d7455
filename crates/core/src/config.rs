use serde::{Deserialize, Serialize};

use crate::{
    cache::CacheGeometry,
    error::{EngineError, Result},
    tokenizer::TokenId,
};

/// Model-specific constants for one deployed checkpoint.
///
/// Defaults describe the 4B MedGemma export (Gemma 3 text stack with a SigLIP tower).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub hidden_size: usize,
    /// Number of projected feature vectors per image, and placeholders reserved for them.
    pub image_tokens: usize,
    /// Square side the vision encoder expects.
    pub image_size: u32,
    /// Token ids that terminate generation when sampled.
    pub stop_token_ids: Vec<TokenId>,
    /// Token literals resolved through the vocabulary and added to the stop set.
    pub stop_tokens: Vec<String>,
    pub cache: CacheGeometry,
    pub template: PromptTemplate,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache: CacheGeometry::default(),
            hidden_size: 2560,
            image_tokens: 256,
            image_size: 896,
            template: PromptTemplate::default(),
            stop_token_ids: vec![1, 106],
            stop_tokens: vec!["<end_of_turn>".to_string()],
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        if self.hidden_size == 0 {
            return Err(EngineError::config("hidden_size must be non-zero"));
        }
        if self.image_size == 0 {
            return Err(EngineError::config("image_size must be non-zero"));
        }
        if self.template.image_token.is_empty() {
            return Err(EngineError::config("image placeholder literal is empty"));
        }
        if self.stop_token_ids.is_empty() && self.stop_tokens.is_empty() {
            return Err(EngineError::config(
                "at least one stop token id or stop token literal is required",
            ));
        }
        Ok(())
    }
}

/// Chat framing around the user prompt.
///
/// The turn strings are encoded with the tokenizer; the image literal must map to a single
/// vocabulary entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PromptTemplate {
    /// Id prepended to every sequence.
    pub bos_token_id: TokenId,
    pub image_token: String,
    pub user_turn: String,
    pub end_of_turn: String,
    pub model_turn: String,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            bos_token_id: 2,
            image_token: "<image>".to_string(),
            user_turn: "<start_of_turn>user\n".to_string(),
            end_of_turn: "<end_of_turn>".to_string(),
            model_turn: "\n<start_of_turn>model\n".to_string(),
        }
    }
}
