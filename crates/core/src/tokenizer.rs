use std::{collections::BTreeSet, ops::Deref};

use anyhow::{Result as AnyResult, anyhow};
use tokenizers::Tokenizer;
use tracing::{debug, warn};

use crate::{
    config::{EngineConfig, PromptTemplate},
    error::{EngineError, Result, Stage, StageContext},
};

pub type TokenId = u32;

/// Text/id conversion required by the engine.
pub trait TextTokenizer: Send + Sync {
    /// Encode `text` without adding model-specific special tokens.
    fn encode(&self, text: &str) -> AnyResult<Vec<TokenId>>;
    fn decode(&self, ids: &[TokenId]) -> AnyResult<String>;
    /// Exact vocabulary lookup for a single token literal.
    fn token_to_id(&self, token: &str) -> Option<TokenId>;
}

impl TextTokenizer for Tokenizer {
    fn encode(&self, text: &str) -> AnyResult<Vec<TokenId>> {
        let encoding = self
            .deref()
            .encode(text, false)
            .map_err(|err| anyhow!("tokenization failed: {err}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[TokenId]) -> AnyResult<String> {
        self.deref()
            .decode(ids, false)
            .map_err(|err| anyhow!("detokenization failed: {err}"))
    }

    fn token_to_id(&self, token: &str) -> Option<TokenId> {
        self.deref().token_to_id(token)
    }
}

/// Prompt framing resolved to concrete ids for one tokenizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecialTokens {
    pub bos: TokenId,
    pub image: TokenId,
    pub user_turn: Vec<TokenId>,
    pub end_of_turn: Vec<TokenId>,
    pub model_turn: Vec<TokenId>,
}

impl SpecialTokens {
    pub fn resolve(tokenizer: &dyn TextTokenizer, template: &PromptTemplate) -> Result<Self> {
        let image = resolve_image_token(tokenizer, template)?;
        let encode = |text: &str, what: &str| -> Result<Vec<TokenId>> {
            let ids = tokenizer.encode(text).at_stage(Stage::Tokenizer)?;
            if ids.is_empty() {
                return Err(EngineError::config(format!(
                    "{what} marker {text:?} encodes to no tokens"
                )));
            }
            Ok(ids)
        };
        let special = Self {
            bos: template.bos_token_id,
            image,
            user_turn: encode(&template.user_turn, "user turn")?,
            end_of_turn: encode(&template.end_of_turn, "end of turn")?,
            model_turn: encode(&template.model_turn, "model turn")?,
        };
        debug!(
            bos = special.bos,
            image = special.image,
            user_turn = ?special.user_turn,
            end_of_turn = ?special.end_of_turn,
            model_turn = ?special.model_turn,
            "resolved prompt special tokens"
        );
        Ok(special)
    }
}

/// Looks the placeholder literal up in the vocabulary, falling back to encoding it and keeping
/// the single non-BOS id when that id decodes back to the literal.
fn resolve_image_token(tokenizer: &dyn TextTokenizer, template: &PromptTemplate) -> Result<TokenId> {
    let literal = template.image_token.as_str();
    if let Some(id) = tokenizer.token_to_id(literal) {
        return Ok(id);
    }
    let encoded = tokenizer.encode(literal).map_err(|err| {
        EngineError::config(format!(
            "image placeholder {literal:?} is not in the vocabulary: {err}"
        ))
    })?;
    let candidates: Vec<TokenId> = encoded
        .iter()
        .copied()
        .filter(|id| *id != template.bos_token_id)
        .collect();
    let round_trips = |id: TokenId| {
        tokenizer
            .decode(&[id])
            .map(|text| text.trim() == literal)
            .unwrap_or(false)
    };
    match candidates.as_slice() {
        [id] if round_trips(*id) => {
            warn!(
                token = %template.image_token,
                id,
                "image placeholder missing from vocabulary lookup, using encoded id"
            );
            Ok(*id)
        }
        _ => Err(EngineError::config(format!(
            "image placeholder {:?} is not a single vocabulary token (encodes to {encoded:?})",
            template.image_token
        ))),
    }
}

/// Set of ids that end generation when sampled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopTokens {
    ids: BTreeSet<TokenId>,
}

impl StopTokens {
    pub fn new(ids: impl IntoIterator<Item = TokenId>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
        }
    }

    /// Builds the stop set from explicit ids plus literals looked up in the vocabulary.
    pub fn from_config(config: &EngineConfig, tokenizer: &dyn TextTokenizer) -> Result<Self> {
        let mut ids: BTreeSet<TokenId> = config.stop_token_ids.iter().copied().collect();
        for literal in &config.stop_tokens {
            let id = tokenizer.token_to_id(literal).ok_or_else(|| {
                EngineError::config(format!("stop token {literal:?} is not in the vocabulary"))
            })?;
            ids.insert(id);
        }
        if ids.is_empty() {
            return Err(EngineError::config("stop token set is empty"));
        }
        Ok(Self { ids })
    }

    pub fn contains(&self, id: TokenId) -> bool {
        self.ids.contains(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = TokenId> + '_ {
        self.ids.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
