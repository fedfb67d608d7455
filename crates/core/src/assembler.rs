use std::ops::Range;

use candle_core::Tensor;
use tracing::debug;

use crate::{
    error::{EngineError, Result, Stage, StageContext},
    model::TokenEmbedder,
    tokenizer::{SpecialTokens, TextTokenizer, TokenId},
};

/// Projected features for one image, one row per placeholder position.
///
/// Consumed by value when spliced so a block cannot be injected twice.
#[derive(Debug)]
pub struct ImageFeatures {
    features: Tensor,
}

impl ImageFeatures {
    /// Accepts `[N, hidden]` or `[1, N, hidden]` projector output.
    pub fn new(features: Tensor) -> Result<Self> {
        let features = match features.rank() {
            2 => features,
            3 if features.dim(0).at_stage(Stage::Projection)? == 1 => {
                features.squeeze(0).at_stage(Stage::Projection)?
            }
            _ => {
                return Err(EngineError::config(format!(
                    "image features must be [N, hidden] or [1, N, hidden], got {:?}",
                    features.dims()
                )));
            }
        };
        Ok(Self { features })
    }

    pub fn len(&self) -> usize {
        self.features.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hidden_size(&self) -> usize {
        self.features.dims()[1]
    }

    pub fn tensor(&self) -> &Tensor {
        &self.features
    }

    pub fn into_inner(self) -> Tensor {
        self.features
    }
}

/// Token ids of an assembled prompt and where the image placeholders sit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptLayout {
    pub token_ids: Vec<TokenId>,
    pub image_span: Option<Range<usize>>,
}

impl PromptLayout {
    pub fn len(&self) -> usize {
        self.token_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_ids.is_empty()
    }
}

#[derive(Debug)]
pub struct AssembledPrompt {
    pub layout: PromptLayout,
    /// `[1, layout.len(), hidden]` with image features already in place.
    pub embeddings: Tensor,
}

/// Builds the initial token sequence and its embeddings.
#[derive(Debug, Clone)]
pub struct Assembler<'a> {
    special: &'a SpecialTokens,
    image_tokens: usize,
}

impl<'a> Assembler<'a> {
    pub fn new(special: &'a SpecialTokens, image_tokens: usize) -> Self {
        Self {
            special,
            image_tokens,
        }
    }

    /// `[bos] + user_turn + [image × N] + prompt + end_of_turn + model_turn`.
    ///
    /// The placeholder block is left out entirely for text-only requests.
    pub fn layout(&self, prompt_ids: &[TokenId], with_image: bool) -> PromptLayout {
        let special = self.special;
        let image_count = if with_image { self.image_tokens } else { 0 };
        let mut token_ids = Vec::with_capacity(
            1 + special.user_turn.len()
                + image_count
                + prompt_ids.len()
                + special.end_of_turn.len()
                + special.model_turn.len(),
        );
        token_ids.push(special.bos);
        token_ids.extend_from_slice(&special.user_turn);
        let start = token_ids.len();
        token_ids.extend(std::iter::repeat_n(special.image, image_count));
        let image_span = with_image.then(|| start..start + image_count);
        token_ids.extend_from_slice(prompt_ids);
        token_ids.extend_from_slice(&special.end_of_turn);
        token_ids.extend_from_slice(&special.model_turn);
        PromptLayout {
            token_ids,
            image_span,
        }
    }

    /// Tokenize `prompt`, lay the sequence out and resolve it to embeddings.
    pub fn assemble(
        &self,
        tokenizer: &dyn TextTokenizer,
        embedder: &dyn TokenEmbedder,
        prompt: &str,
        image: Option<ImageFeatures>,
    ) -> Result<AssembledPrompt> {
        if let Some(features) = &image {
            if features.len() != self.image_tokens {
                return Err(EngineError::config(format!(
                    "image feature block has {} vectors but {} placeholders are reserved",
                    features.len(),
                    self.image_tokens
                )));
            }
        }
        let prompt_ids = tokenizer.encode(prompt).at_stage(Stage::Tokenizer)?;
        let layout = self.layout(&prompt_ids, image.is_some());
        debug!(
            prompt_tokens = prompt_ids.len(),
            total_tokens = layout.len(),
            image_span = ?layout.image_span,
            "assembled prompt layout"
        );

        let embeddings = embedder
            .embed(&layout.token_ids)
            .at_stage(Stage::Embedding)?;
        let embeddings = match (image, &layout.image_span) {
            (Some(features), Some(span)) => splice_features(&embeddings, span.start, features)?,
            _ => embeddings,
        };
        Ok(AssembledPrompt { layout, embeddings })
    }
}

/// Overwrite rows `[start, start + N)` of a `[1, seq, hidden]` tensor with the feature block.
pub fn splice_features(embeddings: &Tensor, start: usize, features: ImageFeatures) -> Result<Tensor> {
    let (batch, seq_len, hidden) = embeddings.dims3().map_err(|_| {
        EngineError::config(format!(
            "embeddings must be [1, seq, hidden], got {:?}",
            embeddings.dims()
        ))
    })?;
    let count = features.len();
    if batch != 1 {
        return Err(EngineError::config(format!(
            "embeddings batch must be 1, got {batch}"
        )));
    }
    if features.hidden_size() != hidden {
        return Err(EngineError::config(format!(
            "image features have hidden size {} but embeddings have {hidden}",
            features.hidden_size()
        )));
    }
    let end = start
        .checked_add(count)
        .filter(|end| *end <= seq_len)
        .ok_or_else(|| {
            EngineError::config(format!(
                "image span {start}..{} falls outside embeddings of length {seq_len}",
                start.saturating_add(count)
            ))
        })?;
    let block = features
        .into_inner()
        .to_dtype(embeddings.dtype())
        .and_then(|t| t.to_device(embeddings.device()))
        .and_then(|t| t.unsqueeze(0))
        .at_stage(Stage::Assembly)?;
    embeddings
        .slice_assign(&[0..1, start..end, 0..hidden], &block)
        .at_stage(Stage::Assembly)
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};

    use super::*;

    fn special() -> SpecialTokens {
        SpecialTokens {
            bos: 2,
            image: 99,
            user_turn: vec![10, 11],
            end_of_turn: vec![106],
            model_turn: vec![20, 21],
        }
    }

    #[test]
    fn text_only_layout_has_no_placeholders() {
        let special = special();
        let layout = Assembler::new(&special, 4).layout(&[55], false);
        assert_eq!(layout.token_ids, vec![2, 10, 11, 55, 106, 20, 21]);
        assert!(layout.image_span.is_none());
    }

    #[test]
    fn batched_features_are_squeezed() -> anyhow::Result<()> {
        let features = ImageFeatures::new(Tensor::ones((1, 3, 2), DType::F32, &Device::Cpu)?)?;
        assert_eq!(features.tensor().dims(), &[3, 2]);
        assert_eq!((features.len(), features.hidden_size()), (3, 2));

        let batch_of_two = Tensor::ones((2, 3, 2), DType::F32, &Device::Cpu)?;
        assert!(ImageFeatures::new(batch_of_two).unwrap_err().is_config());
        Ok(())
    }

    #[test]
    fn splice_rejects_span_past_the_end() -> anyhow::Result<()> {
        let embeddings = Tensor::zeros((1, 3, 2), DType::F32, &Device::Cpu)?;
        let features = ImageFeatures::new(Tensor::ones((2, 2), DType::F32, &Device::Cpu)?)?;
        let err = splice_features(&embeddings, 2, features).unwrap_err();
        assert!(err.is_config());
        Ok(())
    }
}
