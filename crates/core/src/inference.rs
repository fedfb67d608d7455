use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use image::DynamicImage;
use tracing::{debug, info};

use crate::{
    assembler::{Assembler, ImageFeatures, PromptLayout},
    cache::CacheStore,
    config::EngineConfig,
    decode::{DecodeContext, DecodeOutcome, DecodeParameters, Generation},
    error::{EngineError, Result, Stage, StageContext},
    model::{CausalTransformer, TokenEmbedder, VisionEncoder, VisionProjector},
    tokenizer::{SpecialTokens, StopTokens, TextTokenizer, TokenId},
    vision::ImagePreprocessor,
};

/// The sub-models one engine drives.
#[derive(Clone)]
pub struct Collaborators {
    pub vision: Arc<dyn VisionEncoder>,
    pub projector: Arc<dyn VisionProjector>,
    pub embedder: Arc<dyn TokenEmbedder>,
    pub transformer: Arc<dyn CausalTransformer>,
    pub tokenizer: Arc<dyn TextTokenizer>,
}

/// Entry point turning an image and a prompt into generated tokens.
///
/// Construction resolves every special token up front so that a misconfigured vocabulary fails
/// before any model runs. Requests are independent and may run concurrently on a shared engine;
/// each one owns its own [`CacheStore`].
pub struct Engine {
    config: EngineConfig,
    collaborators: Collaborators,
    special: SpecialTokens,
    stop_tokens: StopTokens,
    preprocessor: ImagePreprocessor,
    device: Device,
    cache_dtype: DType,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        collaborators: Collaborators,
        device: &Device,
        cache_dtype: DType,
    ) -> Result<Self> {
        config.validate()?;
        let tokenizer = collaborators.tokenizer.as_ref();
        let special = SpecialTokens::resolve(tokenizer, &config.template)?;
        let stop_tokens = StopTokens::from_config(&config, tokenizer)?;
        let preprocessor = ImagePreprocessor::new(config.image_size, device, DType::F32);
        info!(
            layers = config.cache.num_layers,
            kv_heads = config.cache.kv_heads,
            head_dim = config.cache.head_dim,
            image_tokens = config.image_tokens,
            stop_tokens = ?stop_tokens.iter().collect::<Vec<_>>(),
            "engine ready"
        );
        Ok(Self {
            config,
            collaborators,
            special,
            stop_tokens,
            preprocessor,
            device: device.clone(),
            cache_dtype,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn special_tokens(&self) -> &SpecialTokens {
        &self.special
    }

    pub fn stop_tokens(&self) -> &StopTokens {
        &self.stop_tokens
    }

    pub fn tokenizer(&self) -> &dyn TextTokenizer {
        self.collaborators.tokenizer.as_ref()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Preprocess, encode and project one image.
    pub fn encode_image(&self, image: &DynamicImage) -> Result<ImageFeatures> {
        let pixel_values = self.preprocessor.preprocess(image).at_stage(Stage::Vision)?;
        self.encode_pixels(&pixel_values)
    }

    /// Encode and project an already normalized `[1, 3, S, S]` tensor.
    pub fn encode_pixels(&self, pixel_values: &Tensor) -> Result<ImageFeatures> {
        let visual = self
            .collaborators
            .vision
            .encode(pixel_values)
            .at_stage(Stage::Vision)?;
        debug!(shape = ?visual.dims(), "vision encoder output");
        let projected = self
            .collaborators
            .projector
            .project(&visual)
            .at_stage(Stage::Projection)?;
        debug!(shape = ?projected.dims(), "projector output");
        let features = ImageFeatures::new(projected)?;
        if features.hidden_size() != self.config.hidden_size {
            return Err(EngineError::config(format!(
                "projector produced hidden size {}, expected {}",
                features.hidden_size(),
                self.config.hidden_size
            )));
        }
        Ok(features)
    }

    /// Token layout for `prompt` without touching any model.
    pub fn layout(&self, prompt: &str, with_image: bool) -> Result<PromptLayout> {
        let prompt_ids = self.tokenizer().encode(prompt).at_stage(Stage::Tokenizer)?;
        Ok(self.assembler().layout(&prompt_ids, with_image))
    }

    /// Encode the image (when given) and return a generation ready to step.
    pub fn start(
        &self,
        prompt: &str,
        image: Option<&DynamicImage>,
        params: DecodeParameters,
    ) -> Result<Generation<'_>> {
        params.validate()?;
        let features = image.map(|img| self.encode_image(img)).transpose()?;
        self.start_with_features(prompt, features, params)
    }

    /// Start from a feature block produced elsewhere.
    pub fn start_with_features(
        &self,
        prompt: &str,
        features: Option<ImageFeatures>,
        params: DecodeParameters,
    ) -> Result<Generation<'_>> {
        params.validate()?;
        let assembled = self.assembler().assemble(
            self.tokenizer(),
            self.collaborators.embedder.as_ref(),
            prompt,
            features,
        )?;
        let cache = CacheStore::new(self.config.cache, self.cache_dtype, &self.device)?;
        Generation::new(self.decode_context(), assembled, cache, params)
    }

    /// Run a request to completion, reporting progress after each emitted token.
    pub fn generate(
        &self,
        prompt: &str,
        image: Option<&DynamicImage>,
        params: DecodeParameters,
        on_token: Option<&dyn Fn(usize, &[TokenId])>,
    ) -> Result<DecodeOutcome> {
        let mut generation = self.start(prompt, image, params)?;
        while generation.step()?.is_some() {
            if let Some(callback) = on_token {
                let generated = generation.generated();
                callback(generated.len(), generated);
            }
        }
        generation.finish()
    }

    fn assembler(&self) -> Assembler<'_> {
        Assembler::new(&self.special, self.config.image_tokens)
    }

    fn decode_context(&self) -> DecodeContext<'_> {
        DecodeContext {
            transformer: self.collaborators.transformer.as_ref(),
            embedder: self.collaborators.embedder.as_ref(),
            tokenizer: self.collaborators.tokenizer.as_ref(),
            stop_tokens: &self.stop_tokens,
        }
    }
}
