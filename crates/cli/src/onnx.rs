//! Collaborators backed by the exported ONNX graphs, evaluated with candle-onnx.

use std::{collections::HashMap, path::Path, sync::Arc};

use anyhow::{Context, Result, anyhow, ensure};
use candle_core::{DType, Device, Tensor};
use candle_onnx::onnx::ModelProto;
use medgemma_config::{LocalFileSystem, ModelResources};
use medgemma_core::{
    CausalTransformer, Collaborators, LayerKv, TokenEmbedder, TokenId, TransformerInput,
    TransformerOutput, VisionEncoder, VisionProjector, tokenizer::TextTokenizer,
};
use tracing::{debug, info};

use crate::resources::require_file;

const PIXEL_VALUES: &str = "pixel_values";
const IMAGE_FEATURES: &str = "image_features";
const VISUAL_TOKENS: &str = "visual_tokens";
const INPUT_IDS: &str = "input_ids";
const EMBEDDINGS: &str = "embeddings";
const INPUTS_EMBEDS: &str = "inputs_embeds";
const ATTENTION_MASK: &str = "attention_mask";
const LOGITS: &str = "logits";

/// A parsed graph together with its declared input and output names.
pub struct OnnxGraph {
    name: String,
    model: ModelProto,
    inputs: Vec<String>,
    outputs: Vec<String>,
}

impl OnnxGraph {
    pub fn load(path: &Path) -> Result<Self> {
        let model = candle_onnx::read_file(path)
            .with_context(|| format!("failed to read ONNX graph {}", path.display()))?;
        let graph = model
            .graph
            .as_ref()
            .ok_or_else(|| anyhow!("{} contains no graph", path.display()))?;
        let inputs = graph.input.iter().map(|v| v.name.clone()).collect();
        let outputs = graph.output.iter().map(|v| v.name.clone()).collect();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self {
            name,
            model,
            inputs,
            outputs,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    /// `preferred` when the graph declares it, otherwise its first input.
    fn input_name(&self, preferred: &str) -> Result<String> {
        pick(&self.inputs, preferred).with_context(|| format!("{} declares no inputs", self.name))
    }

    fn output_name(&self, preferred: &str) -> Result<String> {
        pick(&self.outputs, preferred)
            .with_context(|| format!("{} declares no outputs", self.name))
    }

    fn run(&self, feeds: HashMap<String, Tensor>) -> Result<HashMap<String, Tensor>> {
        candle_onnx::simple_eval(&self.model, feeds)
            .with_context(|| format!("evaluating {} failed", self.name))
    }
}

fn pick(names: &[String], preferred: &str) -> Option<String> {
    names
        .iter()
        .find(|n| n.as_str() == preferred)
        .or_else(|| names.first())
        .cloned()
}

fn take(outputs: &mut HashMap<String, Tensor>, name: &str, graph: &str) -> Result<Tensor> {
    outputs
        .remove(name)
        .ok_or_else(|| anyhow!("{graph} did not produce output `{name}`"))
}

pub struct OnnxVisionEncoder {
    graph: OnnxGraph,
}

impl VisionEncoder for OnnxVisionEncoder {
    fn encode(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let input = self.graph.input_name(PIXEL_VALUES)?;
        let output = self.graph.output_name(IMAGE_FEATURES)?;
        let mut outputs = self
            .graph
            .run(HashMap::from([(input, pixel_values.clone())]))?;
        take(&mut outputs, &output, self.graph.name())
    }
}

pub struct OnnxProjector {
    graph: OnnxGraph,
}

impl VisionProjector for OnnxProjector {
    fn project(&self, visual_features: &Tensor) -> Result<Tensor> {
        let input = self.graph.input_name(IMAGE_FEATURES)?;
        let output = self.graph.output_name(VISUAL_TOKENS)?;
        let mut outputs = self
            .graph
            .run(HashMap::from([(input, visual_features.clone())]))?;
        take(&mut outputs, &output, self.graph.name())
    }
}

pub struct OnnxEmbedder {
    graph: OnnxGraph,
    device: Device,
}

impl TokenEmbedder for OnnxEmbedder {
    fn embed(&self, ids: &[TokenId]) -> Result<Tensor> {
        ensure!(!ids.is_empty(), "embedding lookup needs at least one id");
        let input = self.graph.input_name(INPUT_IDS)?;
        let output = self.graph.output_name(EMBEDDINGS)?;
        let ids: Vec<i64> = ids.iter().map(|&id| i64::from(id)).collect();
        let len = ids.len();
        let ids = Tensor::from_vec(ids, (1, len), &self.device)?;
        let mut outputs = self.graph.run(HashMap::from([(input, ids)]))?;
        let embeddings = take(&mut outputs, &output, self.graph.name())?;
        Ok(embeddings.to_dtype(DType::F32)?)
    }
}

/// Decoder graph taking `inputs_embeds`, `attention_mask` and `past_key_values.{i}.key|value`.
pub struct OnnxDecoder {
    graph: OnnxGraph,
    num_layers: usize,
}

impl OnnxDecoder {
    fn check_signature(&self) -> Result<()> {
        for layer in 0..self.num_layers {
            for part in ["key", "value"] {
                let past = format!("past_key_values.{layer}.{part}");
                let present = format!("present.{layer}.{part}");
                ensure!(
                    self.graph.inputs.contains(&past),
                    "{} has no input `{past}`",
                    self.graph.name
                );
                ensure!(
                    self.graph.outputs.contains(&present),
                    "{} has no output `{present}`",
                    self.graph.name
                );
            }
        }
        Ok(())
    }
}

impl CausalTransformer for OnnxDecoder {
    fn forward(&self, input: TransformerInput<'_>) -> Result<TransformerOutput> {
        ensure!(
            input.past.len() == self.num_layers,
            "decoder expects {} cache layers, got {}",
            self.num_layers,
            input.past.len()
        );
        let mut feeds = HashMap::with_capacity(2 + 2 * self.num_layers);
        feeds.insert(INPUTS_EMBEDS.to_string(), input.inputs_embeds.clone());
        feeds.insert(ATTENTION_MASK.to_string(), input.attention_mask.clone());
        for (layer, kv) in input.past.iter().enumerate() {
            feeds.insert(format!("past_key_values.{layer}.key"), kv.key.clone());
            feeds.insert(format!("past_key_values.{layer}.value"), kv.value.clone());
        }

        let mut outputs = self.graph.run(feeds)?;
        let logits = take(&mut outputs, LOGITS, &self.graph.name)?;
        let present = (0..self.num_layers)
            .map(|layer| {
                let key = take(&mut outputs, &format!("present.{layer}.key"), &self.graph.name)?;
                let value =
                    take(&mut outputs, &format!("present.{layer}.value"), &self.graph.name)?;
                Ok(LayerKv { key, value })
            })
            .collect::<Result<Vec<_>>>()?;
        debug!(logits = ?logits.dims(), "decoder step");
        Ok(TransformerOutput { logits, present })
    }
}

/// Load the four graphs of the active model.
pub fn load_collaborators(
    fs: &LocalFileSystem,
    resources: &ModelResources,
    tokenizer: Arc<dyn TextTokenizer>,
    num_layers: usize,
    device: &Device,
) -> Result<Collaborators> {
    let load = |location, what: &str| -> Result<OnnxGraph> {
        let path = require_file(fs, location, what)?;
        info!(graph = %path.display(), "loading {what}");
        OnnxGraph::load(&path)
    };
    let decoder = OnnxDecoder {
        graph: load(&resources.decoder, "decoder graph")?,
        num_layers,
    };
    decoder.check_signature()?;
    Ok(Collaborators {
        vision: Arc::new(OnnxVisionEncoder {
            graph: load(&resources.vision_encoder, "vision encoder graph")?,
        }),
        projector: Arc::new(OnnxProjector {
            graph: load(&resources.projector, "projector graph")?,
        }),
        embedder: Arc::new(OnnxEmbedder {
            graph: load(&resources.embeddings, "embedding graph")?,
            device: device.clone(),
        }),
        transformer: Arc::new(decoder),
        tokenizer,
    })
}

/// Print a graph's declared inputs and outputs.
pub fn describe(path: &Path) -> Result<()> {
    let graph = OnnxGraph::load(path)?;
    println!("{}", graph.name());
    println!("  inputs ({}):", graph.inputs().len());
    for name in graph.inputs() {
        println!("    {name}");
    }
    println!("  outputs ({}):", graph.outputs().len());
    for name in graph.outputs() {
        println!("    {name}");
    }
    Ok(())
}
