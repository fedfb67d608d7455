use std::{
    collections::BTreeMap,
    fs,
    ops::AddAssign,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use medgemma_core::{
    DecodeParameters, EngineConfig,
    runtime::{DeviceKind, Precision},
};
use serde::{Deserialize, Serialize};

use crate::fs::{VirtualFileSystem, VirtualPath};

pub const DEFAULT_MODEL_ID: &str = "medgemma-4b-it";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub models: ModelRegistry,
    pub inference: InferenceSettings,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelRegistry {
    pub active: String,
    pub entries: BTreeMap<String, ModelEntry>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(DEFAULT_MODEL_ID.to_string(), ModelEntry::default());
        Self {
            active: DEFAULT_MODEL_ID.to_string(),
            entries,
        }
    }
}

/// Where one exported checkpoint lives and how its graphs are named.
///
/// Unset paths resolve inside the model's cache directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelEntry {
    pub model_dir: Option<PathBuf>,
    pub tokenizer: Option<PathBuf>,
    pub graphs: GraphFiles,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GraphFiles {
    pub vision_encoder: String,
    pub projector: String,
    pub embeddings: String,
    pub decoder: String,
}

impl Default for GraphFiles {
    fn default() -> Self {
        Self {
            vision_encoder: "vision_encoder.onnx".to_string(),
            projector: "vision_projection.onnx".to_string(),
            embeddings: "embeddings.onnx".to_string(),
            decoder: "model.onnx".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InferenceSettings {
    pub device: DeviceKind,
    pub precision: Option<Precision>,
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub repetition_penalty: f32,
    pub repetition_window: usize,
    pub seed: Option<u64>,
    pub prefill_chunk: Option<usize>,
    pub time_budget_secs: Option<u64>,
    pub stop_strings: Vec<String>,
    pub normalized_stop_strings: Vec<String>,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        let params = DecodeParameters::default();
        Self {
            device: DeviceKind::Cpu,
            precision: None,
            max_new_tokens: params.max_new_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            repetition_penalty: params.repetition_penalty,
            repetition_window: params.repetition_window,
            seed: None,
            prefill_chunk: None,
            time_budget_secs: None,
            stop_strings: Vec::new(),
            normalized_stop_strings: params.normalized_stop_strings,
        }
    }
}

impl InferenceSettings {
    pub fn decode_parameters(&self) -> DecodeParameters {
        DecodeParameters {
            max_new_tokens: self.max_new_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            repetition_penalty: self.repetition_penalty,
            repetition_window: self.repetition_window,
            seed: self.seed,
            prefill_chunk: self.prefill_chunk,
            time_budget: self.time_budget_secs.map(Duration::from_secs),
            stop_strings: self.stop_strings.clone(),
            normalized_stop_strings: self.normalized_stop_strings.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ResourceLocation {
    Virtual(VirtualPath),
    Physical(PathBuf),
}

impl ResourceLocation {
    pub fn display_with(&self, fs: &impl VirtualFileSystem) -> Result<String> {
        match self {
            ResourceLocation::Virtual(path) => {
                fs.with_physical_path(path, |p| Ok(p.display().to_string()))
            }
            ResourceLocation::Physical(path) => Ok(path.display().to_string()),
        }
    }

    pub fn to_path(&self, fs: &impl VirtualFileSystem) -> Result<PathBuf> {
        match self {
            ResourceLocation::Virtual(path) => fs.with_physical_path(path, |p| Ok(p.to_path_buf())),
            ResourceLocation::Physical(path) => Ok(path.clone()),
        }
    }
}

/// Resolved file locations for the active model.
#[derive(Debug, Clone)]
pub struct ModelResources {
    pub id: String,
    pub tokenizer: ResourceLocation,
    pub vision_encoder: ResourceLocation,
    pub projector: ResourceLocation,
    pub embeddings: ResourceLocation,
    pub decoder: ResourceLocation,
}

/// Where the active configuration file was read from.
pub struct ConfigDescriptor {
    pub location: ResourceLocation,
}

impl ConfigDescriptor {
    fn default_location() -> Self {
        Self {
            location: ResourceLocation::Virtual(VirtualPath::config_file()),
        }
    }

    fn at(path: &Path) -> Self {
        Self {
            location: ResourceLocation::Physical(path.to_path_buf()),
        }
    }

    /// File contents, or `None` when nothing has been written yet.
    fn read(&self, fs: &impl VirtualFileSystem) -> Result<Option<String>> {
        let bytes = match &self.location {
            ResourceLocation::Virtual(path) => {
                if !fs.exists(path)? {
                    return Ok(None);
                }
                fs.read(path)?
            }
            ResourceLocation::Physical(path) => {
                if !path.exists() {
                    return Ok(None);
                }
                fs::read(path)
                    .with_context(|| format!("failed to read configuration from {}", path.display()))?
            }
        };
        String::from_utf8(bytes)
            .context("configuration file is not valid UTF-8")
            .map(Some)
    }
}

impl AppConfig {
    pub fn load_or_init(
        fs: &impl VirtualFileSystem,
        override_path: Option<&Path>,
    ) -> Result<(Self, ConfigDescriptor)> {
        let descriptor = override_path.map_or_else(ConfigDescriptor::default_location, |path| {
            ConfigDescriptor::at(path)
        });
        let mut config: AppConfig = match descriptor.read(fs)? {
            Some(contents) => toml::from_str(&contents).with_context(|| {
                format!(
                    "failed to parse configuration at {}",
                    descriptor
                        .location
                        .display_with(fs)
                        .unwrap_or_else(|_| "<unresolved>".to_string())
                )
            })?,
            None => {
                let defaults = AppConfig::default();
                save_config(fs, &descriptor, &defaults)?;
                defaults
            }
        };
        config.normalise(fs)?;
        Ok((config, descriptor))
    }

    pub fn load_with_overrides(
        fs: &impl VirtualFileSystem,
        overrides: ConfigOverrides,
    ) -> Result<(Self, ConfigDescriptor, ModelResources)> {
        let config_path_override = overrides.config_path.clone();
        let (mut config, descriptor) = Self::load_or_init(fs, config_path_override.as_deref())?;
        config += overrides;
        config.normalise(fs)?;
        let resources = config.active_model_resources()?;
        Ok((config, descriptor, resources))
    }

    pub fn normalise(&mut self, fs: &impl VirtualFileSystem) -> Result<()> {
        self.models
            .entries
            .entry(self.models.active.clone())
            .or_default();
        for (model_id, entry) in &self.models.entries {
            if entry.model_dir.is_none() {
                fs.ensure_dir(&VirtualPath::model_dir(model_id.clone()))?;
            }
        }
        self.engine
            .validate()
            .context("invalid [engine] configuration")?;
        Ok(())
    }

    pub fn active_model_resources(&self) -> Result<ModelResources> {
        self.model_resources(&self.models.active)
    }

    pub fn model_resources(&self, model_id: &str) -> Result<ModelResources> {
        let entry = self
            .models
            .entries
            .get(model_id)
            .ok_or_else(|| anyhow!("model `{model_id}` not found in configuration"))?;
        Ok(entry.resolved(model_id))
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(model_id) = overrides.model_id.as_ref() {
            self.models.active = model_id.clone();
            self.models.entries.entry(model_id.clone()).or_default();
        }

        if let Some(entry) = self.models.entries.get_mut(&self.models.active) {
            if let Some(path) = overrides.model_dir.as_ref() {
                entry.model_dir = Some(path.clone());
            }
            if let Some(path) = overrides.tokenizer.as_ref() {
                entry.tokenizer = Some(path.clone());
            }
        }

        let inference = &overrides.inference;
        if let Some(device) = inference.device {
            self.inference.device = device;
        }
        if inference.precision.is_some() {
            self.inference.precision = inference.precision;
        }
        if let Some(max_new_tokens) = inference.max_new_tokens {
            self.inference.max_new_tokens = max_new_tokens;
        }
        if let Some(temperature) = inference.temperature {
            self.inference.temperature = temperature;
        }
        if let Some(top_p) = inference.top_p {
            self.inference.top_p = top_p;
        }
        if let Some(repetition_penalty) = inference.repetition_penalty {
            self.inference.repetition_penalty = repetition_penalty;
        }
        if let Some(window) = inference.repetition_window {
            self.inference.repetition_window = window;
        }
        if inference.seed.is_some() {
            self.inference.seed = inference.seed;
        }
        if inference.prefill_chunk.is_some() {
            self.inference.prefill_chunk = inference.prefill_chunk;
        }
        if inference.time_budget_secs.is_some() {
            self.inference.time_budget_secs = inference.time_budget_secs;
        }
        if !inference.stop_strings.is_empty() {
            self.inference.stop_strings = inference.stop_strings.clone();
        }
        if !inference.normalized_stop_strings.is_empty() {
            self.inference.normalized_stop_strings = inference.normalized_stop_strings.clone();
        }
    }
}

impl ModelEntry {
    fn resolved(&self, model_id: &str) -> ModelResources {
        let locate = |file: &str| match &self.model_dir {
            Some(dir) => ResourceLocation::Physical(dir.join(file)),
            None => ResourceLocation::Virtual(VirtualPath::model_file(model_id.to_string(), file)),
        };
        let tokenizer = match &self.tokenizer {
            Some(path) => ResourceLocation::Physical(path.clone()),
            None => locate("tokenizer.json"),
        };
        ModelResources {
            id: model_id.to_string(),
            tokenizer,
            vision_encoder: locate(&self.graphs.vision_encoder),
            projector: locate(&self.graphs.projector),
            embeddings: locate(&self.graphs.embeddings),
            decoder: locate(&self.graphs.decoder),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub model_id: Option<String>,
    pub model_dir: Option<PathBuf>,
    pub tokenizer: Option<PathBuf>,
    pub inference: InferenceOverride,
}

#[derive(Debug, Default, Clone)]
pub struct InferenceOverride {
    pub device: Option<DeviceKind>,
    pub precision: Option<Precision>,
    pub max_new_tokens: Option<usize>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub repetition_penalty: Option<f32>,
    pub repetition_window: Option<usize>,
    pub seed: Option<u64>,
    pub prefill_chunk: Option<usize>,
    pub time_budget_secs: Option<u64>,
    pub stop_strings: Vec<String>,
    pub normalized_stop_strings: Vec<String>,
}

pub trait ConfigOverride {
    fn apply(self, config: &mut AppConfig);
}

impl ConfigOverride for ConfigOverrides {
    fn apply(self, config: &mut AppConfig) {
        config.apply_overrides(&self);
    }
}

impl<O: ConfigOverride> AddAssign<O> for AppConfig {
    fn add_assign(&mut self, rhs: O) {
        rhs.apply(self);
    }
}

pub fn save_config(
    fs: &impl VirtualFileSystem,
    descriptor: &ConfigDescriptor,
    config: &AppConfig,
) -> Result<()> {
    let serialized = toml::to_string_pretty(config)?;
    match &descriptor.location {
        ResourceLocation::Virtual(path) => fs.write(path, serialized.as_bytes()),
        ResourceLocation::Physical(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create directory {}", parent.display()))?;
            }
            fs::write(path, serialized)
                .with_context(|| format!("failed to write configuration to {}", path.display()))
        }
    }
}
