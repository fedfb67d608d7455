pub mod config;
pub mod fs;

pub use config::{
    AppConfig, ConfigDescriptor, ConfigOverride, ConfigOverrides, DEFAULT_MODEL_ID, GraphFiles,
    InferenceOverride, InferenceSettings, ModelEntry, ModelRegistry, ModelResources,
    ResourceLocation, save_config,
};
pub use fs::{CACHE_DIR_ENV, CONFIG_DIR_ENV, LocalFileSystem, Namespace, VirtualFileSystem, VirtualPath};
