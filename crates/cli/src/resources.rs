use std::path::PathBuf;

use anyhow::{Result, anyhow, bail};
use medgemma_config::{LocalFileSystem, ResourceLocation};
use medgemma_core::tokenizer::TextTokenizer;
use tokenizers::Tokenizer;

/// Resolve `location` to a file that must already exist.
pub fn require_file(fs: &LocalFileSystem, location: &ResourceLocation, what: &str) -> Result<PathBuf> {
    let path = location.to_path(fs)?;
    if !path.is_file() {
        bail!(
            "{what} not found at {} (point --model-dir at the exported model or set it in the config)",
            path.display()
        );
    }
    Ok(path)
}

pub fn load_tokenizer(fs: &LocalFileSystem, location: &ResourceLocation) -> Result<Tokenizer> {
    let path = require_file(fs, location, "tokenizer")?;
    Tokenizer::from_file(&path)
        .map_err(|err| anyhow!("failed to load tokenizer from {}: {err}", path.display()))
}

/// Encode with the engine's conventions (no automatically added special tokens).
pub fn encode(tokenizer: &Tokenizer, text: &str) -> Result<Vec<u32>> {
    TextTokenizer::encode(tokenizer, text)
}
