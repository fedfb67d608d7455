use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, ensure};

/// Overrides the platform configuration directory.
pub const CONFIG_DIR_ENV: &str = "MEDGEMMA_CONFIG_DIR";
/// Overrides the platform cache directory that holds exported model graphs.
pub const CACHE_DIR_ENV: &str = "MEDGEMMA_CACHE_DIR";

const CONFIG_FILE: &str = "config.toml";
const MODELS_DIR: &str = "models";

/// Root a [`VirtualPath`] is resolved against.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Namespace {
    /// Holds `config.toml`.
    Config,
    /// Holds `models/<id>/` with the exported graphs and tokenizer.
    Cache,
}

impl Namespace {
    fn env_var(self) -> &'static str {
        match self {
            Namespace::Config => CONFIG_DIR_ENV,
            Namespace::Cache => CACHE_DIR_ENV,
        }
    }

    fn platform_dir(self) -> Option<PathBuf> {
        match self {
            Namespace::Config => dirs::config_dir(),
            Namespace::Cache => dirs::cache_dir(),
        }
    }

    fn home_fallback(self) -> &'static str {
        match self {
            Namespace::Config => ".config",
            Namespace::Cache => ".cache",
        }
    }
}

/// A location relative to one of the application roots.
///
/// Segments are validated on resolution, so a model id can never escape its root.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct VirtualPath {
    namespace: Namespace,
    segments: Vec<String>,
}

impl VirtualPath {
    pub fn new(namespace: Namespace, segments: Vec<String>) -> Self {
        Self {
            namespace,
            segments,
        }
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn join(&self, segment: impl Into<String>) -> Self {
        let mut joined = self.clone();
        joined.segments.push(segment.into());
        joined
    }

    pub fn config_file() -> Self {
        Self::new(Namespace::Config, vec![CONFIG_FILE.into()])
    }

    /// `models/<id>` under the cache root.
    pub fn model_dir(model_id: impl Into<String>) -> Self {
        Self::new(Namespace::Cache, vec![MODELS_DIR.into(), model_id.into()])
    }

    /// A graph or tokenizer file inside the model's directory.
    pub fn model_file(model_id: impl Into<String>, file: impl Into<String>) -> Self {
        Self::model_dir(model_id).join(file)
    }
}

/// Storage the configuration layer reads from and writes to.
pub trait VirtualFileSystem {
    fn read(&self, path: &VirtualPath) -> Result<Vec<u8>>;
    fn write(&self, path: &VirtualPath, contents: &[u8]) -> Result<()>;
    fn exists(&self, path: &VirtualPath) -> Result<bool>;
    fn ensure_dir(&self, path: &VirtualPath) -> Result<()>;
    fn ensure_parent(&self, path: &VirtualPath) -> Result<()>;

    fn with_physical_path<F, T>(&self, path: &VirtualPath, func: F) -> Result<T>
    where
        F: FnOnce(&Path) -> Result<T>;
}

/// Maps the config and cache namespaces onto local directories.
#[derive(Debug, Clone)]
pub struct LocalFileSystem {
    app_name: String,
    config_root: PathBuf,
    cache_root: PathBuf,
}

impl LocalFileSystem {
    /// Roots come from the environment overrides, else the platform directories.
    pub fn new(app_name: impl Into<String>) -> Self {
        let app_name = app_name.into();
        let config_root = default_root(Namespace::Config, &app_name);
        let cache_root = default_root(Namespace::Cache, &app_name);
        Self {
            app_name,
            config_root,
            cache_root,
        }
    }

    pub fn with_directories(
        app_name: impl Into<String>,
        config_root: PathBuf,
        cache_root: PathBuf,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            config_root,
            cache_root,
        }
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn root(&self, namespace: Namespace) -> &Path {
        match namespace {
            Namespace::Config => &self.config_root,
            Namespace::Cache => &self.cache_root,
        }
    }

    fn resolve(&self, path: &VirtualPath) -> Result<PathBuf> {
        let mut physical = self.root(path.namespace()).to_path_buf();
        for segment in path.segments() {
            ensure!(
                is_plain_segment(segment),
                "invalid path segment {segment:?} in {:?}",
                path.segments()
            );
            physical.push(segment);
        }
        Ok(physical)
    }
}

fn is_plain_segment(segment: &str) -> bool {
    !segment.is_empty() && segment != "." && segment != ".." && !segment.contains(['/', '\\'])
}

fn create_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create directory {}", dir.display()))
}

impl VirtualFileSystem for LocalFileSystem {
    fn read(&self, path: &VirtualPath) -> Result<Vec<u8>> {
        let physical = self.resolve(path)?;
        fs::read(&physical).with_context(|| format!("failed to read {}", physical.display()))
    }

    fn write(&self, path: &VirtualPath, contents: &[u8]) -> Result<()> {
        self.ensure_parent(path)?;
        let physical = self.resolve(path)?;
        fs::write(&physical, contents)
            .with_context(|| format!("failed to write {}", physical.display()))
    }

    fn exists(&self, path: &VirtualPath) -> Result<bool> {
        Ok(self.resolve(path)?.exists())
    }

    fn ensure_dir(&self, path: &VirtualPath) -> Result<()> {
        create_dir(&self.resolve(path)?)
    }

    fn ensure_parent(&self, path: &VirtualPath) -> Result<()> {
        match self.resolve(path)?.parent() {
            Some(parent) => create_dir(parent),
            None => Ok(()),
        }
    }

    fn with_physical_path<F, T>(&self, path: &VirtualPath, func: F) -> Result<T>
    where
        F: FnOnce(&Path) -> Result<T>,
    {
        func(&self.resolve(path)?)
    }
}

fn default_root(namespace: Namespace, app_name: &str) -> PathBuf {
    if let Ok(dir) = env::var(namespace.env_var()) {
        return PathBuf::from(dir);
    }
    namespace
        .platform_dir()
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(namespace.home_fallback())
        })
        .join(app_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_fs() -> Result<(tempfile::TempDir, LocalFileSystem)> {
        let dir = tempfile::tempdir()?;
        let fs = LocalFileSystem::with_directories(
            "medgemma",
            dir.path().join("config"),
            dir.path().join("cache"),
        );
        Ok((dir, fs))
    }

    #[test]
    fn namespaces_map_to_separate_roots() -> Result<()> {
        let (dir, fs) = temp_fs()?;
        let file = VirtualPath::model_file("medgemma-4b-it", "model.onnx");
        fs.write(&file, b"graph")?;
        assert!(fs.exists(&file)?);
        assert!(
            dir.path()
                .join("cache/models/medgemma-4b-it/model.onnx")
                .exists()
        );
        assert_eq!(fs.read(&file)?, b"graph");
        assert!(!fs.exists(&VirtualPath::config_file())?);
        assert_eq!(fs.root(Namespace::Config), dir.path().join("config"));
        Ok(())
    }

    #[test]
    fn traversal_segments_are_rejected() -> Result<()> {
        let (_dir, fs) = temp_fs()?;
        let err = fs
            .ensure_dir(&VirtualPath::model_dir(".."))
            .expect_err("parent segment");
        assert!(err.to_string().contains("invalid path segment"));
        assert!(fs.exists(&VirtualPath::model_file("a/b", "x")).is_err());
        Ok(())
    }
}
