use std::fmt;

use thiserror::Error;

/// Boxed error type carried as the source of a failed stage.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Pipeline stage that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Assembly,
    Vision,
    Projection,
    Embedding,
    Transformer,
    Sampling,
    Tokenizer,
    Cache,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Assembly => "assembly",
            Stage::Vision => "vision",
            Stage::Projection => "projection",
            Stage::Embedding => "embedding",
            Stage::Transformer => "transformer",
            Stage::Sampling => "sampling",
            Stage::Tokenizer => "tokenizer",
            Stage::Cache => "cache",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the decoding engine.
///
/// Configuration problems are detected before any collaborator runs. Failures inside a
/// collaborator or inside the engine's own tensor bookkeeping carry the [`Stage`] they came
/// from so callers can tell a projector failure apart from a transformer failure.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: BoxError,
    },
    #[error("numerical degeneracy: {0}")]
    Numerical(String),
    #[error("{stage} invariant violated: {message}")]
    Invariant { stage: Stage, message: String },
}

impl EngineError {
    pub fn config(message: impl Into<String>) -> Self {
        EngineError::Config(message.into())
    }

    pub fn stage(stage: Stage, source: impl Into<BoxError>) -> Self {
        EngineError::Stage {
            stage,
            source: source.into(),
        }
    }

    pub fn invariant(stage: Stage, message: impl Into<String>) -> Self {
        EngineError::Invariant {
            stage,
            message: message.into(),
        }
    }

    /// Re-attribute a broken invariant to the stage whose output broke it.
    pub fn blame(self, stage: Stage) -> Self {
        match self {
            EngineError::Invariant { message, .. } => EngineError::Invariant { stage, message },
            other => other,
        }
    }

    /// Stage the error originated from, when it came from a pipeline stage.
    pub fn failed_stage(&self) -> Option<Stage> {
        match self {
            EngineError::Stage { stage, .. } | EngineError::Invariant { stage, .. } => Some(*stage),
            EngineError::Numerical(_) => Some(Stage::Sampling),
            EngineError::Config(_) => None,
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(self, EngineError::Config(_))
    }
}

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Attaches a [`Stage`] to errors coming out of collaborators or tensor code.
pub trait StageContext<T> {
    fn at_stage(self, stage: Stage) -> Result<T>;
}

impl<T> StageContext<T> for anyhow::Result<T> {
    fn at_stage(self, stage: Stage) -> Result<T> {
        self.map_err(|err| EngineError::stage(stage, err))
    }
}

impl<T> StageContext<T> for candle_core::Result<T> {
    fn at_stage(self, stage: Stage) -> Result<T> {
        self.map_err(|err| EngineError::stage(stage, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_errors_keep_origin_and_message() {
        let err: Result<()> = Err(anyhow::anyhow!("session run failed")).at_stage(Stage::Projection);
        let err = err.unwrap_err();
        assert_eq!(err.failed_stage(), Some(Stage::Projection));
        assert_eq!(
            err.to_string(),
            "projection stage failed: session run failed"
        );
    }

    #[test]
    fn blamed_invariants_report_the_new_stage() {
        let err = EngineError::invariant(Stage::Cache, "transformer returned 3 cache layers")
            .blame(Stage::Transformer);
        assert_eq!(err.failed_stage(), Some(Stage::Transformer));
        assert_eq!(
            err.to_string(),
            "transformer invariant violated: transformer returned 3 cache layers"
        );
        assert!(EngineError::config("x").blame(Stage::Cache).is_config());
    }

    #[test]
    fn config_errors_have_no_stage() {
        let err = EngineError::config("temperature must be > 0");
        assert!(err.is_config());
        assert!(err.failed_stage().is_none());
    }
}
