use std::path::PathBuf;

use thiserror::Error;

/// Failures raised by a model caller. The orchestrator never propagates these;
/// they end the run and are recorded on the artifact.
#[derive(Debug, Error)]
pub enum LLMError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("invalid response from provider: {0}")]
    InvalidResponse(&'static str),

    #[error("model call timed out after {0} ms")]
    Timeout(u64),

    #[error("rate limited: {0}")]
    RateLimited(String),
}

/// Failures of the harness plumbing around a run: configuration, scenario files
/// and the pattern history store.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid scenario {id}: {message}")]
    InvalidScenario { id: String, message: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("timed out waiting for lock on {0}")]
    LockTimeout(PathBuf),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HarnessError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
