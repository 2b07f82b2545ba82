//! Error types for local-translate
//!
//! Errors are grouped by the layer that produces them. `ModelError` is what
//! the managers surface; the worker codec and configuration have their own
//! narrower types that convert into it where needed.

use thiserror::Error;

/// Errors surfaced by the translation and speech managers
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("{0}")]
    IntegrityFailure(String),

    #[error("{0}")]
    WorkerUnavailable(String),

    #[error("Worker unresponsive: no reply within {0}s")]
    WorkerTimeout(u64),

    #[error("{message}")]
    WorkerReported { message: String, fatal: bool },

    #[error("Download failed: {0}")]
    DownloadFailure(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ModelError {
    /// True when the worker that produced this error can no longer be used
    pub fn is_worker_loss(&self) -> bool {
        matches!(
            self,
            ModelError::WorkerUnavailable(_)
                | ModelError::WorkerTimeout(_)
                | ModelError::WorkerReported { fatal: true, .. }
        )
    }
}

impl From<ProtocolError> for ModelError {
    fn from(err: ProtocolError) -> Self {
        ModelError::WorkerReported {
            message: err.to_string(),
            fatal: false,
        }
    }
}

/// Worker protocol codec errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Failed to encode worker message: {0}")]
    Encode(serde_json::Error),

    #[error("Unrecognized worker frame: {0}")]
    UnrecognizedFrame(String),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("Cannot determine platform directories")]
    NoProjectDirs,

    #[error("No worker runtime found: {0}")]
    RuntimeNotFound(String),
}

/// Errors returned across the command boundary
///
/// Serialized as its display string so a GUI dispatcher can forward it as-is.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("Background task failed: {0}")]
    Join(String),
}

impl serde::Serialize for CommandError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T, E = ModelError> = std::result::Result<T, E>;
