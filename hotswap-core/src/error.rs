//! Error types for the hotswap pipeline
//!
//! Configuration problems and I/O races are reported through these types;
//! the watcher and scheduler loops log them instead of propagating, so a
//! single bad registration or file never stops the pipeline.

use crate::classfile::ClassFormatError;
use crate::loader::LoaderId;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for hotswap operations
#[derive(Debug, Error)]
pub enum HotswapError {
    /// The URI does not address a local file or directory (e.g. inside a jar)
    #[error("Unable to watch {uri}: not a local regular file or directory")]
    NonLocalUri { uri: String },

    /// The path does not exist or is not a directory
    #[error("Unable to watch {path:?}: not a directory")]
    NotADirectory { path: PathBuf },

    /// Filesystem access failed
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The OS watch facility refused a request
    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    /// A filter or class name pattern failed to compile
    #[error("Invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// A class file could not be parsed
    #[error("Invalid class file: {0}")]
    ClassFormat(#[from] ClassFormatError),

    /// The loader handle is not (or no longer) registered
    #[error("Unknown loader {0}")]
    UnknownLoader(LoaderId),

    /// Configuration file could not be parsed
    #[error("Configuration error in {path:?}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// Starting the agent needs a tokio runtime for the scheduler
    #[error("No tokio runtime available for the command scheduler")]
    NoRuntime,

    /// A background thread could not be spawned
    #[error("Unable to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl HotswapError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    /// Errors that may disappear if the same read is attempted again shortly:
    /// the file is being replaced or is still being written.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            Self::ClassFormat(err) => err.is_truncated(),
            _ => false,
        }
    }
}

/// Result type for hotswap operations
pub type HotswapResult<T> = std::result::Result<T, HotswapError>;
