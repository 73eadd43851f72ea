use std::path::{Path, PathBuf};
use thiserror::Error;

use super::types::EntityKey;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed data: {0}")]
    Malformed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Command '{program}' failed: {reason}")]
    Command { program: String, reason: String },

    #[error("Entity {key}: cancel command exited with {exit}")]
    CancelRejected { key: EntityKey, exit: String },

    #[error("Index error: {0}")]
    Index(String),

    #[error("Index API error ({status}): {message}")]
    IndexApi { status: u16, message: String },

    #[error("Task error: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

impl ReconcileError {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<serde_json::Error> for ReconcileError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

impl From<base64::DecodeError> for ReconcileError {
    fn from(err: base64::DecodeError) -> Self {
        Self::Malformed(format!("invalid base64 value: {}", err))
    }
}

impl From<reqwest::Error> for ReconcileError {
    fn from(err: reqwest::Error) -> Self {
        Self::Index(err.to_string())
    }
}

impl From<tokio::task::JoinError> for ReconcileError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}
