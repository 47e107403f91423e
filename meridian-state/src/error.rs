//! Error types for the durable state store

use thiserror::Error;

/// Errors that can occur while reading or writing persisted state
#[derive(Error, Debug)]
pub enum StateError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt state file {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("no state directories configured")]
    NoDirectories,
}

impl StateError {
    /// Build a corruption error for a file
    pub fn corrupt(path: impl Into<String>, reason: impl Into<String>) -> Self {
        StateError::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl From<bincode::Error> for StateError {
    fn from(err: bincode::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Error from a state write.
///
/// `dirty` is false while no directory holds the new generation under its
/// final name; the caller may simply retry. Once any rename has happened the
/// write is dirty: directories may disagree and the caller must either repair
/// via `cleanup_old_files` or accept the new generation.
#[derive(Error, Debug)]
#[error("state write failed (dirty: {dirty}): {source}")]
pub struct WriteStateError {
    pub dirty: bool,
    #[source]
    pub source: StateError,
}

impl WriteStateError {
    /// A failure before any final file exists
    pub fn clean(source: StateError) -> Self {
        Self {
            dirty: false,
            source,
        }
    }

    /// A failure after at least one directory was renamed to the final name
    pub fn dirty(source: StateError) -> Self {
        Self {
            dirty: true,
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, StateError>;
