use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] grove_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("No note content provided")]
    EmptyContent,
    #[error("Invalid {kind} id: {value}")]
    InvalidId { kind: &'static str, value: String },
    #[error("Note not found: {0}")]
    NoteNotFound(String),
    #[error("Tag not found: {0}")]
    TagNotFound(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Sync is disabled in {0}")]
    SyncDisabled(String),
    #[error("{failed} of {total} peer(s) failed to sync")]
    SyncFailed { failed: usize, total: usize },
}
