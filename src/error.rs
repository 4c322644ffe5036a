//! Error taxonomy for the alert pipeline.
//!
//! Each component returns its own error type and the caller decides how far
//! it travels: only `SourceError` ends a runner, everything else is logged at
//! the component boundary.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    /// The camera or stream could not be opened, or dropped mid-stream.
    #[error("source {source_id} unavailable: {reason}")]
    Unavailable { source_id: String, reason: String },

    #[error("detector failed on source {source_id}: {reason}")]
    Detector { source_id: String, reason: String },
}

impl SourceError {
    pub fn unavailable(source_id: impl Into<String>, reason: impl ToString) -> Self {
        Self::Unavailable {
            source_id: source_id.into(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EvidenceError {
    #[error("cannot create evidence directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write evidence {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("evidence task aborted: {0}")]
    Join(String),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("cannot read evidence {path}: {source}")]
    Attachment {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{channel} transport failed: {reason}")]
    Transport { channel: String, reason: String },

    #[error("{channel} rejected the message: {reason}")]
    Rejected { channel: String, reason: String },
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ledger database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("ledger lock poisoned")]
    Poisoned,

    #[error("ledger task aborted: {0}")]
    Join(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
