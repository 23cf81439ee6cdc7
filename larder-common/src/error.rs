//! Common error types for the import pipeline

use thiserror::Error;

use crate::stage::Stage;

/// Common result type for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the pipeline crates
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A note's expected unit count was registered twice with different values
    #[error("Expected count for note {note_id} already registered as {registered}, refusing {requested}")]
    ExpectedCountMismatch {
        note_id: String,
        registered: u64,
        requested: u64,
    },

    /// More distinct units were marked done than the note expects
    #[error("Note {note_id} expects {total} units; unit {line_id} would exceed it")]
    UnitOverflow {
        note_id: String,
        line_id: String,
        total: u64,
    },

    /// The dispatcher rejected or failed an enqueue call
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// A stage was flagged complete but its downstream work could not be scheduled
    #[error("Stage {stage} of note {note_id} completed without scheduled downstream work: {reason}")]
    OrphanedStage {
        note_id: String,
        stage: Stage,
        reason: String,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Logic errors are fatal and must never be retried.
    pub fn is_logic_error(&self) -> bool {
        matches!(
            self,
            Error::ExpectedCountMismatch { .. } | Error::UnitOverflow { .. } | Error::InvalidInput(_)
        )
    }

    /// Backing-store and dispatch failures that a later attempt may not hit.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Database(_) | Error::Io(_) | Error::Dispatch(_))
    }
}
