//! Error types for the fsdelta library
//!
//! Errors fall into a small number of categories that callers treat
//! differently:
//!
//! - **Parse errors** (malformed index, change log, passwd/group or limit
//!   lines) are fatal and always carry the offending line.
//! - **Filesystem races** (a path vanished between enumeration and use) are
//!   tolerated by the walkers; [`DeltaError::is_vanished`] identifies them.
//! - **Id exhaustion** is fatal: reusing an id would corrupt ownership.
//! - **Rollback preconditions** (a missing original) are plain return values
//!   rather than errors, except [`DeltaError::NothingToRollback`] which is
//!   reported to the user.
//! - **External tool failures** are collected as warnings by the restore and
//!   rollback sequences instead of aborting them.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the fsdelta library
pub type Result<T> = std::result::Result<T, DeltaError>;

/// Main error type for all fsdelta operations
#[derive(Debug, Error)]
pub enum DeltaError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// A line of a persisted text format could not be parsed
    #[error("Parse error in {source_name} at line {line_number}: {reason}: {line:?}")]
    Parse {
        /// File (or other source) being parsed
        source_name: String,
        /// 1-based line number
        line_number: usize,
        /// The offending line
        line: String,
        /// What was wrong with it
        reason: String,
    },

    /// Illegal limit syntax
    #[error("Invalid limit: {0}")]
    InvalidLimit(String),

    /// Glob pattern could not be compiled
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    /// A path that must be absolute was not
    #[error("Path is not absolute: {0:?}")]
    NotAbsolute(PathBuf),

    /// No free user or group id left
    #[error("Ran out of ids (allocating an id for old id {based_on})")]
    IdsExhausted {
        /// Id the allocation was based on
        based_on: u32,
    },

    /// The rollback directory does not exist
    #[error("Nothing to rollback: {0:?} does not exist")]
    NothingToRollback(PathBuf),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// An external collaborator (package manager, database) failed
    #[error("{tool} failed: {message}")]
    ExternalTool {
        /// Name of the tool or collaborator
        tool: String,
        /// Failure description
        message: String,
    },

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeltaError {
    /// Create a parse error for a line of some named source
    pub fn parse(
        source_name: impl Into<String>,
        line_number: usize,
        line: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        DeltaError::Parse {
            source_name: source_name.into(),
            line_number,
            line: line.into(),
            reason: reason.into(),
        }
    }

    /// Create an external tool error
    pub fn external(tool: impl Into<String>, message: impl Into<String>) -> Self {
        DeltaError::ExternalTool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        DeltaError::Internal(msg.into())
    }

    /// True when the error means the path disappeared underneath us
    pub fn is_vanished(&self) -> bool {
        match self {
            DeltaError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            DeltaError::WalkDir(e) => e
                .io_error()
                .map(|io| io.kind() == std::io::ErrorKind::NotFound)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Check if this error can be treated as "nothing to do" by the caller
    pub fn is_recoverable(&self) -> bool {
        self.is_vanished() || matches!(self, DeltaError::ExternalTool { .. })
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            DeltaError::NothingToRollback(_) => {
                "Nothing to rollback: no restore has been performed since the last rollback.".to_string()
            }
            DeltaError::IdsExhausted { based_on } => {
                format!(
                    "No free id left in range [1000, 65534) while remapping id {}. \
                     Remove unused accounts on this system and retry.",
                    based_on
                )
            }
            DeltaError::InvalidLimit(limit) => {
                format!(
                    "Invalid limit {:?}. Limits are absolute paths (optionally prefixed \
                     with '-' to exclude) or mysql:/pgsql: database limits.",
                    limit
                )
            }
            _ => self.to_string(),
        }
    }
}
