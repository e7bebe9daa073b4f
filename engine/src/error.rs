//! Error types for the transfer engine.
//!
//! `EngineError` covers both session-level failures (returned from engine calls)
//! and per-item failures. Per-item failures are never propagated out of a
//! transfer session; they are folded into the item's `TransferRecord` through
//! [`EngineError::kind`], [`EngineError::raw_os_error`] and its `Display` text.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The source volume was detached or its root is no longer reachable.
    #[error("Volume no longer available: {}", root.display())]
    VolumeUnavailable { root: PathBuf },

    /// A source file could not be opened or read.
    #[error("Failed to read source file: {}", path.display())]
    UnreadableSource {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The destination could not be written (disk full, permissions, ...).
    #[error("Failed to write destination file: {}", path.display())]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The checksum of the written copy differs from the source.
    #[error("Checksum mismatch for {}: source {expected}, copy {actual}", path.display())]
    VerificationMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// Two plan entries resolve to the same destination. Indicates a planner bug.
    #[error("Unresolved destination collision: {}", path.display())]
    PlanCollisionUnresolved { path: PathBuf },

    /// A source file could not be deleted during cleanup.
    #[error("Failed to delete source file: {}", path.display())]
    DeletionFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A single chunk read or write took longer than the configured threshold.
    #[error("I/O stalled for {elapsed:?} on {}", path.display())]
    Stalled { path: PathBuf, elapsed: Duration },

    /// The caller cancelled the session.
    #[error("Transfer cancelled")]
    Cancelled,

    /// Path is missing, of the wrong type, or otherwise unusable.
    #[error("Invalid path: {} ({reason})", path.display())]
    InvalidPath { path: PathBuf, reason: String },

    /// The organization policy cannot produce destinations.
    #[error("Invalid organization policy: {reason}")]
    InvalidPolicy { reason: String },

    /// Configuration could not be read or parsed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The executor is already running a session.
    #[error("A transfer session is already running")]
    SessionBusy,

    /// Cleanup was requested before every record reached a terminal status.
    #[error("Transfer session has not completed ({pending} items not terminal)")]
    SessionIncomplete { pending: usize },

    /// An engine invariant was violated.
    #[error("Internal engine error: {0}")]
    Internal(String),
}

/// Serializable classification of an [`EngineError`], stored on records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    VolumeUnavailable,
    UnreadableSource,
    WriteFailure,
    VerificationMismatch,
    PlanCollisionUnresolved,
    DeletionFailure,
    Stalled,
    Cancelled,
    InvalidInput,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::VolumeUnavailable => "volume unavailable",
            ErrorKind::UnreadableSource => "unreadable source",
            ErrorKind::WriteFailure => "write failure",
            ErrorKind::VerificationMismatch => "verification mismatch",
            ErrorKind::PlanCollisionUnresolved => "unresolved collision",
            ErrorKind::DeletionFailure => "deletion failure",
            ErrorKind::Stalled => "stalled",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidInput => "invalid input",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

impl EngineError {
    /// Classify this error for storage on a record.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::VolumeUnavailable { .. } => ErrorKind::VolumeUnavailable,
            Self::UnreadableSource { .. } => ErrorKind::UnreadableSource,
            Self::WriteFailure { .. } => ErrorKind::WriteFailure,
            Self::VerificationMismatch { .. } => ErrorKind::VerificationMismatch,
            Self::PlanCollisionUnresolved { .. } => ErrorKind::PlanCollisionUnresolved,
            Self::DeletionFailure { .. } => ErrorKind::DeletionFailure,
            Self::Stalled { .. } => ErrorKind::Stalled,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::InvalidPath { .. }
            | Self::InvalidPolicy { .. }
            | Self::Config(_)
            | Self::SessionBusy
            | Self::SessionIncomplete { .. } => ErrorKind::InvalidInput,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True for failures worth another copy attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::VerificationMismatch { .. } | Self::Stalled { .. })
    }

    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::UnreadableSource { source, .. }
            | Self::WriteFailure { source, .. }
            | Self::DeletionFailure { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    /// Full message including the underlying I/O cause.
    pub fn detail(&self) -> String {
        match self {
            Self::UnreadableSource { source, .. }
            | Self::WriteFailure { source, .. }
            | Self::DeletionFailure { source, .. } => format!("{}: {}", self, source),
            _ => self.to_string(),
        }
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(err: toml::de::Error) -> Self {
        EngineError::Config(err.to_string())
    }
}
