// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the region agent.
//!
//! Every failure the agent can observe is folded into [`AgentError`]. The
//! actor loop does not match on variants directly; it asks each error for
//! its [`ErrorClass`] and decides whether to retry, fail the request, or
//! terminate.
//!
//! # Error Classes
//!
//! | Class | Variants | Agent reaction |
//! |-------|----------|----------------|
//! | `Retryable` | `SourceUnreachable`, `Store`, `PositionUnavailable` | Retry with backoff, never terminal |
//! | `MetadataMismatch` | `TableNotFound`, `TableIdMismatch` | Internal REMOVE + ADD of the table |
//! | `ChangeTimeout` | `ChangeTimeout` | Fail the request, keep the stream |
//! | `StreamRejected` | `StreamRejected` | Cancel the stream, reconnect internally |
//! | `Config` | `Config` | Return to the caller without retry |
//! | `Shutdown` | `Shutdown` | Not an error; report "stopped" |
//! | `Fatal` | `CheckpointStore`, `InvalidState`, `Internal` | Persist ERROR, fail, terminate |

use crate::region::RegionError;
use crate::stream::StreamError;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;

/// How the agent reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    MetadataMismatch,
    ChangeTimeout,
    StreamRejected,
    Config,
    Shutdown,
    Fatal,
}

impl ErrorClass {
    /// Label used in metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retryable => "retryable",
            Self::MetadataMismatch => "metadata_mismatch",
            Self::ChangeTimeout => "change_timeout",
            Self::StreamRejected => "stream_rejected",
            Self::Config => "config",
            Self::Shutdown => "shutdown",
            Self::Fatal => "fatal",
        }
    }
}

/// Errors that can occur while replicating a region.
#[derive(Error, Debug)]
pub enum AgentError {
    /// The source region could not be reached.
    #[error("Source region unreachable: {0}")]
    SourceUnreachable(String),

    /// Transient fault in the row store (read timeout, iterator fault).
    #[error("Store error ({operation}): {message}")]
    Store { operation: String, message: String },

    /// The stream client no longer retains the position we tried to resume from.
    #[error("Stream position unavailable: {0}")]
    PositionUnavailable(String),

    /// Table is missing at the source.
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// Table was dropped and recreated under the same name.
    #[error("Table id mismatch for {table}: expected {expected}, found {actual}")]
    TableIdMismatch {
        table: String,
        expected: u64,
        actual: u64,
    },

    /// A stream membership change did not complete in its budget.
    #[error("Stream change for {table} did not complete within {waited:?}")]
    ChangeTimeout { table: String, waited: Duration },

    /// The stream client rejected the stream state as unrecoverable.
    #[error("Stream rejected: {0}")]
    StreamRejected(String),

    /// SQLite error in the checkpoint store.
    #[error("Checkpoint store error: {0}")]
    CheckpointStore(#[from] sqlx::Error),

    /// Invalid configuration or stream settings.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Agent state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    pub fn store(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::SourceUnreachable(_) | Self::Store { .. } | Self::PositionUnavailable(_) => {
                ErrorClass::Retryable
            }
            Self::TableNotFound(_) | Self::TableIdMismatch { .. } => ErrorClass::MetadataMismatch,
            Self::ChangeTimeout { .. } => ErrorClass::ChangeTimeout,
            Self::StreamRejected(_) => ErrorClass::StreamRejected,
            Self::Config(_) => ErrorClass::Config,
            Self::Shutdown => ErrorClass::Shutdown,
            Self::CheckpointStore(_) | Self::InvalidState { .. } | Self::Internal(_) => {
                ErrorClass::Fatal
            }
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    /// True for errors that must take the agent down.
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }
}

impl From<RegionError> for AgentError {
    fn from(e: RegionError) -> Self {
        match e {
            RegionError::Unavailable(msg) => Self::SourceUnreachable(msg),
            RegionError::Timeout(msg) => Self::store("read", msg),
            RegionError::TableNotFound(table) => Self::TableNotFound(table),
            RegionError::Fatal(msg) => Self::Internal(msg),
        }
    }
}

impl From<StreamError> for AgentError {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::Unreachable(msg) => Self::SourceUnreachable(msg),
            StreamError::PositionUnavailable(msg) => Self::PositionUnavailable(msg),
            StreamError::Rejected(msg) => Self::StreamRejected(msg),
            StreamError::Config(msg) => Self::Config(msg),
            StreamError::Canceled => Self::StreamRejected("subscription canceled".into()),
            StreamError::Other(msg) => Self::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(AgentError::SourceUnreachable("eu-west".into()).is_retryable());
        assert!(AgentError::store("scan", "iterator reset").is_retryable());
        assert!(AgentError::PositionUnavailable("shard 3 trimmed".into()).is_retryable());
    }

    #[test]
    fn test_metadata_mismatch_class() {
        let err = AgentError::TableIdMismatch {
            table: "users".into(),
            expected: 7,
            actual: 9,
        };
        assert_eq!(err.class(), ErrorClass::MetadataMismatch);
        assert!(!err.is_retryable());
        let msg = err.to_string();
        assert!(msg.contains("users"));
        assert!(msg.contains('7'));
        assert!(msg.contains('9'));
        assert_eq!(
            AgentError::TableNotFound("t".into()).class(),
            ErrorClass::MetadataMismatch
        );
    }

    #[test]
    fn test_change_timeout_not_fatal() {
        let err = AgentError::ChangeTimeout {
            table: "orders".into(),
            waited: Duration::from_secs(3),
        };
        assert_eq!(err.class(), ErrorClass::ChangeTimeout);
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("orders"));
    }

    #[test]
    fn test_fatal_classes() {
        assert!(AgentError::Internal("boom".into()).is_fatal());
        let err = AgentError::InvalidState {
            expected: "Streaming".into(),
            actual: "Canceled".into(),
        };
        assert!(err.is_fatal());
        assert!(err.to_string().contains("Canceled"));
    }

    #[test]
    fn test_config_and_shutdown_classes() {
        assert_eq!(AgentError::Config("x".into()).class(), ErrorClass::Config);
        assert_eq!(AgentError::Shutdown.class(), ErrorClass::Shutdown);
        assert!(!AgentError::Shutdown.is_retryable());
    }

    #[test]
    fn test_from_region_error() {
        let err: AgentError = RegionError::Unavailable("down".into()).into();
        assert!(matches!(err, AgentError::SourceUnreachable(_)));
        let err: AgentError = RegionError::Timeout("slow".into()).into();
        assert!(err.is_retryable());
        let err: AgentError = RegionError::TableNotFound("t".into()).into();
        assert!(matches!(err, AgentError::TableNotFound(ref t) if t == "t"));
        let err: AgentError = RegionError::Fatal("corrupt".into()).into();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_from_stream_error() {
        let err: AgentError = StreamError::Rejected("bad state".into()).into();
        assert_eq!(err.class(), ErrorClass::StreamRejected);
        let err: AgentError = StreamError::Config("no shards".into()).into();
        assert_eq!(err.class(), ErrorClass::Config);
        let err: AgentError = StreamError::PositionUnavailable("gone".into()).into();
        assert!(matches!(err, AgentError::PositionUnavailable(_)));
        let err: AgentError = StreamError::Unreachable("dns".into()).into();
        assert!(err.is_retryable());
    }
}
