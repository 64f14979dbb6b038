// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error taxonomy for the fork-join coordinator.
//!
//! Each subsystem owns a `thiserror` enum (`IsolationError`, `StoreError`,
//! `QueueError`, `IpcError`, ...). Every one of them classifies itself into an
//! [`ErrorKind`], which is the stable, wire-visible vocabulary used in IPC
//! responses and CLI exit reporting. `anyhow` is used at the binary boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable classification of failures shared by every subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Duplicate branch or workspace path.
    WorkspaceConflict,
    /// No session with the given id.
    SessionNotFound,
    /// No agent with the given id in the session.
    AgentNotFound,
    /// Job rejected at submission time.
    EnqueueRejected,
    /// Rebase hit a content conflict.
    MergeConflict,
    /// Retry ceiling reached.
    MergeFailedTerminal,
    /// Remote refused the push.
    PushRejected,
    /// Coordinator could not be reached.
    IpcUnavailable,
    /// Persistent state could not be trusted.
    StoreCorrupted,
    /// Anything not covered above (git plumbing, I/O, ...).
    Internal,
}

impl ErrorKind {
    /// Wire code for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkspaceConflict => "WORKSPACE_CONFLICT",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::AgentNotFound => "AGENT_NOT_FOUND",
            Self::EnqueueRejected => "ENQUEUE_REJECTED",
            Self::MergeConflict => "MERGE_CONFLICT",
            Self::MergeFailedTerminal => "MERGE_FAILED_TERMINAL",
            Self::PushRejected => "PUSH_REJECTED",
            Self::IpcUnavailable => "IPC_UNAVAILABLE",
            Self::StoreCorrupted => "STORE_CORRUPTED",
            Self::Internal => "INTERNAL",
        }
    }

    /// Process exit code used by the CLI for this kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Internal => 1,
            Self::WorkspaceConflict => 10,
            Self::SessionNotFound | Self::AgentNotFound => 11,
            Self::EnqueueRejected => 12,
            Self::MergeConflict => 13,
            Self::MergeFailedTerminal => 14,
            Self::PushRejected => 15,
            Self::IpcUnavailable => 16,
            Self::StoreCorrupted => 17,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Invalid config format: {0}")]
    InvalidFormat(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("IO error reading config: {0}")]
    IoError(String),

    #[error("YAML parsing error: {0}")]
    YamlError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::YamlError(err.to_string())
    }
}

/// Result type alias using anyhow for flexible error handling.
pub type Result<T> = anyhow::Result<T>;

/// Find the [`ErrorKind`] of the first classified error in an anyhow chain.
pub fn kind_of(err: &anyhow::Error) -> ErrorKind {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<crate::workspace::IsolationError>() {
            return e.kind();
        }
        if let Some(e) = cause.downcast_ref::<crate::session::StoreError>() {
            return e.kind();
        }
        if let Some(e) = cause.downcast_ref::<crate::session::SessionError>() {
            return e.kind();
        }
        if let Some(e) = cause.downcast_ref::<crate::queue::QueueError>() {
            return e.kind();
        }
        if let Some(e) = cause.downcast_ref::<crate::ipc::IpcError>() {
            return e.kind();
        }
        if let Some(e) = cause.downcast_ref::<crate::completion::CompletionError>() {
            return e.kind();
        }
        if let Some(e) = cause.downcast_ref::<crate::finalize::FinalizeError>() {
            return e.kind();
        }
    }
    ErrorKind::Internal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_codes() {
        assert_eq!(ErrorKind::MergeConflict.as_str(), "MERGE_CONFLICT");
        assert_eq!(ErrorKind::IpcUnavailable.to_string(), "IPC_UNAVAILABLE");

        let json = serde_json::to_string(&ErrorKind::PushRejected).unwrap();
        assert_eq!(json, "\"PUSH_REJECTED\"");

        let parsed: ErrorKind = serde_json::from_str("\"STORE_CORRUPTED\"").unwrap();
        assert_eq!(parsed, ErrorKind::StoreCorrupted);
    }

    #[test]
    fn test_exit_codes_are_distinct_for_failures() {
        assert_eq!(ErrorKind::Internal.exit_code(), 1);
        assert_ne!(
            ErrorKind::MergeConflict.exit_code(),
            ErrorKind::PushRejected.exit_code()
        );
    }

    #[test]
    fn test_config_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(ConfigError::from(io_err), ConfigError::NotFound(_)));

        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(ConfigError::from(io_err), ConfigError::IoError(_)));
    }

    #[test]
    fn test_kind_of_unclassified() {
        let err = anyhow::anyhow!("something odd");
        assert_eq!(kind_of(&err), ErrorKind::Internal);
    }

    #[test]
    fn test_kind_of_finds_classified_cause() {
        let err = anyhow::Error::new(crate::queue::QueueError::Rejected(
            "unknown agent".to_string(),
        ))
        .context("enqueue failed");
        assert_eq!(kind_of(&err), ErrorKind::EnqueueRejected);
    }
}
