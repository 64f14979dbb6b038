// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! IPC error types.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::error::ErrorKind;

/// Errors that can occur in the IPC subsystem.
#[derive(Debug, Error)]
pub enum IpcError {
    /// Nothing answered at the socket.
    #[error("Coordinator unavailable at {}: {reason}", path.display())]
    Unavailable { path: PathBuf, reason: String },

    /// Failed to bind to the socket.
    #[error("Failed to bind IPC endpoint: {0}")]
    BindFailed(String),

    /// Another coordinator owns the socket.
    #[error("A coordinator is already listening on {}", .0.display())]
    AlreadyRunning(PathBuf),

    /// General transport error.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Connection closed before a response arrived.
    #[error("IPC connection closed unexpectedly")]
    ConnectionClosed,

    /// Timeout waiting for response.
    #[error("IPC operation timed out")]
    Timeout,

    /// Invalid message received.
    #[error("Invalid IPC message: {0}")]
    InvalidMessage(String),

    /// The coordinator answered with an error.
    #[error("{reason}")]
    Remote { code: Option<ErrorKind>, reason: String },

    /// Server has not been started.
    #[error("Server not started")]
    NotStarted,
}

impl IpcError {
    /// Create an IPC error from an IO error with context.
    pub fn from_io_error(context: &str, err: io::Error) -> Self {
        IpcError::Transport(format!("{}: {}", context, err))
    }

    /// Taxonomy classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Remote { code, .. } => code.unwrap_or(ErrorKind::Internal),
            Self::Unavailable { .. }
            | Self::Transport(_)
            | Self::ConnectionClosed
            | Self::Timeout => ErrorKind::IpcUnavailable,
            Self::BindFailed(_) | Self::AlreadyRunning(_) | Self::InvalidMessage(_) | Self::NotStarted => {
                ErrorKind::Internal
            }
        }
    }
}

/// Result type for IPC operations.
pub type IpcResult<T> = Result<T, IpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipc_error_display() {
        let err = IpcError::BindFailed("permission denied".to_string());
        assert_eq!(err.to_string(), "Failed to bind IPC endpoint: permission denied");

        let err = IpcError::Unavailable {
            path: PathBuf::from("/tmp/fj.sock"),
            reason: "connection refused".to_string(),
        };
        assert_eq!(err.to_string(), "Coordinator unavailable at /tmp/fj.sock: connection refused");
    }

    #[test]
    fn test_from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed");
        let err = IpcError::from_io_error("writing request", io_err);
        assert!(err.to_string().contains("writing request"));
        assert!(err.to_string().contains("pipe closed"));
        assert_eq!(err.kind(), ErrorKind::IpcUnavailable);
    }

    #[test]
    fn test_remote_kind_passthrough() {
        let err = IpcError::Remote {
            code: Some(ErrorKind::MergeFailedTerminal),
            reason: "exhausted".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::MergeFailedTerminal);

        let err = IpcError::Remote {
            code: None,
            reason: "?".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
