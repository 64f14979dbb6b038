// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Fork-join merge coordinator for parallel coding agents.
//!
//! A task is forked into N agents, each working in its own git worktree on
//! its own branch. When an agent finishes, its work is committed and
//! submitted to a merge queue. A single coordinator drains the queue,
//! rebasing each branch onto a shared target branch, so exactly one writer
//! ever moves the target. Once every agent is done, the session is joined:
//! the target is pushed and one pull request aggregates the merged work.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`error`] - Error taxonomy and result aliases
//! - [`config`] - Configuration loading and merging
//! - [`telemetry`] - Tracing, metrics, and merge spans
//! - [`git`] - Async wrapper around the `git` binary
//! - [`workspace`] - Isolated per-agent worktrees
//! - [`session`] - Session records, persistence, and lifecycle
//! - [`queue`] - The merge queue actor and the rebase merger
//! - [`ipc`] - Coordinator socket protocol, server, and client
//! - [`completion`] - Agent completion client
//! - [`finalize`] - Session finalization and pull requests
//! - [`namer`] - Optional branch, commit, and summary naming
//!
//! # Example
//!
//! ```rust,ignore
//! use forkjoin::ipc::IpcClient;
//!
//! let client = IpcClient::new(".forkjoin/coordinator.sock");
//! let status = client.status().await?;
//! println!("{} job(s) queued", status.length);
//! ```

pub mod completion;
pub mod config;
pub mod error;
pub mod finalize;
pub mod git;
pub mod ipc;
pub mod namer;
pub mod queue;
pub mod session;
pub mod telemetry;
pub mod workspace;

// Re-export commonly used types at crate root
pub use error::{kind_of, ConfigError, ErrorKind, Result};
pub use queue::{Coordinator, CoordinatorHandle, CoordinatorSettings, ConflictPolicy, MergeJob, MergeOutcome};
pub use session::{Agent, AgentStatus, Session, SessionState, SessionStore};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_public_exports() {
        assert_eq!(ConflictPolicy::default(), ConflictPolicy::Surface);
        assert_eq!(AgentStatus::Running.as_str(), "RUNNING");
        assert_eq!(ErrorKind::MergeConflict.as_str(), "MERGE_CONFLICT");
    }
}
