// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Workspace manager trait and naming rules.
//!
//! Every agent gets exactly one branch and one working copy, both derived
//! deterministically from the session and agent ids:
//!
//! ```text
//! branch:    agent/<session_id>/<agent_id>
//! workspace: <worktree_root>/<prefix>agent-<session_id>-<agent_id>
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::git::GitError;

/// Error type for workspace operations.
#[derive(Debug, thiserror::Error)]
pub enum IsolationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] GitError),

    #[error("Workspace conflict: {0}")]
    WorkspaceConflict(String),

    #[error("Base branch not found: {0}")]
    BaseNotFound(String),

    #[error("Invalid workspace: {0}")]
    InvalidWorkspace(String),
}

impl IsolationError {
    /// Taxonomy classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::WorkspaceConflict(_) => ErrorKind::WorkspaceConflict,
            _ => ErrorKind::Internal,
        }
    }
}

/// A provisioned agent workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    /// Checkout directory.
    pub path: PathBuf,
    /// Branch checked out in `path`.
    pub branch: String,
    /// Branch the workspace was forked from.
    pub base_branch: String,
}

/// Creates and destroys isolated agent workspaces.
#[async_trait]
pub trait WorkspaceManager: Send + Sync {
    /// Provision a workspace for `agent_id` rooted at `base_branch`.
    ///
    /// Fails with [`IsolationError::WorkspaceConflict`] if the branch or the
    /// directory already exists.
    async fn create(
        &self,
        session_id: &str,
        agent_id: &str,
        base_branch: &str,
    ) -> Result<WorkspaceInfo, IsolationError>;

    /// Remove a workspace and its branch. Missing pieces are ignored.
    async fn destroy(&self, path: &Path, branch: &str) -> Result<(), IsolationError>;

    /// Workspaces currently managed by this instance.
    async fn list(&self) -> Result<Vec<WorkspaceInfo>, IsolationError>;
}

/// Branch name owned by an agent.
pub fn agent_branch_name(session_id: &str, agent_id: &str) -> String {
    format!("agent/{}/{}", session_id, agent_id)
}

/// Sanitize a branch name for use as a directory name.
pub fn sanitize_branch_name(branch: &str) -> String {
    branch
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '-',
            c => c,
        })
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}

/// Directory for a branch's worktree under `root`.
pub fn worktree_path_for_branch(root: &Path, branch: &str, prefix: &str) -> PathBuf {
    root.join(format!("{}{}", prefix, sanitize_branch_name(branch)))
}

/// Default directory that holds agent worktrees: a sibling of the repository.
pub fn default_worktree_root(repo_root: &Path) -> PathBuf {
    repo_root.parent().unwrap_or(repo_root).to_path_buf()
}

/// Find the enclosing git repository root.
pub fn find_repo_root(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .find(|a| a.join(".git").exists())
        .map(Path::to_path_buf)
}
