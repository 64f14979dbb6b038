// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Isolated per-agent workspaces.

mod isolation;
mod worktree;

pub use isolation::{
    agent_branch_name, default_worktree_root, find_repo_root, sanitize_branch_name,
    worktree_path_for_branch, IsolationError, WorkspaceInfo, WorkspaceManager,
};
pub use worktree::{GitWorktreeManager, WORKTREE_PREFIX};
