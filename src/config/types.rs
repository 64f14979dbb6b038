// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration type definitions.
//!
//! `WorkspaceConfig` is what a config file may contain (every field optional);
//! `ResolvedConfig` is the merged result with every value filled in.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::queue::ConflictPolicy;

/// Directory holding the socket, database, and merge marker.
pub const STATE_DIR_NAME: &str = ".forkjoin";

/// Socket file name inside the state directory.
pub const SOCKET_FILE: &str = "coordinator.sock";

/// Coordinator configuration as written in `.forkjoin.json` and friends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceConfig {
    /// Unix socket the daemon listens on; relative paths are from the root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,

    /// Where the session database and merge marker live.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,

    /// Directory that agent worktrees are created in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree_root: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree_prefix: Option<String>,

    /// Pending jobs allowed before enqueue answers QueueFull.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_queue_size: Option<usize>,

    /// Explicit retries allowed after the first failed attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict_policy: Option<ConflictPolicy>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_on_merge: Option<bool>,

    /// Finalize a session as soon as its last agent is terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_finalize: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_timeout_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<PullRequestConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub namer: Option<NamerConfig>,
}

/// Pull request settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub draft: Option<bool>,
}

/// Namer (LLM) settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Fully merged configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedConfig {
    pub workspace_root: PathBuf,
    pub socket_path: PathBuf,
    pub state_dir: PathBuf,
    pub worktree_root: Option<PathBuf>,
    pub worktree_prefix: String,
    pub max_queue_size: usize,
    pub max_retries: u32,
    pub conflict_policy: ConflictPolicy,
    pub remote: String,
    pub push_on_merge: bool,
    pub auto_finalize: bool,
    pub wait_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub pull_request_enabled: bool,
    pub pull_request_draft: bool,
    pub namer_enabled: bool,
    pub namer_model: Option<String>,
    pub namer_base_url: Option<String>,
    pub namer_timeout_ms: u64,
}

impl ResolvedConfig {
    /// Defaults for a repository rooted at `root`.
    pub fn for_root(root: &Path) -> Self {
        let state_dir = root.join(STATE_DIR_NAME);
        Self {
            workspace_root: root.to_path_buf(),
            socket_path: state_dir.join(SOCKET_FILE),
            state_dir,
            worktree_root: None,
            worktree_prefix: crate::workspace::WORKTREE_PREFIX.to_string(),
            max_queue_size: 100,
            max_retries: 3,
            conflict_policy: ConflictPolicy::Surface,
            remote: "origin".to_string(),
            push_on_merge: true,
            auto_finalize: true,
            wait_timeout_ms: 600_000,
            connect_timeout_ms: 5_000,
            pull_request_enabled: true,
            pull_request_draft: false,
            namer_enabled: false,
            namer_model: None,
            namer_base_url: None,
            namer_timeout_ms: 10_000,
        }
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn namer_timeout(&self) -> Duration {
        Duration::from_millis(self.namer_timeout_ms)
    }
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self::for_root(Path::new("."))
    }
}
