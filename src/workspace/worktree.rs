// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Git worktree backed workspace manager.
//!
//! ```text
//! /work/project/                       # repository, base + target branches
//! /work/fj-agent-<session>-a1/         # agent a1 worktree on agent/<session>/a1
//! /work/fj-agent-<session>-a2/         # agent a2 worktree on agent/<session>/a2
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::git::Git;

use super::isolation::{
    agent_branch_name, default_worktree_root, worktree_path_for_branch, IsolationError,
    WorkspaceInfo, WorkspaceManager,
};

/// Default prefix for worktree directories.
pub const WORKTREE_PREFIX: &str = "fj-";

/// Workspace manager that provisions one `git worktree` per agent.
pub struct GitWorktreeManager {
    repo: Git,
    worktree_root: PathBuf,
    prefix: String,
    tracked: Arc<RwLock<HashMap<String, WorkspaceInfo>>>,
}

impl GitWorktreeManager {
    /// Manage worktrees for the repository at `repo_root`.
    pub fn new(repo_root: impl AsRef<Path>) -> Self {
        let repo_root = repo_root.as_ref();
        Self {
            repo: Git::new(repo_root),
            worktree_root: default_worktree_root(repo_root),
            prefix: WORKTREE_PREFIX.to_string(),
            tracked: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Set a custom prefix for worktree directories.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Place worktrees under `dir` instead of next to the repository.
    pub fn with_worktree_root(mut self, dir: impl AsRef<Path>) -> Self {
        self.worktree_root = dir.as_ref().to_path_buf();
        self
    }

    /// Where the worktree for `branch` lives.
    pub fn worktree_path(&self, branch: &str) -> PathBuf {
        worktree_path_for_branch(&self.worktree_root, branch, &self.prefix)
    }

    fn is_managed_path(&self, path: &Path) -> bool {
        path.parent() == Some(self.worktree_root.as_path())
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(&self.prefix))
                .unwrap_or(false)
    }
}

#[async_trait]
impl WorkspaceManager for GitWorktreeManager {
    async fn create(
        &self,
        session_id: &str,
        agent_id: &str,
        base_branch: &str,
    ) -> Result<WorkspaceInfo, IsolationError> {
        let branch = agent_branch_name(session_id, agent_id);
        let path = self.worktree_path(&branch);

        if self.repo.branch_exists(&branch).await {
            return Err(IsolationError::WorkspaceConflict(format!(
                "branch already exists: {}",
                branch
            )));
        }
        if path.exists() {
            return Err(IsolationError::WorkspaceConflict(format!(
                "directory already exists: {}",
                path.display()
            )));
        }
        if self.repo.rev_parse(base_branch).await.is_err() {
            return Err(IsolationError::BaseNotFound(base_branch.to_string()));
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        info!("Creating worktree for {} at {:?}", branch, path);
        let path_str = path.to_string_lossy().to_string();
        self.repo
            .run(&["worktree", "add", "-b", &branch, &path_str, base_branch])
            .await?;

        let workspace = WorkspaceInfo {
            path,
            branch: branch.clone(),
            base_branch: base_branch.to_string(),
        };
        self.tracked.write().await.insert(branch, workspace.clone());

        debug!("Created worktree {:?}", workspace.path);
        Ok(workspace)
    }

    async fn destroy(&self, path: &Path, branch: &str) -> Result<(), IsolationError> {
        if path.exists() {
            info!("Removing worktree for {} at {:?}", branch, path);
            let path_str = path.to_string_lossy().to_string();
            if let Err(e) = self
                .repo
                .run(&["worktree", "remove", "--force", &path_str])
                .await
            {
                warn!("git worktree remove failed, removing manually: {}", e);
                std::fs::remove_dir_all(path)?;
            }
        }
        // Drops administrative entries for directories deleted behind git's back.
        let _ = self.repo.run(&["worktree", "prune"]).await;

        if self.repo.branch_exists(branch).await {
            self.repo.run(&["branch", "-D", branch]).await?;
        }

        self.tracked.write().await.remove(branch);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<WorkspaceInfo>, IsolationError> {
        let tracked = self.tracked.read().await;
        let mut result: Vec<WorkspaceInfo> = tracked
            .values()
            .filter(|ws| ws.path.exists())
            .cloned()
            .collect();

        for entry in self.repo.worktrees().await? {
            let Some(branch) = entry.branch else { continue };
            if tracked.contains_key(&branch) || !branch.starts_with("agent/") {
                continue;
            }
            if self.is_managed_path(&entry.path) {
                result.push(WorkspaceInfo {
                    path: entry.path,
                    branch,
                    base_branch: String::new(),
                });
            }
        }

        result.sort_by(|a, b| a.branch.cmp(&b.branch));
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn init_repo() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        let git = Git::new(&repo);
        git.run(&["init", "-q"]).await.unwrap();
        git.run(&["symbolic-ref", "HEAD", "refs/heads/main"]).await.unwrap();
        git.run(&["config", "user.email", "test@example.com"]).await.unwrap();
        git.run(&["config", "user.name", "Test"]).await.unwrap();
        std::fs::write(repo.join("README.md"), "hello\n").unwrap();
        git.add_all().await.unwrap();
        git.commit("initial").await.unwrap();
        (dir, repo)
    }

    #[test]
    fn test_worktree_path_layout() {
        let manager = GitWorktreeManager::new("/work/project");
        assert_eq!(
            manager.worktree_path("agent/s1/a1"),
            PathBuf::from("/work/fj-agent-s1-a1")
        );

        let manager = GitWorktreeManager::new("/work/project")
            .with_prefix("wt-")
            .with_worktree_root("/tmp/trees");
        assert_eq!(
            manager.worktree_path("agent/s1/a1"),
            PathBuf::from("/tmp/trees/wt-agent-s1-a1")
        );
    }

    #[tokio::test]
    async fn test_create_and_destroy() {
        let (dir, repo) = init_repo().await;
        let manager = GitWorktreeManager::new(&repo).with_worktree_root(dir.path().join("trees"));

        let ws = manager.create("s1", "a1", "main").await.unwrap();
        assert_eq!(ws.branch, "agent/s1/a1");
        assert!(ws.path.join("README.md").exists());
        assert_eq!(manager.list().await.unwrap(), vec![ws.clone()]);

        manager.destroy(&ws.path, &ws.branch).await.unwrap();
        assert!(!ws.path.exists());
        assert!(!Git::new(&repo).branch_exists(&ws.branch).await);
        assert!(manager.list().await.unwrap().is_empty());

        // Second destroy is a no-op.
        manager.destroy(&ws.path, &ws.branch).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_conflict() {
        let (dir, repo) = init_repo().await;
        let manager = GitWorktreeManager::new(&repo).with_worktree_root(dir.path().join("trees"));

        manager.create("s1", "a1", "main").await.unwrap();
        let err = manager.create("s1", "a1", "main").await.unwrap_err();
        assert!(matches!(err, IsolationError::WorkspaceConflict(_)));
    }

    #[tokio::test]
    async fn test_create_missing_base() {
        let (dir, repo) = init_repo().await;
        let manager = GitWorktreeManager::new(&repo).with_worktree_root(dir.path().join("trees"));

        let err = manager.create("s1", "a1", "nope").await.unwrap_err();
        assert!(matches!(err, IsolationError::BaseNotFound(_)));
    }
}
