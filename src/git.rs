// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Thin async wrapper around the `git` binary.
//!
//! Every git interaction in the crate goes through [`Git`], which runs one
//! subprocess per call in a fixed working directory. Output is trimmed and
//! non-zero exits become [`GitError::Command`] carrying stderr.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::trace;

/// Error type for git invocations.
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("git {args} failed: {stderr}")]
    Command { args: String, stderr: String },
}

/// Raw result of a git invocation that is allowed to fail.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// A checkout entry reported by `git worktree list --porcelain`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub head: String,
    pub branch: Option<String>,
}

/// Git command runner bound to a directory.
#[derive(Debug, Clone)]
pub struct Git {
    dir: PathBuf,
}

impl Git {
    /// Create a runner for the given working directory.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// The directory commands run in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Run git and capture the outcome without treating failure as an error.
    pub async fn output(&self, args: &[&str]) -> Result<GitOutput, GitError> {
        trace!(dir = %self.dir.display(), "git {}", args.join(" "));
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_EDITOR", "true")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        Ok(GitOutput {
            success: output.status.success(),
            // Leading whitespace is significant in porcelain formats.
            stdout: String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Run git and return trimmed stdout.
    pub async fn run(&self, args: &[&str]) -> Result<String, GitError> {
        let out = self.output(args).await?;
        if out.success {
            Ok(out.stdout)
        } else {
            Err(GitError::Command {
                args: args.join(" "),
                stderr: if out.stderr.is_empty() { out.stdout } else { out.stderr },
            })
        }
    }

    /// Resolve a revision to a full commit sha.
    pub async fn rev_parse(&self, rev: &str) -> Result<String, GitError> {
        let spec = format!("{}^{{commit}}", rev);
        self.run(&["rev-parse", "--verify", "--quiet", &spec]).await
    }

    /// Check whether a local branch exists.
    pub async fn branch_exists(&self, branch: &str) -> bool {
        let full = format!("refs/heads/{}", branch);
        matches!(
            self.output(&["rev-parse", "--verify", "--quiet", &full]).await,
            Ok(out) if out.success
        )
    }

    /// Create `branch` pointing at `start`.
    pub async fn create_branch(&self, branch: &str, start: &str) -> Result<(), GitError> {
        self.run(&["branch", branch, start]).await.map(|_| ())
    }

    /// Current branch name, `None` when detached.
    pub async fn current_branch(&self) -> Result<Option<String>, GitError> {
        let name = self.run(&["branch", "--show-current"]).await?;
        Ok(if name.is_empty() { None } else { Some(name) })
    }

    /// Paths with staged, unstaged, or untracked changes.
    pub async fn changed_paths(&self) -> Result<Vec<String>, GitError> {
        let out = self
            .run(&["status", "--porcelain", "-z", "--untracked-files=all"])
            .await?;
        Ok(parse_porcelain_paths(&out))
    }

    /// Whether the working tree has anything to commit.
    pub async fn has_changes(&self) -> Result<bool, GitError> {
        Ok(!self.changed_paths().await?.is_empty())
    }

    /// Stage everything, including deletions and untracked files.
    pub async fn add_all(&self) -> Result<(), GitError> {
        self.run(&["add", "-A"]).await.map(|_| ())
    }

    /// Commit the index and return the new HEAD sha.
    pub async fn commit(&self, message: &str) -> Result<String, GitError> {
        self.run(&["commit", "--no-verify", "-m", message]).await?;
        self.rev_parse("HEAD").await
    }

    /// Number of commits reachable from `head` but not from `base`.
    pub async fn count_commits(&self, base: &str, head: &str) -> Result<usize, GitError> {
        let range = format!("{}..{}", base, head);
        let out = self.run(&["rev-list", "--count", &range]).await?;
        out.parse::<usize>().map_err(|e| GitError::Command {
            args: format!("rev-list --count {}", range),
            stderr: e.to_string(),
        })
    }

    /// Whether `ancestor` is reachable from `descendant`.
    pub async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, GitError> {
        let out = self
            .output(&["merge-base", "--is-ancestor", ancestor, descendant])
            .await?;
        Ok(out.success)
    }

    /// Move a branch to `new`, only if it currently points at `old`.
    pub async fn update_branch(&self, branch: &str, new: &str, old: &str) -> Result<(), GitError> {
        let full = format!("refs/heads/{}", branch);
        self.run(&["update-ref", "-m", "fork-join: advance", &full, new, old])
            .await
            .map(|_| ())
    }

    /// Rebase the checked-out branch onto `upstream`.
    ///
    /// Returns the raw output so callers can distinguish conflicts from other
    /// failures.
    pub async fn rebase(&self, upstream: &str, strategy_option: Option<&str>) -> Result<GitOutput, GitError> {
        let opt = strategy_option.map(|o| format!("-X{}", o));
        let mut args = vec!["rebase", "--no-autostash"];
        if let Some(opt) = opt.as_deref() {
            args.push(opt);
        }
        args.push(upstream);
        self.output(&args).await
    }

    /// Abort an in-progress rebase. Succeeds when none is running.
    pub async fn rebase_abort(&self) -> Result<(), GitError> {
        if self.rebase_in_progress().await? {
            self.run(&["rebase", "--abort"]).await?;
        }
        Ok(())
    }

    /// Whether a rebase is stopped in this checkout.
    pub async fn rebase_in_progress(&self) -> Result<bool, GitError> {
        for marker in ["rebase-merge", "rebase-apply"] {
            let path = self.run(&["rev-parse", "--git-path", marker]).await?;
            let path = PathBuf::from(path);
            let path = if path.is_absolute() { path } else { self.dir.join(path) };
            if path.exists() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Paths left unmerged by a stopped rebase or merge.
    pub async fn conflicted_files(&self) -> Result<Vec<String>, GitError> {
        let out = self.run(&["diff", "--name-only", "-z", "--diff-filter=U"]).await?;
        Ok(out.split('\0').filter(|p| !p.is_empty()).map(str::to_string).collect())
    }

    /// Whether a remote with the given name is configured.
    pub async fn remote_exists(&self, remote: &str) -> bool {
        match self.run(&["remote"]).await {
            Ok(out) => out.lines().any(|l| l.trim() == remote),
            Err(_) => false,
        }
    }

    /// Push a local branch to the same name on `remote`.
    pub async fn push(&self, remote: &str, branch: &str) -> Result<(), GitError> {
        let refspec = format!("refs/heads/{0}:refs/heads/{0}", branch);
        self.run(&["push", "--porcelain", remote, &refspec]).await.map(|_| ())
    }

    /// Tip of `branch` on `remote`, if it exists there.
    pub async fn remote_tip(&self, remote: &str, branch: &str) -> Result<Option<String>, GitError> {
        let full = format!("refs/heads/{}", branch);
        let out = self.run(&["ls-remote", remote, &full]).await?;
        Ok(out
            .lines()
            .next()
            .and_then(|l| l.split_whitespace().next())
            .map(str::to_string))
    }

    /// Full commit message of a revision.
    pub async fn commit_message(&self, rev: &str) -> Result<String, GitError> {
        self.run(&["log", "-1", "--format=%B", rev]).await
    }

    /// Subjects of non-merge commits in `base..head`, oldest first.
    pub async fn log_subjects(&self, base: &str, head: &str) -> Result<Vec<String>, GitError> {
        let range = format!("{}..{}", base, head);
        let out = self
            .run(&["log", "--no-merges", "--reverse", "--pretty=format:%s", &range])
            .await?;
        Ok(out.lines().filter(|l| !l.is_empty()).map(str::to_string).collect())
    }

    /// All checkouts attached to this repository.
    pub async fn worktrees(&self) -> Result<Vec<WorktreeEntry>, GitError> {
        let out = self.run(&["worktree", "list", "--porcelain"]).await?;
        Ok(parse_worktree_list(&out))
    }

    /// The checkout that has `branch` checked out, if any.
    pub async fn worktree_for_branch(&self, branch: &str) -> Result<Option<PathBuf>, GitError> {
        Ok(self
            .worktrees()
            .await?
            .into_iter()
            .find(|w| w.branch.as_deref() == Some(branch))
            .map(|w| w.path))
    }
}

/// Extract paths from `git status --porcelain -z` output.
///
/// Paths are NUL-terminated and unquoted. Renames and copies carry the
/// original path as an extra field; only the new path is reported.
pub fn parse_porcelain_paths(output: &str) -> Vec<String> {
    let mut paths = Vec::new();
    let mut fields = output.split('\0');
    while let Some(entry) = fields.next() {
        if entry.len() < 4 {
            continue;
        }
        let (status, path) = entry.split_at(3);
        if status.contains(['R', 'C']) {
            fields.next();
        }
        paths.push(path.to_string());
    }
    paths
}

/// Parse `git worktree list --porcelain` output.
pub fn parse_worktree_list(output: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current = WorktreeEntry::default();

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if !current.path.as_os_str().is_empty() {
                entries.push(std::mem::take(&mut current));
            }
            current.path = PathBuf::from(path);
        } else if let Some(head) = line.strip_prefix("HEAD ") {
            current.head = head.to_string();
        } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
            current.branch = Some(branch.to_string());
        }
    }

    if !current.path.as_os_str().is_empty() {
        entries.push(current);
    }

    entries
}
