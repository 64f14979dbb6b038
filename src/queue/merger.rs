// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Rebase-based integration of one agent branch into the target.
//!
//! The merge runs in the agent's own worktree, where the source branch is
//! checked out:
//!
//! 1. rebase the source onto the current target tip (`--no-autostash`);
//! 2. advance the target to the rebased tip with a compare-and-swap;
//! 3. push the target when a remote is configured, rolling back on rejection.
//!
//! A [`MergeMarker`] is journaled before each step so an interrupted merge
//! can be undone by [`MergeExecutor::recover`].

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::git::{Git, GitError};

use super::journal::{MergeJournal, MergeMarker, MergeStage};
use super::policy::ConflictPolicy;
use super::types::{MergeJob, MergeOutcome, QueueError};

/// How an interrupted merge was resolved on startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    /// The target already carries the merge and nothing is left to do.
    Completed { commit_sha: String },
    /// The target was moved back to its tip before the merge.
    RolledBack,
    /// The target was never moved.
    Untouched,
}

/// Result of crash recovery for the job named in the marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredMerge {
    pub job_id: Uuid,
    pub session_id: String,
    pub agent_id: String,
    pub recovery: Recovery,
}

/// Backend that integrates a job's branch into its target.
///
/// The coordinator guarantees at most one `merge` call is running.
#[async_trait]
pub trait MergeExecutor: Send + Sync {
    async fn merge(&self, job: &MergeJob) -> MergeOutcome;

    /// Undo or confirm a merge interrupted by a crash.
    async fn recover(&self) -> Result<Option<RecoveredMerge>, QueueError> {
        Ok(None)
    }
}

/// Internal failure carrying its taxonomy kind.
struct StepError {
    kind: ErrorKind,
    reason: String,
}

impl StepError {
    fn internal(reason: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Internal,
            reason: reason.into(),
        }
    }
}

impl From<GitError> for StepError {
    fn from(err: GitError) -> Self {
        Self::internal(err.to_string())
    }
}

/// [`MergeExecutor`] backed by git subprocesses.
pub struct GitRebaseMerger {
    repo: Git,
    journal: MergeJournal,
    policy: ConflictPolicy,
    remote: String,
    push: bool,
}

impl GitRebaseMerger {
    pub fn new(repo_root: impl AsRef<Path>, state_dir: &Path) -> Self {
        Self {
            repo: Git::new(repo_root),
            journal: MergeJournal::new(state_dir),
            policy: ConflictPolicy::default(),
            remote: "origin".to_string(),
            push: true,
        }
    }

    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = remote.into();
        self
    }

    /// Whether to push the target after each merge.
    pub fn with_push(mut self, push: bool) -> Self {
        self.push = push;
        self
    }

    fn journal(&self, marker: &MergeMarker) -> Result<(), StepError> {
        self.journal
            .write(marker)
            .map_err(|e| StepError::internal(format!("cannot write merge marker: {}", e)))
    }

    async fn run(&self, job: &MergeJob) -> Result<MergeOutcome, StepError> {
        if !job.source_workspace.exists() {
            return Err(StepError::internal(format!(
                "workspace {} is missing",
                job.source_workspace.display()
            )));
        }
        let ws = Git::new(&job.source_workspace);
        match ws.current_branch().await? {
            Some(b) if b == job.source_branch => {}
            other => {
                return Err(StepError::internal(format!(
                    "workspace has {} checked out, expected {}",
                    other.as_deref().unwrap_or("a detached HEAD"),
                    job.source_branch
                )));
            }
        }

        let target_before = self.repo.rev_parse(&job.target_branch).await?;
        let source_before = ws.rev_parse("HEAD").await?;
        let marker = MergeMarker::new(job, &target_before, &source_before);
        self.journal(&marker)?;

        let result = self.integrate(job, &ws, marker).await;
        if result.is_err() {
            restore_source(&ws, &source_before).await;
        }
        result
    }

    /// Rebase the agent branch, advance the target, and publish it.
    async fn integrate(&self, job: &MergeJob, ws: &Git, marker: MergeMarker) -> Result<MergeOutcome, StepError> {
        let target_before = marker.target_tip_before.clone();
        if let Some(files) = self.rebase(ws, &target_before).await? {
            self.clear_marker();
            return Ok(MergeOutcome::Conflict { files });
        }

        let new_tip = ws.rev_parse("HEAD").await?;
        if !ws.is_ancestor(&target_before, &new_tip).await? {
            return Err(StepError::internal("rebased tip does not descend from the target"));
        }

        let push = self.push && self.repo.remote_exists(&self.remote).await;
        let mut marker = marker.at(MergeStage::Advancing);
        marker.new_tip = Some(new_tip.clone());
        marker.push_required = push;
        self.journal(&marker)?;
        self.move_target(&job.target_branch, &new_tip, &target_before).await?;
        debug!("Advanced {} {} -> {}", job.target_branch, short(&target_before), short(&new_tip));

        if push {
            let published = match self.journal(&marker.clone().at(MergeStage::Pushing)) {
                Ok(()) => self
                    .repo
                    .push(&self.remote, &job.target_branch)
                    .await
                    .map_err(|e| StepError {
                        kind: ErrorKind::PushRejected,
                        reason: format!("push to {} rejected: {}", self.remote, e),
                    }),
                Err(e) => Err(e),
            };
            if let Err(e) = published {
                warn!("Publishing {} failed, rolling back: {}", job.target_branch, e.reason);
                self.move_target(&job.target_branch, &target_before, &new_tip).await?;
                self.clear_marker();
                return Err(e);
            }
        }

        self.clear_marker();
        Ok(MergeOutcome::Merged { commit_sha: new_tip })
    }

    /// Rebase, applying the conflict policy. Returns the conflicting paths
    /// when the rebase could not complete; the workspace is left clean.
    async fn rebase(&self, ws: &Git, onto: &str) -> Result<Option<Vec<String>>, StepError> {
        let out = ws.rebase(onto, None).await?;
        if out.success {
            return Ok(None);
        }

        let files = ws.conflicted_files().await.unwrap_or_default();
        ws.rebase_abort().await?;
        if files.is_empty() {
            return Err(StepError::internal(format!("rebase failed: {}", out.stderr)));
        }

        let Some(option) = self.policy.strategy_option() else {
            return Ok(Some(files));
        };
        info!("Rebase conflicted; retrying with -X{} ({})", option, self.policy);
        let retry = ws.rebase(onto, Some(option)).await?;
        if retry.success {
            return Ok(None);
        }
        let remaining = ws.conflicted_files().await.unwrap_or_default();
        ws.rebase_abort().await?;
        Ok(Some(if remaining.is_empty() { files } else { remaining }))
    }

    /// Move the target from `old` to `new`.
    ///
    /// A target checked out somewhere is moved inside that checkout so its
    /// index and files follow the ref.
    async fn move_target(&self, target: &str, new: &str, old: &str) -> Result<(), StepError> {
        match self.repo.worktree_for_branch(target).await? {
            Some(path) => {
                let checkout = Git::new(&path);
                let head = checkout.rev_parse("HEAD").await?;
                if head != old {
                    return Err(StepError::internal(format!("{} moved during the merge", target)));
                }
                checkout.run(&["reset", "--keep", new]).await?;
            }
            None => self.repo.update_branch(target, new, old).await?,
        }
        Ok(())
    }

    fn clear_marker(&self) {
        if let Err(e) = self.journal.clear() {
            warn!("Could not clear merge marker: {}", e);
        }
    }
}

#[async_trait]
impl MergeExecutor for GitRebaseMerger {
    async fn merge(&self, job: &MergeJob) -> MergeOutcome {
        info!(
            "Merging {} into {} (attempt {})",
            job.source_branch, job.target_branch, job.attempt_count
        );
        match self.run(job).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // Leave nothing half-applied in the agent's checkout.
                if job.source_workspace.exists() {
                    let _ = Git::new(&job.source_workspace).rebase_abort().await;
                }
                self.clear_marker();
                MergeOutcome::failed(e.kind, e.reason)
            }
        }
    }

    async fn recover(&self) -> Result<Option<RecoveredMerge>, QueueError> {
        let marker = match self.journal.read() {
            Ok(Some(m)) => m,
            Ok(None) => return Ok(None),
            Err(e) => return Err(QueueError::Recovery(format!("unreadable merge marker: {}", e))),
        };
        warn!(
            "Recovering interrupted merge of {} into {} (stage {:?})",
            marker.agent_id, marker.target_branch, marker.stage
        );

        let workspace = PathBuf::from(&marker.workspace);
        let source = workspace.exists().then(|| Git::new(&workspace));
        if let Some(ws) = &source {
            if let Err(e) = ws.rebase_abort().await {
                warn!("Could not abort rebase in {}: {}", workspace.display(), e);
            }
        }

        let current = self
            .repo
            .rev_parse(&marker.target_branch)
            .await
            .map_err(|e| QueueError::Recovery(format!("target {} unresolvable: {}", marker.target_branch, e)))?;

        let recovery = if current == marker.target_tip_before {
            Recovery::Untouched
        } else if Some(&current) == marker.new_tip.as_ref() {
            let published = !marker.push_required
                || self
                    .repo
                    .remote_tip(&self.remote, &marker.target_branch)
                    .await
                    .ok()
                    .flatten()
                    .as_ref()
                    == Some(&current);
            if published {
                Recovery::Completed { commit_sha: current }
            } else {
                self.move_target(&marker.target_branch, &marker.target_tip_before, &current)
                    .await
                    .map_err(|e| QueueError::Recovery(e.reason))?;
                Recovery::RolledBack
            }
        } else {
            return Err(QueueError::Recovery(format!(
                "target {} is at {}, which is neither the pre-merge nor the merged tip",
                marker.target_branch,
                short(&current)
            )));
        };

        if !matches!(recovery, Recovery::Completed { .. }) {
            if let Some(ws) = &source {
                restore_source(ws, &marker.source_tip_before).await;
            }
        }

        self.journal
            .clear()
            .map_err(|e| QueueError::Recovery(format!("cannot clear merge marker: {}", e)))?;
        info!("Interrupted merge of {} resolved: {:?}", marker.agent_id, recovery);
        Ok(Some(RecoveredMerge {
            job_id: marker.job_id,
            session_id: marker.session_id,
            agent_id: marker.agent_id,
            recovery,
        }))
    }
}

/// Put the agent branch back on its pre-merge tip after a merge that did not land.
async fn restore_source(ws: &Git, tip: &str) {
    let _ = ws.rebase_abort().await;
    match ws.rev_parse("HEAD").await {
        Ok(head) if head == tip => {}
        Ok(head) => match ws.run(&["reset", "--keep", tip]).await {
            Ok(_) => debug!("Restored agent branch {} -> {}", short(&head), short(tip)),
            Err(e) => warn!("Could not restore agent branch to {}: {}", short(tip), e),
        },
        Err(e) => warn!("Could not read agent HEAD: {}", e),
    }
}

fn short(sha: &str) -> &str {
    &sha[..sha.len().min(8)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        repo: Git,
        state: PathBuf,
        root: PathBuf,
        trees: PathBuf,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("repo");
        std::fs::create_dir_all(&root).unwrap();
        let repo = Git::new(&root);
        repo.run(&["init", "-q"]).await.unwrap();
        repo.run(&["symbolic-ref", "HEAD", "refs/heads/main"]).await.unwrap();
        repo.run(&["config", "user.email", "test@example.com"]).await.unwrap();
        repo.run(&["config", "user.name", "Test"]).await.unwrap();
        std::fs::write(root.join("shared.txt"), "line\n").unwrap();
        repo.add_all().await.unwrap();
        repo.commit("initial").await.unwrap();
        repo.run(&["branch", "target"]).await.unwrap();
        Fixture {
            state: dir.path().join("state"),
            trees: dir.path().join("trees"),
            root,
            repo,
            _dir: dir,
        }
    }

    /// Worktree on `branch` with one commit writing `file`.
    async fn agent(fx: &Fixture, name: &str, file: &str, content: &str) -> MergeJob {
        let branch = format!("agent/s1/{}", name);
        let path = fx.trees.join(name);
        fx.repo
            .run(&["worktree", "add", "-q", "-b", &branch, path.to_str().unwrap(), "main"])
            .await
            .unwrap();
        std::fs::write(path.join(file), content).unwrap();
        let ws = Git::new(&path);
        ws.add_all().await.unwrap();
        ws.commit(&format!("{} change", name)).await.unwrap();
        MergeJob::new("s1", name, branch, path, "target", 1)
    }

    #[tokio::test]
    async fn test_merge_advances_target() {
        let fx = fixture().await;
        let merger = GitRebaseMerger::new(&fx.root, &fx.state);
        let a = agent(&fx, "a1", "a.txt", "a\n").await;
        let b = agent(&fx, "a2", "b.txt", "b\n").await;

        let first = merger.merge(&a).await;
        assert!(first.is_merged(), "{:?}", first);
        let second = merger.merge(&b).await;
        let MergeOutcome::Merged { commit_sha } = second else {
            panic!("expected merge, got {:?}", second);
        };

        assert_eq!(fx.repo.rev_parse("target").await.unwrap(), commit_sha);
        assert_eq!(fx.repo.count_commits("main", "target").await.unwrap(), 2);
        assert!(MergeJournal::new(&fx.state).read().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_conflict_surfaces_files_and_keeps_target() {
        let fx = fixture().await;
        let merger = GitRebaseMerger::new(&fx.root, &fx.state);
        let a = agent(&fx, "a1", "shared.txt", "from a1\n").await;
        let b = agent(&fx, "a2", "shared.txt", "from a2\n").await;

        assert!(merger.merge(&a).await.is_merged());
        let tip = fx.repo.rev_parse("target").await.unwrap();

        let outcome = merger.merge(&b).await;
        assert_eq!(
            outcome,
            MergeOutcome::Conflict {
                files: vec!["shared.txt".to_string()]
            }
        );
        assert_eq!(fx.repo.rev_parse("target").await.unwrap(), tip);
        let ws = Git::new(&b.source_workspace);
        assert!(!ws.rebase_in_progress().await.unwrap());
        assert!(!ws.has_changes().await.unwrap());
    }

    #[tokio::test]
    async fn test_prefer_incoming_resolves_conflict() {
        let fx = fixture().await;
        let merger = GitRebaseMerger::new(&fx.root, &fx.state).with_policy(ConflictPolicy::PreferIncoming);
        let a = agent(&fx, "a1", "shared.txt", "from a1\n").await;
        let b = agent(&fx, "a2", "shared.txt", "from a2\n").await;

        assert!(merger.merge(&a).await.is_merged());
        assert!(merger.merge(&b).await.is_merged());
        let content = fx.repo.run(&["show", "target:shared.txt"]).await.unwrap();
        assert_eq!(content, "from a2");
    }

    #[tokio::test]
    async fn test_missing_workspace_fails_without_touching_target() {
        let fx = fixture().await;
        let merger = GitRebaseMerger::new(&fx.root, &fx.state);
        let job = MergeJob::new("s1", "ghost", "agent/s1/ghost", fx.trees.join("ghost"), "target", 1);
        let before = fx.repo.rev_parse("target").await.unwrap();
        let outcome = merger.merge(&job).await;
        assert!(matches!(outcome, MergeOutcome::Failed { kind: ErrorKind::Internal, .. }));
        assert_eq!(fx.repo.rev_parse("target").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_push_rejection_rolls_back() {
        let fx = fixture().await;
        // A remote that is not a repository rejects every push.
        fx.repo
            .run(&["remote", "add", "origin", fx.root.join("nowhere").to_str().unwrap()])
            .await
            .unwrap();
        let merger = GitRebaseMerger::new(&fx.root, &fx.state);
        let a = agent(&fx, "a1", "a.txt", "a\n").await;
        let before = fx.repo.rev_parse("target").await.unwrap();

        let outcome = merger.merge(&a).await;
        assert!(matches!(outcome, MergeOutcome::Failed { kind: ErrorKind::PushRejected, .. }));
        assert_eq!(fx.repo.rev_parse("target").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_push_rejection_restores_agent_branch() {
        let fx = fixture().await;
        let local = GitRebaseMerger::new(&fx.root, &fx.state).with_push(false);
        let first = agent(&fx, "a0", "first.txt", "first\n").await;
        assert!(local.merge(&first).await.is_merged());

        fx.repo
            .run(&["remote", "add", "origin", fx.root.join("nowhere").to_str().unwrap()])
            .await
            .unwrap();
        let merger = GitRebaseMerger::new(&fx.root, &fx.state);
        let job = agent(&fx, "a1", "a.txt", "a\n").await;
        let commit = fx.repo.rev_parse(&job.source_branch).await.unwrap();

        let outcome = merger.merge(&job).await;
        assert!(matches!(outcome, MergeOutcome::Failed { kind: ErrorKind::PushRejected, .. }));
        assert_eq!(fx.repo.rev_parse(&job.source_branch).await.unwrap(), commit);
        let ws = Git::new(&job.source_workspace);
        assert!(ws.is_ancestor(&commit, "HEAD").await.unwrap());
        assert!(!ws.has_changes().await.unwrap());
    }

    #[tokio::test]
    async fn test_recover_restores_rebased_agent_branch() {
        let fx = fixture().await;
        let local = GitRebaseMerger::new(&fx.root, &fx.state).with_push(false);
        let first = agent(&fx, "a0", "first.txt", "first\n").await;
        assert!(local.merge(&first).await.is_merged());

        let job = agent(&fx, "a1", "a.txt", "a\n").await;
        let before = fx.repo.rev_parse("target").await.unwrap();
        let commit = fx.repo.rev_parse(&job.source_branch).await.unwrap();

        // Crash after the rebase rewrote the branch, before the target moved.
        MergeJournal::new(&fx.state)
            .write(&MergeMarker::new(&job, &before, &commit))
            .unwrap();
        let ws = Git::new(&job.source_workspace);
        ws.run(&["rebase", "-q", &before]).await.unwrap();
        assert_ne!(ws.rev_parse("HEAD").await.unwrap(), commit);

        let recovered = local.recover().await.unwrap().unwrap();
        assert_eq!(recovered.recovery, Recovery::Untouched);
        assert_eq!(fx.repo.rev_parse(&job.source_branch).await.unwrap(), commit);
        assert_eq!(fx.repo.rev_parse("target").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_recover_rolls_back_unpublished_advance() {
        let fx = fixture().await;
        let merger = GitRebaseMerger::new(&fx.root, &fx.state);
        let job = agent(&fx, "a1", "a.txt", "a\n").await;
        let before = fx.repo.rev_parse("target").await.unwrap();
        let tip = fx.repo.rev_parse(&job.source_branch).await.unwrap();

        // Simulate a crash after advancing but before the push finished.
        let mut marker = MergeMarker::new(&job, &before, &tip).at(MergeStage::Pushing);
        marker.new_tip = Some(tip.clone());
        marker.push_required = true;
        MergeJournal::new(&fx.state).write(&marker).unwrap();
        fx.repo.update_branch("target", &tip, &before).await.unwrap();

        let recovered = merger.recover().await.unwrap().unwrap();
        assert_eq!(recovered.recovery, Recovery::RolledBack);
        assert_eq!(recovered.job_id, job.id);
        assert_eq!(fx.repo.rev_parse("target").await.unwrap(), before);
        assert!(merger.recover().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recover_keeps_completed_local_merge() {
        let fx = fixture().await;
        let merger = GitRebaseMerger::new(&fx.root, &fx.state).with_push(false);
        let job = agent(&fx, "a1", "a.txt", "a\n").await;
        let before = fx.repo.rev_parse("target").await.unwrap();
        let tip = fx.repo.rev_parse(&job.source_branch).await.unwrap();

        let mut marker = MergeMarker::new(&job, &before, &tip).at(MergeStage::Advancing);
        marker.new_tip = Some(tip.clone());
        MergeJournal::new(&fx.state).write(&marker).unwrap();
        fx.repo.update_branch("target", &tip, &before).await.unwrap();

        let recovered = merger.recover().await.unwrap().unwrap();
        assert_eq!(recovered.recovery, Recovery::Completed { commit_sha: tip });
    }
}
