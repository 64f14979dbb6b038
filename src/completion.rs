// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Agent completion client.
//!
//! Runs when an agent says it is done. A workspace with no changes is
//! cleaned up. Changes without a commit message come back to the caller
//! with a suggested message and nothing is touched. Otherwise everything
//! is committed with an `Agent-Id` trailer and submitted to the merge queue.
//!
//! The coordinator is reached through [`CoordinatorLink`], implemented both
//! by the in-process [`CoordinatorHandle`] and by the socket [`IpcClient`].

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::ErrorKind;
use crate::git::{Git, GitError};
use crate::ipc::{IpcClient, IpcError};
use crate::namer::{fallback_commit_message, Namer};
use crate::queue::{CoordinatorHandle, DequeueOutcome, EnqueueReceipt, EnqueueRequest, QueueError};
use crate::session::{AgentStatus, Session};

/// Commit trailer naming the agent that produced a commit.
pub const AGENT_TRAILER: &str = "Agent-Id";

/// Paths listed in the namer prompt.
const PROMPT_PATH_LIMIT: usize = 20;

/// Error type for completion.
#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("Agent {agent_id} not found in session {session_id}")]
    AgentNotFound { session_id: String, agent_id: String },

    #[error("Agent {agent_id} is {status} and cannot complete")]
    NotActive { agent_id: String, status: AgentStatus },

    #[error("Workspace {} does not exist", .0.display())]
    MissingWorkspace(PathBuf),

    #[error("Commit failed: {0}")]
    Commit(GitError),

    #[error(transparent)]
    Git(#[from] GitError),

    /// The coordinator could not be reached. The commit stays in the workspace.
    #[error("Coordinator unreachable{}: {source}", .commit_sha.as_ref().map(|s| format!(" (commit {} kept)", s)).unwrap_or_default())]
    Unavailable {
        commit_sha: Option<String>,
        source: IpcError,
    },

    #[error("Coordinator refused agent {agent_id}: {source}")]
    Rejected { agent_id: String, source: IpcError },
}

impl CompletionError {
    /// Taxonomy classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AgentNotFound { .. } => ErrorKind::AgentNotFound,
            Self::NotActive { .. } => ErrorKind::EnqueueRejected,
            Self::Unavailable { .. } => ErrorKind::IpcUnavailable,
            Self::Rejected { source, .. } => source.kind(),
            Self::MissingWorkspace(_) | Self::Commit(_) | Self::Git(_) => ErrorKind::Internal,
        }
    }

    /// Commit created before the failure, if any.
    pub fn kept_commit(&self) -> Option<&str> {
        match self {
            Self::Unavailable { commit_sha, .. } => commit_sha.as_deref(),
            _ => None,
        }
    }
}

// ============================================================================
// Coordinator link
// ============================================================================

/// The coordinator operations a completing agent needs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CoordinatorLink: Send + Sync {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueReceipt, IpcError>;

    async fn dequeue(&self, session_id: &str, agent_id: &str) -> Result<DequeueOutcome, IpcError>;

    async fn update_agent(&self, session_id: &str, agent_id: &str, status: AgentStatus) -> Result<(), IpcError>;
}

fn remote(err: QueueError) -> IpcError {
    IpcError::Remote {
        code: Some(err.kind()),
        reason: err.to_string(),
    }
}

#[async_trait]
impl CoordinatorLink for CoordinatorHandle {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueReceipt, IpcError> {
        CoordinatorHandle::enqueue(self, request).await.map_err(remote)
    }

    async fn dequeue(&self, session_id: &str, agent_id: &str) -> Result<DequeueOutcome, IpcError> {
        CoordinatorHandle::dequeue(self, agent_id, Some(session_id))
            .await
            .map_err(remote)
    }

    async fn update_agent(&self, session_id: &str, agent_id: &str, status: AgentStatus) -> Result<(), IpcError> {
        CoordinatorHandle::update_agent(self, session_id, agent_id, status)
            .await
            .map_err(remote)
    }
}

#[async_trait]
impl CoordinatorLink for IpcClient {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueReceipt, IpcError> {
        IpcClient::enqueue(self, &request).await
    }

    async fn dequeue(&self, session_id: &str, agent_id: &str) -> Result<DequeueOutcome, IpcError> {
        IpcClient::dequeue(self, agent_id, Some(session_id)).await
    }

    async fn update_agent(&self, session_id: &str, agent_id: &str, status: AgentStatus) -> Result<(), IpcError> {
        IpcClient::update_agent(self, session_id, agent_id, status).await
    }
}

// ============================================================================
// Completion
// ============================================================================

/// Everything the client needs to know about the completing agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentContext {
    pub session_id: String,
    pub agent_id: String,
    pub workspace: PathBuf,
    pub branch: String,
    pub base_branch: String,
    pub target_branch: String,
    pub status: AgentStatus,
    /// Tip the agent landed as, once merged.
    pub merged_sha: Option<String>,
}

impl AgentContext {
    pub fn from_session(session: &Session, agent_id: &str) -> Result<Self, CompletionError> {
        let agent = session
            .agent(agent_id)
            .ok_or_else(|| CompletionError::AgentNotFound {
                session_id: session.session_id.clone(),
                agent_id: agent_id.to_string(),
            })?;
        Ok(Self {
            session_id: session.session_id.clone(),
            agent_id: agent.agent_id.clone(),
            workspace: agent.workspace_path.clone(),
            branch: agent.branch_name.clone(),
            base_branch: session.base_branch.clone(),
            target_branch: session.target_branch.clone(),
            status: agent.status,
            merged_sha: agent.merged_sha.clone(),
        })
    }
}

/// What completing an agent did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionReport {
    /// Nothing to merge; the agent was cleaned up.
    NoChanges { outcome: DequeueOutcome },
    /// Changes exist but no message was given. Nothing was modified.
    NeedsCommitMessage {
        changed_paths: Vec<String>,
        suggested_message: String,
    },
    /// Committed (or already committed) and submitted.
    Enqueued { commit_sha: String, receipt: EnqueueReceipt },
}

impl CompletionReport {
    /// JSON view printed by the CLI.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::NoChanges { outcome } => json!({ "changes": false, "outcome": outcome }),
            Self::NeedsCommitMessage {
                changed_paths,
                suggested_message,
            } => json!({
                "needs_commit_message": true,
                "changed_paths": changed_paths,
                "suggested_message": suggested_message,
            }),
            Self::Enqueued { commit_sha, receipt } => json!({
                "changes": true,
                "commit_sha": commit_sha,
                "position": receipt.position(),
                "receipt": receipt,
            }),
        }
    }
}

/// Commits an agent's work and hands it to the coordinator.
pub struct CompletionClient {
    link: Arc<dyn CoordinatorLink>,
    namer: Arc<dyn Namer>,
}

impl CompletionClient {
    pub fn new(link: Arc<dyn CoordinatorLink>, namer: Arc<dyn Namer>) -> Self {
        Self { link, namer }
    }

    /// Complete `ctx` with an optional commit message.
    pub async fn complete(&self, ctx: &AgentContext, message: Option<&str>) -> Result<CompletionReport, CompletionError> {
        if ctx.status == AgentStatus::CleanedUp {
            return Err(CompletionError::NotActive {
                agent_id: ctx.agent_id.clone(),
                status: ctx.status,
            });
        }
        if ctx.status == AgentStatus::Merged {
            // The workspace is gone once merged; answer with the earlier receipt.
            debug!("Agent {} already merged", ctx.agent_id);
            return Ok(CompletionReport::Enqueued {
                commit_sha: ctx.merged_sha.clone().unwrap_or_default(),
                receipt: EnqueueReceipt::Merged {
                    commit_sha: ctx.merged_sha.clone(),
                },
            });
        }
        if !ctx.workspace.is_dir() {
            return Err(CompletionError::MissingWorkspace(ctx.workspace.clone()));
        }

        let git = Git::new(&ctx.workspace);
        let changed = git.changed_paths().await?;

        if changed.is_empty() {
            // Work the agent committed itself still needs merging.
            if git.count_commits(&ctx.base_branch, "HEAD").await? > 0 {
                let sha = git.rev_parse("HEAD").await?;
                let subject = git.commit_message("HEAD").await.ok();
                return self.submit(ctx, sha, subject).await;
            }
            info!("Agent {} finished without changes", ctx.agent_id);
            let outcome = self
                .link
                .dequeue(&ctx.session_id, &ctx.agent_id)
                .await
                .map_err(|e| self.link_failed(ctx, None, e))?;
            return Ok(CompletionReport::NoChanges { outcome });
        }

        let message = match message.map(str::trim).filter(|m| !m.is_empty()) {
            Some(message) => message,
            None => {
                let suggested_message = self.suggest_message(&ctx.agent_id, &changed).await;
                return Ok(CompletionReport::NeedsCommitMessage {
                    changed_paths: changed,
                    suggested_message,
                });
            }
        };

        self.report(ctx, AgentStatus::ChangesPending).await;
        git.add_all().await.map_err(CompletionError::Commit)?;
        let sha = git
            .commit(&with_trailer(message, &ctx.agent_id))
            .await
            .map_err(CompletionError::Commit)?;
        info!("Agent {} committed {} file(s) as {}", ctx.agent_id, changed.len(), sha);
        self.report(ctx, AgentStatus::Committed).await;

        self.submit(ctx, sha, Some(message.to_string())).await
    }

    async fn submit(
        &self,
        ctx: &AgentContext,
        commit_sha: String,
        commit_message: Option<String>,
    ) -> Result<CompletionReport, CompletionError> {
        let request = EnqueueRequest {
            agent_id: ctx.agent_id.clone(),
            session_id: ctx.session_id.clone(),
            branch: ctx.branch.clone(),
            workspace: ctx.workspace.clone(),
            target_branch: ctx.target_branch.clone(),
            commit_sha: Some(commit_sha.clone()),
            commit_message,
        };
        let receipt = self
            .link
            .enqueue(request)
            .await
            .map_err(|e| self.link_failed(ctx, Some(&commit_sha), e))?;
        debug!("Agent {} enqueued: {:?}", ctx.agent_id, receipt);
        Ok(CompletionReport::Enqueued { commit_sha, receipt })
    }

    /// Progress updates are informational; the enqueue carries the state.
    async fn report(&self, ctx: &AgentContext, status: AgentStatus) {
        if let Err(e) = self.link.update_agent(&ctx.session_id, &ctx.agent_id, status).await {
            warn!("Could not report {} for {}: {}", status, ctx.agent_id, e);
        }
    }

    async fn suggest_message(&self, agent_id: &str, changed: &[String]) -> String {
        let listed: Vec<&str> = changed.iter().take(PROMPT_PATH_LIMIT).map(String::as_str).collect();
        let prompt = format!(
            "Write a one-line conventional commit message for changes to: {}",
            listed.join(", ")
        );
        self.namer
            .name(&prompt)
            .await
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| fallback_commit_message(agent_id, changed.len()))
    }

    fn link_failed(&self, ctx: &AgentContext, commit_sha: Option<&str>, err: IpcError) -> CompletionError {
        if err.kind() == ErrorKind::IpcUnavailable {
            CompletionError::Unavailable {
                commit_sha: commit_sha.map(str::to_string),
                source: err,
            }
        } else {
            CompletionError::Rejected {
                agent_id: ctx.agent_id.clone(),
                source: err,
            }
        }
    }
}

/// Append the `Agent-Id` trailer unless the message already has it.
pub fn with_trailer(message: &str, agent_id: &str) -> String {
    let trailer = format!("{}: {}", AGENT_TRAILER, agent_id);
    let message = message.trim_end();
    if message.lines().any(|line| line.trim() == trailer) {
        message.to_string()
    } else {
        format!("{}\n\n{}", message, trailer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namer::MockNamer;
    use mockall::predicate::*;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        ctx: AgentContext,
        git: Git,
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
        std::fs::write(root.join("README.md"), "hello\n").unwrap();
        repo.add_all().await.unwrap();
        repo.commit("initial").await.unwrap();

        let workspace = dir.path().join("fj-a1");
        repo.run(&["worktree", "add", "-q", "-b", "agent/s1/a1", workspace.to_str().unwrap(), "main"])
            .await
            .unwrap();

        Fixture {
            ctx: AgentContext {
                session_id: "s1".to_string(),
                agent_id: "a1".to_string(),
                workspace: workspace.clone(),
                branch: "agent/s1/a1".to_string(),
                base_branch: "main".to_string(),
                target_branch: "feature".to_string(),
                status: AgentStatus::Running,
                merged_sha: None,
            },
            git: Git::new(&workspace),
            _dir: dir,
        }
    }

    fn quiet_namer() -> Arc<dyn Namer> {
        let mut namer = MockNamer::new();
        namer.expect_name().returning(|_| None);
        Arc::new(namer)
    }

    #[test]
    fn test_with_trailer() {
        assert_eq!(with_trailer("feat: add x\n", "a1"), "feat: add x\n\nAgent-Id: a1");
        let already = "feat: add x\n\nAgent-Id: a1";
        assert_eq!(with_trailer(already, "a1"), already);
    }

    #[test]
    fn test_report_json_shapes() {
        let report = CompletionReport::NoChanges {
            outcome: DequeueOutcome::CleanedUp,
        };
        assert_eq!(report.to_json()["changes"], false);

        let report = CompletionReport::NeedsCommitMessage {
            changed_paths: vec!["a.txt".to_string()],
            suggested_message: "chore(a1): update 1 file".to_string(),
        };
        assert_eq!(report.to_json()["needs_commit_message"], true);

        let report = CompletionReport::Enqueued {
            commit_sha: "abc".to_string(),
            receipt: EnqueueReceipt::Queued { position: 2 },
        };
        assert_eq!(report.to_json()["position"], 2);
    }

    #[tokio::test]
    async fn test_no_changes_cleans_up() {
        let fx = fixture().await;
        let mut link = MockCoordinatorLink::new();
        link.expect_dequeue()
            .with(eq("s1"), eq("a1"))
            .times(1)
            .returning(|_, _| Ok(DequeueOutcome::CleanedUp));
        link.expect_enqueue().never();

        let client = CompletionClient::new(Arc::new(link), quiet_namer());
        let report = client.complete(&fx.ctx, Some("unused")).await.unwrap();
        assert_eq!(
            report,
            CompletionReport::NoChanges {
                outcome: DequeueOutcome::CleanedUp
            }
        );
    }

    #[tokio::test]
    async fn test_merged_agent_reports_prior_receipt() {
        let mut ctx = fixture().await.ctx;
        ctx.status = AgentStatus::Merged;
        ctx.merged_sha = Some("0123abcd".to_string());
        ctx.workspace = PathBuf::from("/nonexistent/fj-a1");

        let mut link = MockCoordinatorLink::new();
        link.expect_enqueue().never();
        link.expect_dequeue().never();

        let client = CompletionClient::new(Arc::new(link), quiet_namer());
        let report = client.complete(&ctx, Some("again")).await.unwrap();
        assert_eq!(
            report,
            CompletionReport::Enqueued {
                commit_sha: "0123abcd".to_string(),
                receipt: EnqueueReceipt::Merged {
                    commit_sha: Some("0123abcd".to_string())
                },
            }
        );
    }

    #[tokio::test]
    async fn test_missing_message_suggests_without_side_effects() {
        let fx = fixture().await;
        std::fs::write(fx.ctx.workspace.join("new.txt"), "x\n").unwrap();

        let mut link = MockCoordinatorLink::new();
        link.expect_update_agent().never();
        link.expect_enqueue().never();

        let client = CompletionClient::new(Arc::new(link), quiet_namer());
        let report = client.complete(&fx.ctx, None).await.unwrap();
        match report {
            CompletionReport::NeedsCommitMessage {
                changed_paths,
                suggested_message,
            } => {
                assert_eq!(changed_paths, vec!["new.txt".to_string()]);
                assert_eq!(suggested_message, "chore(a1): update 1 file");
            }
            other => panic!("unexpected report: {:?}", other),
        }
        assert_eq!(fx.git.changed_paths().await.unwrap(), vec!["new.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_suggestion_from_namer() {
        let fx = fixture().await;
        std::fs::write(fx.ctx.workspace.join("new.txt"), "x\n").unwrap();

        let mut namer = MockNamer::new();
        namer
            .expect_name()
            .returning(|_| Some("feat: add new file".to_string()));
        let client = CompletionClient::new(Arc::new(MockCoordinatorLink::new()), Arc::new(namer));

        match client.complete(&fx.ctx, Some("  ")).await.unwrap() {
            CompletionReport::NeedsCommitMessage { suggested_message, .. } => {
                assert_eq!(suggested_message, "feat: add new file")
            }
            other => panic!("unexpected report: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_commit_and_enqueue() {
        let fx = fixture().await;
        std::fs::write(fx.ctx.workspace.join("new.txt"), "x\n").unwrap();

        let mut link = MockCoordinatorLink::new();
        link.expect_update_agent().times(2).returning(|_, _, _| Ok(()));
        link.expect_enqueue()
            .withf(|req| {
                req.agent_id == "a1"
                    && req.branch == "agent/s1/a1"
                    && req.target_branch == "feature"
                    && req.commit_sha.is_some()
            })
            .times(1)
            .returning(|_| Ok(EnqueueReceipt::Queued { position: 1 }));

        let client = CompletionClient::new(Arc::new(link), quiet_namer());
        let report = client.complete(&fx.ctx, Some("feat: add new file")).await.unwrap();

        let CompletionReport::Enqueued { commit_sha, receipt } = report else {
            panic!("expected enqueue");
        };
        assert_eq!(receipt.position(), 1);
        assert_eq!(fx.git.rev_parse("HEAD").await.unwrap(), commit_sha);
        let message = fx.git.commit_message("HEAD").await.unwrap();
        assert!(message.contains("Agent-Id: a1"));
        assert!(fx.git.changed_paths().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_already_committed_work_is_enqueued() {
        let fx = fixture().await;
        std::fs::write(fx.ctx.workspace.join("done.txt"), "x\n").unwrap();
        fx.git.add_all().await.unwrap();
        let sha = fx.git.commit("feat: done").await.unwrap();

        let mut link = MockCoordinatorLink::new();
        let expected = sha.clone();
        link.expect_enqueue()
            .withf(move |req| req.commit_sha.as_deref() == Some(expected.as_str()))
            .returning(|_| Ok(EnqueueReceipt::Merging));
        link.expect_dequeue().never();

        let client = CompletionClient::new(Arc::new(link), quiet_namer());
        let report = client.complete(&fx.ctx, None).await.unwrap();
        assert_eq!(
            report,
            CompletionReport::Enqueued {
                commit_sha: sha,
                receipt: EnqueueReceipt::Merging
            }
        );
    }

    #[tokio::test]
    async fn test_unavailable_keeps_commit() {
        let fx = fixture().await;
        std::fs::write(fx.ctx.workspace.join("new.txt"), "x\n").unwrap();

        let mut link = MockCoordinatorLink::new();
        link.expect_update_agent().returning(|_, _, _| {
            Err(IpcError::Unavailable {
                path: PathBuf::from("/nowhere.sock"),
                reason: "refused".to_string(),
            })
        });
        link.expect_enqueue().returning(|_| {
            Err(IpcError::Unavailable {
                path: PathBuf::from("/nowhere.sock"),
                reason: "refused".to_string(),
            })
        });

        let client = CompletionClient::new(Arc::new(link), quiet_namer());
        let err = client.complete(&fx.ctx, Some("feat: x")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IpcUnavailable);
        let kept = err.kept_commit().unwrap().to_string();
        assert_eq!(fx.git.rev_parse("HEAD").await.unwrap(), kept);
    }

    #[tokio::test]
    async fn test_rejection_keeps_kind() {
        let fx = fixture().await;
        std::fs::write(fx.ctx.workspace.join("new.txt"), "x\n").unwrap();

        let mut link = MockCoordinatorLink::new();
        link.expect_update_agent().returning(|_, _, _| Ok(()));
        link.expect_enqueue().returning(|_| {
            Err(IpcError::Remote {
                code: Some(ErrorKind::EnqueueRejected),
                reason: "unknown session".to_string(),
            })
        });

        let client = CompletionClient::new(Arc::new(link), quiet_namer());
        let err = client.complete(&fx.ctx, Some("feat: x")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EnqueueRejected);
        assert!(err.kept_commit().is_none());
    }

    #[tokio::test]
    async fn test_cleaned_up_agent_cannot_complete() {
        let mut fx = fixture().await;
        fx.ctx.status = AgentStatus::CleanedUp;
        let client = CompletionClient::new(Arc::new(MockCoordinatorLink::new()), quiet_namer());
        let err = client.complete(&fx.ctx, Some("x")).await.unwrap_err();
        assert!(matches!(err, CompletionError::NotActive { .. }));
    }
}
