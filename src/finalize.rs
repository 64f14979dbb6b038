// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session finalization: publish the target branch and open one pull request.
//!
//! Runs once every agent is terminal. A session with at least one merged
//! agent is pushed, gets a pull request aggregating the merged commit
//! messages, and is marked COMPLETE. A session where nothing merged is
//! marked FAILED. Running it again updates the existing pull request.

use std::path::Path;
use std::sync::Arc;
#[cfg(feature = "telemetry")]
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::ErrorKind;
use crate::git::{Git, GitError};
use crate::namer::{fallback_pr_title, Namer};
use crate::session::{Agent, AgentStatus, Session, SessionState, SessionStore, StoreError};

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

/// Error type for finalization.
#[derive(Debug, thiserror::Error)]
pub enum FinalizeError {
    #[error("Session {session_id} still has active agents: {}", active.join(", "))]
    NotDrained { session_id: String, active: Vec<String> },

    #[error("Push of {branch} rejected: {reason}")]
    PushRejected { branch: String, reason: String },

    #[error("Pull request error: {0}")]
    PullRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Git(#[from] GitError),
}

impl FinalizeError {
    /// Taxonomy classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PushRejected { .. } => ErrorKind::PushRejected,
            Self::Store(e) => e.kind(),
            _ => ErrorKind::Internal,
        }
    }
}

/// An open pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
}

/// Contents for creating or updating a pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestDraft {
    pub head: String,
    pub base: String,
    pub title: String,
    pub body: String,
    pub draft: bool,
}

/// Where pull requests are opened.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PullRequestSink: Send + Sync {
    /// The open pull request from `head` into `base`, if any.
    async fn find_open(&self, head: &str, base: &str) -> Result<Option<PullRequest>, FinalizeError>;

    async fn create(&self, draft: &PullRequestDraft) -> Result<PullRequest, FinalizeError>;

    async fn update(&self, number: u64, draft: &PullRequestDraft) -> Result<PullRequest, FinalizeError>;
}

/// [`PullRequestSink`] driving the GitHub CLI (`gh`).
pub struct GhCliSink {
    repo_root: std::path::PathBuf,
}

impl GhCliSink {
    pub fn new(repo_root: impl AsRef<Path>) -> Self {
        Self {
            repo_root: repo_root.as_ref().to_path_buf(),
        }
    }

    async fn gh(&self, args: &[&str]) -> Result<String, FinalizeError> {
        debug!("gh {}", args.join(" "));
        let output = Command::new("gh")
            .args(args)
            .current_dir(&self.repo_root)
            .env("GH_PROMPT_DISABLED", "1")
            .output()
            .await
            .map_err(|e| FinalizeError::PullRequest(format!("cannot run gh: {}", e)))?;
        if !output.status.success() {
            return Err(FinalizeError::PullRequest(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// `https://github.com/o/r/pull/42` -> 42.
fn pr_number_from_url(url: &str) -> Option<u64> {
    url.trim_end_matches('/').rsplit('/').next()?.parse().ok()
}

#[async_trait]
impl PullRequestSink for GhCliSink {
    async fn find_open(&self, head: &str, base: &str) -> Result<Option<PullRequest>, FinalizeError> {
        let out = self
            .gh(&["pr", "list", "--head", head, "--base", base, "--state", "open", "--json", "number,url"])
            .await?;
        let mut prs: Vec<PullRequest> =
            serde_json::from_str(&out).map_err(|e| FinalizeError::PullRequest(e.to_string()))?;
        Ok(if prs.is_empty() { None } else { Some(prs.remove(0)) })
    }

    async fn create(&self, draft: &PullRequestDraft) -> Result<PullRequest, FinalizeError> {
        let mut args = vec![
            "pr",
            "create",
            "--head",
            draft.head.as_str(),
            "--base",
            draft.base.as_str(),
            "--title",
            draft.title.as_str(),
            "--body",
            draft.body.as_str(),
        ];
        if draft.draft {
            args.push("--draft");
        }
        let url = self.gh(&args).await?;
        let url = url.lines().last().unwrap_or_default().to_string();
        let number = pr_number_from_url(&url)
            .ok_or_else(|| FinalizeError::PullRequest(format!("unexpected gh output: {}", url)))?;
        Ok(PullRequest { number, url })
    }

    async fn update(&self, number: u64, draft: &PullRequestDraft) -> Result<PullRequest, FinalizeError> {
        let number_arg = number.to_string();
        self.gh(&[
            "pr",
            "edit",
            number_arg.as_str(),
            "--title",
            draft.title.as_str(),
            "--body",
            draft.body.as_str(),
        ])
            .await?;
        let url = self.gh(&["pr", "view", number_arg.as_str(), "--json", "url", "--jq", ".url"]).await?;
        Ok(PullRequest { number, url })
    }
}

/// Finalizer knobs.
#[derive(Debug, Clone)]
pub struct FinalizeSettings {
    pub remote: String,
    pub push: bool,
    pub draft: bool,
}

impl Default for FinalizeSettings {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
            push: true,
            draft: false,
        }
    }
}

/// What finalization did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeReport {
    pub session_id: String,
    pub state: SessionState,
    pub merged: Vec<String>,
    pub failed: Vec<String>,
    pub cancelled: Vec<String>,
    pub pushed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<PullRequest>,
}

/// Publishes finished sessions.
pub struct Finalizer {
    repo: Git,
    store: Arc<SessionStore>,
    sink: Option<Arc<dyn PullRequestSink>>,
    namer: Arc<dyn Namer>,
    settings: FinalizeSettings,
}

impl Finalizer {
    pub fn new(
        repo_root: impl AsRef<Path>,
        store: Arc<SessionStore>,
        sink: Option<Arc<dyn PullRequestSink>>,
        namer: Arc<dyn Namer>,
        settings: FinalizeSettings,
    ) -> Self {
        Self {
            repo: Git::new(repo_root),
            store,
            sink,
            namer,
            settings,
        }
    }

    pub async fn finalize(&self, session_id: &str) -> Result<FinalizeReport, FinalizeError> {
        #[cfg(feature = "telemetry")]
        let start = Instant::now();

        let result = self.run(session_id).await;

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("finalize.run", start.elapsed());

        result
    }

    async fn run(&self, session_id: &str) -> Result<FinalizeReport, FinalizeError> {
        let session = self.store.get_session(session_id)?;
        let active: Vec<String> = session
            .active_agents()
            .iter()
            .map(|a| a.agent_id.clone())
            .collect();
        if !active.is_empty() {
            return Err(FinalizeError::NotDrained {
                session_id: session_id.to_string(),
                active,
            });
        }

        let ids = |status| -> Vec<String> {
            session
                .agents_with(status)
                .iter()
                .map(|a| a.agent_id.clone())
                .collect()
        };
        let mut report = FinalizeReport {
            session_id: session_id.to_string(),
            state: SessionState::Failed,
            merged: ids(AgentStatus::Merged),
            failed: ids(AgentStatus::MergeFailed),
            cancelled: ids(AgentStatus::CleanedUp),
            pushed: false,
            pull_request: None,
        };

        if report.merged.is_empty() {
            warn!("Session {} finished with nothing merged", session_id);
            self.store.mark_session_state(session_id, SessionState::Failed)?;
            return Ok(report);
        }

        if self.settings.push && self.repo.remote_exists(&self.settings.remote).await {
            self.repo
                .push(&self.settings.remote, &session.target_branch)
                .await
                .map_err(|e| FinalizeError::PushRejected {
                    branch: session.target_branch.clone(),
                    reason: e.to_string(),
                })?;
            report.pushed = true;
        }

        if let Some(sink) = &self.sink {
            let draft = self.draft(&session).await;
            let pr = match sink.find_open(&draft.head, &draft.base).await? {
                Some(existing) => {
                    info!("Updating pull request #{}", existing.number);
                    sink.update(existing.number, &draft).await?
                }
                None => sink.create(&draft).await?,
            };
            self.store.set_pr_url(session_id, &pr.url)?;
            report.pull_request = Some(pr);
        }

        self.store.mark_session_state(session_id, SessionState::Complete)?;
        report.state = SessionState::Complete;
        info!(
            "Session {} complete: {} merged, {} failed, {} cancelled",
            session_id,
            report.merged.len(),
            report.failed.len(),
            report.cancelled.len()
        );
        Ok(report)
    }

    /// Subject line for a merged agent's contribution.
    async fn message_for(&self, agent: &Agent) -> String {
        if let Some(message) = agent.commit_message.as_deref() {
            return subject(message);
        }
        if let Some(sha) = agent.merged_sha.as_deref().or(agent.commit_sha.as_deref()) {
            if let Ok(message) = self.repo.commit_message(sha).await {
                return subject(&message);
            }
        }
        format!("changes from {}", agent.agent_id)
    }

    async fn draft(&self, session: &Session) -> PullRequestDraft {
        let mut merged_lines = Vec::new();
        let mut messages = Vec::new();
        for agent in session.agents_with(AgentStatus::Merged) {
            let message = self.message_for(agent).await;
            let sha = agent.merged_sha.as_deref().map(short).unwrap_or("-");
            merged_lines.push(format!("- `{}` ({}): {}", agent.agent_id, sha, message));
            messages.push(message);
        }

        let mut body = String::new();
        if let Some(summary) = self
            .namer
            .summarize(&session.target_branch, &messages.join("\n"))
            .await
        {
            body.push_str(&format!("## Summary\n\n{}\n\n", summary.trim()));
        }
        body.push_str("## Merged agents\n\n");
        body.push_str(&merged_lines.join("\n"));
        body.push('\n');

        let failed = session.agents_with(AgentStatus::MergeFailed);
        if !failed.is_empty() {
            body.push_str("\n## Merge failures\n\n");
            for agent in failed {
                if agent.conflict_files.is_empty() {
                    body.push_str(&format!("- `{}`\n", agent.agent_id));
                } else {
                    body.push_str(&format!(
                        "- `{}`: conflicts in {}\n",
                        agent.agent_id,
                        agent.conflict_files.join(", ")
                    ));
                }
            }
        }

        let cancelled = session.agents_with(AgentStatus::CleanedUp);
        if !cancelled.is_empty() {
            body.push_str("\n## Cancelled\n\n");
            for agent in cancelled {
                body.push_str(&format!("- `{}`\n", agent.agent_id));
            }
        }

        PullRequestDraft {
            head: session.target_branch.clone(),
            base: session.base_branch.clone(),
            title: fallback_pr_title(&session.target_branch, messages.len()),
            body,
            draft: self.settings.draft,
        }
    }
}

fn subject(message: &str) -> String {
    message.lines().next().unwrap_or_default().trim().to_string()
}

fn short(sha: &str) -> &str {
    &sha[..sha.len().min(7)]
}
