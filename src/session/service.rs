// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session lifecycle: start (fork) and explicit cleanup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::ErrorKind;
use crate::git::{Git, GitError};
use crate::namer::{fallback_target_branch, Namer};
use crate::workspace::{IsolationError, WorkspaceManager};

use super::storage::{SessionStore, StoreError};
use super::types::{is_valid_agent_id, Agent, AgentStatus, Session, SessionState};

/// Error type for session lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Workspace(#[from] IsolationError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error("Base branch not found: {0}")]
    BaseNotFound(String),

    #[error("Target branch already exists: {0}")]
    TargetExists(String),

    #[error("Invalid agent id: {0:?}")]
    InvalidAgentId(String),

    #[error("Duplicate agent id: {0}")]
    DuplicateAgent(String),

    #[error("Session {0} is still active; finalize it or pass force")]
    StillActive(String),
}

impl SessionError {
    /// Taxonomy classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(e) => e.kind(),
            Self::Workspace(e) => e.kind(),
            Self::TargetExists(_) | Self::DuplicateAgent(_) => ErrorKind::WorkspaceConflict,
            _ => ErrorKind::Internal,
        }
    }
}

/// Parameters for starting a session.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub base_branch: String,
    /// Integration branch; derived from `prompt` or the session id when absent.
    pub target_branch: Option<String>,
    /// Task description, used to name the target branch.
    pub prompt: Option<String>,
    pub agent_ids: Vec<String>,
}

/// Creates sessions and provisions their agent workspaces.
pub struct SessionService {
    repo_root: PathBuf,
    repo: Git,
    store: Arc<SessionStore>,
    workspaces: Arc<dyn WorkspaceManager>,
    namer: Arc<dyn Namer>,
}

impl SessionService {
    pub fn new(
        repo_root: impl AsRef<Path>,
        store: Arc<SessionStore>,
        workspaces: Arc<dyn WorkspaceManager>,
        namer: Arc<dyn Namer>,
    ) -> Self {
        let repo_root = repo_root.as_ref().to_path_buf();
        Self {
            repo: Git::new(&repo_root),
            repo_root,
            store,
            workspaces,
            namer,
        }
    }

    /// Fork: create the target branch, then one workspace per agent.
    ///
    /// On any provisioning failure the workspaces created so far are destroyed
    /// and the session is marked FAILED.
    pub async fn start(&self, options: StartOptions) -> Result<Session, SessionError> {
        let mut seen = std::collections::HashSet::new();
        for id in &options.agent_ids {
            if !is_valid_agent_id(id) {
                return Err(SessionError::InvalidAgentId(id.clone()));
            }
            if !seen.insert(id.as_str()) {
                return Err(SessionError::DuplicateAgent(id.clone()));
            }
        }

        let base_sha = self
            .repo
            .rev_parse(&options.base_branch)
            .await
            .map_err(|_| SessionError::BaseNotFound(options.base_branch.clone()))?;

        let target_branch = match &options.target_branch {
            Some(t) => t.clone(),
            None => self.derive_target_branch(options.prompt.as_deref()).await,
        };
        if self.repo.branch_exists(&target_branch).await {
            return Err(SessionError::TargetExists(target_branch));
        }

        let session = self
            .store
            .create_session(&options.base_branch, &target_branch, &self.repo_root)?;
        let session_id = session.session_id.clone();

        // The target exists before any agent is provisioned.
        if let Err(e) = self.repo.create_branch(&target_branch, &base_sha).await {
            self.store.mark_session_state(&session_id, SessionState::Failed)?;
            return Err(e.into());
        }
        info!(
            "Session {} started: {} -> {} with {} agent(s)",
            session_id,
            options.base_branch,
            target_branch,
            options.agent_ids.len()
        );

        let mut created = Vec::new();
        for agent_id in &options.agent_ids {
            let result = self
                .workspaces
                .create(&session_id, agent_id, &options.base_branch)
                .await;
            let workspace = match result {
                Ok(ws) => ws,
                Err(e) => {
                    warn!("Provisioning {} failed: {}", agent_id, e);
                    self.rollback(&session_id, &created).await;
                    return Err(e.into());
                }
            };
            let agent = Agent::new(agent_id.clone(), workspace.path.clone(), workspace.branch.clone());
            if let Err(e) = self.store.add_agent(&session_id, &agent) {
                created.push(agent);
                self.rollback(&session_id, &created).await;
                return Err(e.into());
            }
            created.push(agent);
        }

        self.store.set_current(&self.repo_root, &session_id)?;
        Ok(self.store.get_session(&session_id)?)
    }

    async fn rollback(&self, session_id: &str, agents: &[Agent]) {
        for agent in agents {
            if let Err(e) = self
                .workspaces
                .destroy(&agent.workspace_path, &agent.branch_name)
                .await
            {
                warn!("Rollback of {} failed: {}", agent.agent_id, e);
            }
        }
        if let Err(e) = self.store.mark_session_state(session_id, SessionState::Failed) {
            warn!("Could not mark session {} failed: {}", session_id, e);
        }
    }

    async fn derive_target_branch(&self, prompt: Option<&str>) -> String {
        if let Some(prompt) = prompt {
            if let Some(name) = self.namer.name(prompt).await {
                let slug = crate::namer::slugify(&name);
                if !slug.is_empty() {
                    return format!("feature/{}", slug);
                }
            }
            let slug = crate::namer::slugify(prompt);
            if !slug.is_empty() {
                return format!("feature/{}", slug);
            }
        }
        fallback_target_branch(&uuid::Uuid::new_v4().simple().to_string()[..8])
    }

    /// Load a session.
    pub fn status(&self, session_id: &str) -> Result<Session, SessionError> {
        Ok(self.store.get_session(session_id)?)
    }

    /// The current session for this repository.
    pub fn current(&self) -> Result<Option<Session>, SessionError> {
        match self.store.current(&self.repo_root)? {
            Some(id) => Ok(Some(self.store.get_session(&id)?)),
            None => Ok(None),
        }
    }

    /// Explicitly remove a session: leftover workspaces, branches of failed
    /// agents, and the record itself. The target branch is kept.
    pub async fn cleanup(&self, session_id: &str, force: bool) -> Result<usize, SessionError> {
        let session = self.store.get_session(session_id)?;
        if !session.state.is_finished() && !force {
            return Err(SessionError::StillActive(session_id.to_string()));
        }

        let mut removed = 0;
        for agent in &session.agents {
            if agent.status == AgentStatus::Merged || agent.status == AgentStatus::CleanedUp {
                continue;
            }
            self.workspaces
                .destroy(&agent.workspace_path, &agent.branch_name)
                .await?;
            removed += 1;
        }

        self.store.delete_session(session_id)?;
        info!("Cleaned up session {} ({} workspace(s))", session_id, removed);
        Ok(removed)
    }
}
