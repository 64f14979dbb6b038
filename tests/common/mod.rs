// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use forkjoin::finalize::{FinalizeError, PullRequest, PullRequestDraft, PullRequestSink};
use forkjoin::queue::{EnqueueRequest, MergeExecutor, MergeJob, MergeOutcome};
use forkjoin::session::{Agent, Session, SessionStore};
use forkjoin::workspace::{agent_branch_name, IsolationError, WorkspaceInfo, WorkspaceManager};

pub const TARGET: &str = "feature/combined";

// ============================================================================
// Fake merge backend
// ============================================================================

/// Merge backend that answers from a script and records what it saw.
///
/// Tracks how many merges run at once so tests can assert a single writer.
pub struct ScriptedMerger {
    outcomes: Mutex<HashMap<String, VecDeque<MergeOutcome>>>,
    order: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    delay: Duration,
    gate: Option<Semaphore>,
}

impl ScriptedMerger {
    pub fn new() -> Self {
        Self {
            outcomes: Mutex::new(HashMap::new()),
            order: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            delay: Duration::ZERO,
            gate: None,
        }
    }

    /// Sleep inside every merge.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Hold every merge until [`release`](Self::release) hands out permits.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    pub fn release(&self, merges: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(merges);
        }
    }

    /// Queue the outcomes for the agent's next attempts. Unscripted attempts merge.
    pub fn script(&self, agent_id: &str, outcomes: Vec<MergeOutcome>) {
        self.outcomes
            .lock()
            .unwrap()
            .entry(agent_id.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// Agents in the order their merges started.
    pub fn order(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MergeExecutor for ScriptedMerger {
    async fn merge(&self, job: &MergeJob) -> MergeOutcome {
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.order.lock().unwrap().push(job.agent_id.clone());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted = self
            .outcomes
            .lock()
            .unwrap()
            .get_mut(&job.agent_id)
            .and_then(|q| q.pop_front());

        self.active.fetch_sub(1, Ordering::SeqCst);
        scripted.unwrap_or_else(|| MergeOutcome::Merged {
            commit_sha: format!("sha-{}-{}", job.agent_id, job.attempt_count),
        })
    }
}

// ============================================================================
// Fake workspaces
// ============================================================================

/// Workspace manager that only records teardown.
#[derive(Default)]
pub struct RecordingWorkspaces {
    destroyed: Mutex<Vec<String>>,
}

impl RecordingWorkspaces {
    pub fn destroyed(&self) -> Vec<String> {
        self.destroyed.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkspaceManager for RecordingWorkspaces {
    async fn create(&self, session_id: &str, agent_id: &str, base: &str) -> Result<WorkspaceInfo, IsolationError> {
        Ok(WorkspaceInfo {
            path: PathBuf::from("/tmp").join(session_id).join(agent_id),
            branch: agent_branch_name(session_id, agent_id),
            base_branch: base.to_string(),
        })
    }

    async fn destroy(&self, _path: &Path, branch: &str) -> Result<(), IsolationError> {
        self.destroyed.lock().unwrap().push(branch.to_string());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<WorkspaceInfo>, IsolationError> {
        Ok(Vec::new())
    }
}

// ============================================================================
// Fake pull request host
// ============================================================================

/// Pull request sink that keeps what it was asked to publish.
#[derive(Default)]
pub struct RecordingSink {
    created: Mutex<Vec<PullRequestDraft>>,
    updated: Mutex<Vec<(u64, PullRequestDraft)>>,
}

impl RecordingSink {
    pub fn created(&self) -> Vec<PullRequestDraft> {
        self.created.lock().unwrap().clone()
    }

    pub fn updated(&self) -> Vec<(u64, PullRequestDraft)> {
        self.updated.lock().unwrap().clone()
    }
}

#[async_trait]
impl PullRequestSink for RecordingSink {
    async fn find_open(&self, _head: &str, _base: &str) -> Result<Option<PullRequest>, FinalizeError> {
        let open = !self.created.lock().unwrap().is_empty();
        Ok(open.then(|| PullRequest {
            number: 1,
            url: "https://example.com/pull/1".to_string(),
        }))
    }

    async fn create(&self, draft: &PullRequestDraft) -> Result<PullRequest, FinalizeError> {
        self.created.lock().unwrap().push(draft.clone());
        Ok(PullRequest {
            number: 1,
            url: "https://example.com/pull/1".to_string(),
        })
    }

    async fn update(&self, number: u64, draft: &PullRequestDraft) -> Result<PullRequest, FinalizeError> {
        self.updated.lock().unwrap().push((number, draft.clone()));
        Ok(PullRequest {
            number,
            url: "https://example.com/pull/1".to_string(),
        })
    }
}

// ============================================================================
// Sessions
// ============================================================================

/// A STARTED session with the given agents, recorded in `store`.
pub fn seed_session(store: &SessionStore, root: &Path, agents: &[&str]) -> Session {
    let session = store.create_session("main", TARGET, root).unwrap();
    for agent_id in agents {
        let agent = Agent::new(
            *agent_id,
            root.join("worktrees").join(agent_id),
            agent_branch_name(&session.session_id, agent_id),
        );
        store.add_agent(&session.session_id, &agent).unwrap();
    }
    store.get_session(&session.session_id).unwrap()
}

/// The submission an agent's completion client would send.
pub fn request_for(session: &Session, agent_id: &str) -> EnqueueRequest {
    let agent = session.agent(agent_id).unwrap();
    EnqueueRequest {
        agent_id: agent_id.to_string(),
        session_id: session.session_id.clone(),
        branch: agent.branch_name.clone(),
        workspace: agent.workspace_path.clone(),
        target_branch: session.target_branch.clone(),
        commit_sha: None,
        commit_message: None,
    }
}

pub fn open_store(dir: &Path) -> Arc<SessionStore> {
    Arc::new(SessionStore::open(dir).unwrap())
}

// ============================================================================
// Real git fixtures
// ============================================================================

/// Run git in `dir`, panicking with stderr on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git is installed");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// A repository on `main` with one commit containing `files`.
pub fn init_repo(dir: &Path, files: &[(&str, &str)]) {
    git(dir, &["init", "-q", "-b", "main"]);
    git(dir, &["config", "user.email", "agents@example.com"]);
    git(dir, &["config", "user.name", "Agents"]);
    git(dir, &["config", "commit.gpgsign", "false"]);
    for (path, content) in files {
        write_file(dir, path, content);
    }
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-q", "-m", "initial"]);
}

pub fn write_file(dir: &Path, path: &str, content: &str) {
    let full = dir.join(path);
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(full, content).unwrap();
}

/// Contents of `path` at `rev`.
pub fn show(dir: &Path, rev: &str, path: &str) -> String {
    git(dir, &["show", &format!("{}:{}", rev, path)])
}
