// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session and agent records.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static AGENT_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,63}$").expect("valid agent id regex"));

/// Lifecycle of a fork-join session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Started,
    Merging,
    Complete,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "STARTED",
            Self::Merging => "MERGING",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
        }
    }

    /// Whether the session accepts no more work.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STARTED" => Ok(Self::Started),
            "MERGING" => Ok(Self::Merging),
            "COMPLETE" => Ok(Self::Complete),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown session state: {}", other)),
        }
    }
}

/// Lifecycle of one agent inside a session.
///
/// Transitions only move forward; the single exception is
/// `MergeFailed -> Queued` when a failed merge is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Running,
    ChangesPending,
    Committed,
    Queued,
    Merged,
    MergeFailed,
    CleanedUp,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::ChangesPending => "CHANGES_PENDING",
            Self::Committed => "COMMITTED",
            Self::Queued => "QUEUED",
            Self::Merged => "MERGED",
            Self::MergeFailed => "MERGE_FAILED",
            Self::CleanedUp => "CLEANED_UP",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Running => 0,
            Self::ChangesPending => 1,
            Self::Committed => 2,
            Self::Queued => 3,
            Self::Merged | Self::MergeFailed => 4,
            Self::CleanedUp => 5,
        }
    }

    /// Whether the agent needs nothing more from the coordinator.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Merged | Self::MergeFailed | Self::CleanedUp)
    }

    /// Whether moving from `self` to `next` is allowed.
    ///
    /// Staying in the same state is allowed and is a no-op.
    pub fn can_transition_to(&self, next: AgentStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            Self::Merged | Self::CleanedUp => false,
            Self::MergeFailed => next == Self::Queued,
            _ => next.rank() > self.rank(),
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(Self::Running),
            "CHANGES_PENDING" => Ok(Self::ChangesPending),
            "COMMITTED" => Ok(Self::Committed),
            "QUEUED" => Ok(Self::Queued),
            "MERGED" => Ok(Self::Merged),
            "MERGE_FAILED" => Ok(Self::MergeFailed),
            "CLEANED_UP" => Ok(Self::CleanedUp),
            other => Err(format!("unknown agent status: {}", other)),
        }
    }
}

/// One unit of parallel work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: String,
    pub workspace_path: PathBuf,
    pub branch_name: String,
    pub status: AgentStatus,
    /// Commit produced by the completion client.
    pub commit_sha: Option<String>,
    /// Commit the target branch was advanced to when this agent merged.
    pub merged_sha: Option<String>,
    /// 1-based position at submission time.
    pub queue_position: Option<u32>,
    pub conflict_files: Vec<String>,
    pub commit_message: Option<String>,
}

impl Agent {
    /// A freshly provisioned agent.
    pub fn new(agent_id: impl Into<String>, workspace_path: PathBuf, branch_name: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            workspace_path,
            branch_name: branch_name.into(),
            status: AgentStatus::Running,
            commit_sha: None,
            merged_sha: None,
            queue_position: None,
            conflict_files: Vec::new(),
            commit_message: None,
        }
    }
}

/// Partial update applied to an agent record.
///
/// `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentPatch {
    pub status: Option<AgentStatus>,
    pub commit_sha: Option<String>,
    pub merged_sha: Option<String>,
    pub queue_position: Option<u32>,
    pub conflict_files: Option<Vec<String>>,
    pub commit_message: Option<String>,
}

impl AgentPatch {
    pub fn status(status: AgentStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_commit(mut self, sha: impl Into<String>) -> Self {
        self.commit_sha = Some(sha.into());
        self
    }

    pub fn with_position(mut self, position: u32) -> Self {
        self.queue_position = Some(position);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.commit_message = Some(message.into());
        self
    }
}

/// One fork-join task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub base_branch: String,
    pub target_branch: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    /// Repository the session belongs to.
    pub workspace_root: PathBuf,
    /// Agents in spawn order.
    pub agents: Vec<Agent>,
    pub merged_count: u32,
    pub conflict_count: u32,
    pub pr_url: Option<String>,
}

impl Session {
    pub fn agent(&self, agent_id: &str) -> Option<&Agent> {
        self.agents.iter().find(|a| a.agent_id == agent_id)
    }

    /// Whether every agent reached a terminal status.
    pub fn is_drained(&self) -> bool {
        self.agents.iter().all(|a| a.status.is_terminal())
    }

    /// Agents that still need the coordinator.
    pub fn active_agents(&self) -> Vec<&Agent> {
        self.agents.iter().filter(|a| !a.status.is_terminal()).collect()
    }

    pub fn agents_with(&self, status: AgentStatus) -> Vec<&Agent> {
        self.agents.iter().filter(|a| a.status == status).collect()
    }
}

/// Generate a time-derived session id, e.g. `fj-20260314-101500-3fa2c1`.
pub fn generate_session_id() -> String {
    let now = Utc::now();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("fj-{}-{}", now.format("%Y%m%d-%H%M%S"), &suffix[..6])
}

/// Whether `id` is usable as an agent id (and thus inside a ref name).
pub fn is_valid_agent_id(id: &str) -> bool {
    AGENT_ID_RE.is_match(id) && !id.contains("..") && !id.ends_with(".lock")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        use AgentStatus::*;
        assert!(Running.can_transition_to(ChangesPending));
        assert!(Running.can_transition_to(Committed));
        assert!(Committed.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Merged));
        assert!(Queued.can_transition_to(MergeFailed));
        assert!(Running.can_transition_to(CleanedUp));
        assert!(Queued.can_transition_to(CleanedUp));
    }

    #[test]
    fn test_backward_transitions_rejected() {
        use AgentStatus::*;
        assert!(!Queued.can_transition_to(Running));
        assert!(!Committed.can_transition_to(ChangesPending));
        assert!(!Merged.can_transition_to(Queued));
        assert!(!Merged.can_transition_to(CleanedUp));
        assert!(!CleanedUp.can_transition_to(Queued));
        assert!(!MergeFailed.can_transition_to(Merged));
        assert!(!MergeFailed.can_transition_to(CleanedUp));
    }

    #[test]
    fn test_retry_transition_and_noop() {
        use AgentStatus::*;
        assert!(MergeFailed.can_transition_to(Queued));
        assert!(Merged.can_transition_to(Merged));
        assert!(Queued.can_transition_to(Queued));
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            AgentStatus::Running,
            AgentStatus::ChangesPending,
            AgentStatus::MergeFailed,
            AgentStatus::CleanedUp,
        ] {
            assert_eq!(status.as_str().parse::<AgentStatus>().unwrap(), status);
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        assert!("DONE".parse::<AgentStatus>().is_err());
        assert!("merging".parse::<SessionState>().is_err());
    }

    #[test]
    fn test_session_id_format() {
        let id = generate_session_id();
        assert!(id.starts_with("fj-"));
        assert_eq!(id.len(), "fj-20260101-000000-abcdef".len());
        assert_ne!(id, generate_session_id());
    }

    #[test]
    fn test_agent_id_validation() {
        assert!(is_valid_agent_id("agent-1"));
        assert!(is_valid_agent_id("a.b_c"));
        assert!(!is_valid_agent_id(""));
        assert!(!is_valid_agent_id("-lead"));
        assert!(!is_valid_agent_id("has space"));
        assert!(!is_valid_agent_id("a/b"));
        assert!(!is_valid_agent_id("a..b"));
        assert!(!is_valid_agent_id("x.lock"));
    }

    #[test]
    fn test_session_drained() {
        let mut session = Session {
            session_id: "s".to_string(),
            base_branch: "main".to_string(),
            target_branch: "feature".to_string(),
            state: SessionState::Started,
            created_at: Utc::now(),
            workspace_root: PathBuf::from("/repo"),
            agents: vec![
                Agent::new("a1", PathBuf::from("/w1"), "agent/s/a1"),
                Agent::new("a2", PathBuf::from("/w2"), "agent/s/a2"),
            ],
            merged_count: 0,
            conflict_count: 0,
            pr_url: None,
        };
        assert!(!session.is_drained());
        assert_eq!(session.active_agents().len(), 2);

        session.agents[0].status = AgentStatus::Merged;
        session.agents[1].status = AgentStatus::CleanedUp;
        assert!(session.is_drained());
        assert_eq!(session.agents_with(AgentStatus::Merged).len(), 1);
    }
}
