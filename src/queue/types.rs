// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Merge job and queue data types.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;

/// Lifecycle of a merge job.
///
/// `Queued -> Merging -> {Merged | MergeFailed}`; only an explicit retry
/// moves `MergeFailed` back to `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Merging,
    Merged,
    MergeFailed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Merging => "MERGING",
            Self::Merged => "MERGED",
            Self::MergeFailed => "MERGE_FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Merged | Self::MergeFailed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "MERGING" => Ok(Self::Merging),
            "MERGED" => Ok(Self::Merged),
            "MERGE_FAILED" => Ok(Self::MergeFailed),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// Request to integrate one agent's branch into the session target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeJob {
    pub id: Uuid,
    pub session_id: String,
    pub agent_id: String,
    pub source_branch: String,
    pub source_workspace: PathBuf,
    pub target_branch: String,
    pub submitted_at: DateTime<Utc>,
    /// Attempts scheduled so far, starting at 1.
    pub attempt_count: u32,
    pub status: JobStatus,
    pub last_error: Option<String>,
    pub conflict_files: Vec<String>,
    /// Monotonic position in submission order; retries get a fresh one.
    pub queue_order: u64,
}

impl MergeJob {
    pub fn new(
        session_id: impl Into<String>,
        agent_id: impl Into<String>,
        source_branch: impl Into<String>,
        source_workspace: PathBuf,
        target_branch: impl Into<String>,
        queue_order: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            agent_id: agent_id.into(),
            source_branch: source_branch.into(),
            source_workspace,
            target_branch: target_branch.into(),
            submitted_at: Utc::now(),
            attempt_count: 1,
            status: JobStatus::Queued,
            last_error: None,
            conflict_files: Vec::new(),
            queue_order,
        }
    }

    pub fn key(&self) -> JobKey {
        JobKey::new(&self.session_id, &self.agent_id)
    }

    /// Public view of this job.
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            agent_id: self.agent_id.clone(),
            session_id: self.session_id.clone(),
            status: self.status,
            attempt_count: self.attempt_count,
            commit_sha: None,
            conflict_files: self.conflict_files.clone(),
            last_error: self.last_error.clone(),
            error_kind: None,
        }
    }
}

/// Identity of a job: one per agent per session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey {
    pub session_id: String,
    pub agent_id: String,
}

impl JobKey {
    pub fn new(session_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            agent_id: agent_id.into(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session_id, self.agent_id)
    }
}

/// What a merge attempt produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum MergeOutcome {
    /// Target advanced to `commit_sha`.
    Merged { commit_sha: String },
    /// Rebase stopped on content conflicts in `files`.
    Conflict { files: Vec<String> },
    /// Anything else; the target is unchanged.
    Failed { kind: ErrorKind, reason: String },
}

impl MergeOutcome {
    pub fn failed(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self::Failed {
            kind,
            reason: reason.into(),
        }
    }

    pub fn is_merged(&self) -> bool {
        matches!(self, Self::Merged { .. })
    }

    /// Label used for metrics and spans.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Merged { .. } => "merged",
            Self::Conflict { .. } => "conflict",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Job state as seen by waiters and IPC clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub agent_id: String,
    pub session_id: String,
    pub status: JobStatus,
    pub attempt_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflict_files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

/// Submission of an agent's branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub agent_id: String,
    pub session_id: String,
    pub branch: String,
    pub workspace: PathBuf,
    pub target_branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_message: Option<String>,
}

/// Accepted submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnqueueReceipt {
    /// Waiting at 1-based `position`.
    Queued { position: usize },
    /// Currently being merged.
    Merging,
    /// Already integrated; the prior result.
    Merged { commit_sha: Option<String> },
}

impl EnqueueReceipt {
    /// Position reported on the wire; 0 while merging or merged.
    pub fn position(&self) -> usize {
        match self {
            Self::Queued { position } => *position,
            _ => 0,
        }
    }
}

/// Result of a dequeue request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DequeueOutcome {
    /// A pending job was removed.
    Removed,
    /// Agent had no job; it was cleaned up.
    CleanedUp,
    /// Job already finished; nothing changed.
    AlreadyComplete,
}

/// Queue status summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Pending plus in-flight jobs.
    pub length: usize,
    pub pending: usize,
    pub processing: usize,
    /// Agent currently merging.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merging: Option<String>,
    /// Pending agents in drain order.
    pub agents: Vec<String>,
    pub shutting_down: bool,
}

// ============================================================================
// Errors
// ============================================================================

/// Error type for merge queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Enqueue rejected: {0}")]
    Rejected(String),

    #[error("Queue is full ({0} pending jobs)")]
    QueueFull(usize),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("No job for agent {0}")]
    JobNotFound(String),

    #[error("Agent {0} is being merged and cannot be cancelled")]
    JobInFlight(String),

    #[error("Job for agent {0} was cancelled")]
    Cancelled(String),

    #[error("Agent {agent_id} is {status}; only MERGE_FAILED jobs can be retried")]
    NotRetryable { agent_id: String, status: JobStatus },

    #[error("Agent {agent_id} exhausted its retries after {attempts} attempt(s)")]
    RetryLimit { agent_id: String, attempts: u32 },

    #[error("Session {0} is halted after a store failure")]
    SessionHalted(String),

    #[error("Timed out waiting for agent {0}")]
    Timeout(String),

    #[error("Coordinator is shutting down")]
    ShuttingDown,

    #[error("Coordinator is not running")]
    ChannelClosed,

    #[error("Finalization is not configured")]
    FinalizeDisabled,

    #[error("Finalize failed: {message}")]
    Finalize { kind: ErrorKind, message: String },

    #[error("Merge recovery failed: {0}")]
    Recovery(String),

    #[error(transparent)]
    Store(#[from] crate::session::StoreError),

    #[error(transparent)]
    Workspace(#[from] crate::workspace::IsolationError),
}

impl QueueError {
    /// Taxonomy classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Rejected(_)
            | Self::QueueFull(_)
            | Self::JobInFlight(_)
            | Self::Cancelled(_)
            | Self::NotRetryable { .. } => ErrorKind::EnqueueRejected,
            Self::SessionNotFound(_) => ErrorKind::SessionNotFound,
            Self::JobNotFound(_) => ErrorKind::AgentNotFound,
            Self::RetryLimit { .. } => ErrorKind::MergeFailedTerminal,
            Self::SessionHalted(_) | Self::Recovery(_) => ErrorKind::StoreCorrupted,
            Self::ShuttingDown | Self::ChannelClosed => ErrorKind::IpcUnavailable,
            Self::Finalize { kind, .. } => *kind,
            Self::Store(e) => e.kind(),
            Self::Workspace(e) => e.kind(),
            Self::Timeout(_) | Self::FinalizeDisabled => ErrorKind::Internal,
        }
    }
}
