// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! SQLite-backed session store.
//!
//! Holds sessions, their agent rosters, persisted merge jobs, and the
//! "current session" pointer per workspace root. Multi-statement writes run
//! inside a transaction so a failed write leaves the previous state intact.
//! Rows that cannot be decoded are reported as [`StoreError::Corrupted`] and
//! never repaired.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
#[cfg(feature = "telemetry")]
use std::time::Instant;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::{debug, error};

use crate::error::ErrorKind;
use crate::queue::{JobStatus, MergeJob};

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

use super::types::{generate_session_id, Agent, AgentPatch, AgentStatus, Session, SessionState};

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Database file name inside the state directory.
pub const DB_FILE: &str = "sessions.db";

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Agent {agent_id} not found in session {session_id}")]
    AgentNotFound { session_id: String, agent_id: String },

    #[error("Agent {0} already exists")]
    AgentExists(String),

    #[error("Invalid transition for agent {agent_id}: {from} -> {to}")]
    InvalidTransition {
        agent_id: String,
        from: AgentStatus,
        to: AgentStatus,
    },

    #[error("Session store corrupted: {0}")]
    Corrupted(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl StoreError {
    /// Taxonomy classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SessionNotFound(_) => ErrorKind::SessionNotFound,
            Self::AgentNotFound { .. } => ErrorKind::AgentNotFound,
            Self::Corrupted(_) => ErrorKind::StoreCorrupted,
            _ => ErrorKind::Internal,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// Durable record of sessions and merge jobs.
pub struct SessionStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SessionStore {
    /// Open or create the store inside `state_dir`.
    pub fn open(state_dir: &Path) -> Result<Self, StoreError> {
        Self::open_at(&state_dir.join(DB_FILE))
    }

    /// Open or create a store at a specific database path.
    pub fn open_at(db_path: &Path) -> Result<Self, StoreError> {
        #[cfg(feature = "telemetry")]
        let start = Instant::now();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Database(format!("Failed to create directory: {}", e))
            })?;
        }

        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        // WAL lets the CLI read while the daemon writes.
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;

        let store = Self {
            conn: Mutex::new(conn),
            path: db_path.to_path_buf(),
        };
        store.init_schema()?;

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("session.store.open", start.elapsed());

        Ok(store)
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Database("store lock poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                base_branch TEXT NOT NULL,
                target_branch TEXT NOT NULL,
                state TEXT NOT NULL,
                workspace_root TEXT NOT NULL,
                merged_count INTEGER NOT NULL DEFAULT 0,
                conflict_count INTEGER NOT NULL DEFAULT 0,
                pr_url TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS agents (
                session_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                workspace_path TEXT NOT NULL,
                branch_name TEXT NOT NULL,
                status TEXT NOT NULL,
                commit_sha TEXT,
                merged_sha TEXT,
                queue_position INTEGER,
                conflict_files TEXT NOT NULL DEFAULT '[]',
                commit_message TEXT,
                PRIMARY KEY (session_id, agent_id),
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS merge_jobs (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                source_branch TEXT NOT NULL,
                source_workspace TEXT NOT NULL,
                target_branch TEXT NOT NULL,
                submitted_at INTEGER NOT NULL,
                attempt_count INTEGER NOT NULL,
                status TEXT NOT NULL,
                last_error TEXT,
                conflict_files TEXT NOT NULL DEFAULT '[]',
                queue_order INTEGER NOT NULL,
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS current_session (
                workspace_root TEXT PRIMARY KEY,
                session_id TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_order ON merge_jobs(queue_order);
            CREATE INDEX IF NOT EXISTS idx_jobs_agent ON merge_jobs(session_id, agent_id);
            "#,
        )?;

        let current: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .optional()?;
        match current {
            None => {
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?)",
                    params![SCHEMA_VERSION],
                )?;
            }
            Some(v) if v > SCHEMA_VERSION => {
                return Err(StoreError::Corrupted(format!(
                    "schema version {} is newer than supported {}",
                    v, SCHEMA_VERSION
                )));
            }
            Some(_) => {}
        }
        Ok(())
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Create a new session record and return it.
    pub fn create_session(
        &self,
        base_branch: &str,
        target_branch: &str,
        workspace_root: &Path,
    ) -> Result<Session, StoreError> {
        let session = Session {
            session_id: generate_session_id(),
            base_branch: base_branch.to_string(),
            target_branch: target_branch.to_string(),
            state: SessionState::Started,
            created_at: Utc::now(),
            workspace_root: workspace_root.to_path_buf(),
            agents: Vec::new(),
            merged_count: 0,
            conflict_count: 0,
            pr_url: None,
        };
        self.insert_session(&session)?;
        Ok(session)
    }

    /// Insert a fully formed session, including its agents.
    pub fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now().timestamp_millis();
        tx.execute(
            r#"
            INSERT INTO sessions (
                id, base_branch, target_branch, state, workspace_root,
                merged_count, conflict_count, pr_url, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                session.session_id,
                session.base_branch,
                session.target_branch,
                session.state.as_str(),
                session.workspace_root.to_string_lossy(),
                session.merged_count,
                session.conflict_count,
                session.pr_url,
                session.created_at.timestamp_millis(),
                now,
            ],
        )?;
        for (seq, agent) in session.agents.iter().enumerate() {
            insert_agent(&tx, &session.session_id, seq as i64, agent)?;
        }
        tx.commit()?;
        debug!("Created session {}", session.session_id);
        Ok(())
    }

    /// Append an agent to a session's roster.
    pub fn add_agent(&self, session_id: &str, agent: &Agent) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        ensure_session(&tx, session_id)?;
        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM agents WHERE session_id = ? AND agent_id = ?",
                params![session_id, agent.agent_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(StoreError::AgentExists(agent.agent_id.clone()));
        }
        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq) + 1, 0) FROM agents WHERE session_id = ?",
            params![session_id],
            |row| row.get(0),
        )?;
        insert_agent(&tx, session_id, seq, agent)?;
        touch(&tx, session_id)?;
        tx.commit()?;
        Ok(())
    }

    /// Load a session with its agents in spawn order.
    pub fn get_session(&self, session_id: &str) -> Result<Session, StoreError> {
        let conn = self.conn()?;
        load_session(&conn, session_id)
    }

    /// All sessions, newest first.
    pub fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let conn = self.conn()?;
        let ids: Vec<String> = {
            let mut stmt = conn.prepare("SELECT id FROM sessions ORDER BY created_at DESC")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        ids.iter().map(|id| load_session(&conn, id)).collect()
    }

    /// Set the lifecycle state of a session.
    pub fn mark_session_state(&self, session_id: &str, state: SessionState) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let rows = conn.execute(
            "UPDATE sessions SET state = ?, updated_at = ? WHERE id = ?",
            params![state.as_str(), Utc::now().timestamp_millis(), session_id],
        )?;
        if rows == 0 {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }
        debug!("Session {} -> {}", session_id, state);
        Ok(())
    }

    /// Record the pull request opened for a session.
    pub fn set_pr_url(&self, session_id: &str, url: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let rows = conn.execute(
            "UPDATE sessions SET pr_url = ?, updated_at = ? WHERE id = ?",
            params![url, Utc::now().timestamp_millis(), session_id],
        )?;
        if rows == 0 {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }

    /// Delete a session, its agents, and its jobs.
    pub fn delete_session(&self, session_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM current_session WHERE session_id = ?", params![session_id])?;
        let rows = tx.execute("DELETE FROM sessions WHERE id = ?", params![session_id])?;
        tx.commit()?;
        Ok(rows > 0)
    }

    // ========================================================================
    // Agents
    // ========================================================================

    /// Atomic read-modify-write of one agent record.
    ///
    /// Status changes are validated against the agent lifecycle.
    pub fn update_agent(
        &self,
        session_id: &str,
        agent_id: &str,
        patch: &AgentPatch,
    ) -> Result<Agent, StoreError> {
        #[cfg(feature = "telemetry")]
        let start = Instant::now();

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let agent = apply_patch(&tx, session_id, agent_id, patch)?;
        touch(&tx, session_id)?;
        tx.commit()?;

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("session.store.update_agent", start.elapsed());

        Ok(agent)
    }

    /// Mark an agent merged and bump `merged_count` in one transaction.
    pub fn record_merged(
        &self,
        session_id: &str,
        agent_id: &str,
        merged_sha: &str,
    ) -> Result<Agent, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let patch = AgentPatch {
            status: Some(AgentStatus::Merged),
            merged_sha: Some(merged_sha.to_string()),
            conflict_files: Some(Vec::new()),
            ..Default::default()
        };
        let agent = apply_patch(&tx, session_id, agent_id, &patch)?;
        tx.execute(
            "UPDATE sessions SET merged_count = merged_count + 1, updated_at = ? WHERE id = ?",
            params![Utc::now().timestamp_millis(), session_id],
        )?;
        tx.commit()?;
        Ok(agent)
    }

    /// Mark an agent's merge failed; conflicts also bump `conflict_count`.
    pub fn record_merge_failed(
        &self,
        session_id: &str,
        agent_id: &str,
        conflict_files: &[String],
        is_conflict: bool,
    ) -> Result<Agent, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let patch = AgentPatch {
            status: Some(AgentStatus::MergeFailed),
            conflict_files: Some(conflict_files.to_vec()),
            ..Default::default()
        };
        let agent = apply_patch(&tx, session_id, agent_id, &patch)?;
        let bump = if is_conflict { 1 } else { 0 };
        tx.execute(
            "UPDATE sessions SET conflict_count = conflict_count + ?, updated_at = ? WHERE id = ?",
            params![bump, Utc::now().timestamp_millis(), session_id],
        )?;
        tx.commit()?;
        Ok(agent)
    }

    // ========================================================================
    // Current session pointer
    // ========================================================================

    /// Point `workspace_root` at `session_id`.
    pub fn set_current(&self, workspace_root: &Path, session_id: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO current_session (workspace_root, session_id) VALUES (?, ?)
            ON CONFLICT(workspace_root) DO UPDATE SET session_id = excluded.session_id
            "#,
            params![workspace_root.to_string_lossy(), session_id],
        )?;
        Ok(())
    }

    /// The current session for `workspace_root`, if any.
    pub fn current(&self, workspace_root: &Path) -> Result<Option<String>, StoreError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT session_id FROM current_session WHERE workspace_root = ?",
                params![workspace_root.to_string_lossy()],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Drop the current pointer for `workspace_root`.
    pub fn clear_current(&self, workspace_root: &Path) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM current_session WHERE workspace_root = ?",
            params![workspace_root.to_string_lossy()],
        )?;
        Ok(())
    }

    // ========================================================================
    // Merge jobs
    // ========================================================================

    /// Insert or replace a merge job.
    pub fn save_job(&self, job: &MergeJob) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let conflicts = serde_json::to_string(&job.conflict_files)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        conn.execute(
            r#"
            INSERT INTO merge_jobs (
                id, session_id, agent_id, source_branch, source_workspace, target_branch,
                submitted_at, attempt_count, status, last_error, conflict_files, queue_order
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                attempt_count = excluded.attempt_count,
                status = excluded.status,
                last_error = excluded.last_error,
                conflict_files = excluded.conflict_files,
                queue_order = excluded.queue_order
            "#,
            params![
                job.id.to_string(),
                job.session_id,
                job.agent_id,
                job.source_branch,
                job.source_workspace.to_string_lossy(),
                job.target_branch,
                job.submitted_at.timestamp_millis(),
                job.attempt_count,
                job.status.as_str(),
                job.last_error,
                conflicts,
                job.queue_order as i64,
            ],
        )?;
        Ok(())
    }

    /// Remove a merge job.
    pub fn delete_job(&self, job_id: &uuid::Uuid) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM merge_jobs WHERE id = ?", params![job_id.to_string()])?;
        Ok(())
    }

    /// Every persisted job in queue order.
    pub fn load_jobs(&self) -> Result<Vec<MergeJob>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, session_id, agent_id, source_branch, source_workspace, target_branch,
                   submitted_at, attempt_count, status, last_error, conflict_files, queue_order
            FROM merge_jobs ORDER BY queue_order ASC
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(RawJob {
                id: row.get(0)?,
                session_id: row.get(1)?,
                agent_id: row.get(2)?,
                source_branch: row.get(3)?,
                source_workspace: row.get(4)?,
                target_branch: row.get(5)?,
                submitted_at: row.get(6)?,
                attempt_count: row.get(7)?,
                status: row.get(8)?,
                last_error: row.get(9)?,
                conflict_files: row.get(10)?,
                queue_order: row.get(11)?,
            })
        })?;

        let mut jobs = Vec::new();
        for raw in rows {
            jobs.push(raw?.decode()?);
        }
        Ok(jobs)
    }
}

struct RawJob {
    id: String,
    session_id: String,
    agent_id: String,
    source_branch: String,
    source_workspace: String,
    target_branch: String,
    submitted_at: i64,
    attempt_count: u32,
    status: String,
    last_error: Option<String>,
    conflict_files: String,
    queue_order: i64,
}

impl RawJob {
    fn decode(self) -> Result<MergeJob, StoreError> {
        let id = uuid::Uuid::parse_str(&self.id)
            .map_err(|e| StoreError::Corrupted(format!("job id {}: {}", self.id, e)))?;
        let status: JobStatus = self
            .status
            .parse()
            .map_err(|e: String| StoreError::Corrupted(format!("job {}: {}", self.id, e)))?;
        let conflict_files: Vec<String> = serde_json::from_str(&self.conflict_files)
            .map_err(|e| StoreError::Corrupted(format!("job {} conflict files: {}", self.id, e)))?;
        Ok(MergeJob {
            id,
            session_id: self.session_id,
            agent_id: self.agent_id,
            source_branch: self.source_branch,
            source_workspace: PathBuf::from(self.source_workspace),
            target_branch: self.target_branch,
            submitted_at: timestamp(self.submitted_at)?,
            attempt_count: self.attempt_count,
            status,
            last_error: self.last_error,
            conflict_files,
            queue_order: self.queue_order as u64,
        })
    }
}

fn timestamp(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| StoreError::Corrupted(format!("invalid timestamp {}", millis)))
}

fn ensure_session(conn: &Connection, session_id: &str) -> Result<(), StoreError> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM sessions WHERE id = ?", params![session_id], |row| row.get(0))
        .optional()?;
    match found {
        Some(_) => Ok(()),
        None => Err(StoreError::SessionNotFound(session_id.to_string())),
    }
}

fn touch(conn: &Connection, session_id: &str) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE sessions SET updated_at = ? WHERE id = ?",
        params![Utc::now().timestamp_millis(), session_id],
    )?;
    Ok(())
}

fn insert_agent(conn: &Connection, session_id: &str, seq: i64, agent: &Agent) -> Result<(), StoreError> {
    let conflicts = serde_json::to_string(&agent.conflict_files)
        .map_err(|e| StoreError::Database(e.to_string()))?;
    conn.execute(
        r#"
        INSERT INTO agents (
            session_id, agent_id, seq, workspace_path, branch_name, status,
            commit_sha, merged_sha, queue_position, conflict_files, commit_message
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            session_id,
            agent.agent_id,
            seq,
            agent.workspace_path.to_string_lossy(),
            agent.branch_name,
            agent.status.as_str(),
            agent.commit_sha,
            agent.merged_sha,
            agent.queue_position,
            conflicts,
            agent.commit_message,
        ],
    )?;
    Ok(())
}

fn apply_patch(
    tx: &Transaction<'_>,
    session_id: &str,
    agent_id: &str,
    patch: &AgentPatch,
) -> Result<Agent, StoreError> {
    ensure_session(tx, session_id)?;
    let mut agent = load_agent(tx, session_id, agent_id)?.ok_or_else(|| StoreError::AgentNotFound {
        session_id: session_id.to_string(),
        agent_id: agent_id.to_string(),
    })?;

    if let Some(next) = patch.status {
        if !agent.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                agent_id: agent_id.to_string(),
                from: agent.status,
                to: next,
            });
        }
        agent.status = next;
    }
    if let Some(sha) = &patch.commit_sha {
        agent.commit_sha = Some(sha.clone());
    }
    if let Some(sha) = &patch.merged_sha {
        agent.merged_sha = Some(sha.clone());
    }
    if let Some(position) = patch.queue_position {
        agent.queue_position = Some(position);
    }
    if let Some(files) = &patch.conflict_files {
        agent.conflict_files = files.clone();
    }
    if let Some(message) = &patch.commit_message {
        agent.commit_message = Some(message.clone());
    }

    let conflicts = serde_json::to_string(&agent.conflict_files)
        .map_err(|e| StoreError::Database(e.to_string()))?;
    tx.execute(
        r#"
        UPDATE agents SET
            status = ?, commit_sha = ?, merged_sha = ?, queue_position = ?,
            conflict_files = ?, commit_message = ?
        WHERE session_id = ? AND agent_id = ?
        "#,
        params![
            agent.status.as_str(),
            agent.commit_sha,
            agent.merged_sha,
            agent.queue_position,
            conflicts,
            agent.commit_message,
            session_id,
            agent_id,
        ],
    )?;
    Ok(agent)
}

type AgentRow = (String, String, String, String, Option<String>, Option<String>, Option<u32>, String, Option<String>);

fn decode_agent(row: AgentRow) -> Result<Agent, StoreError> {
    let (agent_id, workspace_path, branch_name, status, commit_sha, merged_sha, queue_position, conflicts, commit_message) = row;
    let status: AgentStatus = status.parse().map_err(|e: String| {
        error!("Corrupted agent record {}: {}", agent_id, e);
        StoreError::Corrupted(format!("agent {}: {}", agent_id, e))
    })?;
    let conflict_files: Vec<String> = serde_json::from_str(&conflicts)
        .map_err(|e| StoreError::Corrupted(format!("agent {} conflict files: {}", agent_id, e)))?;
    Ok(Agent {
        agent_id,
        workspace_path: PathBuf::from(workspace_path),
        branch_name,
        status,
        commit_sha,
        merged_sha,
        queue_position,
        conflict_files,
        commit_message,
    })
}

const AGENT_COLUMNS: &str = "agent_id, workspace_path, branch_name, status, commit_sha, merged_sha, queue_position, conflict_files, commit_message";

fn read_agent_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn load_agent(conn: &Connection, session_id: &str, agent_id: &str) -> Result<Option<Agent>, StoreError> {
    let sql = format!(
        "SELECT {} FROM agents WHERE session_id = ? AND agent_id = ?",
        AGENT_COLUMNS
    );
    let row = conn
        .query_row(&sql, params![session_id, agent_id], read_agent_row)
        .optional()?;
    row.map(decode_agent).transpose()
}

fn load_session(conn: &Connection, session_id: &str) -> Result<Session, StoreError> {
    let row = conn
        .query_row(
            r#"
            SELECT id, base_branch, target_branch, state, workspace_root,
                   merged_count, conflict_count, pr_url, created_at
            FROM sessions WHERE id = ?
            "#,
            params![session_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, u32>(5)?,
                    row.get::<_, u32>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, i64>(8)?,
                ))
            },
        )
        .optional()?
        .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;

    let (id, base_branch, target_branch, state, workspace_root, merged_count, conflict_count, pr_url, created_at) = row;
    let state: SessionState = state.parse().map_err(|e: String| {
        error!("Corrupted session record {}: {}", id, e);
        StoreError::Corrupted(format!("session {}: {}", id, e))
    })?;

    let sql = format!(
        "SELECT {} FROM agents WHERE session_id = ? ORDER BY seq ASC",
        AGENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![session_id], read_agent_row)?;
    let mut agents = Vec::new();
    for row in rows {
        agents.push(decode_agent(row?)?);
    }

    Ok(Session {
        session_id: id,
        base_branch,
        target_branch,
        state,
        created_at: timestamp(created_at)?,
        workspace_root: PathBuf::from(workspace_root),
        agents,
        merged_count,
        conflict_count,
        pr_url,
    })
}
