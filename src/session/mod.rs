// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Fork-join sessions: records, persistence, and lifecycle.
//!
//! A session spans one fork-join task. It is created with a base branch and a
//! target integration branch, holds the roster of agents in spawn order, and
//! is never deleted implicitly so it can be inspected after the fact.

mod service;
mod storage;
mod types;

pub use service::{SessionError, SessionService, StartOptions};
pub use storage::{SessionStore, StoreError, DB_FILE, SCHEMA_VERSION};
pub use types::{
    generate_session_id, is_valid_agent_id, Agent, AgentPatch, AgentStatus, Session, SessionState,
};
