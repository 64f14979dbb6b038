// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Coordinator IPC.
//!
//! The coordinator daemon serves its [`CoordinatorHandle`](crate::queue::CoordinatorHandle)
//! on a Unix domain socket; completion clients and the CLI talk to it with
//! [`IpcClient`].
//!
//! ```text
//! ┌──────────────────┐               ┌──────────────────┐
//! │   fork-join CLI  │               │   Coordinator    │
//! │   / agents       │    Unix       │                  │
//! │  ┌────────────┐  │   socket      │  ┌────────────┐  │
//! │  │ IpcClient  │──┼───────────────┼─►│ IpcServer  │  │
//! │  └────────────┘  │               │  └─────┬──────┘  │
//! └──────────────────┘               │        ▼ mpsc    │
//!                                    │   queue actor    │
//!                                    └──────────────────┘
//! ```
//!
//! # Protocol
//!
//! Newline-delimited JSON. Each request is a JSON object tagged by `type`;
//! each response is `{"status":"OK"|"ERROR", ...}` with optional `position`,
//! `reason`, `code`, and `data`.
//!
//! - `REGISTER` - liveness check
//! - `ENQUEUE` - submit a branch, answers the 1-based position
//! - `DEQUEUE` - cancel an agent
//! - `RETRY` - requeue a failed merge
//! - `STATUS` - queue length, pending, processing, agents
//! - `CONFLICTS` - files that stopped a merge
//! - `WAIT` - block until a job is terminal
//! - `UPDATE_AGENT` - completion progress
//! - `SESSION_END` - finalize a session
//! - `SHUTDOWN` - stop the daemon

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transport;

pub use client::IpcClient;
pub use error::{IpcError, IpcResult};
pub use protocol::{decode, decode_messages, encode, Request, Response, ResponseStatus};
pub use server::{dispatch, IpcServer};
