// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! IPC client for agents and the CLI.
//!
//! Each request opens its own connection, writes one line, and reads one
//! line back. Connecting is retried briefly so a client started alongside
//! the daemon does not race its bind; after that the coordinator is
//! reported unavailable.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::finalize::FinalizeReport;
use crate::queue::{DequeueOutcome, EnqueueReceipt, EnqueueRequest, JobSnapshot, QueueStatus};
use crate::session::AgentStatus;

use super::error::IpcError;
use super::protocol::{decode, encode, Request, Response};
use super::transport::{self, IpcStream};

const CONNECT_RETRY_ATTEMPTS: usize = 10;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);
/// Server-side bound on a WAIT without its own timeout.
const DEFAULT_WAIT: Duration = Duration::from_secs(600);
/// Extra time given to blocking requests beyond their own bound.
const BLOCKING_GRACE: Duration = Duration::from_secs(5);
const FINALIZE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Deserialize)]
struct OutcomeData {
    outcome: DequeueOutcome,
}

#[derive(Deserialize)]
struct FilesData {
    files: Vec<String>,
}

/// Client for the coordinator socket.
#[derive(Debug, Clone)]
pub struct IpcClient {
    socket_path: PathBuf,
    connect_timeout: Duration,
    retry_attempts: usize,
}

impl IpcClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            connect_timeout: CONNECT_TIMEOUT,
            retry_attempts: CONNECT_RETRY_ATTEMPTS,
        }
    }

    /// Per-attempt connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Connect attempts before giving up; at least one is always made.
    pub fn with_retries(mut self, attempts: usize) -> Self {
        self.retry_attempts = attempts.max(1);
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn connect(&self) -> Result<IpcStream, IpcError> {
        let mut last_error: Option<String> = None;

        for attempt in 0..self.retry_attempts {
            match tokio::time::timeout(self.connect_timeout, transport::connect(&self.socket_path)).await {
                Ok(Ok(conn)) => return Ok(conn),
                Ok(Err(err)) => {
                    last_error = Some(err.to_string());
                }
                Err(_) => {
                    last_error = Some("connect timeout".to_string());
                }
            }

            if attempt + 1 < self.retry_attempts {
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            }
        }

        Err(IpcError::Unavailable {
            path: self.socket_path.clone(),
            reason: last_error.unwrap_or_else(|| "failed to connect".to_string()),
        })
    }

    /// Send one request and return the raw response, error or not.
    pub async fn send(&self, request: &Request) -> Result<Response, IpcError> {
        let stream = self.connect().await?;
        let (read_half, mut writer) = tokio::io::split(stream);

        let encoded = encode(request).map_err(|e| IpcError::InvalidMessage(format!("encode failed: {}", e)))?;
        writer
            .write_all(encoded.as_bytes())
            .await
            .map_err(|e| IpcError::from_io_error("sending request", e))?;
        writer
            .flush()
            .await
            .map_err(|e| IpcError::from_io_error("flushing writer", e))?;

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        let read = tokio::time::timeout(response_deadline(request), reader.read_line(&mut line))
            .await
            .map_err(|_| IpcError::Timeout)?
            .map_err(|e| IpcError::from_io_error("reading response", e))?;
        if read == 0 {
            return Err(IpcError::ConnectionClosed);
        }

        debug!("IPC {} answered", request.name());
        decode(&line).map_err(|e| IpcError::InvalidMessage(format!("response decode failed: {}", e)))
    }

    /// Send a request, turning an ERROR response into [`IpcError::Remote`].
    async fn call(&self, request: &Request) -> Result<Response, IpcError> {
        let response = self.send(request).await?;
        if response.is_ok() {
            Ok(response)
        } else {
            Err(IpcError::Remote {
                code: response.code,
                reason: response.reason.unwrap_or_else(|| "request failed".to_string()),
            })
        }
    }

    /// Whether a coordinator answers right now. Does not retry.
    pub async fn ping(&self) -> bool {
        self.clone().with_retries(1).send(&Request::Status).await.is_ok()
    }

    pub async fn register(&self, agent_id: &str, session_id: Option<&str>) -> Result<(), IpcError> {
        self.call(&Request::Register {
            agent_id: agent_id.to_string(),
            session_id: session_id.map(str::to_string),
        })
        .await
        .map(|_| ())
    }

    pub async fn enqueue(&self, request: &EnqueueRequest) -> Result<EnqueueReceipt, IpcError> {
        let response = self.call(&Request::Enqueue(request.clone())).await?;
        receipt_from(&response)
    }

    pub async fn dequeue(&self, agent_id: &str, session_id: Option<&str>) -> Result<DequeueOutcome, IpcError> {
        let response = self
            .call(&Request::Dequeue {
                agent_id: agent_id.to_string(),
                session_id: session_id.map(str::to_string),
            })
            .await?;
        Ok(payload::<OutcomeData>(&response)?.outcome)
    }

    pub async fn retry(&self, agent_id: &str, session_id: Option<&str>) -> Result<EnqueueReceipt, IpcError> {
        let response = self
            .call(&Request::Retry {
                agent_id: agent_id.to_string(),
                session_id: session_id.map(str::to_string),
            })
            .await?;
        receipt_from(&response)
    }

    pub async fn status(&self) -> Result<QueueStatus, IpcError> {
        let response = self.call(&Request::Status).await?;
        payload(&response)
    }

    pub async fn conflicts(&self, agent_id: &str, session_id: Option<&str>) -> Result<Vec<String>, IpcError> {
        let response = self
            .call(&Request::Conflicts {
                agent_id: agent_id.to_string(),
                session_id: session_id.map(str::to_string),
            })
            .await?;
        Ok(payload::<FilesData>(&response)?.files)
    }

    /// Block until the agent's job is terminal or `timeout` passes.
    pub async fn wait(
        &self,
        agent_id: &str,
        session_id: Option<&str>,
        timeout: Duration,
    ) -> Result<JobSnapshot, IpcError> {
        let response = self
            .call(&Request::Wait {
                agent_id: agent_id.to_string(),
                session_id: session_id.map(str::to_string),
                timeout_ms: Some(timeout.as_millis() as u64),
            })
            .await?;
        payload(&response)
    }

    pub async fn update_agent(&self, session_id: &str, agent_id: &str, status: AgentStatus) -> Result<(), IpcError> {
        self.call(&Request::UpdateAgent {
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            status,
        })
        .await
        .map(|_| ())
    }

    /// Ask the coordinator to finalize a session and wait for the report.
    pub async fn session_end(&self, session_id: Option<&str>) -> Result<FinalizeReport, IpcError> {
        let response = self
            .call(&Request::SessionEnd {
                session_id: session_id.map(str::to_string),
            })
            .await?;
        payload(&response)
    }

    pub async fn shutdown(&self) -> Result<(), IpcError> {
        self.call(&Request::Shutdown).await.map(|_| ())
    }
}

/// How long to wait for the response line.
fn response_deadline(request: &Request) -> Duration {
    match request {
        Request::Wait { timeout_ms, .. } => {
            timeout_ms.map(Duration::from_millis).unwrap_or(DEFAULT_WAIT) + BLOCKING_GRACE
        }
        Request::SessionEnd { .. } => FINALIZE_TIMEOUT,
        _ => RESPONSE_TIMEOUT,
    }
}

fn payload<T: DeserializeOwned>(response: &Response) -> Result<T, IpcError> {
    response
        .data_as()
        .map_err(|e| IpcError::InvalidMessage(format!("bad payload: {}", e)))?
        .ok_or_else(|| IpcError::InvalidMessage("response has no payload".to_string()))
}

fn receipt_from(response: &Response) -> Result<EnqueueReceipt, IpcError> {
    match response.data_as::<EnqueueReceipt>() {
        Ok(Some(receipt)) => Ok(receipt),
        Ok(None) => Ok(EnqueueReceipt::Queued {
            position: response.position.unwrap_or(0),
        }),
        Err(e) => Err(IpcError::InvalidMessage(format!("bad receipt: {}", e))),
    }
}
