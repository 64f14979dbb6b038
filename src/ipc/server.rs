// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! IPC server for the coordinator.
//!
//! Listens on the coordinator socket and answers each request line by
//! forwarding it to the [`CoordinatorHandle`]. Every connection gets its own
//! task, so a blocking WAIT never holds up other clients.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::error::ErrorKind;
use crate::queue::{CoordinatorHandle, QueueError};

use super::error::IpcError;
use super::protocol::{decode, encode, Request, Response};
use super::transport::{self, IpcListener, IpcStream};

/// Default bound on a WAIT that names no timeout.
const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(600);

/// IPC server in front of a running coordinator.
pub struct IpcServer {
    /// Path to the IPC endpoint.
    socket_path: PathBuf,
    /// Listener (set after start).
    listener: Option<IpcListener>,
    handle: CoordinatorHandle,
    wait_timeout: Duration,
}

impl IpcServer {
    pub fn new(socket_path: impl AsRef<Path>, handle: CoordinatorHandle) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            listener: None,
            handle,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }

    /// Bound applied to WAIT requests without `timeout_ms`.
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket.
    pub async fn start(&mut self) -> Result<(), IpcError> {
        let listener = transport::bind(&self.socket_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                IpcError::AlreadyRunning(self.socket_path.clone())
            } else {
                IpcError::BindFailed(format!("{}: {}", self.socket_path.display(), e))
            }
        })?;
        info!("IPC server listening on {:?}", self.socket_path);
        self.listener = Some(listener);
        Ok(())
    }

    /// Accept connections until `shutdown` resolves, then remove the socket.
    pub async fn serve<F>(mut self, shutdown: F) -> Result<(), IpcError>
    where
        F: Future<Output = ()>,
    {
        let listener = self.listener.take().ok_or(IpcError::NotStarted)?;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok(stream) => {
                        debug!("New connection accepted");
                        let handle = self.handle.clone();
                        let wait_timeout = self.wait_timeout;
                        tokio::spawn(async move {
                            serve_connection(stream, handle, wait_timeout).await;
                        });
                    }
                    Err(e) => warn!("Failed to accept IPC connection: {}", e),
                },
            }
        }

        drop(listener);
        transport::cleanup(&self.socket_path)
            .map_err(|e| IpcError::from_io_error("cleaning up socket", e))?;
        info!("IPC server stopped");
        Ok(())
    }
}

/// Answer request lines on one connection until the peer hangs up.
async fn serve_connection(stream: IpcStream, handle: CoordinatorHandle, wait_timeout: Duration) {
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if line.trim().is_empty() {
                    continue;
                }
                let response = match decode::<Request>(&line) {
                    Ok(request) => dispatch(&handle, request, wait_timeout).await,
                    Err(e) => {
                        warn!("Invalid IPC request: {}", e);
                        Response::error(ErrorKind::Internal, format!("invalid request: {}", e))
                    }
                };
                let encoded = match encode(&response) {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        warn!("Failed to encode response: {}", e);
                        break;
                    }
                };
                if let Err(e) = writer.write_all(encoded.as_bytes()).await {
                    debug!("Client went away before the response: {}", e);
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Error reading IPC request: {}", e);
                break;
            }
        }
    }
}

/// Execute one request against the coordinator.
pub async fn dispatch(handle: &CoordinatorHandle, request: Request, wait_timeout: Duration) -> Response {
    let name = request.name();
    debug!("IPC {}", name);

    let result: Result<Response, QueueError> = match request {
        Request::Register { agent_id, session_id } => handle.status().await.map(|status| {
            info!(
                "Agent {} registered{}",
                agent_id,
                session_id.map(|s| format!(" for {}", s)).unwrap_or_default()
            );
            Response::with_data(&json!({ "queue_length": status.length }))
        }),
        Request::Enqueue(request) => handle.enqueue(request).await.map(|r| Response::receipt(&r)),
        Request::Dequeue { agent_id, session_id } => handle
            .dequeue(&agent_id, session_id.as_deref())
            .await
            .map(|outcome| Response::with_data(&json!({ "outcome": outcome }))),
        Request::Retry { agent_id, session_id } => handle
            .retry(&agent_id, session_id.as_deref())
            .await
            .map(|r| Response::receipt(&r)),
        Request::Status => handle.status().await.map(|s| Response::with_data(&s)),
        Request::Conflicts { agent_id, session_id } => handle
            .conflicts(&agent_id, session_id.as_deref())
            .await
            .map(|files| Response::with_data(&json!({ "files": files }))),
        Request::Wait {
            agent_id,
            session_id,
            timeout_ms,
        } => {
            let timeout = timeout_ms.map(Duration::from_millis).unwrap_or(wait_timeout);
            handle
                .wait(&agent_id, session_id.as_deref(), timeout)
                .await
                .map(|snapshot| Response::with_data(&snapshot))
        }
        Request::UpdateAgent {
            session_id,
            agent_id,
            status,
        } => handle
            .update_agent(&session_id, &agent_id, status)
            .await
            .map(|_| Response::ok()),
        Request::SessionEnd { session_id } => handle
            .finalize(session_id.as_deref())
            .await
            .map(|report| Response::with_data(&report)),
        Request::Shutdown => handle.shutdown().await.map(|_| Response::ok()),
    };

    result.unwrap_or_else(|e| {
        debug!("IPC {} failed: {}", name, e);
        Response::from(&e)
    })
}
