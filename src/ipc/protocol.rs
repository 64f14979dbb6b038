// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Coordinator wire protocol.
//!
//! Uses newline-delimited JSON: one request line, one response line.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::queue::{EnqueueReceipt, EnqueueRequest, QueueError};
use crate::session::AgentStatus;

// ============================================================================
// Requests
// ============================================================================

/// Messages sent from clients to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    /// Liveness check from an agent.
    Register {
        agent_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    /// Submit an agent's branch for merging.
    Enqueue(EnqueueRequest),

    /// Cancel an agent before its merge starts.
    Dequeue {
        agent_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    /// Requeue a failed merge.
    Retry {
        agent_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    /// Queue summary.
    Status,

    /// Files that stopped an agent's merge.
    Conflicts {
        agent_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    /// Block until an agent's job is terminal.
    Wait {
        agent_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },

    /// Progress reported by the completion client.
    UpdateAgent {
        session_id: String,
        agent_id: String,
        status: AgentStatus,
    },

    /// Finalize a session.
    SessionEnd {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    /// Stop the coordinator.
    Shutdown,
}

impl Request {
    /// Wire name of the request type.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Register { .. } => "REGISTER",
            Self::Enqueue(_) => "ENQUEUE",
            Self::Dequeue { .. } => "DEQUEUE",
            Self::Retry { .. } => "RETRY",
            Self::Status => "STATUS",
            Self::Conflicts { .. } => "CONFLICTS",
            Self::Wait { .. } => "WAIT",
            Self::UpdateAgent { .. } => "UPDATE_AGENT",
            Self::SessionEnd { .. } => "SESSION_END",
            Self::Shutdown => "SHUTDOWN",
        }
    }

    /// Whether the server may hold the request open for a long time.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::Wait { .. } | Self::SessionEnd { .. })
    }
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Reply to any request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            status: ResponseStatus::Ok,
            position: None,
            reason: None,
            code: None,
            data: None,
        }
    }

    /// Success carrying a serialized payload.
    pub fn with_data<T: Serialize>(data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Self {
                data: Some(value),
                ..Self::ok()
            },
            Err(e) => Self::error(ErrorKind::Internal, format!("encode failed: {}", e)),
        }
    }

    /// ENQUEUE and RETRY reply: `{"status":"OK","position":N}` plus the receipt.
    pub fn receipt(receipt: &EnqueueReceipt) -> Self {
        Self {
            position: Some(receipt.position()),
            ..Self::with_data(receipt)
        }
    }

    pub fn error(code: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            position: None,
            reason: Some(reason.into()),
            code: Some(code),
            data: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    /// Decode the payload.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.data
            .as_ref()
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
    }
}

impl From<&QueueError> for Response {
    fn from(err: &QueueError) -> Self {
        Self::error(err.kind(), err.to_string())
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode a message as one NDJSON line.
pub fn encode<T: Serialize>(msg: &T) -> Result<String, serde_json::Error> {
    let mut json = serde_json::to_string(msg)?;
    json.push('\n');
    Ok(json)
}

/// Decode a message from a JSON line.
pub fn decode<'a, T: Deserialize<'a>>(json: &'a str) -> Result<T, serde_json::Error> {
    serde_json::from_str(json.trim())
}

/// Parse multiple newline-delimited messages from a buffer.
pub fn decode_messages<'a, T: Deserialize<'a>>(buffer: &'a str) -> Vec<Result<T, serde_json::Error>> {
    buffer
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line.trim()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn enqueue_request() -> EnqueueRequest {
        EnqueueRequest {
            agent_id: "a1".to_string(),
            session_id: "s1".to_string(),
            branch: "agent/s1/a1".to_string(),
            workspace: PathBuf::from("/tmp/fj-a1"),
            target_branch: "feature".to_string(),
            commit_sha: None,
            commit_message: None,
        }
    }

    #[test]
    fn test_enqueue_wire_format() {
        let json = encode(&Request::Enqueue(enqueue_request())).unwrap();
        assert!(json.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "ENQUEUE");
        assert_eq!(value["agent_id"], "a1");
        assert_eq!(value["workspace"], "/tmp/fj-a1");
        assert!(value.get("commit_sha").is_none());
    }

    #[test]
    fn test_decode_minimal_enqueue() {
        let line = r#"{"type":"ENQUEUE","agent_id":"a1","session_id":"s1","branch":"agent/s1/a1","workspace":"/tmp/fj-a1","target_branch":"feature"}"#;
        let request: Request = decode(line).unwrap();
        assert_eq!(request, Request::Enqueue(enqueue_request()));
        assert_eq!(request.name(), "ENQUEUE");
    }

    #[test]
    fn test_dequeue_without_session() {
        let request: Request = decode(r#"{"type":"DEQUEUE","agent_id":"a2"}"#).unwrap();
        assert_eq!(
            request,
            Request::Dequeue {
                agent_id: "a2".to_string(),
                session_id: None
            }
        );
    }

    #[test]
    fn test_multi_word_tags() {
        let request = Request::UpdateAgent {
            session_id: "s1".to_string(),
            agent_id: "a1".to_string(),
            status: AgentStatus::ChangesPending,
        };
        let json = encode(&request).unwrap();
        assert!(json.contains(r#""type":"UPDATE_AGENT""#));
        assert!(json.contains(r#""status":"CHANGES_PENDING""#));

        let end: Request = decode(r#"{"type":"SESSION_END"}"#).unwrap();
        assert_eq!(end, Request::SessionEnd { session_id: None });
        assert!(end.is_blocking());
    }

    #[test]
    fn test_unknown_type_fails() {
        assert!(decode::<Request>(r#"{"type":"MERGE_NOW"}"#).is_err());
    }

    #[test]
    fn test_ok_response_shape() {
        let response = Response::receipt(&EnqueueReceipt::Queued { position: 2 });
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["status"], "OK");
        assert_eq!(value["position"], 2);
        assert!(value.get("reason").is_none());

        let receipt: EnqueueReceipt = response.data_as().unwrap().unwrap();
        assert_eq!(receipt, EnqueueReceipt::Queued { position: 2 });
    }

    #[test]
    fn test_error_response_shape() {
        let response = Response::from(&QueueError::QueueFull(100));
        let json = encode(&response).unwrap();
        assert!(json.contains(r#""status":"ERROR""#));
        assert!(json.contains(r#""code":"ENQUEUE_REJECTED""#));
        assert!(!response.is_ok());
    }

    #[test]
    fn test_decode_messages() {
        let buffer = "{\"type\":\"STATUS\"}\n\n{\"type\":\"SHUTDOWN\"}\nnot json\n";
        let messages: Vec<Result<Request, _>> = decode_messages(buffer);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].as_ref().unwrap(), &Request::Status);
        assert_eq!(messages[1].as_ref().unwrap(), &Request::Shutdown);
        assert!(messages[2].is_err());
    }

    #[test]
    fn test_wire_snapshots() {
        let wait = Request::Wait {
            agent_id: "a1".to_string(),
            session_id: Some("s1".to_string()),
            timeout_ms: Some(5000),
        };
        insta::assert_snapshot!(
            encode(&wait).unwrap().trim_end(),
            @r#"{"type":"WAIT","agent_id":"a1","session_id":"s1","timeout_ms":5000}"#
        );

        let update = Request::UpdateAgent {
            session_id: "s1".to_string(),
            agent_id: "a1".to_string(),
            status: AgentStatus::ChangesPending,
        };
        insta::assert_snapshot!(
            encode(&update).unwrap().trim_end(),
            @r#"{"type":"UPDATE_AGENT","session_id":"s1","agent_id":"a1","status":"CHANGES_PENDING"}"#
        );

        let conflict = Response::error(ErrorKind::MergeConflict, "merge conflict in src/lib.rs");
        insta::assert_snapshot!(
            encode(&conflict).unwrap().trim_end(),
            @r#"{"status":"ERROR","reason":"merge conflict in src/lib.rs","code":"MERGE_CONFLICT"}"#
        );
    }
}
