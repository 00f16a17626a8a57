//! ACP wire messages
//!
//! One frame shape across both transports:
//! `{type, instance_id, message_id, payload, timestamp}`. The payload is
//! carried as raw JSON on the wire and decoded into the typed shape for
//! its message kind at the protocol boundary, before anything above the
//! session sees it.

use crate::utils::errors::{HubError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

pub const PROTOCOL_VERSION: &str = "1.0";

/// ACP message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Handshake,
    Heartbeat,
    TaskRequest,
    TaskResponse,
    StatusUpdate,
    Error,
    Shutdown,
}

/// Typed payload shapes, one per message kind
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Handshake(HandshakePayload),
    Heartbeat,
    TaskRequest(TaskRequestPayload),
    TaskResponse(TaskResponsePayload),
    StatusUpdate(StatusUpdatePayload),
    Error(ErrorPayload),
    Shutdown(ShutdownPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakePayload {
    pub protocol_version: String,

    /// Set to `ready` in the worker's acknowledgment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequestPayload {
    pub endpoint: String,
    pub parameters: Value,

    /// Caller timeout in seconds, advisory for the worker
    pub timeout: f64,
}

/// Terminal status of a task as reported by the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponsePayload {
    /// message_id of the TaskRequest this answers
    pub message_id: String,
    pub status: TaskStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdatePayload {
    #[serde(default)]
    pub health: Value,

    #[serde(default)]
    pub usage: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownPayload {
    pub reason: String,
}

/// One ACP wire frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcpMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub instance_id: String,
    pub message_id: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl AcpMessage {
    fn new(kind: MessageType, instance_id: &str, payload: Value) -> Self {
        Self {
            kind,
            instance_id: instance_id.to_string(),
            message_id: Ulid::new().to_string(),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn handshake(instance_id: &str) -> Self {
        Self::new(
            MessageType::Handshake,
            instance_id,
            serde_json::json!({ "protocol_version": PROTOCOL_VERSION }),
        )
    }

    pub fn handshake_ack(instance_id: &str) -> Self {
        Self::new(
            MessageType::Handshake,
            instance_id,
            serde_json::json!({ "protocol_version": PROTOCOL_VERSION, "status": "ready" }),
        )
    }

    pub fn heartbeat(instance_id: &str) -> Self {
        Self::new(MessageType::Heartbeat, instance_id, serde_json::json!({}))
    }

    pub fn task_request(instance_id: &str, endpoint: &str, parameters: Value, timeout: f64) -> Self {
        Self::new(
            MessageType::TaskRequest,
            instance_id,
            serde_json::json!({
                "endpoint": endpoint,
                "parameters": parameters,
                "timeout": timeout,
            }),
        )
    }

    pub fn task_response(instance_id: &str, payload: &TaskResponsePayload) -> Self {
        Self::new(
            MessageType::TaskResponse,
            instance_id,
            serde_json::to_value(payload).unwrap_or(Value::Null),
        )
    }

    pub fn shutdown(instance_id: &str, reason: &str) -> Self {
        Self::new(
            MessageType::Shutdown,
            instance_id,
            serde_json::json!({ "reason": reason }),
        )
    }

    /// Decode the raw payload into the typed shape for this kind.
    ///
    /// This is the protocol boundary validation: a frame whose payload
    /// does not match its declared type is rejected here.
    pub fn decode_payload(&self) -> Result<Payload> {
        let invalid = |e: serde_json::Error| {
            HubError::Transport(format!(
                "invalid {:?} payload in message {}: {}",
                self.kind, self.message_id, e
            ))
        };
        Ok(match self.kind {
            MessageType::Handshake => {
                Payload::Handshake(serde_json::from_value(self.payload.clone()).map_err(invalid)?)
            }
            MessageType::Heartbeat => Payload::Heartbeat,
            MessageType::TaskRequest => {
                Payload::TaskRequest(serde_json::from_value(self.payload.clone()).map_err(invalid)?)
            }
            MessageType::TaskResponse => Payload::TaskResponse(
                serde_json::from_value(self.payload.clone()).map_err(invalid)?,
            ),
            MessageType::StatusUpdate => Payload::StatusUpdate(
                serde_json::from_value(self.payload.clone()).map_err(invalid)?,
            ),
            MessageType::Error => {
                Payload::Error(serde_json::from_value(self.payload.clone()).map_err(invalid)?)
            }
            MessageType::Shutdown => {
                Payload::Shutdown(serde_json::from_value(self.payload.clone()).map_err(invalid)?)
            }
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let msg = AcpMessage::task_request("inst_1", "/analyze", serde_json::json!({"q": 1}), 30.0);
        let json: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "task_request");
        assert_eq!(json["instance_id"], "inst_1");
        assert_eq!(json["payload"]["endpoint"], "/analyze");
        assert!(json["message_id"].is_string());
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_handshake_ack_decodes_ready() {
        let ack = AcpMessage::handshake_ack("inst_1");
        match ack.decode_payload().unwrap() {
            Payload::Handshake(p) => {
                assert_eq!(p.status.as_deref(), Some("ready"));
                assert_eq!(p.protocol_version, PROTOCOL_VERSION);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_mismatched_payload_rejected() {
        let mut msg = AcpMessage::heartbeat("inst_1");
        msg.kind = MessageType::TaskResponse; // payload {} lacks required fields
        let err = msg.decode_payload().unwrap_err();
        assert!(matches!(err, HubError::Transport(_)));
    }

    #[test]
    fn test_task_response_correlation_field() {
        let payload = TaskResponsePayload {
            message_id: "req-123".into(),
            status: TaskStatus::Completed,
            result: Some(serde_json::json!({"ok": true})),
            error: None,
        };
        let msg = AcpMessage::task_response("inst_1", &payload);
        match msg.decode_payload().unwrap() {
            Payload::TaskResponse(p) => assert_eq!(p.message_id, "req-123"),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_message_ids_unique() {
        let a = AcpMessage::heartbeat("inst_1");
        let b = AcpMessage::heartbeat("inst_1");
        assert_ne!(a.message_id, b.message_id);
    }
}
