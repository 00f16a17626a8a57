//! Error types for the orchestration core
//!
//! One crate-wide error enum plus a `Result` alias. Operational errors
//! (capacity, ownership, lifecycle) are distinct variants so callers can
//! branch without string matching; transient runtime/protocol failures
//! carry enough detail for the monitor loop's retry policy.

use crate::orchestrator::instance::LifecycleState;
use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, HubError>;

/// Errors surfaced by the orchestration core
#[derive(Debug, Error)]
pub enum HubError {
    /// Agent has reached its declared max_instances
    #[error("agent {agent_id} is at capacity ({current}/{max} instances)")]
    CapacityExceeded {
        agent_id: String,
        current: usize,
        max: usize,
    },

    /// Instance exists but belongs to a different customer
    #[error("instance {0} is not owned by the caller")]
    NotOwner(String),

    /// Instance is in the wrong lifecycle state for the requested operation
    #[error("instance {instance_id} is {state:?}, cannot {operation}")]
    InstanceUnavailable {
        instance_id: String,
        state: LifecycleState,
        operation: &'static str,
    },

    /// The runtime could not reserve a compute unit or address
    #[error("resource allocation failed: {0}")]
    AllocationFailed(String),

    /// The compute unit did not report liveness within the startup deadline
    #[error("compute unit failed to start within {0:?}")]
    StartupTimeout(std::time::Duration),

    /// ACP handshake was rejected or timed out
    #[error("ACP handshake failed: {0}")]
    HandshakeFailed(String),

    /// Runtime unreachable for a read-only operation (health signal, not fatal)
    #[error("resource handle unreachable: {0}")]
    HandleUnreachable(String),

    /// Task did not complete within the caller-supplied timeout
    #[error("task timed out after {0:?}")]
    TaskTimeout(std::time::Duration),

    /// Pending request resolved because the instance left Running
    #[error("task cancelled: {0}")]
    Cancelled(String),

    /// Unknown instance or agent identifier
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// Endpoint not declared by the agent's catalog entry
    #[error("agent {agent_id} does not declare endpoint {endpoint}")]
    UnknownEndpoint { agent_id: String, endpoint: String },

    /// Per-session in-flight task limit reached
    #[error("instance {instance_id} has {inflight} tasks in flight (limit {limit})")]
    Busy {
        instance_id: String,
        inflight: usize,
        limit: usize,
    },

    /// Transport-level failure (framing, connect, I/O)
    #[error("transport error: {0}")]
    Transport(String),

    /// Configuration load or validation failure
    #[error("configuration error: {0}")]
    Config(String),
}

impl HubError {
    /// Transient failures are absorbed by the monitor loop as health
    /// signals and retried; everything else is surfaced synchronously.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HubError::HandleUnreachable(_) | HubError::Transport(_)
        )
    }

    pub fn unavailable(
        instance_id: impl Into<String>,
        state: LifecycleState,
        operation: &'static str,
    ) -> Self {
        HubError::InstanceUnavailable {
            instance_id: instance_id.into(),
            state,
            operation,
        }
    }

    pub fn instance_not_found(id: impl Into<String>) -> Self {
        HubError::NotFound {
            kind: "instance",
            id: id.into(),
        }
    }

    pub fn agent_not_found(id: impl Into<String>) -> Self {
        HubError::NotFound {
            kind: "agent",
            id: id.into(),
        }
    }
}

impl From<std::io::Error> for HubError {
    fn from(e: std::io::Error) -> Self {
        HubError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for HubError {
    fn from(e: serde_json::Error) -> Self {
        HubError::Transport(format!("frame codec: {}", e))
    }
}

impl From<config::ConfigError> for HubError {
    fn from(e: config::ConfigError) -> Self {
        HubError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(HubError::HandleUnreachable("daemon down".into()).is_transient());
        assert!(HubError::Transport("broken pipe".into()).is_transient());
        assert!(!HubError::NotOwner("inst_1".into()).is_transient());
        assert!(!HubError::TaskTimeout(std::time::Duration::from_secs(1)).is_transient());
    }

    #[test]
    fn test_display_includes_identifiers() {
        let err = HubError::CapacityExceeded {
            agent_id: "agent_1".into(),
            current: 3,
            max: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("agent_1"));
        assert!(msg.contains("3/3"));
    }
}
