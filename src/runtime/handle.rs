//! Resource handle abstraction over the container runtime
//!
//! A `ResourceHandle` is a capability-typed reference to one isolated
//! compute unit. The `ContainerRuntime` seam keeps the orchestrator
//! independent of the concrete runtime (a container daemon in production,
//! a local process or in-memory fake in tests).
//!
//! All operations are idempotent with respect to the observable end state
//! and are never retried internally; retry policy lives with the caller
//! (see `runtime::retry`).

use crate::utils::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Reference to one isolated compute unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHandle {
    /// Runtime-unique identifier for the unit
    pub handle_id: String,

    /// Image the unit was created from
    pub image_ref: String,

    /// Host port reserved for the unit's worker endpoint
    pub port: u16,
}

impl ResourceHandle {
    /// Address the worker is expected to listen on once started
    pub fn address(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.port))
    }
}

/// Point-in-time resource usage of a compute unit
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HandleStats {
    /// Cumulative CPU time consumed, in seconds
    pub cpu_seconds: f64,

    /// Current resident memory in bytes
    pub memory_bytes: u64,

    /// Cumulative network bytes (rx + tx)
    pub network_bytes: u64,
}

/// Container runtime seam
///
/// `stats` and `logs` are read-only best-effort; an unreachable runtime
/// surfaces as `HubError::HandleUnreachable`, which the monitor loop
/// treats as a health signal rather than an instance failure.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Reserve a compute unit and a locally-unique address for it
    async fn allocate(&self, image_ref: &str, env: &[(String, String)]) -> Result<ResourceHandle>;

    /// Begin executing the unit; resolves with the ready address once the
    /// worker reports liveness, or `StartupTimeout` after the deadline
    async fn start(&self, handle: &ResourceHandle) -> Result<SocketAddr>;

    /// Suspend execution without releasing resources
    async fn pause(&self, handle: &ResourceHandle) -> Result<()>;

    /// Resume a paused unit
    async fn unpause(&self, handle: &ResourceHandle) -> Result<()>;

    /// Stop the unit; `remove` must follow during teardown
    async fn stop(&self, handle: &ResourceHandle) -> Result<()>;

    /// Release the address and any ephemeral storage
    async fn remove(&self, handle: &ResourceHandle) -> Result<()>;

    async fn stats(&self, handle: &ResourceHandle) -> Result<HandleStats>;

    async fn logs(&self, handle: &ResourceHandle, tail_lines: usize) -> Result<Vec<String>>;
}
