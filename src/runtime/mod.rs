//! Compute-unit runtime layer
//!
//! This module owns everything below the instance state machine:
//!
//! - **handle**: the `ContainerRuntime` seam and `ResourceHandle` type
//! - **process**: local process-backed runtime implementation
//! - **ports**: shared host-port allocation pool
//! - **retry**: bounded-backoff retry applied by runtime callers
//!
//! The orchestrator only ever sees `dyn ContainerRuntime`; no lifecycle
//! logic lives here.

pub mod handle;
pub mod ports;
pub mod process;
pub mod retry;

pub use handle::{ContainerRuntime, HandleStats, ResourceHandle};
pub use ports::PortPool;
pub use process::ProcessRuntime;
pub use retry::{with_retry, RetryPolicy};
