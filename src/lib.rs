// src/lib.rs
//! AgentHub Orchestration Engine Library
//!
//! This library provides the lifecycle orchestration core of an agent
//! marketplace: per-customer agent instances backed by sandboxed compute
//! units, driven over the Agent Communication Protocol.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **catalog**: Agent definitions, billing models, usage statistics
//! - **runtime**: Compute-unit allocation, port pool, process runtime
//! - **protocol**: ACP wire messages, transports, stateful sessions
//! - **orchestrator**: Instance state machine, registry, monitor, billing
//! - **utils**: Configuration and error types

// Public module exports
pub mod catalog;
pub mod orchestrator;
pub mod protocol;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use catalog::{Agent, BillingModel, CatalogStore, InMemoryCatalog};
pub use orchestrator::{AgentInstance, LifecycleState, Orchestrator};
pub use utils::config::EngineConfig;
pub use utils::errors::{HubError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Engine build information
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_build_info() {
        let info = BuildInfo::current();
        assert!(!info.version.is_empty());
    }
}
