//! Common utilities
//!
//! - **errors**: crate-wide error enum and `Result` alias
//! - **config**: layered engine configuration

pub mod config;
pub mod errors;

pub use config::EngineConfig;
pub use errors::{HubError, Result};
