// src/main.rs
//! AgentHub Orchestration Engine
//!
//! Runs the instance lifecycle core with the local process runtime:
//! creates and supervises agent compute units, speaks ACP to them, and
//! keeps billing and health records current until shutdown.

use agenthub_engine::catalog::InMemoryCatalog;
use agenthub_engine::orchestrator::Orchestrator;
use agenthub_engine::runtime::{PortPool, ProcessRuntime};
use agenthub_engine::utils::config::EngineConfig;
use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(
        "Starting AgentHub Orchestration Engine v{}",
        env!("CARGO_PKG_VERSION")
    );

    // Load configuration
    let config = EngineConfig::load()?;
    info!("Configuration loaded: {:?}", config);

    let pool = Arc::new(PortPool::new(
        config.runtime.port_range_start,
        config.runtime.port_range_len,
    ));
    let runtime = Arc::new(ProcessRuntime::new(
        pool,
        config.startup_timeout(),
        std::time::Duration::from_secs(config.runtime.stop_grace_secs),
    ));
    let catalog = Arc::new(InMemoryCatalog::new());

    let orchestrator = Orchestrator::new(runtime, catalog, config);
    info!("Orchestration core ready");

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal, draining instances...");
    orchestrator.drain().await;
    info!("Engine stopped gracefully");
    Ok(())
}
