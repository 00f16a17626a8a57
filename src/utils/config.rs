//! Engine configuration
//!
//! Layered load order: built-in defaults, then an optional
//! `config/engine.yaml`, then `AGENTHUB_`-prefixed environment variables
//! (e.g. `AGENTHUB_MONITOR__SAMPLE_INTERVAL_SECS=10`).

use crate::utils::errors::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Compute-unit runtime settings
    pub runtime: RuntimeConfig,

    /// ACP protocol settings
    pub protocol: ProtocolConfig,

    /// Monitor and sweep settings
    pub monitor: MonitorConfig,
}

/// Resource handle / compute-unit settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// First host port handed out by the allocation pool
    pub port_range_start: u16,

    /// Number of ports in the pool
    pub port_range_len: u16,

    /// Startup liveness deadline in seconds
    pub startup_timeout_secs: u64,

    /// Grace period between stop request and forced kill, in seconds
    pub stop_grace_secs: u64,

    /// Retry attempts for runtime operations (allocate/start/stop)
    pub max_retries: u32,

    /// Initial retry backoff in milliseconds (doubles per attempt)
    pub retry_backoff_ms: u64,
}

/// ACP protocol settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Handshake acknowledgment window in seconds
    pub handshake_timeout_secs: u64,

    /// Heartbeat emission interval in seconds
    pub heartbeat_interval_secs: u64,

    /// Window within which a heartbeat reply must arrive, in seconds
    pub heartbeat_timeout_secs: u64,

    /// Maximum outstanding task requests per session
    pub max_inflight_tasks: usize,

    /// Poll interval for the HTTP fallback transport, in milliseconds
    pub poll_interval_ms: u64,
}

/// Monitor/billing loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Per-instance sampler interval in seconds
    pub sample_interval_secs: u64,

    /// Global sweep interval in seconds
    pub sweep_interval_secs: u64,

    /// Deadline for transitional states before the sweep forces them, in seconds
    pub transition_deadline_secs: u64,

    /// Consecutive health failures before an instance is forced to Failed
    pub max_consecutive_errors: u32,

    /// How long Stopped instances remain queryable, in seconds
    pub retention_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig {
                port_range_start: 8100,
                port_range_len: 1000,
                startup_timeout_secs: 30,
                stop_grace_secs: 10,
                max_retries: 3,
                retry_backoff_ms: 200,
            },
            protocol: ProtocolConfig {
                handshake_timeout_secs: 10,
                heartbeat_interval_secs: 30,
                heartbeat_timeout_secs: 120,
                max_inflight_tasks: 32,
                poll_interval_ms: 500,
            },
            monitor: MonitorConfig {
                sample_interval_secs: 30,
                sweep_interval_secs: 60,
                transition_deadline_secs: 120,
                max_consecutive_errors: 3,
                retention_secs: 86_400,
            },
        }
    }
}

impl EngineConfig {
    /// Load configuration from defaults, optional file, and environment
    pub fn load() -> Result<Self> {
        let defaults = config::Config::try_from(&EngineConfig::default())?;

        let cfg = config::Config::builder()
            .add_source(defaults)
            .add_source(config::File::with_name("config/engine").required(false))
            .add_source(
                config::Environment::with_prefix("AGENTHUB")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(cfg.try_deserialize()?)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime.startup_timeout_secs)
    }

    /// Staleness window enforced by the monitor loop
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.protocol.heartbeat_timeout_secs)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.sample_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.sweep_interval_secs)
    }

    pub fn transition_deadline(&self) -> Duration {
        Duration::from_secs(self.monitor.transition_deadline_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.monitor.retention_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.protocol.max_inflight_tasks, 32);
        assert_eq!(cfg.monitor.max_consecutive_errors, 3);
        assert_eq!(cfg.runtime.port_range_start, 8100);
    }

    #[test]
    fn test_duration_accessors() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.heartbeat_timeout(), Duration::from_secs(120));
        assert_eq!(cfg.retention(), Duration::from_secs(86_400));
    }
}
