//! Agent instance data model
//!
//! `AgentInstance` is the unit the core owns exclusively. All mutation
//! goes through the state machine's transition function or the monitor
//! loop's read-modify-write, both under the instance's serialization
//! token.

use crate::catalog::BillingModel;
use crate::protocol::TransportKind;
use crate::runtime::ResourceHandle;
use crate::utils::errors::{HubError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::info;

/// Lifecycle states; `Stopped` and `Failed` are terminal for normal
/// operation (`Failed` exits only through cleanup to `Stopped`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    Created,
    Starting,
    Running,
    Pausing,
    Paused,
    Resuming,
    Stopping,
    Stopped,
    Failed,
}

impl LifecycleState {
    /// Legal edges of the transition graph
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Created, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Running, Pausing)
                | (Running, Stopping)
                | (Running, Failed)
                | (Pausing, Paused)
                | (Pausing, Failed)
                | (Paused, Resuming)
                | (Paused, Stopping)
                | (Resuming, Running)
                | (Resuming, Failed)
                | (Stopping, Stopped)
                | (Failed, Stopped)
        )
    }

    /// States the global sweep watches for stuck instances
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            LifecycleState::Starting
                | LifecycleState::Pausing
                | LifecycleState::Resuming
                | LifecycleState::Stopping
        )
    }

    /// States that count against an agent's capacity
    pub fn is_live(self) -> bool {
        !matches!(self, LifecycleState::Stopped | LifecycleState::Failed)
    }
}

/// Cumulative resource usage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_seconds: f64,
    pub memory_peak_bytes: u64,
    pub network_bytes: u64,
    pub task_count: u64,

    /// Wall-clock time spent Running (paused intervals excluded)
    #[serde(with = "duration_secs")]
    pub uptime: Duration,

    pub last_sampled: Option<DateTime<Utc>>,
}

/// Health as observed by the monitor loop
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthStatus {
    pub consecutive_errors: u32,
    pub last_error: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Billing record; the model snapshot is frozen at creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingInfo {
    pub accrued_cost: f64,
    pub model: BillingModel,
    pub last_billed: Option<DateTime<Utc>>,
    pub finalized: bool,
}

impl BillingInfo {
    pub fn new(model: BillingModel) -> Self {
        Self {
            accrued_cost: 0.0,
            model,
            last_billed: None,
            finalized: false,
        }
    }
}

/// Protocol session summary kept on the instance record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub session_id: String,
    pub transport: TransportKind,
}

/// One customer-specific, independently billed deployment of an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInstance {
    pub instance_id: String,
    pub agent_id: String,
    pub customer_id: String,

    pub lifecycle_state: LifecycleState,

    /// Human-readable reason for the last forced or failed transition
    pub state_reason: Option<String>,

    /// Reference to the backing compute unit; None until Starting completes
    pub resource_handle: Option<ResourceHandle>,

    /// Protocol session summary; None while not Running
    pub connection: Option<ConnectionInfo>,

    pub usage: ResourceUsage,
    pub billing: BillingInfo,
    pub health: HealthStatus,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,

    /// When the current state was entered (sweep deadline bookkeeping)
    pub state_changed_at: DateTime<Utc>,

    /// Monotonic cursor for the current Running span; Some iff Running
    #[serde(skip)]
    pub active_since: Option<Instant>,

    /// Monotonic mirror of state_changed_at
    #[serde(skip, default = "Instant::now")]
    pub state_changed_mono: Instant,
}

impl AgentInstance {
    pub fn new(instance_id: &str, agent_id: &str, customer_id: &str, model: BillingModel) -> Self {
        let now = Utc::now();
        Self {
            instance_id: instance_id.to_string(),
            agent_id: agent_id.to_string(),
            customer_id: customer_id.to_string(),
            lifecycle_state: LifecycleState::Created,
            state_reason: None,
            resource_handle: None,
            connection: None,
            usage: ResourceUsage::default(),
            billing: BillingInfo::new(model),
            health: HealthStatus::default(),
            created_at: now,
            started_at: None,
            paused_at: None,
            stopped_at: None,
            state_changed_at: now,
            active_since: None,
            state_changed_mono: Instant::now(),
        }
    }

    /// Apply one transition, rejecting edges outside the graph.
    pub fn transition(&mut self, next: LifecycleState) -> Result<()> {
        let current = self.lifecycle_state;
        if !current.can_transition_to(next) {
            return Err(HubError::unavailable(
                self.instance_id.clone(),
                current,
                "transition",
            ));
        }

        info!(
            instance_id = %self.instance_id,
            from = ?current,
            to = ?next,
            "lifecycle transition"
        );

        let now = Utc::now();
        match next {
            LifecycleState::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(now);
                }
                self.paused_at = None;
                self.active_since = Some(Instant::now());
            }
            LifecycleState::Paused => {
                self.paused_at = Some(now);
            }
            LifecycleState::Stopped | LifecycleState::Failed => {
                self.stopped_at = Some(now);
            }
            _ => {}
        }
        if current == LifecycleState::Running {
            // fold_active_time must have been called by the state machine
            // before leaving Running; clear the cursor regardless
            self.active_since = None;
        }

        self.lifecycle_state = next;
        self.state_changed_at = now;
        self.state_changed_mono = Instant::now();
        Ok(())
    }

    /// Time the instance has been in its current state
    pub fn time_in_state(&self) -> Duration {
        self.state_changed_mono.elapsed()
    }

    pub fn is_owned_by(&self, customer_id: &str) -> bool {
        self.customer_id == customer_id
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> AgentInstance {
        AgentInstance::new(
            "inst_1",
            "agent_1",
            "cust_1",
            BillingModel::PerMinute { rate: 0.5 },
        )
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut inst = instance();
        for next in [
            LifecycleState::Starting,
            LifecycleState::Running,
            LifecycleState::Pausing,
            LifecycleState::Paused,
            LifecycleState::Resuming,
            LifecycleState::Running,
            LifecycleState::Stopping,
            LifecycleState::Stopped,
        ] {
            inst.transition(next).unwrap();
            assert_eq!(inst.lifecycle_state, next);
        }
        assert!(inst.started_at.is_some());
        assert!(inst.stopped_at.is_some());
    }

    #[test]
    fn test_illegal_edge_rejected() {
        let mut inst = instance();
        inst.transition(LifecycleState::Starting).unwrap();
        inst.transition(LifecycleState::Running).unwrap();
        inst.transition(LifecycleState::Pausing).unwrap();
        inst.transition(LifecycleState::Paused).unwrap();

        // Paused -> Running must pass through Resuming
        let err = inst.transition(LifecycleState::Running).unwrap_err();
        assert!(matches!(err, HubError::InstanceUnavailable { .. }));
        assert_eq!(inst.lifecycle_state, LifecycleState::Paused);
    }

    #[test]
    fn test_failed_only_exits_to_stopped() {
        let mut inst = instance();
        inst.transition(LifecycleState::Starting).unwrap();
        inst.transition(LifecycleState::Failed).unwrap();

        assert!(inst
            .transition(LifecycleState::Running)
            .is_err());
        inst.transition(LifecycleState::Stopped).unwrap();
    }

    #[test]
    fn test_running_sets_cursor() {
        let mut inst = instance();
        inst.transition(LifecycleState::Starting).unwrap();
        inst.transition(LifecycleState::Running).unwrap();
        assert!(inst.active_since.is_some());

        inst.transition(LifecycleState::Pausing).unwrap();
        assert!(inst.active_since.is_none());
    }

    #[test]
    fn test_live_states() {
        assert!(LifecycleState::Running.is_live());
        assert!(LifecycleState::Paused.is_live());
        assert!(LifecycleState::Starting.is_live());
        assert!(!LifecycleState::Stopped.is_live());
        assert!(!LifecycleState::Failed.is_live());
    }
}
