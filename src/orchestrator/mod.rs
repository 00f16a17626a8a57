//! Instance lifecycle orchestration core
//!
//! The `Orchestrator` is the single entry point for everything callers
//! do with instances: create, execute, pause, resume, terminate, query.
//! It owns the registry, the shared lifecycle dependencies, and the
//! global sweep task. Ownership is enforced here, at the boundary, so
//! the inner layers never see another customer's instance.

pub mod billing;
pub mod instance;
pub mod lifecycle;
pub mod monitor;
pub mod registry;

pub use instance::{AgentInstance, BillingInfo, HealthStatus, LifecycleState, ResourceUsage};
pub use lifecycle::LifecycleDeps;
pub use registry::{InstanceRegistry, ManagedInstance};

use crate::catalog::CatalogStore;
use crate::protocol::TaskOutcome;
use crate::runtime::ContainerRuntime;
use crate::utils::config::EngineConfig;
use crate::utils::errors::{HubError, Result};
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;
use ulid::Ulid;

/// Per-customer aggregate view for the dashboard endpoint
#[derive(Debug, Clone, Serialize)]
pub struct DashboardSummary {
    pub customer_id: String,
    pub total_instances: usize,
    pub by_state: BTreeMap<String, usize>,
    pub total_accrued_cost: f64,
    pub total_tasks: u64,
}

/// Facade over the lifecycle state machine, registry, and monitor
pub struct Orchestrator {
    registry: Arc<InstanceRegistry>,
    deps: Arc<LifecycleDeps>,
    sweep: SyncMutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        catalog: Arc<dyn CatalogStore>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let registry = Arc::new(InstanceRegistry::new());
        let deps = Arc::new(LifecycleDeps {
            runtime,
            catalog,
            config,
        });
        let sweep = monitor::spawn_sweep(registry.clone(), deps.clone());
        Arc::new(Self {
            registry,
            deps,
            sweep: SyncMutex::new(Some(sweep)),
        })
    }

    /// Create an instance of `agent_id` for `customer_id` and drive it
    /// to Running before returning its id.
    ///
    /// On a startup failure the record stays registered in Failed, so
    /// the caller can inspect the reason before it ages out.
    pub async fn create_instance(&self, customer_id: &str, agent_id: &str) -> Result<String> {
        let agent = self.deps.catalog.get_agent(agent_id).await?;

        let instance_id = format!("inst_{}", Ulid::new().to_string().to_lowercase());
        let record = AgentInstance::new(&instance_id, agent_id, customer_id, agent.billing.clone());
        let managed = self.registry.admit(record, agent.max_instances)?;

        info!(instance_id = %instance_id, agent_id, customer_id, "instance admitted");
        lifecycle::start_instance(&managed, &self.deps, &agent).await?;
        Ok(instance_id)
    }

    /// Snapshot of one owned instance
    pub fn get_instance(&self, customer_id: &str, instance_id: &str) -> Result<AgentInstance> {
        let managed = self.owned(customer_id, instance_id)?;
        Ok(managed.snapshot())
    }

    /// Snapshots of every instance the customer owns
    pub fn list_instances(&self, customer_id: &str) -> Vec<AgentInstance> {
        self.registry.list_for_customer(customer_id)
    }

    /// Execute one task on a Running owned instance
    pub async fn execute(
        &self,
        customer_id: &str,
        instance_id: &str,
        endpoint: &str,
        parameters: Value,
        timeout: Duration,
    ) -> Result<TaskOutcome> {
        let managed = self.owned(customer_id, instance_id)?;
        let agent_id = managed.snapshot().agent_id;
        let agent = self.deps.catalog.get_agent(&agent_id).await?;
        lifecycle::execute(&managed, &self.deps, &agent, endpoint, parameters, timeout).await
    }

    pub async fn pause_instance(&self, customer_id: &str, instance_id: &str) -> Result<()> {
        let managed = self.owned(customer_id, instance_id)?;
        lifecycle::pause(&managed, &self.deps).await
    }

    pub async fn resume_instance(&self, customer_id: &str, instance_id: &str) -> Result<()> {
        let managed = self.owned(customer_id, instance_id)?;
        lifecycle::resume(&managed, &self.deps).await
    }

    pub async fn terminate_instance(&self, customer_id: &str, instance_id: &str) -> Result<()> {
        let managed = self.owned(customer_id, instance_id)?;
        lifecycle::terminate(&managed, &self.deps, "terminated by customer").await
    }

    /// Aggregate usage and billing across the customer's instances
    pub fn dashboard_summary(&self, customer_id: &str) -> DashboardSummary {
        let instances = self.registry.list_for_customer(customer_id);
        let mut by_state: BTreeMap<String, usize> = BTreeMap::new();
        let mut total_accrued_cost = 0.0;
        let mut total_tasks = 0;
        for inst in &instances {
            *by_state
                .entry(format!("{:?}", inst.lifecycle_state).to_lowercase())
                .or_insert(0) += 1;
            total_accrued_cost += inst.billing.accrued_cost;
            total_tasks += inst.usage.task_count;
        }
        DashboardSummary {
            customer_id: customer_id.to_string(),
            total_instances: instances.len(),
            by_state,
            total_accrued_cost,
            total_tasks,
        }
    }

    /// Stop the sweep and terminate every live instance. Used at engine
    /// shutdown; safe to call more than once.
    pub async fn drain(&self) {
        if let Some(sweep) = self.sweep.lock().take() {
            sweep.abort();
        }
        let live: Vec<_> = self
            .registry
            .all()
            .into_iter()
            .filter(|m| m.snapshot().lifecycle_state.is_live())
            .collect();
        info!(count = live.len(), "draining live instances");
        for managed in live {
            let _ = lifecycle::terminate(&managed, &self.deps, "engine shutting down").await;
        }
    }

    /// Registry handle for tests and status endpoints
    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    fn owned(&self, customer_id: &str, instance_id: &str) -> Result<Arc<ManagedInstance>> {
        let managed = self.registry.get(instance_id)?;
        if !managed.snapshot().is_owned_by(customer_id) {
            return Err(HubError::NotOwner(instance_id.to_string()));
        }
        Ok(managed)
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Some(sweep) = self.sweep.lock().take() {
            sweep.abort();
        }
    }
}
