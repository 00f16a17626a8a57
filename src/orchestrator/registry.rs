//! Instance registry
//!
//! Sole owner of instance records. Each entry pairs the mutable cell
//! (instance record, live session, sampler task) behind the instance's
//! serialization token with a lock-free published snapshot, so reads
//! never wait on an in-flight lifecycle operation.

use crate::orchestrator::instance::{AgentInstance, LifecycleState};
use crate::protocol::ProtocolSession;
use crate::utils::errors::{HubError, Result};
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::debug;

/// Mutable per-instance state, guarded by the serialization token
pub struct InstanceCell {
    pub instance: AgentInstance,

    /// Live protocol session; Some iff the instance is Running
    pub session: Option<Arc<ProtocolSession>>,

    /// Per-instance monitor sampler
    pub sampler: Option<JoinHandle<()>>,
}

/// Registry entry: serialization token plus published snapshot
pub struct ManagedInstance {
    cell: Mutex<InstanceCell>,
    snapshot: SyncMutex<AgentInstance>,
}

impl ManagedInstance {
    pub fn new(instance: AgentInstance) -> Arc<Self> {
        Arc::new(Self {
            snapshot: SyncMutex::new(instance.clone()),
            cell: Mutex::new(InstanceCell {
                instance,
                session: None,
                sampler: None,
            }),
        })
    }

    /// Acquire the serialization token. At most one lifecycle operation
    /// or monitor tick holds this per instance.
    pub async fn lock(&self) -> MutexGuard<'_, InstanceCell> {
        self.cell.lock().await
    }

    /// Publish the cell's record for lock-free readers. Callers must
    /// invoke this before releasing the token after any mutation.
    pub fn publish(&self, cell: &InstanceCell) {
        *self.snapshot.lock() = cell.instance.clone();
    }

    /// Last published record
    pub fn snapshot(&self) -> AgentInstance {
        self.snapshot.lock().clone()
    }
}

/// Concurrent map of all instances the engine knows about
#[derive(Default)]
pub struct InstanceRegistry {
    instances: DashMap<String, Arc<ManagedInstance>>,

    /// Serializes the capacity check against concurrent inserts
    admission: SyncMutex<()>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new instance after checking the per-agent capacity
    /// limit. The check and the insert are atomic with respect to other
    /// admissions.
    pub fn admit(&self, instance: AgentInstance, max_instances: usize) -> Result<Arc<ManagedInstance>> {
        let _guard = self.admission.lock();

        let current = self.live_count_for_agent(&instance.agent_id);
        if current >= max_instances {
            return Err(HubError::CapacityExceeded {
                agent_id: instance.agent_id.clone(),
                current,
                max: max_instances,
            });
        }

        let id = instance.instance_id.clone();
        let managed = ManagedInstance::new(instance);
        self.instances.insert(id, managed.clone());
        Ok(managed)
    }

    pub fn get(&self, instance_id: &str) -> Result<Arc<ManagedInstance>> {
        self.instances
            .get(instance_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| HubError::instance_not_found(instance_id))
    }

    /// Drop an instance record entirely (retention eviction)
    pub fn evict(&self, instance_id: &str) {
        if self.instances.remove(instance_id).is_some() {
            debug!(instance_id, "instance record evicted");
        }
    }

    /// Instances counting against an agent's capacity
    pub fn live_count_for_agent(&self, agent_id: &str) -> usize {
        self.instances
            .iter()
            .filter(|e| {
                let snap = e.value().snapshot();
                snap.agent_id == agent_id && snap.lifecycle_state.is_live()
            })
            .count()
    }

    /// Snapshots of every instance owned by one customer
    pub fn list_for_customer(&self, customer_id: &str) -> Vec<AgentInstance> {
        let mut out: Vec<AgentInstance> = self
            .instances
            .iter()
            .map(|e| e.value().snapshot())
            .filter(|snap| snap.customer_id == customer_id)
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    /// Every registry entry, for the sweep and for drain
    pub fn all(&self) -> Vec<Arc<ManagedInstance>> {
        self.instances.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Count of instances currently in `state`, from snapshots
    pub fn count_in_state(&self, state: LifecycleState) -> usize {
        self.instances
            .iter()
            .filter(|e| e.value().snapshot().lifecycle_state == state)
            .count()
    }
}
