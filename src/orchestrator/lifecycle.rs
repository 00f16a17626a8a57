//! Lifecycle state machine driver
//!
//! Every operation acquires the instance's serialization token for the
//! full read-decide-act-record cycle, so two operations on one instance
//! can never interleave. Stop-flavored outcomes win ties by the token
//! order: whichever operation acquires the token first decides the next
//! state, and the loser observes it and rejects or no-ops.
//!
//! Task execution validates under the token but awaits the worker
//! outside it, so pause/terminate can cut in and cancel outstanding
//! work instead of queueing behind it.

use crate::catalog::{Agent, CatalogStore};
use crate::orchestrator::billing;
use crate::orchestrator::instance::{ConnectionInfo, LifecycleState};
use crate::orchestrator::monitor;
use crate::orchestrator::registry::{InstanceCell, ManagedInstance};
use crate::protocol::{ProtocolSession, TaskOutcome, TaskStatus};
use crate::runtime::{with_retry, ContainerRuntime, RetryPolicy};
use crate::utils::config::EngineConfig;
use crate::utils::errors::{HubError, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Shared collaborators of the state machine and the monitor loop
pub struct LifecycleDeps {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub catalog: Arc<dyn CatalogStore>,
    pub config: EngineConfig,
}

impl LifecycleDeps {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.config.runtime.max_retries,
            Duration::from_millis(self.config.runtime.retry_backoff_ms),
        )
    }
}

/// Drive a freshly admitted instance from Created to Running:
/// provision the compute unit, wait for liveness, establish the ACP
/// session. Any failure lands the instance in Failed with the reason
/// recorded and the unit torn down best-effort.
pub async fn start_instance(
    managed: &Arc<ManagedInstance>,
    deps: &Arc<LifecycleDeps>,
    agent: &Agent,
) -> Result<()> {
    let mut cell = managed.lock().await;
    cell.instance.transition(LifecycleState::Starting)?;
    managed.publish(&cell);

    match provision(&mut cell, deps, agent).await {
        Ok(()) => {
            cell.instance.transition(LifecycleState::Running)?;
            cell.sampler = Some(monitor::spawn_sampler(managed.clone(), deps.clone()));
            managed.publish(&cell);
            info!(
                instance_id = %cell.instance.instance_id,
                agent_id = %agent.agent_id,
                "instance running"
            );
            Ok(())
        }
        Err(e) => {
            fail_cell(&mut cell, deps, format!("startup failed: {e}")).await;
            managed.publish(&cell);
            Err(e)
        }
    }
}

async fn provision(
    cell: &mut InstanceCell,
    deps: &LifecycleDeps,
    agent: &Agent,
) -> Result<()> {
    let policy = deps.retry_policy();
    let env = vec![
        (
            "AGENTHUB_INSTANCE_ID".to_string(),
            cell.instance.instance_id.clone(),
        ),
        ("AGENTHUB_AGENT_ID".to_string(), agent.agent_id.clone()),
    ];

    let handle = with_retry(policy, "allocate", || {
        deps.runtime.allocate(&agent.image_ref, &env)
    })
    .await?;
    cell.instance.resource_handle = Some(handle.clone());

    let addr = with_retry(policy, "start", || deps.runtime.start(&handle)).await?;

    let session =
        ProtocolSession::establish(&cell.instance.instance_id, addr, &deps.config.protocol).await?;
    cell.instance.connection = Some(ConnectionInfo {
        session_id: session.session_id().to_string(),
        transport: session.transport_kind(),
    });
    cell.session = Some(Arc::new(session));
    Ok(())
}

/// Execute one task against a Running instance.
///
/// The state check and session pickup happen under the token; the await
/// on the worker does not. If the instance leaves Running mid-flight the
/// session cancels the pending request and this returns `Cancelled`.
pub async fn execute(
    managed: &Arc<ManagedInstance>,
    deps: &Arc<LifecycleDeps>,
    agent: &Agent,
    endpoint: &str,
    parameters: Value,
    timeout: Duration,
) -> Result<TaskOutcome> {
    if !agent.declares_endpoint(endpoint) {
        return Err(HubError::UnknownEndpoint {
            agent_id: agent.agent_id.clone(),
            endpoint: endpoint.to_string(),
        });
    }

    let session = {
        let cell = managed.lock().await;
        if cell.instance.lifecycle_state != LifecycleState::Running {
            return Err(HubError::unavailable(
                cell.instance.instance_id.clone(),
                cell.instance.lifecycle_state,
                "execute",
            ));
        }
        cell.session
            .clone()
            .ok_or_else(|| HubError::Transport("running instance has no session".into()))?
    };

    let started = Instant::now();
    let result = session.execute_task(endpoint, parameters, timeout).await;
    let latency = started.elapsed();

    match &result {
        Ok(outcome) => {
            let completed = outcome.status == TaskStatus::Completed;
            {
                let mut cell = managed.lock().await;
                cell.instance.usage.task_count += 1;
                if completed {
                    billing::charge_task(&mut cell.instance);
                }
                managed.publish(&cell);
            }
            // at-least-once; a lost update here only skews statistics
            let _ = deps
                .catalog
                .record_usage_stats(&agent.agent_id, completed, latency)
                .await;
        }
        Err(HubError::TaskTimeout(_)) | Err(HubError::Transport(_)) => {
            let _ = deps
                .catalog
                .record_usage_stats(&agent.agent_id, false, latency)
                .await;
        }
        // Busy and Cancelled are engine-side outcomes, not worker failures
        Err(_) => {}
    }
    result
}

/// Suspend a Running instance. Outstanding tasks are cancelled and the
/// session is torn down; a suspended worker cannot answer heartbeats.
pub async fn pause(managed: &Arc<ManagedInstance>, deps: &Arc<LifecycleDeps>) -> Result<()> {
    let mut cell = managed.lock().await;
    if cell.instance.lifecycle_state != LifecycleState::Running {
        return Err(HubError::unavailable(
            cell.instance.instance_id.clone(),
            cell.instance.lifecycle_state,
            "pause",
        ));
    }

    billing::accrue_active_time(&mut cell.instance);
    cell.instance.transition(LifecycleState::Pausing)?;
    managed.publish(&cell);

    if let Some(session) = cell.session.take() {
        session.close("instance pausing").await;
    }
    cell.instance.connection = None;

    let handle = cell
        .instance
        .resource_handle
        .clone()
        .ok_or_else(|| HubError::Transport("running instance has no handle".into()))?;

    match with_retry(deps.retry_policy(), "pause", || deps.runtime.pause(&handle)).await {
        Ok(()) => {
            cell.instance.transition(LifecycleState::Paused)?;
            managed.publish(&cell);
            Ok(())
        }
        Err(e) => {
            fail_cell(&mut cell, deps, format!("pause failed: {e}")).await;
            managed.publish(&cell);
            Err(e)
        }
    }
}

/// Resume a Paused instance and re-establish its session.
pub async fn resume(managed: &Arc<ManagedInstance>, deps: &Arc<LifecycleDeps>) -> Result<()> {
    let mut cell = managed.lock().await;
    if cell.instance.lifecycle_state != LifecycleState::Paused {
        return Err(HubError::unavailable(
            cell.instance.instance_id.clone(),
            cell.instance.lifecycle_state,
            "resume",
        ));
    }

    cell.instance.transition(LifecycleState::Resuming)?;
    managed.publish(&cell);

    let handle = cell
        .instance
        .resource_handle
        .clone()
        .ok_or_else(|| HubError::Transport("paused instance has no handle".into()))?;

    let resumed = async {
        with_retry(deps.retry_policy(), "unpause", || {
            deps.runtime.unpause(&handle)
        })
        .await?;
        ProtocolSession::establish(
            &cell.instance.instance_id,
            handle.address(),
            &deps.config.protocol,
        )
        .await
    }
    .await;

    match resumed {
        Ok(session) => {
            cell.instance.connection = Some(ConnectionInfo {
                session_id: session.session_id().to_string(),
                transport: session.transport_kind(),
            });
            cell.session = Some(Arc::new(session));
            cell.instance.transition(LifecycleState::Running)?;
            if cell.sampler.as_ref().map(|s| s.is_finished()).unwrap_or(true) {
                cell.sampler = Some(monitor::spawn_sampler(managed.clone(), deps.clone()));
            }
            managed.publish(&cell);
            Ok(())
        }
        Err(e) => {
            fail_cell(&mut cell, deps, format!("resume failed: {e}")).await;
            managed.publish(&cell);
            Err(e)
        }
    }
}

/// Stop an instance and release its compute unit. Idempotent on
/// Stopped; on Failed it performs cleanup only. Billing is finalized
/// exactly once on the way to Stopped.
pub async fn terminate(
    managed: &Arc<ManagedInstance>,
    deps: &Arc<LifecycleDeps>,
    reason: &str,
) -> Result<()> {
    let mut cell = managed.lock().await;
    match cell.instance.lifecycle_state {
        LifecycleState::Stopped => Ok(()),
        LifecycleState::Failed => {
            teardown_handle(&mut cell, deps).await;
            billing::finalize(&mut cell.instance);
            cell.instance.transition(LifecycleState::Stopped)?;
            if let Some(sampler) = cell.sampler.take() {
                sampler.abort();
            }
            managed.publish(&cell);
            Ok(())
        }
        LifecycleState::Running | LifecycleState::Paused => {
            billing::accrue_active_time(&mut cell.instance);
            if let Some(session) = cell.session.take() {
                session.close(reason).await;
            }
            cell.instance.connection = None;
            cell.instance.transition(LifecycleState::Stopping)?;
            managed.publish(&cell);

            teardown_handle(&mut cell, deps).await;
            billing::finalize(&mut cell.instance);
            cell.instance.transition(LifecycleState::Stopped)?;
            cell.instance.state_reason = Some(reason.to_string());
            if let Some(sampler) = cell.sampler.take() {
                sampler.abort();
            }
            managed.publish(&cell);
            info!(
                instance_id = %cell.instance.instance_id,
                reason,
                accrued_cost = cell.instance.billing.accrued_cost,
                "instance terminated"
            );
            Ok(())
        }
        state => Err(HubError::unavailable(
            cell.instance.instance_id.clone(),
            state,
            "terminate",
        )),
    }
}

/// Stop and remove the backing unit, best-effort. The handle reference
/// is cleared only once removal succeeds, so the sweep can retry orphan
/// cleanup later.
pub(crate) async fn teardown_handle(cell: &mut InstanceCell, deps: &LifecycleDeps) {
    let Some(handle) = cell.instance.resource_handle.clone() else {
        return;
    };
    // Single attempt while the token is held; the sweep retries orphans
    let policy = RetryPolicy::none();

    if let Err(e) = with_retry(policy, "stop", || deps.runtime.stop(&handle)).await {
        warn!(
            instance_id = %cell.instance.instance_id,
            handle_id = %handle.handle_id,
            error = %e,
            "stop failed during teardown"
        );
    }
    match with_retry(policy, "remove", || deps.runtime.remove(&handle)).await {
        Ok(()) => cell.instance.resource_handle = None,
        Err(e) => warn!(
            instance_id = %cell.instance.instance_id,
            handle_id = %handle.handle_id,
            error = %e,
            "remove failed, sweep will retry"
        ),
    }
}

/// Force the cell into Failed with `reason`: cancel work, drop the
/// session, tear down the unit. Used by startup/pause/resume failure
/// paths and by the monitor when health policy trips.
///
/// The sampler is left to observe the terminal state and exit on its
/// own; this may run inside the sampler task itself.
pub(crate) async fn fail_cell(cell: &mut InstanceCell, deps: &LifecycleDeps, reason: String) {
    warn!(
        instance_id = %cell.instance.instance_id,
        state = ?cell.instance.lifecycle_state,
        %reason,
        "forcing instance to Failed"
    );

    billing::accrue_active_time(&mut cell.instance);
    if let Some(session) = cell.session.take() {
        session.close(&reason).await;
    }
    cell.instance.connection = None;

    if cell
        .instance
        .lifecycle_state
        .can_transition_to(LifecycleState::Failed)
    {
        // edge legality verified above
        let _ = cell.instance.transition(LifecycleState::Failed);
    }
    cell.instance.state_reason = Some(reason);
    cell.instance.health.last_error = cell.instance.state_reason.clone();

    // Last worker output often explains the failure; capture it before
    // the unit goes away
    if let Some(handle) = cell.instance.resource_handle.clone() {
        if let Ok(tail) = deps.runtime.logs(&handle, 20).await {
            for line in tail {
                warn!(instance_id = %cell.instance.instance_id, worker_log = %line);
            }
        }
    }

    teardown_handle(cell, deps).await;
}
