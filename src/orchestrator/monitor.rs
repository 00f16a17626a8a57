//! Monitor and billing loop
//!
//! Two cadences:
//!
//! - a per-instance **sampler** that reads compute-unit stats, advances
//!   billing accrual, and applies health policy (the session only counts
//!   missed heartbeats; deciding an instance is dead happens here)
//! - a global **sweep** that forces stuck transitional states past their
//!   deadline, retries orphaned handle cleanup, and evicts terminal
//!   records after the retention window
//!
//! Both run under the instance token, so their read-modify-write cycles
//! never interleave with lifecycle operations.

use crate::orchestrator::billing;
use crate::orchestrator::instance::LifecycleState;
use crate::orchestrator::lifecycle::{self, LifecycleDeps};
use crate::orchestrator::registry::{InstanceRegistry, ManagedInstance};
use crate::runtime::with_retry;
use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Spawn the sampler for one instance. The task exits on its own once
/// the instance reaches a terminal state.
pub(crate) fn spawn_sampler(
    managed: Arc<ManagedInstance>,
    deps: Arc<LifecycleDeps>,
) -> JoinHandle<()> {
    let interval = deps.config.sample_interval();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if !sample_once(&managed, &deps).await {
                return;
            }
        }
    })
}

/// One sampler tick; returns false when the instance is terminal and
/// the sampler should exit.
async fn sample_once(managed: &Arc<ManagedInstance>, deps: &Arc<LifecycleDeps>) -> bool {
    let mut cell = managed.lock().await;
    let state = cell.instance.lifecycle_state;
    if !matches!(state, LifecycleState::Running | LifecycleState::Paused) {
        debug!(
            instance_id = %cell.instance.instance_id,
            ?state,
            "sampler exiting"
        );
        return false;
    }

    // Heartbeat policy first: a worker that stopped answering gets no
    // further accrual past this tick. Two triggers: the consecutive-miss
    // counter, and the last reply aging past the staleness window. The
    // window only applies once a reply has been seen; silent workers are
    // caught by the counter.
    if state == LifecycleState::Running {
        if let Some(session) = cell.session.clone() {
            let health = session.health();
            cell.instance.health.last_heartbeat = health.last_heartbeat_received;
            let missed = health.missed_heartbeats;
            let window = deps.config.heartbeat_timeout();
            let stale = health.last_heartbeat_received.is_some() && !session.is_healthy(window);
            if missed >= deps.config.monitor.max_consecutive_errors || stale {
                billing::accrue_active_time(&mut cell.instance);
                let reason = if stale {
                    format!(
                        "worker unresponsive: last heartbeat reply stale after {}s",
                        window.as_secs()
                    )
                } else {
                    format!("worker unresponsive: {missed} consecutive heartbeats missed")
                };
                lifecycle::fail_cell(&mut cell, deps, reason).await;
                managed.publish(&cell);
                return false;
            }
        }
    }

    billing::accrue_active_time(&mut cell.instance);

    if let Some(handle) = cell.instance.resource_handle.clone() {
        match with_retry(deps.retry_policy(), "stats", || deps.runtime.stats(&handle)).await {
            Ok(stats) => {
                let usage = &mut cell.instance.usage;
                usage.cpu_seconds = usage.cpu_seconds.max(stats.cpu_seconds);
                usage.memory_peak_bytes = usage.memory_peak_bytes.max(stats.memory_bytes);
                usage.network_bytes = usage.network_bytes.max(stats.network_bytes);
                usage.last_sampled = Some(Utc::now());
                cell.instance.health.consecutive_errors = 0;
            }
            Err(e) => {
                cell.instance.health.consecutive_errors += 1;
                cell.instance.health.last_error = Some(e.to_string());
                let errors = cell.instance.health.consecutive_errors;
                warn!(
                    instance_id = %cell.instance.instance_id,
                    consecutive_errors = errors,
                    error = %e,
                    "stats sample failed"
                );
                if state == LifecycleState::Running
                    && errors >= deps.config.monitor.max_consecutive_errors
                {
                    lifecycle::fail_cell(
                        &mut cell,
                        deps,
                        format!("compute unit unreachable for {errors} samples"),
                    )
                    .await;
                    managed.publish(&cell);
                    return false;
                }
            }
        }
    }

    managed.publish(&cell);
    true
}

/// Spawn the global sweep over the whole registry.
pub(crate) fn spawn_sweep(
    registry: Arc<InstanceRegistry>,
    deps: Arc<LifecycleDeps>,
) -> JoinHandle<()> {
    let interval = deps.config.sweep_interval();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            sweep_once(&registry, &deps).await;
        }
    })
}

async fn sweep_once(registry: &InstanceRegistry, deps: &Arc<LifecycleDeps>) {
    let deadline = deps.config.transition_deadline();
    let retention = deps.config.retention();

    for managed in registry.all() {
        let snap = managed.snapshot();
        let age = snap.time_in_state();

        if snap.lifecycle_state.is_transitional() && age > deadline {
            let mut cell = managed.lock().await;
            // re-check under the token; the state may have moved on
            let state = cell.instance.lifecycle_state;
            if !state.is_transitional() || cell.instance.time_in_state() <= deadline {
                continue;
            }
            warn!(
                instance_id = %cell.instance.instance_id,
                ?state,
                stuck_secs = age.as_secs(),
                "forcing stuck transitional state"
            );
            if state == LifecycleState::Stopping {
                lifecycle::teardown_handle(&mut cell, deps).await;
                billing::finalize(&mut cell.instance);
                if cell.instance.transition(LifecycleState::Stopped).is_ok() {
                    cell.instance.state_reason =
                        Some("stop forced after transition deadline".into());
                }
            } else {
                lifecycle::fail_cell(
                    &mut cell,
                    deps,
                    format!("stuck in {state:?} past transition deadline"),
                )
                .await;
            }
            managed.publish(&cell);
            continue;
        }

        // Orphaned unit behind a terminal record: removal failed earlier
        if !snap.lifecycle_state.is_live() && snap.resource_handle.is_some() {
            let mut cell = managed.lock().await;
            if !cell.instance.lifecycle_state.is_live() {
                lifecycle::teardown_handle(&mut cell, deps).await;
                managed.publish(&cell);
            }
            continue;
        }

        if age > retention {
            match snap.lifecycle_state {
                LifecycleState::Stopped => {
                    info!(instance_id = %snap.instance_id, "retention window elapsed");
                    registry.evict(&snap.instance_id);
                }
                LifecycleState::Failed => {
                    // cleanup-only path to Stopped; eviction follows on a
                    // later sweep
                    let mut cell = managed.lock().await;
                    if cell.instance.lifecycle_state == LifecycleState::Failed {
                        lifecycle::teardown_handle(&mut cell, deps).await;
                        billing::finalize(&mut cell.instance);
                        let _ = cell.instance.transition(LifecycleState::Stopped);
                        managed.publish(&cell);
                    }
                }
                _ => {}
            }
        }
    }
}
