//! Incremental billing accrual
//!
//! Cost accrues against the billing model snapshot frozen on the
//! instance at creation. Time-based charges accrue only for Running
//! spans: the active-time cursor is advanced at every monitor tick and
//! folded once more when the instance leaves Running, so accrued cost
//! is monotone non-decreasing and paused time is never charged.
//! Finalization happens at most once; later accrual calls are no-ops.

use crate::orchestrator::instance::AgentInstance;
use chrono::Utc;
use std::time::Instant;
use tracing::debug;

/// Fold active time since the last accrual into uptime and cost, then
/// advance the cursor. No-op unless the instance has an open Running
/// span and billing has not been finalized.
pub fn accrue_active_time(instance: &mut AgentInstance) {
    if instance.billing.finalized {
        return;
    }
    let Some(cursor) = instance.active_since else {
        return;
    };

    let elapsed = cursor.elapsed();
    instance.usage.uptime += elapsed;
    instance.billing.accrued_cost += instance.billing.model.time_cost(elapsed);
    instance.billing.last_billed = Some(Utc::now());
    instance.active_since = Some(Instant::now());
}

/// Charge one completed task under per-request or hybrid pricing.
pub fn charge_task(instance: &mut AgentInstance) {
    if instance.billing.finalized {
        return;
    }
    instance.billing.accrued_cost += instance.billing.model.request_cost();
    instance.billing.last_billed = Some(Utc::now());
}

/// Close the billing record. Accrues any open Running span first, then
/// freezes the total; exactly-once even if teardown paths overlap.
pub fn finalize(instance: &mut AgentInstance) {
    if instance.billing.finalized {
        return;
    }
    accrue_active_time(instance);
    instance.billing.finalized = true;
    instance.billing.last_billed = Some(Utc::now());
    debug!(
        instance_id = %instance.instance_id,
        accrued_cost = instance.billing.accrued_cost,
        "billing finalized"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::BillingModel;
    use crate::orchestrator::instance::LifecycleState;
    use std::time::Duration;

    fn running_instance(model: BillingModel) -> AgentInstance {
        let mut inst = AgentInstance::new("inst_1", "agent_1", "cust_1", model);
        inst.transition(LifecycleState::Starting).unwrap();
        inst.transition(LifecycleState::Running).unwrap();
        inst
    }

    #[test]
    fn test_time_accrual_is_monotone() {
        let mut inst = running_instance(BillingModel::PerHour { rate: 3600.0 });
        inst.active_since = Some(Instant::now() - Duration::from_secs(2));

        accrue_active_time(&mut inst);
        let first = inst.billing.accrued_cost;
        assert!(first >= 2.0);

        accrue_active_time(&mut inst);
        assert!(inst.billing.accrued_cost >= first);
        assert!(inst.usage.uptime >= Duration::from_secs(2));
    }

    #[test]
    fn test_per_request_ignores_time() {
        let mut inst = running_instance(BillingModel::PerRequest { price: 0.25 });
        inst.active_since = Some(Instant::now() - Duration::from_secs(60));

        accrue_active_time(&mut inst);
        assert_eq!(inst.billing.accrued_cost, 0.0);

        charge_task(&mut inst);
        charge_task(&mut inst);
        assert_eq!(inst.billing.accrued_cost, 0.5);
    }

    #[test]
    fn test_no_accrual_without_cursor() {
        let mut inst = AgentInstance::new(
            "inst_1",
            "agent_1",
            "cust_1",
            BillingModel::PerMinute { rate: 60.0 },
        );
        accrue_active_time(&mut inst);
        assert_eq!(inst.billing.accrued_cost, 0.0);
        assert!(inst.billing.last_billed.is_none());
    }

    #[test]
    fn test_finalize_exactly_once() {
        let mut inst = running_instance(BillingModel::PerHour { rate: 3600.0 });
        inst.active_since = Some(Instant::now() - Duration::from_secs(1));

        finalize(&mut inst);
        let total = inst.billing.accrued_cost;
        assert!(inst.billing.finalized);
        assert!(total >= 1.0);

        // A second finalize or later charge must not move the total
        inst.active_since = Some(Instant::now() - Duration::from_secs(100));
        finalize(&mut inst);
        charge_task(&mut inst);
        accrue_active_time(&mut inst);
        assert_eq!(inst.billing.accrued_cost, total);
    }

    #[test]
    fn test_hybrid_charges_both() {
        let mut inst = running_instance(BillingModel::Hybrid {
            hourly_rate: 3600.0,
            per_request: 0.1,
        });
        inst.active_since = Some(Instant::now() - Duration::from_secs(1));

        accrue_active_time(&mut inst);
        charge_task(&mut inst);
        assert!(inst.billing.accrued_cost >= 1.1);
    }
}
