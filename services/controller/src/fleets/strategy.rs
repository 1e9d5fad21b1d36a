//! Replica targets for the sets of one fleet.

use fleetplane_api::{Fleet, GameServerSet, ReplicaStatus, StrategyType};
use fleetplane_reconcile::{RollingStrategy, RolloutPlan, SetSnapshot};

use crate::config::RollingUpdateDefaults;

/// A set together with the population counted from its live game servers.
#[derive(Debug, Clone)]
pub struct SetView {
    pub set: GameServerSet,
    pub status: ReplicaStatus,
}

impl SetView {
    pub fn snapshot(&self) -> SetSnapshot {
        SetSnapshot {
            replicas: self.set.spec.replicas,
            up: self.status.replicas,
            available: self.status.available(),
            allocated: self.status.allocated_replicas,
        }
    }

    /// Only allocated servers are left.
    fn drained(&self) -> bool {
        self.status.replicas <= self.status.allocated_replicas
    }
}

/// Surge and unavailability of `fleet`, resolved against its replicas.
/// Surge rounds up and unavailability rounds down.
pub fn rolling_budgets(fleet: &Fleet, defaults: &RollingUpdateDefaults) -> RollingStrategy {
    let params = fleet.spec.strategy.rolling_update.unwrap_or_default();
    let desired = fleet.spec.replicas;
    let surge = params
        .max_surge
        .unwrap_or(defaults.max_surge)
        .resolve(desired, true);
    let unavailable = params
        .max_unavailable
        .unwrap_or(defaults.max_unavailable)
        .resolve(desired, false);
    RollingStrategy::new(surge, unavailable)
}

/// New replica targets for the active set and each inactive set, in the
/// order given.
pub fn targets(
    fleet: &Fleet,
    defaults: &RollingUpdateDefaults,
    active: &SetView,
    rest: &[SetView],
) -> RolloutPlan {
    let desired = fleet.spec.replicas;
    if rest.is_empty() {
        return RolloutPlan {
            active_replicas: desired,
            rest_replicas: Vec::new(),
        };
    }

    match fleet.spec.strategy.kind {
        StrategyType::Recreate => {
            let pinned: u32 = rest.iter().map(|v| v.status.allocated_replicas).sum();
            let goal = desired.saturating_sub(pinned);
            let active_replicas = if rest.iter().all(SetView::drained) {
                goal
            } else {
                active.set.spec.replicas.min(goal)
            };
            RolloutPlan {
                active_replicas,
                rest_replicas: vec![0; rest.len()],
            }
        }
        StrategyType::RollingUpdate => {
            let snapshots: Vec<SetSnapshot> = rest.iter().map(SetView::snapshot).collect();
            rolling_budgets(fleet, defaults).plan(desired, &active.snapshot(), &snapshots)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetplane_api::{FleetStrategy, IntOrPercent, RollingUpdateParams};
    use fleetplane_testing::{fleet, set_for};

    fn view(replicas: u32, up: u32, ready: u32, allocated: u32) -> SetView {
        SetView {
            set: set_for(&fleet("f", replicas), "s", replicas),
            status: ReplicaStatus {
                replicas: up,
                ready_replicas: ready,
                allocated_replicas: allocated,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_budgets_round_in_opposite_directions() {
        let mut f = fleet("f", 10);
        f.spec.strategy.rolling_update = Some(RollingUpdateParams {
            max_surge: Some(IntOrPercent::Percent(25)),
            max_unavailable: Some(IntOrPercent::Percent(25)),
        });
        let budgets = rolling_budgets(&f, &RollingUpdateDefaults::default());
        assert_eq!(budgets.max_surge, 3);
        assert_eq!(budgets.max_unavailable, 2);

        let mut f = fleet("f", 1);
        f.spec.strategy.rolling_update = Some(RollingUpdateParams {
            max_surge: Some(IntOrPercent::Int(0)),
            max_unavailable: Some(IntOrPercent::Percent(10)),
        });
        let budgets = rolling_budgets(&f, &RollingUpdateDefaults::default());
        assert_eq!(budgets.max_unavailable, 1);
    }

    #[test]
    fn test_single_set_follows_fleet() {
        let f = fleet("f", 7);
        let plan = targets(&f, &RollingUpdateDefaults::default(), &view(3, 3, 3, 0), &[]);
        assert_eq!(plan.active_replicas, 7);
    }

    #[test]
    fn test_recreate_waits_for_drain() {
        let mut f = fleet("f", 4);
        f.spec.strategy = FleetStrategy {
            kind: StrategyType::Recreate,
            rolling_update: None,
        };
        let defaults = RollingUpdateDefaults::default();

        let plan = targets(&f, &defaults, &view(0, 0, 0, 0), &[view(4, 4, 3, 1)]);
        assert_eq!(plan.active_replicas, 0);
        assert_eq!(plan.rest_replicas, vec![0]);

        // Only the allocated server is left in the old set.
        let plan = targets(&f, &defaults, &view(0, 0, 0, 0), &[view(0, 1, 0, 1)]);
        assert_eq!(plan.active_replicas, 3);
    }

    #[test]
    fn test_rolling_step_respects_surge() {
        let mut f = fleet("f", 10);
        f.spec.strategy.rolling_update = Some(RollingUpdateParams {
            max_surge: Some(IntOrPercent::Int(2)),
            max_unavailable: Some(IntOrPercent::Int(2)),
        });
        let plan = targets(
            &f,
            &RollingUpdateDefaults::default(),
            &view(0, 0, 0, 0),
            &[view(10, 10, 10, 0)],
        );
        assert_eq!(plan.active_replicas, 2);
        assert_eq!(plan.rest_replicas, vec![8]);
    }
}
