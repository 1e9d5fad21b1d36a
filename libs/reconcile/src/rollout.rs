//! Rolling replacement math.
//!
//! A fleet owns one active set (current template) and any number of
//! inactive sets being drained. Each pass computes new replica targets for
//! all of them such that, once the set controllers act on those targets,
//!
//! - `sum(up) <= desired + max_surge`, and
//! - `sum(available) >= desired - max_unavailable`.
//!
//! Allocated instances in inactive sets are never counted as removable; the
//! active set's target shrinks by their number instead.

/// Observed state of one set, as reported in its status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetSnapshot {
    /// Target written in the set spec.
    pub replicas: u32,

    /// Non-terminal instances.
    pub up: u32,

    /// Instances that can serve: ready, reserved or allocated.
    pub available: u32,

    /// Allocated instances; the set controller never deletes these.
    pub allocated: u32,
}

impl SetSnapshot {
    /// Instances this set may hold once its controller converges, or holds
    /// now if it has not caught up with a shrink yet.
    fn footprint(&self) -> u32 {
        self.replicas.max(self.up)
    }

    /// Available instances that survive the current target.
    fn surviving_available(&self) -> u32 {
        self.available.min(self.replicas.max(self.allocated))
    }
}

/// New targets for the active set and each inactive set (same order as the
/// input slice).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloutPlan {
    pub active_replicas: u32,
    pub rest_replicas: Vec<u32>,
}

/// Surge and unavailability budgets, already resolved to absolute counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollingStrategy {
    /// Maximum instances above desired during a rollout.
    pub max_surge: u32,

    /// Maximum instances below desired during a rollout.
    pub max_unavailable: u32,
}

impl Default for RollingStrategy {
    fn default() -> Self {
        Self {
            max_surge: 1,
            max_unavailable: 0,
        }
    }
}

impl RollingStrategy {
    /// Build a strategy. When both budgets are zero no progress is possible,
    /// so unavailability is raised to one.
    pub fn new(max_surge: u32, max_unavailable: u32) -> Self {
        let max_unavailable = if max_surge == 0 && max_unavailable == 0 {
            1
        } else {
            max_unavailable
        };
        Self {
            max_surge,
            max_unavailable,
        }
    }

    /// Compute one rollout step.
    pub fn plan(&self, desired: u32, active: &SetSnapshot, rest: &[SetSnapshot]) -> RolloutPlan {
        let pinned: u32 = rest.iter().map(|s| s.allocated).sum();
        let active_target = desired.saturating_sub(pinned);

        let total: u32 = active.footprint() + rest.iter().map(SetSnapshot::footprint).sum::<u32>();
        let ceiling = desired.saturating_add(self.max_surge);
        let active_replicas = if active.replicas >= active_target {
            active_target
        } else {
            let room = ceiling.saturating_sub(total);
            active.replicas.saturating_add(room).min(active_target)
        };

        let min_available = desired.saturating_sub(self.max_unavailable);
        let available: u32 = active.available
            + rest
                .iter()
                .map(SetSnapshot::surviving_available)
                .sum::<u32>();
        let active_unavailable = active.replicas.saturating_sub(active.available);
        let mut budget = available
            .saturating_sub(min_available)
            .saturating_sub(active_unavailable);

        let rest_replicas = rest
            .iter()
            .map(|set| {
                // Members that are not serving go for free.
                let mut target = set.replicas.min(set.available);
                let removable = target.saturating_sub(set.allocated);
                let take = removable.min(budget);
                budget -= take;
                target -= take;
                if target <= set.allocated {
                    0
                } else {
                    target
                }
            })
            .collect();

        RolloutPlan {
            active_replicas,
            rest_replicas,
        }
    }
}
