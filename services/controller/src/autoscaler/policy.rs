//! Replica targets for the policies that need no outside input.

use fleetplane_api::{
    AggregatedStatus, BufferPolicy, CapacityPolicy, Fleet, FleetAutoscaleResponse, IntOrPercent,
    WebhookPolicy,
};

/// What one policy wants the fleet's replicas to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub replicas: u32,
    /// The policy asked for more or fewer than its bounds allow.
    pub limited: bool,
}

impl Decision {
    fn clamped(wanted: u64, min: u32, max: u32) -> Self {
        let replicas = wanted.clamp(u64::from(min), u64::from(max.max(min)));
        Self {
            replicas: u32::try_from(replicas).unwrap_or(u32::MAX),
            limited: replicas != wanted,
        }
    }
}

/// Allocated servers plus a buffer of ready ones.
///
/// A percentage buffer is taken of the allocated count and rounded up, so
/// any allocation keeps at least one spare.
pub fn buffer(policy: &BufferPolicy, fleet: &Fleet) -> Decision {
    let allocated = fleet.status.allocated_replicas;
    let spare = match policy.buffer_size {
        IntOrPercent::Int(n) => n,
        pct @ IntOrPercent::Percent(_) => pct.resolve(allocated, true),
    };
    Decision::clamped(
        u64::from(allocated) + u64::from(spare),
        policy.min_replicas,
        policy.max_replicas,
    )
}

/// Which per-server capacity a [`CapacityPolicy`] tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityKind {
    Counter,
    List,
}

/// Enough servers to hold the used capacity plus a buffer of free capacity.
///
/// Capacity per server comes from the fleet template, so a fleet whose
/// template does not declare the key cannot be scaled this way. The result
/// never drops below the allocated count.
pub fn capacity(kind: CapacityKind, policy: &CapacityPolicy, fleet: &Fleet) -> Result<Decision, String> {
    let template = &fleet.spec.template.spec;
    let per_server = match kind {
        CapacityKind::Counter => template.counters.get(&policy.key).map(|c| c.capacity),
        CapacityKind::List => template.lists.get(&policy.key).map(|l| l.capacity),
    }
    .unwrap_or(0);
    if per_server <= 0 {
        return Err(format!(
            "fleet template gives '{}' no capacity to scale on",
            policy.key
        ));
    }

    let aggregate: AggregatedStatus = match kind {
        CapacityKind::Counter => fleet.status.counters.get(&policy.key),
        CapacityKind::List => fleet.status.lists.get(&policy.key),
    }
    .copied()
    .unwrap_or_default();

    let used = aggregate.count.max(0);
    let spare = match policy.buffer_size {
        IntOrPercent::Int(n) => i64::from(n),
        IntOrPercent::Percent(p) => (used * i64::from(p) + 99) / 100,
    };
    let wanted = used + spare;
    let bounded = wanted.clamp(policy.min_capacity, policy.max_capacity.max(policy.min_capacity));

    let servers = (bounded + per_server - 1) / per_server;
    let servers = u32::try_from(servers.max(0)).unwrap_or(u32::MAX);
    Ok(Decision {
        replicas: servers.max(fleet.status.allocated_replicas),
        limited: bounded != wanted,
    })
}

/// Apply a webhook answer. A "no scale" answer keeps the fleet as it is.
pub fn from_webhook(policy: &WebhookPolicy, answer: &FleetAutoscaleResponse, current: u32) -> Decision {
    if !answer.scale {
        return Decision {
            replicas: current,
            limited: false,
        };
    }
    Decision::clamped(
        u64::from(answer.replicas),
        policy.min_replicas.unwrap_or(0),
        policy.max_replicas.unwrap_or(u32::MAX),
    )
}
