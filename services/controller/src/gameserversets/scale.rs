//! Scale decisions for one set, as a pure function of its population.

use std::collections::HashMap;

use fleetplane_api::{GameServer, GameServerSet, GameServerState, SchedulingStrategy};
use fleetplane_reconcile::{select_for_drain, DrainKey, DrainPriority, NodePreference};

/// Most game servers created by one reconcile pass. The rest follow on the
/// next pass, which the creations themselves trigger.
pub const MAX_CREATIONS_PER_PASS: u32 = 64;

#[derive(Debug, Default, PartialEq)]
pub struct ScalePlan {
    pub create: u32,

    /// In deletion order.
    pub delete: Vec<GameServer>,

    /// More creations are pending past the per-pass cap.
    pub more: bool,
}

/// Decide how `set` moves toward its desired replicas given the game
/// servers it owns.
///
/// Servers that are allocated or reserved are never chosen for deletion, so
/// a set may sit above its target until they finish.
pub fn plan_scale(set: &GameServerSet, owned: &[GameServer]) -> ScalePlan {
    let desired = set.spec.replicas;
    let up: Vec<&GameServer> = owned.iter().filter(|gs| gs.state().is_up()).collect();
    let up_count = up.len() as u32;

    if up_count < desired {
        let missing = desired - up_count;
        return ScalePlan {
            create: missing.min(MAX_CREATIONS_PER_PASS),
            delete: Vec::new(),
            more: missing > MAX_CREATIONS_PER_PASS,
        };
    }
    if up_count == desired {
        return ScalePlan::default();
    }

    let mut per_node: HashMap<&str, u32> = HashMap::new();
    for gs in &up {
        if !gs.status.node_name.is_empty() {
            *per_node.entry(gs.status.node_name.as_str()).or_default() += 1;
        }
    }

    let preference = match set.spec.scheduling {
        SchedulingStrategy::Packed => NodePreference::MostPacked,
        SchedulingStrategy::Distributed => NodePreference::LeastPacked,
    };
    let candidates: Vec<&GameServer> = up
        .iter()
        .copied()
        .filter(|gs| !gs.state().is_protected())
        .collect();
    let surplus = (up_count - desired) as usize;

    let delete = select_for_drain(candidates, preference, |gs| DrainKey {
        priority: drain_priority(gs.state()),
        node_load: per_node
            .get(gs.status.node_name.as_str())
            .copied()
            .unwrap_or(0),
        id: gs.metadata.name.clone(),
    })
    .into_iter()
    .take(surplus)
    .cloned()
    .collect();

    ScalePlan {
        create: 0,
        delete,
        more: false,
    }
}

fn drain_priority(state: GameServerState) -> DrainPriority {
    match state {
        GameServerState::Error => DrainPriority::Failed,
        s if s.is_before_ready() => DrainPriority::NotReady,
        _ => DrainPriority::Ready,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetplane_testing::{fleet, set_for, GameServerBuilder};
    use rstest::rstest;

    fn names(plan: &ScalePlan) -> Vec<&str> {
        plan.delete.iter().map(|gs| gs.metadata.name.as_str()).collect()
    }

    #[rstest]
    #[case(5, 2, 3)]
    #[case(3, 3, 0)]
    #[case(100, 0, MAX_CREATIONS_PER_PASS)]
    fn test_creates_missing(#[case] desired: u32, #[case] existing: usize, #[case] expect: u32) {
        let set = set_for(&fleet("f", desired), "f-a", desired);
        let owned: Vec<_> = (0..existing)
            .map(|i| GameServerBuilder::new(&format!("gs-{i}")).owned_by(&set).build())
            .collect();
        let plan = plan_scale(&set, &owned);
        assert_eq!(plan.create, expect);
        assert!(plan.delete.is_empty());
        assert_eq!(plan.more, desired as usize - existing > MAX_CREATIONS_PER_PASS as usize);
    }

    #[test]
    fn test_shutdown_servers_do_not_count() {
        let set = set_for(&fleet("f", 2), "f-a", 2);
        let owned = vec![
            GameServerBuilder::new("a").ready_on("n1").build(),
            GameServerBuilder::new("b").state(GameServerState::Shutdown).build(),
            GameServerBuilder::new("c").state(GameServerState::Unhealthy).build(),
        ];
        assert_eq!(plan_scale(&set, &owned).create, 1);
    }

    #[test]
    fn test_not_ready_go_first_and_protected_never() {
        let set = set_for(&fleet("f", 1), "f-a", 1);
        let owned = vec![
            GameServerBuilder::new("allocated")
                .ready_on("n1")
                .state(GameServerState::Allocated)
                .build(),
            GameServerBuilder::new("reserved")
                .ready_on("n1")
                .state(GameServerState::Reserved)
                .build(),
            GameServerBuilder::new("ready").ready_on("n1").build(),
            GameServerBuilder::new("starting")
                .state(GameServerState::Starting)
                .build(),
            GameServerBuilder::new("failed").state(GameServerState::Error).build(),
        ];
        let plan = plan_scale(&set, &owned);
        assert_eq!(names(&plan), vec!["failed", "starting", "ready"]);
    }

    #[rstest]
    #[case(SchedulingStrategy::Packed, "crowded-1")]
    #[case(SchedulingStrategy::Distributed, "lonely")]
    fn test_node_preference(#[case] scheduling: SchedulingStrategy, #[case] first: &str) {
        let mut set = set_for(&fleet("f", 2), "f-a", 2);
        set.spec.scheduling = scheduling;
        let owned = vec![
            GameServerBuilder::new("crowded-1").ready_on("n1").build(),
            GameServerBuilder::new("crowded-2").ready_on("n1").build(),
            GameServerBuilder::new("lonely").ready_on("n2").build(),
        ];
        let plan = plan_scale(&set, &owned);
        assert_eq!(names(&plan), vec![first]);
    }
}
