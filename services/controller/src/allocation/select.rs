//! Candidate ordering for one allocation request.

use std::cmp::Ordering;
use std::collections::HashMap;

use fleetplane_api::{AllocationSpec, GameServer, GameServerState, SchedulingStrategy, SortOrder};

/// Allocated game servers per node, the load measure used for packing.
pub fn allocated_per_node<'a>(
    game_servers: impl IntoIterator<Item = &'a GameServer>,
) -> HashMap<String, u32> {
    let mut load = HashMap::new();
    for gs in game_servers {
        if gs.state() == GameServerState::Allocated && !gs.status.node_name.is_empty() {
            *load.entry(gs.status.node_name.clone()).or_default() += 1;
        }
    }
    load
}

/// Candidates for `spec`, best first.
///
/// Order: preferred selector group (earlier group wins, unmatched last),
/// then node load (most loaded first when packed, least loaded first when
/// distributed), then each priority in turn, then name.
pub fn order_candidates(
    spec: &AllocationSpec,
    game_servers: Vec<GameServer>,
    load: &HashMap<String, u32>,
) -> Vec<GameServer> {
    let mut keyed: Vec<(usize, u32, GameServer)> = game_servers
        .into_iter()
        .filter(|gs| spec.required.matches(gs))
        .map(|gs| {
            let group = spec
                .preferred
                .iter()
                .position(|sel| sel.matches(&gs))
                .unwrap_or(spec.preferred.len());
            let node_load = load.get(&gs.status.node_name).copied().unwrap_or(0);
            (group, node_load, gs)
        })
        .collect();

    keyed.sort_by(|(ga, la, a), (gb, lb, b)| {
        ga.cmp(gb)
            .then_with(|| match spec.scheduling {
                SchedulingStrategy::Packed => lb.cmp(la),
                SchedulingStrategy::Distributed => la.cmp(lb),
            })
            .then_with(|| by_priorities(spec, a, b))
            .then_with(|| a.metadata.name.cmp(&b.metadata.name))
    });
    keyed.into_iter().map(|(_, _, gs)| gs).collect()
}

fn by_priorities(spec: &AllocationSpec, a: &GameServer, b: &GameServer) -> Ordering {
    for priority in &spec.priorities {
        let ordering = match (priority.available(a), priority.available(b)) {
            (Some(x), Some(y)) => match priority.order {
                SortOrder::Ascending => x.cmp(&y),
                SortOrder::Descending => y.cmp(&x),
            },
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetplane_api::{GameServerSelector, Priority, PriorityKind};
    use fleetplane_testing::GameServerBuilder;

    fn names(list: &[GameServer]) -> Vec<&str> {
        list.iter().map(|gs| gs.metadata.name.as_str()).collect()
    }

    fn pool() -> Vec<GameServer> {
        vec![
            GameServerBuilder::new("a").ready_on("n1").label("app", "f").build(),
            GameServerBuilder::new("b").ready_on("n2").label("app", "f").build(),
            GameServerBuilder::new("c")
                .ready_on("n2")
                .label("app", "f")
                .label("map", "dust")
                .build(),
            GameServerBuilder::new("busy")
                .ready_on("n2")
                .label("app", "f")
                .state(GameServerState::Allocated)
                .build(),
            GameServerBuilder::new("other").ready_on("n1").label("app", "g").build(),
        ]
    }

    #[test]
    fn test_required_filters_and_packed_prefers_loaded_node() {
        let spec = AllocationSpec {
            required: GameServerSelector::with_labels([("app", "f")]),
            ..Default::default()
        };
        let pool = pool();
        let load = allocated_per_node(&pool);
        let ordered = order_candidates(&spec, pool, &load);
        assert_eq!(names(&ordered), vec!["b", "c", "a"]);
    }

    #[test]
    fn test_distributed_prefers_idle_node() {
        let spec = AllocationSpec {
            required: GameServerSelector::with_labels([("app", "f")]),
            scheduling: SchedulingStrategy::Distributed,
            ..Default::default()
        };
        let pool = pool();
        let load = allocated_per_node(&pool);
        let ordered = order_candidates(&spec, pool, &load);
        assert_eq!(names(&ordered)[0], "a");
    }

    #[test]
    fn test_preferred_group_beats_node_load() {
        let spec = AllocationSpec {
            required: GameServerSelector::with_labels([("app", "f")]),
            preferred: vec![GameServerSelector::with_labels([("map", "dust")])],
            ..Default::default()
        };
        let pool = pool();
        let load = allocated_per_node(&pool);
        let ordered = order_candidates(&spec, pool, &load);
        assert_eq!(names(&ordered), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_priorities_break_ties() {
        let mut spec = AllocationSpec {
            priorities: vec![Priority {
                kind: PriorityKind::Counter,
                key: "rooms".into(),
                order: SortOrder::Ascending,
            }],
            ..Default::default()
        };
        let pool = vec![
            GameServerBuilder::new("roomy").ready_on("n1").counter("rooms", 0, 10).build(),
            GameServerBuilder::new("tight").ready_on("n1").counter("rooms", 8, 10).build(),
            GameServerBuilder::new("none").ready_on("n1").build(),
        ];
        let ordered = order_candidates(&spec, pool.clone(), &HashMap::new());
        assert_eq!(names(&ordered), vec!["tight", "roomy", "none"]);

        spec.priorities[0].order = SortOrder::Descending;
        let ordered = order_candidates(&spec, pool, &HashMap::new());
        assert_eq!(names(&ordered), vec!["roomy", "tight", "none"]);
    }
}
