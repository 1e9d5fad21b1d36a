//! Order in which multi-cluster allocation policies are consulted.

use std::collections::BTreeMap;

use fleetplane_api::AllocationPolicy;
use rand::Rng;

/// Sort `policies` by ascending priority and shuffle each priority group by
/// weight.
///
/// Within a group the next policy is drawn with probability proportional
/// to its weight among those not yet drawn. Zero-weight policies never win a
/// draw; they follow the weighted ones in name order. The result depends
/// only on the input and the state of `rng`, so a seeded generator gives a
/// reproducible order.
pub fn order_policies<R: Rng>(
    policies: Vec<AllocationPolicy>,
    rng: &mut R,
) -> Vec<AllocationPolicy> {
    let mut groups: BTreeMap<u32, Vec<AllocationPolicy>> = BTreeMap::new();
    for policy in policies {
        groups.entry(policy.spec.priority).or_default().push(policy);
    }

    let mut ordered = Vec::new();
    for (_, mut group) in groups {
        // Fixed starting order so the draw sequence does not depend on how
        // the store listed them.
        group.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        let (mut weighted, unweighted): (Vec<_>, Vec<_>) =
            group.into_iter().partition(|p| p.spec.weight > 0);

        while !weighted.is_empty() {
            let total: u64 = weighted.iter().map(|p| u64::from(p.spec.weight)).sum();
            let mut pick = rng.random_range(0..total);
            let mut index = weighted.len() - 1;
            for (i, policy) in weighted.iter().enumerate() {
                let weight = u64::from(policy.spec.weight);
                if pick < weight {
                    index = i;
                    break;
                }
                pick -= weight;
            }
            ordered.push(weighted.remove(index));
        }
        ordered.extend(unweighted);
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetplane_testing::allocation_policy;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn names(list: &[AllocationPolicy]) -> Vec<&str> {
        list.iter().map(|p| p.metadata.name.as_str()).collect()
    }

    #[test]
    fn test_priority_groups_in_order() {
        let policies = vec![
            allocation_policy("late", "c3", 3, 10, None),
            allocation_policy("first", "c1", 1, 10, None),
            allocation_policy("middle", "c2", 2, 10, None),
        ];
        let mut rng = StdRng::seed_from_u64(7);
        let ordered = order_policies(policies, &mut rng);
        assert_eq!(names(&ordered), vec!["first", "middle", "late"]);
    }

    #[test]
    fn test_zero_weight_goes_last() {
        let policies = vec![
            allocation_policy("zero-b", "c1", 1, 0, None),
            allocation_policy("zero-a", "c2", 1, 0, None),
            allocation_policy("weighted", "c3", 1, 1, None),
        ];
        let mut rng = StdRng::seed_from_u64(1);
        let ordered = order_policies(policies, &mut rng);
        assert_eq!(names(&ordered), vec!["weighted", "zero-a", "zero-b"]);
    }

    #[test]
    fn test_same_seed_same_order() {
        let policies: Vec<_> = (0..6)
            .map(|i| allocation_policy(&format!("p{i}"), "c", 1, i + 1, None))
            .collect();
        let a = order_policies(policies.clone(), &mut StdRng::seed_from_u64(42));
        let b = order_policies(policies, &mut StdRng::seed_from_u64(42));
        assert_eq!(names(&a), names(&b));
    }

    #[test]
    fn test_heavier_weight_usually_first() {
        let policies = vec![
            allocation_policy("heavy", "c1", 1, 99, None),
            allocation_policy("light", "c2", 1, 1, None),
        ];
        let mut rng = StdRng::seed_from_u64(3);
        let heavy_first = (0..200)
            .filter(|_| order_policies(policies.clone(), &mut rng)[0].metadata.name == "heavy")
            .count();
        assert!(heavy_first > 180, "heavy first {heavy_first} of 200");
    }
}
