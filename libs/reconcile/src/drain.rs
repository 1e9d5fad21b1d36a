//! Ordering of surplus instances for deletion.

/// Which instances go first when a set shrinks. Lower drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DrainPriority {
    /// Failed to come up (pod creation errors).
    Failed = 0,

    /// Still starting; never served a player.
    NotReady = 1,

    /// Ready and idle.
    Ready = 2,
}

/// Which node's instances are removed first among equally ready ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePreference {
    /// Instances on nodes hosting the most instances go first.
    MostPacked,

    /// Instances on nodes hosting the fewest instances go first.
    LeastPacked,
}

/// Sort key of one drain candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainKey {
    pub priority: DrainPriority,

    /// Instances currently hosted on the candidate's node.
    pub node_load: u32,

    /// Stable tie-break.
    pub id: String,
}

/// Order candidates for deletion: priority, then node load in the preferred
/// direction, then id. The result is deterministic for identical inputs.
pub fn select_for_drain<T, F>(candidates: Vec<T>, preference: NodePreference, key: F) -> Vec<T>
where
    F: Fn(&T) -> DrainKey,
{
    let mut keyed: Vec<(DrainKey, T)> = candidates.into_iter().map(|c| (key(&c), c)).collect();

    keyed.sort_by(|(a, _), (b, _)| {
        let load = match preference {
            NodePreference::MostPacked => b.node_load.cmp(&a.node_load),
            NodePreference::LeastPacked => a.node_load.cmp(&b.node_load),
        };
        a.priority
            .cmp(&b.priority)
            .then(load)
            .then_with(|| a.id.cmp(&b.id))
    });

    keyed.into_iter().map(|(_, c)| c).collect()
}
