//! Allocation requests and their results.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::common::{
    append_list_value, decrement_counter, delete_list_value, increment_counter,
    set_counter_capacity, set_list_capacity, CounterStatus, ListStatus, MutationError,
    SchedulingStrategy,
};
use crate::gameserver::{GameServer, GameServerState, StatusPort};
use crate::meta::ObjectMeta;
use crate::selector::LabelSelector;

// =============================================================================
// Selectors
// =============================================================================

/// Bounds on a named counter. A `max_*` of zero means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSelector {
    #[serde(default)]
    pub min_count: i64,
    #[serde(default)]
    pub max_count: i64,
    #[serde(default)]
    pub min_available: i64,
    #[serde(default)]
    pub max_available: i64,
}

impl CounterSelector {
    fn matches(&self, counter: &CounterStatus) -> bool {
        let available = counter.available();
        counter.count >= self.min_count
            && (self.max_count == 0 || counter.count <= self.max_count)
            && available >= self.min_available
            && (self.max_available == 0 || available <= self.max_available)
    }

    fn validate(&self, name: &str) -> Result<(), String> {
        if self.min_count < 0 || self.max_count < 0 || self.min_available < 0 || self.max_available < 0 {
            return Err(format!("counter selector '{name}' has a negative bound"));
        }
        if self.max_count != 0 && self.min_count > self.max_count {
            return Err(format!("counter selector '{name}': min_count > max_count"));
        }
        if self.max_available != 0 && self.min_available > self.max_available {
            return Err(format!("counter selector '{name}': min_available > max_available"));
        }
        Ok(())
    }
}

/// Bounds on a named list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contains_value: Option<String>,
    #[serde(default)]
    pub min_available: i64,
    #[serde(default)]
    pub max_available: i64,
}

impl ListSelector {
    fn matches(&self, list: &ListStatus) -> bool {
        let available = list.available();
        self.contains_value
            .as_deref()
            .is_none_or(|v| list.contains(v))
            && available >= self.min_available
            && (self.max_available == 0 || available <= self.max_available)
    }

    fn validate(&self, name: &str) -> Result<(), String> {
        if self.min_available < 0 || self.max_available < 0 {
            return Err(format!("list selector '{name}' has a negative bound"));
        }
        if self.max_available != 0 && self.min_available > self.max_available {
            return Err(format!("list selector '{name}': min_available > max_available"));
        }
        Ok(())
    }
}

/// One preferred or required filter over game servers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameServerSelector {
    #[serde(flatten)]
    pub labels: LabelSelector,

    /// `Ready` (default) or `Allocated` to re-allocate a running match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_server_state: Option<GameServerState>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, CounterSelector>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub lists: BTreeMap<String, ListSelector>,
}

impl GameServerSelector {
    pub fn with_labels<K: Into<String>, V: Into<String>>(
        labels: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        Self {
            labels: LabelSelector::from_labels(labels),
            ..Default::default()
        }
    }

    /// State a candidate has to be in.
    pub fn state(&self) -> GameServerState {
        self.game_server_state.unwrap_or(GameServerState::Ready)
    }

    pub fn matches(&self, gs: &GameServer) -> bool {
        gs.state() == self.state()
            && self.labels.matches(&gs.metadata.labels)
            && self.counters.iter().all(|(name, sel)| {
                gs.status.counters.get(name).is_some_and(|c| sel.matches(c))
            })
            && self
                .lists
                .iter()
                .all(|(name, sel)| gs.status.lists.get(name).is_some_and(|l| sel.matches(l)))
    }

    pub fn validate(&self) -> Result<(), String> {
        self.labels.validate()?;
        match self.state() {
            GameServerState::Ready | GameServerState::Allocated => {}
            other => return Err(format!("cannot select game servers in state {other}")),
        }
        for (name, sel) in &self.counters {
            sel.validate(name)?;
        }
        for (name, sel) in &self.lists {
            sel.validate(name)?;
        }
        Ok(())
    }
}

// =============================================================================
// Priorities and mutations
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriorityKind {
    Counter,
    List,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Tie-break on the available capacity of a counter or list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Priority {
    #[serde(rename = "type")]
    pub kind: PriorityKind,
    pub key: String,
    #[serde(default)]
    pub order: SortOrder,
}

impl Priority {
    /// Available capacity of the named counter or list; missing sorts last.
    pub fn available(&self, gs: &GameServer) -> Option<i64> {
        match self.kind {
            PriorityKind::Counter => gs.status.counters.get(&self.key).map(CounterStatus::available),
            PriorityKind::List => gs.status.lists.get(&self.key).map(ListStatus::available),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterOp {
    Increment,
    Decrement,
}

/// Counter change applied together with the allocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<CounterOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<i64>,
}

impl CounterAction {
    fn validate(&self, name: &str) -> Result<(), String> {
        match (self.action, self.amount) {
            (Some(_), None) => Err(format!("counter action '{name}' needs an amount")),
            (None, Some(_)) => Err(format!("counter action '{name}' needs an action")),
            (_, Some(amount)) if amount <= 0 => {
                Err(format!("counter action '{name}' amount must be positive"))
            }
            _ if self.capacity.is_some_and(|c| c < 0) => {
                Err(format!("counter action '{name}' capacity must not be negative"))
            }
            _ => Ok(()),
        }
    }

    /// Capacity first, then the count change.
    pub fn apply(
        &self,
        name: &str,
        counters: &mut BTreeMap<String, CounterStatus>,
    ) -> Result<(), MutationError> {
        if let Some(capacity) = self.capacity {
            set_counter_capacity(counters, name, capacity)?;
        }
        match (self.action, self.amount) {
            (Some(CounterOp::Increment), Some(amount)) => increment_counter(counters, name, amount),
            (Some(CounterOp::Decrement), Some(amount)) => decrement_counter(counters, name, amount),
            _ => Ok(()),
        }
    }
}

/// List change applied together with the allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListAction {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add_values: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delete_values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<i64>,
    /// Fail instead of ignoring values that are already present.
    #[serde(default)]
    pub reject_duplicates: bool,
}

impl ListAction {
    fn validate(&self, name: &str) -> Result<(), String> {
        if self
            .capacity
            .is_some_and(|c| !(0..=crate::common::MAX_LIST_CAPACITY).contains(&c))
        {
            return Err(format!("list action '{name}' capacity out of range"));
        }
        if self.add_values.iter().any(|v| v.is_empty()) {
            return Err(format!("list action '{name}' adds an empty value"));
        }
        Ok(())
    }

    /// Capacity, then deletions, then additions.
    pub fn apply(
        &self,
        name: &str,
        lists: &mut BTreeMap<String, ListStatus>,
    ) -> Result<(), MutationError> {
        if let Some(capacity) = self.capacity {
            set_list_capacity(lists, name, capacity)?;
        }
        for value in &self.delete_values {
            delete_list_value(lists, name, value)?;
        }
        for value in &self.add_values {
            append_list_value(lists, name, value, self.reject_duplicates)?;
        }
        Ok(())
    }
}

/// Labels and annotations written with the allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaPatch {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl MetaPatch {
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.annotations.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiClusterSetting {
    #[serde(default)]
    pub enabled: bool,

    /// Chooses the allocation policies to consult.
    #[serde(default)]
    pub policy_selector: LabelSelector,
}

// =============================================================================
// Request and result
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationSpec {
    #[serde(default)]
    pub required: GameServerSelector,

    /// Tried in order; earlier entries win.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preferred: Vec<GameServerSelector>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub priorities: Vec<Priority>,

    #[serde(default)]
    pub scheduling: SchedulingStrategy,

    #[serde(default, skip_serializing_if = "MetaPatch::is_empty")]
    pub metadata: MetaPatch,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, CounterAction>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub lists: BTreeMap<String, ListAction>,

    #[serde(default)]
    pub multi_cluster: MultiClusterSetting,
}

impl AllocationSpec {
    /// Request-level checks; a failure rejects the request outright.
    pub fn validate(&self) -> Result<(), String> {
        self.required.validate()?;
        for selector in &self.preferred {
            selector.validate()?;
        }
        for (name, action) in &self.counters {
            action.validate(name)?;
        }
        for (name, action) in &self.lists {
            action.validate(name)?;
        }
        Ok(())
    }

    /// Apply every mutation to a copy-on-write candidate. Either all apply
    /// or the candidate is left unusable and the caller drops it.
    pub fn apply_mutations(&self, gs: &mut GameServer) -> Result<(), MutationError> {
        for (name, action) in &self.counters {
            action.apply(name, &mut gs.status.counters)?;
        }
        for (name, action) in &self.lists {
            action.apply(name, &mut gs.status.lists)?;
        }
        gs.metadata.labels.extend(self.metadata.labels.clone());
        gs.metadata
            .annotations
            .extend(self.metadata.annotations.clone());
        Ok(())
    }
}

/// Terminal outcome of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationState {
    Allocated,
    /// No candidate matched.
    UnAllocated,
    /// Candidates existed but every claim lost a race.
    Contention,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationStatus {
    pub state: AllocationState,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub game_server_name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<StatusPort>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,

    /// Cluster that served the request.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,

    #[serde(default, skip_serializing_if = "MetaPatch::is_empty")]
    pub metadata: MetaPatch,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, CounterStatus>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub lists: BTreeMap<String, ListStatus>,
}

impl AllocationStatus {
    pub fn unallocated() -> Self {
        Self::empty(AllocationState::UnAllocated)
    }

    pub fn contention() -> Self {
        Self::empty(AllocationState::Contention)
    }

    fn empty(state: AllocationState) -> Self {
        Self {
            state,
            game_server_name: String::new(),
            ports: Vec::new(),
            address: String::new(),
            node_name: String::new(),
            source: String::new(),
            metadata: MetaPatch::default(),
            counters: BTreeMap::new(),
            lists: BTreeMap::new(),
        }
    }

    /// Result describing an allocated game server.
    pub fn allocated(gs: &GameServer, source: &str) -> Self {
        Self {
            state: AllocationState::Allocated,
            game_server_name: gs.metadata.name.clone(),
            ports: gs.status.ports.clone(),
            address: gs.status.address.clone(),
            node_name: gs.status.node_name.clone(),
            source: source.to_string(),
            metadata: MetaPatch {
                labels: gs.metadata.labels.clone(),
                annotations: gs.metadata.annotations.clone(),
            },
            counters: gs.status.counters.clone(),
            lists: gs.status.lists.clone(),
        }
    }
}

/// An allocation request; `status` is filled in by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameServerAllocation {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: AllocationSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AllocationStatus>,
}

impl GameServerAllocation {
    pub fn new(namespace: impl Into<String>, spec: AllocationSpec) -> Self {
        Self {
            metadata: ObjectMeta::named(namespace, ""),
            spec,
            status: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gameserver::{ContainerSpec, GameServerSpec, GameServerTemplate};

    fn ready_server(labels: &[(&str, &str)]) -> GameServer {
        let template = GameServerTemplate {
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            annotations: BTreeMap::new(),
            spec: GameServerSpec {
                container: ContainerSpec {
                    image: "game:1".into(),
                    ..Default::default()
                },
                counters: BTreeMap::from([(
                    "rooms".to_string(),
                    CounterStatus {
                        count: 2,
                        capacity: 5,
                    },
                )]),
                lists: BTreeMap::from([(
                    "players".to_string(),
                    ListStatus {
                        capacity: 3,
                        values: vec!["p1".into()],
                    },
                )]),
                ..Default::default()
            },
        };
        let mut gs = GameServer::from_template(ObjectMeta::named("default", "gs"), &template);
        gs.status.state = GameServerState::Ready;
        gs
    }

    #[test]
    fn test_selector_state_defaults_to_ready() {
        let gs = ready_server(&[("app", "f")]);
        let sel = GameServerSelector::with_labels([("app", "f")]);
        assert!(sel.matches(&gs));

        let mut allocated = gs.clone();
        allocated.status.state = GameServerState::Allocated;
        assert!(!sel.matches(&allocated));

        let realloc = GameServerSelector {
            game_server_state: Some(GameServerState::Allocated),
            ..sel
        };
        assert!(realloc.matches(&allocated));
    }

    #[test]
    fn test_counter_and_list_selectors() {
        let gs = ready_server(&[]);
        let mut sel = GameServerSelector::default();
        sel.counters.insert(
            "rooms".into(),
            CounterSelector {
                min_available: 3,
                ..Default::default()
            },
        );
        assert!(sel.matches(&gs));
        sel.counters.get_mut("rooms").unwrap().min_available = 4;
        assert!(!sel.matches(&gs));

        let mut by_list = GameServerSelector::default();
        by_list.lists.insert(
            "players".into(),
            ListSelector {
                contains_value: Some("p1".into()),
                ..Default::default()
            },
        );
        assert!(by_list.matches(&gs));
        by_list.lists.get_mut("players").unwrap().contains_value = Some("p9".into());
        assert!(!by_list.matches(&gs));
    }

    #[test]
    fn test_validate_rejects_contradictions() {
        let mut spec = AllocationSpec::default();
        spec.required.counters.insert(
            "rooms".into(),
            CounterSelector {
                min_count: 5,
                max_count: 2,
                ..Default::default()
            },
        );
        assert!(spec.validate().is_err());

        let spec = AllocationSpec {
            required: GameServerSelector {
                game_server_state: Some(GameServerState::Shutdown),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_apply_mutations_all_or_error() {
        let mut gs = ready_server(&[]);
        let mut spec = AllocationSpec::default();
        spec.counters.insert(
            "rooms".into(),
            CounterAction {
                action: Some(CounterOp::Increment),
                amount: Some(2),
                capacity: None,
            },
        );
        spec.lists.insert(
            "players".into(),
            ListAction {
                add_values: vec!["p2".into()],
                ..Default::default()
            },
        );
        spec.metadata.labels.insert("match".into(), "42".into());

        spec.apply_mutations(&mut gs).unwrap();
        assert_eq!(gs.status.counters["rooms"].count, 4);
        assert_eq!(gs.status.lists["players"].values, vec!["p1", "p2"]);
        assert_eq!(gs.metadata.label("match"), Some("42"));

        spec.counters.get_mut("rooms").unwrap().amount = Some(5);
        assert!(matches!(
            spec.apply_mutations(&mut gs),
            Err(MutationError::CounterOverflow { .. })
        ));
    }

    #[test]
    fn test_selector_flattens_labels_on_the_wire() {
        let sel: GameServerSelector =
            serde_json::from_str(r#"{"match_labels":{"app":"f"},"game_server_state":"Ready"}"#)
                .unwrap();
        assert_eq!(sel.labels.match_labels["app"], "f");
    }
}
