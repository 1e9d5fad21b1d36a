//! Types shared across kinds: scheduling, int-or-percent budgets, counters
//! and lists.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Upper bound on a list's capacity.
pub const MAX_LIST_CAPACITY: i64 = 1000;

// =============================================================================
// Scheduling
// =============================================================================

/// Placement preference for game servers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchedulingStrategy {
    /// Co-locate on as few nodes as possible.
    #[default]
    Packed,

    /// Spread across nodes.
    Distributed,
}

// =============================================================================
// Int or percent
// =============================================================================

/// An absolute count or a percentage of some total, written as `3` or `"25%"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntOrPercent {
    Int(u32),
    Percent(u32),
}

impl IntOrPercent {
    /// Resolve against `total`. Percentages round up or down as asked.
    pub fn resolve(&self, total: u32, round_up: bool) -> u32 {
        match *self {
            IntOrPercent::Int(n) => n,
            IntOrPercent::Percent(p) => {
                let scaled = u64::from(total) * u64::from(p);
                let value = if round_up {
                    scaled.div_ceil(100)
                } else {
                    scaled / 100
                };
                u32::try_from(value).unwrap_or(u32::MAX)
            }
        }
    }
}

impl Default for IntOrPercent {
    fn default() -> Self {
        IntOrPercent::Percent(25)
    }
}

impl fmt::Display for IntOrPercent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntOrPercent::Int(n) => write!(f, "{n}"),
            IntOrPercent::Percent(p) => write!(f, "{p}%"),
        }
    }
}

impl std::str::FromStr for IntOrPercent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(pct) = s.strip_suffix('%') {
            let value = pct
                .trim()
                .parse::<u32>()
                .map_err(|_| format!("invalid percentage '{s}'"))?;
            if value > 100 {
                return Err(format!("percentage '{s}' exceeds 100%"));
            }
            return Ok(IntOrPercent::Percent(value));
        }
        s.parse::<u32>()
            .map(IntOrPercent::Int)
            .map_err(|_| format!("expected an integer or percentage, got '{s}'"))
    }
}

impl Serialize for IntOrPercent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            IntOrPercent::Int(n) => serializer.serialize_u32(*n),
            IntOrPercent::Percent(_) => serializer.collect_str(self),
        }
    }
}

impl<'de> Deserialize<'de> for IntOrPercent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(u32),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Int(n) => Ok(IntOrPercent::Int(n)),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

// =============================================================================
// Counters and lists
// =============================================================================

/// A named integer with a ceiling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterStatus {
    #[serde(default)]
    pub count: i64,
    #[serde(default)]
    pub capacity: i64,
}

impl CounterStatus {
    pub fn available(&self) -> i64 {
        (self.capacity - self.count).max(0)
    }
}

/// A named set of strings with a size ceiling. Order is insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListStatus {
    #[serde(default)]
    pub capacity: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl ListStatus {
    pub fn available(&self) -> i64 {
        (self.capacity - self.values.len() as i64).max(0)
    }

    pub fn contains(&self, value: &str) -> bool {
        self.values.iter().any(|v| v == value)
    }
}

/// Rollup of one counter or list across many game servers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedStatus {
    pub allocated_count: i64,
    pub allocated_capacity: i64,
    pub count: i64,
    pub capacity: i64,
}

impl AggregatedStatus {
    /// Add one game server's contribution.
    pub fn add(&mut self, count: i64, capacity: i64, allocated: bool) {
        self.count = self.count.saturating_add(count);
        self.capacity = self.capacity.saturating_add(capacity);
        if allocated {
            self.allocated_count = self.allocated_count.saturating_add(count);
            self.allocated_capacity = self.allocated_capacity.saturating_add(capacity);
        }
    }

    /// Merge another rollup into this one.
    pub fn merge(&mut self, other: &AggregatedStatus) {
        self.allocated_count = self.allocated_count.saturating_add(other.allocated_count);
        self.allocated_capacity = self.allocated_capacity.saturating_add(other.allocated_capacity);
        self.count = self.count.saturating_add(other.count);
        self.capacity = self.capacity.saturating_add(other.capacity);
    }
}

/// Merge per-name rollups.
pub fn merge_aggregates(
    into: &mut BTreeMap<String, AggregatedStatus>,
    from: &BTreeMap<String, AggregatedStatus>,
) {
    for (name, status) in from {
        into.entry(name.clone()).or_default().merge(status);
    }
}

/// Rejected counter or list mutation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MutationError {
    #[error("counter '{0}' not found")]
    UnknownCounter(String),

    #[error("list '{0}' not found")]
    UnknownList(String),

    #[error("counter '{name}': count {count} + {amount} exceeds capacity {capacity}")]
    CounterOverflow {
        name: String,
        count: i64,
        amount: i64,
        capacity: i64,
    },

    #[error("counter '{name}': cannot decrement {amount} below zero (count {count})")]
    CounterUnderflow {
        name: String,
        count: i64,
        amount: i64,
    },

    #[error("'{name}': invalid capacity {capacity}")]
    InvalidCapacity { name: String, capacity: i64 },

    #[error("'{name}': amount must be positive, got {amount}")]
    InvalidAmount { name: String, amount: i64 },

    #[error("list '{name}' is at capacity {capacity}")]
    ListFull { name: String, capacity: i64 },

    #[error("list '{name}' already contains '{value}'")]
    DuplicateValue { name: String, value: String },
}

/// Add `amount` to a counter without passing its capacity.
pub fn increment_counter(
    counters: &mut BTreeMap<String, CounterStatus>,
    name: &str,
    amount: i64,
) -> Result<(), MutationError> {
    if amount < 0 {
        return Err(MutationError::InvalidAmount {
            name: name.to_string(),
            amount,
        });
    }
    let counter = counters
        .get_mut(name)
        .ok_or_else(|| MutationError::UnknownCounter(name.to_string()))?;
    let fits = counter
        .count
        .checked_add(amount)
        .is_some_and(|total| total <= counter.capacity);
    if !fits {
        return Err(MutationError::CounterOverflow {
            name: name.to_string(),
            count: counter.count,
            amount,
            capacity: counter.capacity,
        });
    }
    counter.count += amount;
    Ok(())
}

/// Subtract `amount` from a counter without going below zero.
pub fn decrement_counter(
    counters: &mut BTreeMap<String, CounterStatus>,
    name: &str,
    amount: i64,
) -> Result<(), MutationError> {
    if amount < 0 {
        return Err(MutationError::InvalidAmount {
            name: name.to_string(),
            amount,
        });
    }
    let counter = counters
        .get_mut(name)
        .ok_or_else(|| MutationError::UnknownCounter(name.to_string()))?;
    if amount > counter.count {
        return Err(MutationError::CounterUnderflow {
            name: name.to_string(),
            count: counter.count,
            amount,
        });
    }
    counter.count -= amount;
    Ok(())
}

/// Set a counter's count directly, within `[0, capacity]`.
pub fn set_counter_count(
    counters: &mut BTreeMap<String, CounterStatus>,
    name: &str,
    count: i64,
) -> Result<(), MutationError> {
    let counter = counters
        .get_mut(name)
        .ok_or_else(|| MutationError::UnknownCounter(name.to_string()))?;
    if count < 0 || count > counter.capacity {
        return Err(MutationError::InvalidAmount {
            name: name.to_string(),
            amount: count,
        });
    }
    counter.count = count;
    Ok(())
}

/// Change a counter's capacity; a count above the new capacity is clamped.
pub fn set_counter_capacity(
    counters: &mut BTreeMap<String, CounterStatus>,
    name: &str,
    capacity: i64,
) -> Result<(), MutationError> {
    if capacity < 0 {
        return Err(MutationError::InvalidCapacity {
            name: name.to_string(),
            capacity,
        });
    }
    let counter = counters
        .get_mut(name)
        .ok_or_else(|| MutationError::UnknownCounter(name.to_string()))?;
    counter.capacity = capacity;
    counter.count = counter.count.min(capacity);
    Ok(())
}

/// Change a list's capacity; values past the new capacity are dropped from
/// the end.
pub fn set_list_capacity(
    lists: &mut BTreeMap<String, ListStatus>,
    name: &str,
    capacity: i64,
) -> Result<(), MutationError> {
    if !(0..=MAX_LIST_CAPACITY).contains(&capacity) {
        return Err(MutationError::InvalidCapacity {
            name: name.to_string(),
            capacity,
        });
    }
    let list = lists
        .get_mut(name)
        .ok_or_else(|| MutationError::UnknownList(name.to_string()))?;
    list.capacity = capacity;
    list.values.truncate(capacity as usize);
    Ok(())
}

/// Append a value. A value already present is an error when
/// `reject_duplicates` is set and a no-op otherwise.
pub fn append_list_value(
    lists: &mut BTreeMap<String, ListStatus>,
    name: &str,
    value: &str,
    reject_duplicates: bool,
) -> Result<(), MutationError> {
    let list = lists
        .get_mut(name)
        .ok_or_else(|| MutationError::UnknownList(name.to_string()))?;
    if list.contains(value) {
        if reject_duplicates {
            return Err(MutationError::DuplicateValue {
                name: name.to_string(),
                value: value.to_string(),
            });
        }
        return Ok(());
    }
    if list.values.len() as i64 >= list.capacity {
        return Err(MutationError::ListFull {
            name: name.to_string(),
            capacity: list.capacity,
        });
    }
    list.values.push(value.to_string());
    Ok(())
}

/// Remove a value; absent values are ignored.
pub fn delete_list_value(
    lists: &mut BTreeMap<String, ListStatus>,
    name: &str,
    value: &str,
) -> Result<(), MutationError> {
    let list = lists
        .get_mut(name)
        .ok_or_else(|| MutationError::UnknownList(name.to_string()))?;
    list.values.retain(|v| v != value);
    Ok(())
}
