//! Host port bookkeeping.
//!
//! Game servers expose host ports drawn from an operator-configured
//! inclusive range. A host port only has to be unique on the node that
//! runs it. [`PortTable`] maps every port in the range to at most one
//! owner, reserves batches all-or-nothing, and rebuilds itself from
//! recorded assignments after a restart, reporting collisions instead of
//! silently overwriting them. [`NodePorts`] keeps one such table per node.
//!
//! Neither type has interior locking; the owning service wraps it in a
//! single mutex.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Port bookkeeping errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PortError {
    /// Range bounds are reversed or zero.
    #[error("invalid port range: {0}")]
    InvalidRange(String),

    /// Not enough free ports for the request.
    #[error("port range {range} exhausted: requested {requested}, {available} free")]
    Exhausted {
        range: PortRange,
        requested: usize,
        available: usize,
    },

    /// A port is outside the managed range.
    #[error("port {port} outside range {range}")]
    OutOfRange { port: u16, range: PortRange },

    /// A port already belongs to someone else.
    #[error("port {port} already held by {holder}")]
    Collision { port: u16, holder: String },
}

// ============================================================================
// Port range
// ============================================================================

/// Inclusive range of host ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawRange", into = "RawRange")]
pub struct PortRange {
    min: u16,
    max: u16,
}

/// Wire form: either `{min, max}` or the string `"min-max"`.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawRange {
    Bounds { min: u16, max: u16 },
    Text(String),
}

impl TryFrom<RawRange> for PortRange {
    type Error = PortError;

    fn try_from(raw: RawRange) -> Result<Self, Self::Error> {
        match raw {
            RawRange::Bounds { min, max } => PortRange::new(min, max),
            RawRange::Text(text) => text.parse(),
        }
    }
}

impl From<PortRange> for RawRange {
    fn from(range: PortRange) -> Self {
        RawRange::Bounds {
            min: range.min,
            max: range.max,
        }
    }
}

impl PortRange {
    pub fn new(min: u16, max: u16) -> Result<Self, PortError> {
        if min == 0 {
            return Err(PortError::InvalidRange("port 0 is not assignable".into()));
        }
        if min > max {
            return Err(PortError::InvalidRange(format!("{min} > {max}")));
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> u16 {
        self.min
    }

    pub fn max(&self) -> u16 {
        self.max
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.min..=self.max).contains(&port)
    }

    /// Number of ports in the range.
    pub fn size(&self) -> usize {
        usize::from(self.max - self.min) + 1
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            min: 7000,
            max: 8000,
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

impl FromStr for PortRange {
    type Err = PortError;

    /// Parses `min-max`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((min, max)) = s.split_once('-') else {
            return Err(PortError::InvalidRange(format!("expected MIN-MAX, got '{s}'")));
        };
        let parse = |v: &str| {
            v.trim()
                .parse::<u16>()
                .map_err(|_| PortError::InvalidRange(format!("'{v}' is not a port")))
        };
        Self::new(parse(min)?, parse(max)?)
    }
}

// ============================================================================
// Port table
// ============================================================================

/// Assignment of ports in a range to owners.
#[derive(Debug, Clone)]
pub struct PortTable<O> {
    range: PortRange,
    holders: BTreeMap<u16, O>,
    by_owner: HashMap<O, Vec<u16>>,
    /// Next port to try; reservations walk the range round-robin so a port
    /// just released is the last to be handed out again.
    cursor: u16,
}

impl<O> PortTable<O>
where
    O: Clone + Eq + Hash + fmt::Display,
{
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            holders: BTreeMap::new(),
            by_owner: HashMap::new(),
            cursor: range.min,
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Ports currently held.
    pub fn used(&self) -> usize {
        self.holders.len()
    }

    /// Ports currently free.
    pub fn available(&self) -> usize {
        self.range.size() - self.holders.len()
    }

    pub fn holder(&self, port: u16) -> Option<&O> {
        self.holders.get(&port)
    }

    pub fn ports_of(&self, owner: &O) -> &[u16] {
        self.by_owner.get(owner).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Reserve `count` ports for `owner`, all or nothing.
    ///
    /// Reserving again for an owner that already holds exactly `count`
    /// ports returns the same ports.
    pub fn reserve(&mut self, owner: &O, count: usize) -> Result<Vec<u16>, PortError> {
        if let Some(held) = self.by_owner.get(owner) {
            if held.len() == count {
                return Ok(held.clone());
            }
            self.release(owner);
        }
        if count == 0 {
            return Ok(Vec::new());
        }
        if count > self.available() {
            return Err(PortError::Exhausted {
                range: self.range,
                requested: count,
                available: self.available(),
            });
        }

        let mut picked = Vec::with_capacity(count);
        let mut port = self.cursor;
        for _ in 0..self.range.size() {
            if !self.holders.contains_key(&port) {
                picked.push(port);
                if picked.len() == count {
                    break;
                }
            }
            port = self.next_port(port);
        }
        self.cursor = self.next_port(port);

        for p in &picked {
            self.holders.insert(*p, owner.clone());
        }
        self.by_owner.insert(owner.clone(), picked.clone());
        Ok(picked)
    }

    /// Record ports an owner is known to hold (recovery path).
    ///
    /// Fails without changing anything if any port is outside the range or
    /// held by another owner.
    pub fn claim(&mut self, owner: &O, ports: &[u16]) -> Result<(), PortError> {
        for port in ports {
            if !self.range.contains(*port) {
                return Err(PortError::OutOfRange {
                    port: *port,
                    range: self.range,
                });
            }
            if let Some(holder) = self.holders.get(port) {
                if holder != owner {
                    return Err(PortError::Collision {
                        port: *port,
                        holder: holder.to_string(),
                    });
                }
            }
        }

        let entry = self.by_owner.entry(owner.clone()).or_default();
        for port in ports {
            if self.holders.insert(*port, owner.clone()).is_none() {
                entry.push(*port);
            }
        }
        Ok(())
    }

    /// Free every port of `owner`; returns what was freed.
    pub fn release(&mut self, owner: &O) -> Vec<u16> {
        let ports = self.by_owner.remove(owner).unwrap_or_default();
        for port in &ports {
            self.holders.remove(port);
        }
        ports
    }

    fn next_port(&self, port: u16) -> u16 {
        if port >= self.range.max {
            self.range.min
        } else {
            port + 1
        }
    }
}

// ============================================================================
// Per-node tables
// ============================================================================

/// One [`PortTable`] per node, all over the same range.
///
/// Ports are reserved before the orchestrator has picked a node, so a fresh
/// reservation is parked on the first node (by name) with room for the
/// whole batch. [`NodePorts::bind`] later moves it to the node the owner
/// actually runs on. Parked reservations give way to bound ones.
#[derive(Debug, Clone)]
pub struct NodePorts<O> {
    range: PortRange,
    nodes: BTreeMap<String, PortTable<O>>,
    placed: HashMap<O, Placement>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Placement {
    node: String,
    bound: bool,
}

impl<O> NodePorts<O>
where
    O: Clone + Eq + Hash + fmt::Display,
{
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            nodes: BTreeMap::new(),
            placed: HashMap::new(),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Ports held across every node.
    pub fn used(&self) -> usize {
        self.nodes.values().map(PortTable::used).sum()
    }

    /// Ports free across every node.
    pub fn available(&self) -> usize {
        self.nodes.values().map(PortTable::available).sum()
    }

    pub fn holder(&self, node: &str, port: u16) -> Option<&O> {
        self.nodes.get(node).and_then(|t| t.holder(port))
    }

    /// Node whose table holds `owner`'s ports, and whether the owner is
    /// known to run there.
    pub fn node_of(&self, owner: &O) -> Option<(&str, bool)> {
        self.placed.get(owner).map(|p| (p.node.as_str(), p.bound))
    }

    pub fn ports_of(&self, owner: &O) -> &[u16] {
        self.placed
            .get(owner)
            .and_then(|p| self.nodes.get(&p.node))
            .map(|t| t.ports_of(owner))
            .unwrap_or(&[])
    }

    /// Track exactly the nodes in `names`.
    ///
    /// Parked reservations on a vanished node move to another node when one
    /// has room. Owners that end up nowhere are returned; their ports are
    /// forgotten.
    pub fn sync_nodes<I, S>(&mut self, names: I) -> Vec<O>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let wanted: BTreeSet<String> = names.into_iter().map(Into::into).collect();
        let range = self.range;
        for name in &wanted {
            self.nodes
                .entry(name.clone())
                .or_insert_with(|| PortTable::new(range));
        }
        let gone: Vec<String> = self
            .nodes
            .keys()
            .filter(|n| !wanted.contains(*n))
            .cloned()
            .collect();

        let mut dropped = Vec::new();
        for name in gone {
            let Some(table) = self.nodes.remove(&name) else {
                continue;
            };
            let owners: Vec<O> = self
                .placed
                .iter()
                .filter(|(_, p)| p.node == name)
                .map(|(o, _)| o.clone())
                .collect();
            for owner in owners {
                let parked = self.placed.remove(&owner).is_some_and(|p| !p.bound);
                if !parked || self.park(&owner, table.ports_of(&owner)).is_err() {
                    dropped.push(owner);
                }
            }
        }
        dropped
    }

    /// Reserve `count` ports for `owner`, all or nothing, on the first node
    /// with room. Asking again with the count already held returns the same
    /// ports.
    pub fn reserve(&mut self, owner: &O, count: usize) -> Result<Vec<u16>, PortError> {
        if self.placed.contains_key(owner) {
            let held = self.ports_of(owner);
            if held.len() == count {
                return Ok(held.to_vec());
            }
            self.release(owner);
        }
        if count == 0 {
            return Ok(Vec::new());
        }

        let Some((node, table)) = self
            .nodes
            .iter_mut()
            .find(|(_, t)| t.available() >= count)
        else {
            return Err(PortError::Exhausted {
                range: self.range,
                requested: count,
                available: self.nodes.values().map(PortTable::available).max().unwrap_or(0),
            });
        };
        let ports = table.reserve(owner, count)?;
        self.placed.insert(
            owner.clone(),
            Placement {
                node: node.clone(),
                bound: false,
            },
        );
        Ok(ports)
    }

    /// Pin `owner` to `node` holding exactly `ports`.
    ///
    /// Parked reservations on `node` that overlap are moved elsewhere; any
    /// that fit nowhere are dropped and returned. Fails without changing
    /// anything if a port is outside the range or held by an owner already
    /// bound to `node`.
    pub fn bind(&mut self, owner: &O, node: &str, ports: &[u16]) -> Result<Vec<O>, PortError> {
        if let Some(port) = ports.iter().find(|p| !self.range.contains(**p)) {
            return Err(PortError::OutOfRange {
                port: *port,
                range: self.range,
            });
        }

        let mut displaced = Vec::new();
        if let Some(table) = self.nodes.get(node) {
            for port in ports {
                let Some(holder) = table.holder(*port) else {
                    continue;
                };
                if holder == owner || displaced.contains(holder) {
                    continue;
                }
                if self.placed.get(holder).map_or(true, |p| p.bound) {
                    return Err(PortError::Collision {
                        port: *port,
                        holder: holder.to_string(),
                    });
                }
                displaced.push(holder.clone());
            }
        }

        let mut moved = Vec::with_capacity(displaced.len());
        for other in &displaced {
            moved.push((other.clone(), self.release(other)));
        }
        self.release(owner);
        let range = self.range;
        self.nodes
            .entry(node.to_string())
            .or_insert_with(|| PortTable::new(range))
            .claim(owner, ports)?;
        self.placed.insert(
            owner.clone(),
            Placement {
                node: node.to_string(),
                bound: true,
            },
        );

        let mut dropped = Vec::new();
        for (other, held) in moved {
            if self.park(&other, &held).is_err() {
                dropped.push(other);
            }
        }
        Ok(dropped)
    }

    /// Free every port of `owner`; returns what was freed.
    pub fn release(&mut self, owner: &O) -> Vec<u16> {
        match self.placed.remove(owner) {
            Some(p) => self
                .nodes
                .get_mut(&p.node)
                .map(|t| t.release(owner))
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// Build from recorded assignments.
    ///
    /// Bound claims (those with a node) are applied first, oldest first by
    /// `age`, then parked ones. A claim that collides with an earlier one,
    /// or that no node can take, is rejected as a whole and returned with
    /// the error.
    pub fn rebuild<A, I, N>(range: PortRange, nodes: N, claims: I) -> (Self, Vec<(O, PortError)>)
    where
        A: Ord,
        I: IntoIterator<Item = (O, A, Option<String>, Vec<u16>)>,
        N: IntoIterator<Item = String>,
    {
        let mut claims: Vec<_> = claims.into_iter().collect();
        claims.sort_by(|a, b| a.2.is_none().cmp(&b.2.is_none()).then_with(|| a.1.cmp(&b.1)));

        let mut pool = Self::new(range);
        pool.sync_nodes(nodes);
        let mut rejected = Vec::new();
        for (owner, _, node, ports) in claims {
            let result = match node {
                Some(node) => pool.bind(&owner, &node, &ports).map(|_| ()),
                None => pool.park(&owner, &ports),
            };
            if let Err(e) = result {
                rejected.push((owner, e));
            }
        }
        (pool, rejected)
    }

    /// Record `ports` as a parked reservation on the first node that takes
    /// them.
    fn park(&mut self, owner: &O, ports: &[u16]) -> Result<(), PortError> {
        let mut last = PortError::Exhausted {
            range: self.range,
            requested: ports.len(),
            available: 0,
        };
        for (node, table) in self.nodes.iter_mut() {
            match table.claim(owner, ports) {
                Ok(()) => {
                    self.placed.insert(
                        owner.clone(),
                        Placement {
                            node: node.clone(),
                            bound: false,
                        },
                    );
                    return Ok(());
                }
                Err(e) => last = e,
            }
        }
        Err(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;
    use std::collections::HashSet;

    fn table(min: u16, max: u16) -> PortTable<String> {
        PortTable::new(PortRange::new(min, max).unwrap())
    }

    #[rstest]
    #[case("7000-8000", Some((7000, 8000)))]
    #[case(" 10 - 10 ", Some((10, 10)))]
    #[case("8000-7000", None)]
    #[case("0-10", None)]
    #[case("7000", None)]
    fn test_parse_range(#[case] input: &str, #[case] expected: Option<(u16, u16)>) {
        let parsed = input.parse::<PortRange>().ok().map(|r| (r.min(), r.max()));
        assert_eq!(parsed, expected);
    }

    #[test]
    fn test_range_serde_validates() {
        let ok: PortRange = serde_json::from_str(r#"{"min":7000,"max":7001}"#).unwrap();
        assert_eq!(ok.size(), 2);
        assert!(serde_json::from_str::<PortRange>(r#"{"min":9,"max":1}"#).is_err());

        let text: PortRange = serde_json::from_str(r#""7100-7199""#).unwrap();
        assert_eq!((text.min(), text.max()), (7100, 7199));
        assert!(serde_json::from_str::<PortRange>(r#""7199-7100""#).is_err());
    }

    #[test]
    fn test_reserve_is_idempotent_per_owner() {
        let mut t = table(7000, 7009);
        let first = t.reserve(&"gs-a".into(), 2).unwrap();
        let again = t.reserve(&"gs-a".into(), 2).unwrap();
        assert_eq!(first, again);
        assert_eq!(t.used(), 2);
    }

    #[test]
    fn test_exhaustion_is_all_or_nothing() {
        let mut t = table(7000, 7002);
        t.reserve(&"gs-a".into(), 2).unwrap();
        let err = t.reserve(&"gs-b".into(), 2).unwrap_err();
        assert!(matches!(err, PortError::Exhausted { available: 1, .. }));
        assert_eq!(t.used(), 2);
        assert!(t.ports_of(&"gs-b".into()).is_empty());
    }

    #[test]
    fn test_release_frees_ports_and_cursor_moves_on() {
        let mut t = table(7000, 7003);
        let a = t.reserve(&"gs-a".into(), 1).unwrap();
        assert_eq!(a, vec![7000]);
        assert_eq!(t.release(&"gs-a".into()), vec![7000]);

        // Round-robin: the freed port is not handed out straight away.
        assert_eq!(t.reserve(&"gs-b".into(), 1).unwrap(), vec![7001]);
        assert_eq!(t.available(), 3);
    }

    #[test]
    fn test_reserve_wraps_around_range() {
        let mut t = table(7000, 7002);
        t.reserve(&"a".into(), 2).unwrap();
        t.release(&"a".into());
        let ports = t.reserve(&"b".into(), 3).unwrap();
        let unique: HashSet<_> = ports.iter().collect();
        assert_eq!(unique.len(), 3);
    }

    fn pool(min: u16, max: u16, nodes: &[&str]) -> NodePorts<String> {
        let mut pool = NodePorts::new(PortRange::new(min, max).unwrap());
        pool.sync_nodes(nodes.iter().copied());
        pool
    }

    #[test]
    fn test_same_port_on_different_nodes() {
        let mut p = pool(7000, 7000, &["node-a", "node-b"]);
        assert_eq!(p.reserve(&"gs-a".into(), 1).unwrap(), vec![7000]);
        assert_eq!(p.reserve(&"gs-b".into(), 1).unwrap(), vec![7000]);
        assert_eq!(p.node_of(&"gs-a".into()), Some(("node-a", false)));
        assert_eq!(p.node_of(&"gs-b".into()), Some(("node-b", false)));
        assert_eq!(p.available(), 0);

        let err = p.reserve(&"gs-c".into(), 1).unwrap_err();
        assert!(matches!(err, PortError::Exhausted { available: 0, .. }));
    }

    #[test]
    fn test_reserve_without_nodes_is_exhausted() {
        let mut p = pool(7000, 7010, &[]);
        assert!(matches!(
            p.reserve(&"gs-a".into(), 1),
            Err(PortError::Exhausted { .. })
        ));
        assert_eq!(p.reserve(&"gs-a".into(), 0).unwrap(), Vec::<u16>::new());
    }

    #[test]
    fn test_bind_moves_parked_reservation() {
        let mut p = pool(7000, 7000, &["node-a", "node-b"]);
        p.reserve(&"gs-a".into(), 1).unwrap();
        p.reserve(&"gs-b".into(), 1).unwrap();

        // gs-b landed on node-a; gs-a is still parked there and moves over.
        assert!(p.bind(&"gs-b".into(), "node-a", &[7000]).unwrap().is_empty());
        assert_eq!(p.node_of(&"gs-b".into()), Some(("node-a", true)));
        assert_eq!(p.node_of(&"gs-a".into()), Some(("node-b", false)));
        assert_eq!(p.holder("node-b", 7000).map(String::as_str), Some("gs-a"));
        assert_eq!(p.used(), 2);
    }

    #[test]
    fn test_bind_refuses_to_steal_from_bound_owner() {
        let mut p = pool(7000, 7001, &["node-a"]);
        p.bind(&"gs-a".into(), "node-a", &[7000]).unwrap();
        let err = p.bind(&"gs-b".into(), "node-a", &[7000]).unwrap_err();
        assert!(matches!(err, PortError::Collision { port: 7000, .. }));
        assert!(p.ports_of(&"gs-b".into()).is_empty());
        assert_eq!(p.holder("node-a", 7000).map(String::as_str), Some("gs-a"));
    }

    #[test]
    fn test_vanished_node_rehomes_parked_and_drops_bound() {
        let mut p = pool(7000, 7001, &["node-a", "node-b"]);
        p.bind(&"bound".into(), "node-a", &[7000]).unwrap();
        p.reserve(&"parked".into(), 1).unwrap();
        assert_eq!(p.node_of(&"parked".into()), Some(("node-a", false)));

        let dropped = p.sync_nodes(["node-b"]);
        assert_eq!(dropped, vec!["bound".to_string()]);
        assert_eq!(p.node_of(&"parked".into()), Some(("node-b", false)));
        assert_eq!(p.nodes().collect::<Vec<_>>(), ["node-b"]);
    }

    #[test]
    fn test_rebuild_prefers_bound_then_older_claims() {
        let range = PortRange::new(7000, 7010).unwrap();
        let nodes = vec!["node-a".to_string(), "node-b".to_string()];
        let claims = vec![
            ("young".to_string(), 2u64, Some("node-a".to_string()), vec![7001, 7002]),
            ("old".to_string(), 1u64, Some("node-a".to_string()), vec![7002]),
            ("elsewhere".to_string(), 3u64, Some("node-b".to_string()), vec![7002]),
            ("parked".to_string(), 0u64, None, vec![7002]),
            ("stray".to_string(), 4u64, Some("node-b".to_string()), vec![9000]),
        ];
        let (pool, rejected) = NodePorts::rebuild(range, nodes, claims);

        assert_eq!(pool.holder("node-a", 7002).map(String::as_str), Some("old"));
        assert_eq!(pool.holder("node-a", 7001), None);
        assert_eq!(pool.holder("node-b", 7002).map(String::as_str), Some("elsewhere"));
        let names: Vec<_> = rejected.iter().map(|(o, _)| o.as_str()).collect();
        assert_eq!(names, ["young", "stray", "parked"]);
        assert!(matches!(rejected[0].1, PortError::Collision { port: 7002, .. }));
        assert!(matches!(rejected[1].1, PortError::OutOfRange { port: 9000, .. }));
    }

    proptest! {
        #[test]
        fn prop_ports_unique_and_in_range(ops in proptest::collection::vec((0u8..12, 0usize..4, any::<bool>()), 1..200)) {
            let mut t = table(7000, 7031);
            for (owner, count, release) in ops {
                let owner = format!("gs-{owner}");
                if release {
                    t.release(&owner);
                } else {
                    let _ = t.reserve(&owner, count);
                }

                let mut seen = HashSet::new();
                for o in 0u8..12 {
                    for p in t.ports_of(&format!("gs-{o}")) {
                        prop_assert!(t.range().contains(*p));
                        prop_assert!(seen.insert(*p), "port {} assigned twice", p);
                    }
                }
                prop_assert_eq!(seen.len(), t.used());
            }
        }

        #[test]
        fn prop_node_ports_unique_per_node(ops in proptest::collection::vec((0u8..10, 0u8..3, 0usize..3), 1..150)) {
            let nodes = ["node-a", "node-b", "node-c"];
            let mut p = pool(7000, 7007, &nodes);
            for (owner, action, count) in ops {
                let owner = format!("gs-{owner}");
                match action {
                    0 => { let _ = p.reserve(&owner, count); }
                    1 => {
                        let held = p.ports_of(&owner).to_vec();
                        let _ = p.bind(&owner, nodes[count], &held);
                    }
                    _ => { p.release(&owner); }
                }

                let mut seen = HashSet::new();
                let mut total = 0;
                for o in 0u8..10 {
                    let o = format!("gs-{o}");
                    let Some((node, _)) = p.node_of(&o) else { continue };
                    for port in p.ports_of(&o) {
                        prop_assert!(p.range().contains(*port));
                        prop_assert!(seen.insert((node.to_string(), *port)), "port {} reused on {}", port, node);
                        prop_assert_eq!(p.holder(node, *port), Some(&o));
                        total += 1;
                    }
                }
                prop_assert_eq!(total, p.used());
            }
        }
    }
}
