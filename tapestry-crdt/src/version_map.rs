//! Per-actor version vectors
//!
//! A `VersionMap` tags every CRDT mutation. Maps are partially ordered by
//! pointwise comparison; two maps where neither dominates are concurrent.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of a writer (for handles, the handle name)
pub type Actor = String;

/// Monotonic per-actor counters
///
/// Absent actors read as zero, and zero entries are never stored, so two maps
/// that differ only by explicit zeros compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "BTreeMap<Actor, u64>", into = "BTreeMap<Actor, u64>")]
pub struct VersionMap(BTreeMap<Actor, u64>);

impl VersionMap {
    /// Create an empty version map
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a map from `(actor, version)` pairs
    pub fn from_pairs<I, A>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (A, u64)>,
        A: Into<Actor>,
    {
        let mut map = Self::new();
        for (actor, version) in pairs {
            map.set(actor, version);
        }
        map
    }

    /// Version recorded for `actor` (zero when absent)
    pub fn get(&self, actor: &str) -> u64 {
        self.0.get(actor).copied().unwrap_or(0)
    }

    /// Overwrite the version for `actor`
    pub fn set(&mut self, actor: impl Into<Actor>, version: u64) {
        let actor = actor.into();
        if version == 0 {
            self.0.remove(&actor);
        } else {
            self.0.insert(actor, version);
        }
    }

    /// Bump the counter for `actor`, returning the new value
    pub fn increment(&mut self, actor: &str) -> u64 {
        let next = self.get(actor) + 1;
        self.set(actor, next);
        next
    }

    /// Copy of this map with `actor` set to `version`
    pub fn with_version(&self, actor: &str, version: u64) -> Self {
        let mut copy = self.clone();
        copy.set(actor, version);
        copy
    }

    /// True if every counter here is at least the other map's counter
    pub fn dominates(&self, other: &VersionMap) -> bool {
        other.0.iter().all(|(actor, v)| self.get(actor) >= *v)
    }

    /// Dominates and differs
    pub fn strictly_dominates(&self, other: &VersionMap) -> bool {
        self != other && self.dominates(other)
    }

    /// Neither map dominates the other
    pub fn is_concurrent_with(&self, other: &VersionMap) -> bool {
        !self.dominates(other) && !other.dominates(self)
    }

    /// Pointwise maximum, in place
    pub fn merge(&mut self, other: &VersionMap) {
        for (actor, version) in &other.0 {
            if *version > self.get(actor) {
                self.0.insert(actor.clone(), *version);
            }
        }
    }

    /// Pointwise maximum of two maps
    pub fn merged(&self, other: &VersionMap) -> VersionMap {
        let mut copy = self.clone();
        copy.merge(other);
        copy
    }

    /// Deterministic total order used to break ties between concurrent maps.
    ///
    /// Actors are visited in ascending id order and the first differing
    /// counter decides. A dominating map always compares greater.
    pub fn total_cmp(&self, other: &VersionMap) -> Ordering {
        let mut actors: Vec<&Actor> = self.0.keys().chain(other.0.keys()).collect();
        actors.sort();
        actors.dedup();
        for actor in actors {
            match self.get(actor).cmp(&other.get(actor)) {
                Ordering::Equal => continue,
                decided => return decided,
            }
        }
        Ordering::Equal
    }

    /// Iterate over `(actor, version)` entries in actor order
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(a, v)| (a.as_str(), *v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl PartialOrd for VersionMap {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self.dominates(other), other.dominates(self)) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Greater),
            (false, true) => Some(Ordering::Less),
            (false, false) => None,
        }
    }
}

impl From<BTreeMap<Actor, u64>> for VersionMap {
    fn from(entries: BTreeMap<Actor, u64>) -> Self {
        Self::from_pairs(entries)
    }
}

impl From<VersionMap> for BTreeMap<Actor, u64> {
    fn from(map: VersionMap) -> Self {
        map.0
    }
}

impl fmt::Display for VersionMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (actor, version)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", actor, version)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(pairs: &[(&str, u64)]) -> VersionMap {
        VersionMap::from_pairs(pairs.iter().map(|(a, v)| (a.to_string(), *v)))
    }

    #[test]
    fn test_missing_actor_reads_zero() {
        let map = vm(&[("alice", 2)]);
        assert_eq!(map.get("alice"), 2);
        assert_eq!(map.get("bob"), 0);
        assert_eq!(vm(&[("alice", 2), ("bob", 0)]), map);
    }

    #[test]
    fn test_increment() {
        let mut map = VersionMap::new();
        assert_eq!(map.increment("alice"), 1);
        assert_eq!(map.increment("alice"), 2);
        assert_eq!(map.get("alice"), 2);
    }

    #[test]
    fn test_dominance() {
        let older = vm(&[("alice", 1)]);
        let newer = vm(&[("alice", 2), ("bob", 1)]);

        assert!(newer.dominates(&older));
        assert!(newer.strictly_dominates(&older));
        assert!(!older.dominates(&newer));
        assert!(older.dominates(&older));
        assert!(!older.strictly_dominates(&older));
        assert!(newer > older);
    }

    #[test]
    fn test_concurrency() {
        let a = vm(&[("alice", 1)]);
        let b = vm(&[("bob", 1)]);

        assert!(a.is_concurrent_with(&b));
        assert_eq!(a.partial_cmp(&b), None);

        let merged = a.merged(&b);
        assert!(merged.dominates(&a));
        assert!(merged.dominates(&b));
        assert_eq!(merged, vm(&[("alice", 1), ("bob", 1)]));
    }

    #[test]
    fn test_total_order_respects_dominance() {
        let older = vm(&[("alice", 1), ("bob", 3)]);
        let newer = vm(&[("alice", 1), ("bob", 4)]);
        assert_eq!(newer.total_cmp(&older), Ordering::Greater);
        assert_eq!(older.total_cmp(&newer), Ordering::Less);
    }

    #[test]
    fn test_total_order_breaks_ties_by_actor() {
        let from_alice = vm(&[("alice", 1)]);
        let from_bob = vm(&[("bob", 1)]);
        assert_eq!(from_alice.total_cmp(&from_bob), Ordering::Greater);
        assert_eq!(from_bob.total_cmp(&from_alice), Ordering::Less);
    }

    #[test]
    fn test_display() {
        assert_eq!(vm(&[("b", 2), ("a", 1)]).to_string(), "{a: 1, b: 2}");
        assert_eq!(VersionMap::new().to_string(), "{}");
    }

    #[test]
    fn test_serde_drops_zero_entries() {
        let map: VersionMap = serde_json::from_str(r#"{"alice": 3, "bob": 0}"#).unwrap();
        assert_eq!(map, vm(&[("alice", 3)]));
        assert_eq!(serde_json::to_string(&map).unwrap(), r#"{"alice":3}"#);
    }
}
