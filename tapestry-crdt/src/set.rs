//! Observed-remove set keyed by value identity

use crate::model::{
    check_advance, check_current, ApplyOutcome, CrdtModel, CrdtOperation, CrdtResult, DataValue,
    MergeOutcome, Referencable, ReferenceId,
};
use crate::version_map::{Actor, VersionMap};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Replica state shared by sets and singletons
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrdtSetData<T> {
    pub version_map: VersionMap,
    pub values: BTreeMap<ReferenceId, DataValue<T>>,
}

impl<T> Default for CrdtSetData<T> {
    fn default() -> Self {
        Self {
            version_map: VersionMap::new(),
            values: BTreeMap::new(),
        }
    }
}

impl<T: Referencable> CrdtSetData<T> {
    /// Merge `other` into `self` using observed-remove rules.
    ///
    /// A value held by only one side survives unless the other side's clock
    /// has already seen its version, which means the other side removed it.
    pub(crate) fn merge_from(&mut self, other: &CrdtSetData<T>) -> MergeOutcome {
        let mut values = BTreeMap::new();
        for (id, mine) in &self.values {
            match other.values.get(id) {
                Some(theirs) => {
                    values.insert(id.clone(), mine.combine(theirs));
                }
                None if !other.version_map.dominates(&mine.version_map) => {
                    values.insert(id.clone(), mine.clone());
                }
                None => {}
            }
        }
        for (id, theirs) in &other.values {
            if !self.values.contains_key(id) && !self.version_map.dominates(&theirs.version_map) {
                values.insert(id.clone(), theirs.clone());
            }
        }
        let version_map = self.version_map.merged(&other.version_map);

        let outcome = MergeOutcome {
            local_changed: values != self.values || version_map != self.version_map,
            remote_stale: values != other.values || version_map != other.version_map,
        };
        self.values = values;
        self.version_map = version_map;
        outcome
    }

    /// Insert or combine a value carried by an accepted op
    pub(crate) fn put(&mut self, value: &T, clock: &VersionMap) {
        let incoming = DataValue::new(value.clone(), clock.clone());
        let merged = match self.values.get(value.id()) {
            Some(existing) => incoming.combine(existing),
            None => incoming,
        };
        self.values.insert(value.id().to_string(), merged);
    }

    /// Drop every value whose version the clock has seen; returns true if
    /// anything was removed
    pub(crate) fn clear_dominated(&mut self, clock: &VersionMap) -> bool {
        let before = self.values.len();
        self.values
            .retain(|_, entry| !clock.dominates(&entry.version_map));
        before != self.values.len()
    }
}

/// Set mutations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CrdtSetOp<T> {
    /// Insert a value; the actor's counter must advance by one
    Add {
        actor: Actor,
        version_map: VersionMap,
        added: T,
    },
    /// Remove an observed value; the actor's counter must match
    Remove {
        actor: Actor,
        version_map: VersionMap,
        removed: T,
    },
}

impl<T: Referencable> CrdtOperation for CrdtSetOp<T> {
    fn actor(&self) -> &str {
        match self {
            CrdtSetOp::Add { actor, .. } | CrdtSetOp::Remove { actor, .. } => actor,
        }
    }

    fn version_map(&self) -> &VersionMap {
        match self {
            CrdtSetOp::Add { version_map, .. } | CrdtSetOp::Remove { version_map, .. } => {
                version_map
            }
        }
    }
}

/// Replicated set of referencable values
#[derive(Debug, Clone, PartialEq)]
pub struct CrdtSet<T> {
    data: CrdtSetData<T>,
}

impl<T: Referencable> CrdtSet<T> {
    pub fn new() -> Self {
        Self {
            data: CrdtSetData::default(),
        }
    }

    /// Current value for an id, if present
    pub fn get(&self, id: &str) -> Option<&T> {
        self.data.values.get(id).map(|entry| &entry.value)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.data.values.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.data.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.values.is_empty()
    }
}

impl<T: Referencable> Default for CrdtSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Referencable> CrdtModel for CrdtSet<T> {
    type Data = CrdtSetData<T>;
    type Op = CrdtSetOp<T>;
    type View = Vec<T>;

    fn empty() -> Self {
        Self::new()
    }

    fn from_data(data: Self::Data) -> Self {
        Self { data }
    }

    fn data(&self) -> &Self::Data {
        &self.data
    }

    fn version_map(&self) -> &VersionMap {
        &self.data.version_map
    }

    fn merge(&mut self, other: &Self::Data) -> MergeOutcome {
        self.data.merge_from(other)
    }

    fn apply_operation(&mut self, op: &Self::Op) -> CrdtResult<ApplyOutcome> {
        match op {
            CrdtSetOp::Add {
                actor,
                version_map,
                added,
            } => {
                let incoming = version_map.get(actor);
                let local = self.data.version_map.get(actor);
                if let Some(outcome) = check_advance(actor, local, incoming)? {
                    return Ok(outcome);
                }
                self.data.put(added, version_map);
                self.data.version_map.set(actor.as_str(), incoming);
                Ok(ApplyOutcome::Applied)
            }
            CrdtSetOp::Remove {
                actor,
                version_map,
                removed,
            } => {
                let incoming = version_map.get(actor);
                let local = self.data.version_map.get(actor);
                if let Some(outcome) = check_current(actor, local, incoming)? {
                    return Ok(outcome);
                }
                match self.data.values.get(removed.id()) {
                    Some(existing) if version_map.dominates(&existing.version_map) => {
                        self.data.values.remove(removed.id());
                        Ok(ApplyOutcome::Applied)
                    }
                    // Absent, or re-added concurrently: the add wins.
                    _ => Ok(ApplyOutcome::Redundant),
                }
            }
        }
    }

    fn consumer_view(&self) -> Self::View {
        self.data
            .values
            .values()
            .map(|entry| entry.value.clone())
            .collect()
    }
}
