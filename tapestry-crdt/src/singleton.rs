//! Singleton register built on the set's replica state
//!
//! Concurrent updates all survive in the replica. Consumers see the entry
//! whose version is greatest under `VersionMap::total_cmp`, so a dominating
//! write always wins and concurrent writes settle on the smallest actor id.

use crate::model::{
    check_advance, check_current, ApplyOutcome, CrdtModel, CrdtOperation, CrdtResult,
    MergeOutcome, Referencable,
};
use crate::set::CrdtSetData;
use crate::version_map::{Actor, VersionMap};
use serde::{Deserialize, Serialize};

/// Singleton replica state
pub type CrdtSingletonData<T> = CrdtSetData<T>;

/// Singleton mutations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CrdtSingletonOp<T> {
    /// Replace every value the clock has seen
    Update {
        actor: Actor,
        version_map: VersionMap,
        value: T,
    },
    /// Remove every value the clock has seen
    Clear {
        actor: Actor,
        version_map: VersionMap,
    },
}

impl<T: Referencable> CrdtOperation for CrdtSingletonOp<T> {
    fn actor(&self) -> &str {
        match self {
            CrdtSingletonOp::Update { actor, .. } | CrdtSingletonOp::Clear { actor, .. } => actor,
        }
    }

    fn version_map(&self) -> &VersionMap {
        match self {
            CrdtSingletonOp::Update { version_map, .. }
            | CrdtSingletonOp::Clear { version_map, .. } => version_map,
        }
    }
}

/// Replicated single value
#[derive(Debug, Clone, PartialEq)]
pub struct CrdtSingleton<T> {
    data: CrdtSingletonData<T>,
}

impl<T: Referencable> CrdtSingleton<T> {
    pub fn new() -> Self {
        Self {
            data: CrdtSetData::default(),
        }
    }

    /// Number of concurrent candidates held
    pub fn candidates(&self) -> usize {
        self.data.values.len()
    }
}

impl<T: Referencable> Default for CrdtSingleton<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Referencable> CrdtModel for CrdtSingleton<T> {
    type Data = CrdtSingletonData<T>;
    type Op = CrdtSingletonOp<T>;
    type View = Option<T>;

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
            CrdtSingletonOp::Update {
                actor,
                version_map,
                value,
            } => {
                let incoming = version_map.get(actor);
                let local = self.data.version_map.get(actor);
                if let Some(outcome) = check_advance(actor, local, incoming)? {
                    return Ok(outcome);
                }
                self.data.clear_dominated(version_map);
                self.data.put(value, version_map);
                self.data.version_map.set(actor.as_str(), incoming);
                Ok(ApplyOutcome::Applied)
            }
            CrdtSingletonOp::Clear { actor, version_map } => {
                let incoming = version_map.get(actor);
                let local = self.data.version_map.get(actor);
                if let Some(outcome) = check_current(actor, local, incoming)? {
                    return Ok(outcome);
                }
                if self.data.clear_dominated(version_map) {
                    Ok(ApplyOutcome::Applied)
                } else {
                    Ok(ApplyOutcome::Redundant)
                }
            }
        }
    }

    fn consumer_view(&self) -> Self::View {
        self.data
            .values
            .values()
            .max_by(|a, b| a.version_map.total_cmp(&b.version_map))
            .map(|entry| entry.value.clone())
    }
}
