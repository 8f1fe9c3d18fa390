//! The CRDT model abstraction shared by stores and proxies

use crate::version_map::{Actor, VersionMap};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Identity of a value held by a CRDT container
pub type ReferenceId = String;

/// Payloads that can live in a Singleton or Set
///
/// Two payloads with the same `id` occupy the same slot.
pub trait Referencable: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    fn id(&self) -> &str;
}

impl Referencable for String {
    fn id(&self) -> &str {
        self
    }
}

/// A payload together with the version that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataValue<T> {
    pub version_map: VersionMap,
    pub value: T,
}

impl<T: Referencable> DataValue<T> {
    pub fn new(value: T, version_map: VersionMap) -> Self {
        Self { version_map, value }
    }

    /// Combine two records of the same slot.
    ///
    /// The dominant version's value wins; concurrent versions are settled by
    /// `VersionMap::total_cmp`. The resulting version is the merge of both.
    pub fn combine(&self, other: &DataValue<T>) -> DataValue<T> {
        let value = if self.version_map == other.version_map
            || self.version_map.dominates(&other.version_map)
        {
            self.value.clone()
        } else if other.version_map.dominates(&self.version_map) {
            other.value.clone()
        } else if self.version_map.total_cmp(&other.version_map).is_ge() {
            self.value.clone()
        } else {
            other.value.clone()
        };
        DataValue {
            version_map: self.version_map.merged(&other.version_map),
            value,
        }
    }
}

/// Result of applying one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The operation changed (or confirmed) the replica
    Applied,
    /// The replica already reflects the operation; nothing changed
    Redundant,
}

/// Result of merging another replica's data into this one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeOutcome {
    /// This replica changed
    pub local_changed: bool,
    /// The other replica lacks something this one has
    pub remote_stale: bool,
}

/// Errors raised by CRDT operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CrdtError {
    /// The op does not causally follow this replica for its actor
    #[error("operation from {actor} at version {incoming} does not follow local version {local}")]
    CausalGap {
        actor: Actor,
        local: u64,
        incoming: u64,
    },
}

/// Result type for CRDT operations
pub type CrdtResult<T> = std::result::Result<T, CrdtError>;

/// An operation carrying its issuing actor and version
pub trait CrdtOperation: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    fn actor(&self) -> &str;
    fn version_map(&self) -> &VersionMap;
}

/// A replicated container
///
/// Implementations are pure: no I/O and no interior mutability.
pub trait CrdtModel: Clone + fmt::Debug + Send + Sync + 'static {
    /// Serializable replica state
    type Data: Clone + PartialEq + fmt::Debug + Send + Sync + 'static;
    /// Mutation
    type Op: CrdtOperation;
    /// What consumers see
    type View: Clone + PartialEq + fmt::Debug + Send + Sync + 'static;

    /// Empty replica
    fn empty() -> Self;

    /// Replica seeded from existing data
    fn from_data(data: Self::Data) -> Self;

    fn data(&self) -> &Self::Data;

    fn version_map(&self) -> &VersionMap;

    /// Merge another replica's data into this one
    fn merge(&mut self, other: &Self::Data) -> MergeOutcome;

    /// Apply one operation
    ///
    /// A causal gap is an error; an already-reflected op is `Redundant`.
    fn apply_operation(&mut self, op: &Self::Op) -> CrdtResult<ApplyOutcome>;

    fn consumer_view(&self) -> Self::View;
}

/// Check an incoming counter against the local one for an op that must
/// advance the actor by exactly one.
pub(crate) fn check_advance(
    actor: &str,
    local: u64,
    incoming: u64,
) -> CrdtResult<Option<ApplyOutcome>> {
    if incoming <= local {
        Ok(Some(ApplyOutcome::Redundant))
    } else if incoming == local + 1 {
        Ok(None)
    } else {
        Err(CrdtError::CausalGap {
            actor: actor.to_string(),
            local,
            incoming,
        })
    }
}

/// Check an incoming counter for an op that must match the local one
/// (removals do not advance the clock).
pub(crate) fn check_current(
    actor: &str,
    local: u64,
    incoming: u64,
) -> CrdtResult<Option<ApplyOutcome>> {
    if incoming < local {
        Ok(Some(ApplyOutcome::Redundant))
    } else if incoming == local {
        Ok(None)
    } else {
        Err(CrdtError::CausalGap {
            actor: actor.to_string(),
            local,
            incoming,
        })
    }
}
