//! Replicated data types for tapestry
//!
//! This crate holds the pure CRDT layer that stores and storage proxies are
//! built on. Nothing here performs I/O or takes locks.
//!
//! - [`VersionMap`]: per-actor counters, partially ordered by dominance
//! - [`CrdtSet`]: observed-remove set keyed by [`Referencable::id`]
//! - [`CrdtSingleton`]: register whose concurrent writes survive until a
//!   later write has seen them
//!
//! Both containers implement [`CrdtModel`]. Applying an op the replica
//! already reflects is [`ApplyOutcome::Redundant`]; an op that skips ahead of
//! the replica for its actor fails with [`CrdtError::CausalGap`] and the
//! caller is expected to resynchronize by merging full state.
//!
//! ```
//! use tapestry_crdt::{CrdtModel, CrdtSet, CrdtSetOp, VersionMap};
//!
//! let mut set = CrdtSet::new();
//! set.apply_operation(&CrdtSetOp::Add {
//!     actor: "alice".into(),
//!     version_map: VersionMap::from_pairs([("alice", 1)]),
//!     added: "x".to_string(),
//! })
//! .unwrap();
//! assert_eq!(set.consumer_view(), vec!["x".to_string()]);
//! ```

pub mod model;
pub mod set;
pub mod singleton;
pub mod version_map;

pub use model::{
    ApplyOutcome, CrdtError, CrdtModel, CrdtOperation, CrdtResult, DataValue, MergeOutcome,
    Referencable, ReferenceId,
};
pub use set::{CrdtSet, CrdtSetData, CrdtSetOp};
pub use singleton::{CrdtSingleton, CrdtSingletonData, CrdtSingletonOp};
pub use version_map::{Actor, VersionMap};
