//! Pointers to entities stored elsewhere

use crate::data::raw::{RawEntity, UNINITIALIZED_TIMESTAMP};
use crate::error::{StorageError, StorageResult};
use crate::storage::dereferencer::Dereferencer;
use crate::storage::key::StorageKey;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tapestry_crdt::{Referencable, ReferenceId, VersionMap};

/// A typed pointer to an entity in a backing store
///
/// Two references are equal when id, storage key and version agree; the
/// installed dereferencer does not take part in comparisons or
/// serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reference {
    pub id: ReferenceId,
    pub storage_key: StorageKey,
    /// Version of the target when the reference was taken
    pub version: Option<VersionMap>,
    #[serde(default = "uninitialized")]
    pub creation_timestamp: i64,
    #[serde(default = "uninitialized")]
    pub expiration_timestamp: i64,
    #[serde(skip)]
    dereferencer: Option<Weak<dyn Dereferencer>>,
}

fn uninitialized() -> i64 {
    UNINITIALIZED_TIMESTAMP
}

impl Reference {
    pub fn new(
        id: impl Into<ReferenceId>,
        storage_key: StorageKey,
        version: Option<VersionMap>,
    ) -> Self {
        Self {
            id: id.into(),
            storage_key,
            version,
            creation_timestamp: UNINITIALIZED_TIMESTAMP,
            expiration_timestamp: UNINITIALIZED_TIMESTAMP,
            dereferencer: None,
        }
    }

    /// Install the dereferencer used by [`Reference::dereference`]
    ///
    /// Only a weak pointer is kept; the owner of the dereferencer controls
    /// its lifetime.
    pub fn set_dereferencer(&mut self, dereferencer: &Arc<dyn Dereferencer>) {
        self.dereferencer = Some(Arc::downgrade(dereferencer));
    }

    pub fn has_dereferencer(&self) -> bool {
        self.dereferencer
            .as_ref()
            .is_some_and(|weak| weak.strong_count() > 0)
    }

    /// Resolve the target entity
    ///
    /// `Ok(None)` means the target is not (yet) visible in the backing
    /// store. A removed target resolves to its nulled-out tombstone.
    pub async fn dereference(&self) -> StorageResult<Option<RawEntity>> {
        let dereferencer = self
            .dereferencer
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(StorageError::NoDereferencer)?;
        dereferencer.dereference(self).await
    }

    /// Whether the target currently resolves
    pub async fn is_alive(&self) -> StorageResult<bool> {
        Ok(self.dereference().await?.is_some())
    }

    pub async fn is_dead(&self) -> StorageResult<bool> {
        Ok(!self.is_alive().await?)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expiration_timestamp != UNINITIALIZED_TIMESTAMP && self.expiration_timestamp < now
    }
}

impl PartialEq for Reference {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.storage_key == other.storage_key
            && self.version == other.version
            && self.creation_timestamp == other.creation_timestamp
            && self.expiration_timestamp == other.expiration_timestamp
    }
}

impl Referencable for Reference {
    fn id(&self) -> &str {
        &self.id
    }
}
