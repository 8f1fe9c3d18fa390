use super::{
    CollectionDelta, EntityStorageAdapter, HandleCore, HandleMode, ParticleHandle, StorageAdapter,
};
use crate::data::{EntitySpec, Reference, Schema};
use crate::error::{HandleError, Result};
use crate::scheduler::Completion;
use crate::storage::{EventCallback, ProxyState, StorageKey, StorageProxy};
use std::collections::BTreeSet;
use std::sync::Arc;
use tapestry_crdt::{CrdtSet, CrdtSetOp, Referencable};

type CollectionProxy<A> = Arc<dyn StorageProxy<CrdtSet<<A as StorageAdapter>::Stored>>>;

/// Handle over a storage key holding a set of values keyed by id
pub struct CollectionHandle<A: StorageAdapter> {
    core: Arc<HandleCore<A>>,
    proxy: CollectionProxy<A>,
}

impl<A: StorageAdapter> Clone for CollectionHandle<A> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            proxy: self.proxy.clone(),
        }
    }
}

impl<A: StorageAdapter> CollectionHandle<A> {
    pub(crate) fn new(core: HandleCore<A>, proxy: CollectionProxy<A>) -> Self {
        Self {
            core: Arc::new(core),
            proxy,
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn mode(&self) -> HandleMode {
        self.core.mode
    }

    pub fn storage_key(&self) -> &StorageKey {
        self.proxy.storage_key()
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    fn stored(&self) -> Result<Vec<A::Stored>> {
        Ok(self.proxy.get_particle_view_unsafe()?)
    }

    /// Live values, excluding expired ones
    pub fn fetch_all(&self) -> Result<Vec<A::Value>> {
        self.core.check_read("fetch_all")?;
        Ok(self.core.live_values(&self.stored()?))
    }

    pub fn fetch_by_id(&self, id: &str) -> Result<Option<A::Value>> {
        self.core.check_read("fetch_by_id")?;
        let stored = self.stored()?;
        Ok(self
            .core
            .live_values(stored.iter().filter(|item| item.id() == id))
            .pop())
    }

    pub fn size(&self) -> Result<usize> {
        self.core.check_read("size")?;
        let stored = self.stored()?;
        Ok(stored
            .iter()
            .filter(|item| !self.core.adapter.is_expired(item))
            .count())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.size()? == 0)
    }

    /// Live values accepted by `predicate`
    pub fn query(&self, predicate: impl Fn(&A::Value) -> bool) -> Result<Vec<A::Value>> {
        self.core.check_query("query")?;
        if !A::QUERYABLE {
            return Err(HandleError::QueryNotSupported.into());
        }
        let mut values = self.core.live_values(&self.stored()?);
        values.retain(|value| predicate(value));
        Ok(values)
    }

    /// Add or replace `value`; assigns an id to entities that have none
    pub fn store(&self, value: &mut A::Value) -> Result<Completion<bool>> {
        self.store_all(std::slice::from_mut(value))
    }

    /// Store every value as one batch
    pub fn store_all(&self, values: &mut [A::Value]) -> Result<Completion<bool>> {
        self.core.check_write("store")?;
        let mut version_map = self.proxy.version_map()?;
        let mut ops = Vec::with_capacity(values.len());
        for value in values.iter_mut() {
            let added = self.core.adapter.store_value(value)?;
            version_map.increment(&self.core.name);
            ops.push(CrdtSetOp::Add {
                actor: self.core.name.clone(),
                version_map: version_map.clone(),
                added,
            });
        }
        Ok(self.proxy.apply_ops(ops)?)
    }

    pub fn remove(&self, value: &A::Value) -> Result<Completion<bool>> {
        self.core.check_write("remove")?;
        let id = self
            .core
            .adapter
            .value_id(value)
            .ok_or(HandleError::MissingId)?;
        self.remove_stored(vec![self.core.adapter.placeholder(&id)])
    }

    pub fn remove_by_id(&self, id: &str) -> Result<Completion<bool>> {
        self.core.check_write("remove_by_id")?;
        self.remove_stored(vec![self.core.adapter.placeholder(id)])
    }

    /// Remove everything currently in the local replica
    pub fn clear(&self) -> Result<Completion<bool>> {
        self.core.check_write("clear")?;
        let stored = self.stored()?;
        self.remove_stored(stored)
    }

    fn remove_stored(&self, removed: Vec<A::Stored>) -> Result<Completion<bool>> {
        let version_map = self.proxy.version_map()?;
        let ops = removed
            .into_iter()
            .map(|removed| CrdtSetOp::Remove {
                actor: self.core.name.clone(),
                version_map: version_map.clone(),
                removed,
            })
            .collect();
        Ok(self.proxy.apply_ops(ops)?)
    }

    pub fn on_ready(&self, callback: impl Fn() + Send + Sync + 'static) -> Result<()> {
        self.core.check_read("on_ready")?;
        let callback = HandleCore::guarded(&self.core, callback);
        Ok(self.proxy.add_on_ready(&self.core.callback_id, callback)?)
    }

    /// Called with the values added and removed by each change
    pub fn on_update(
        &self,
        callback: impl Fn(CollectionDelta<A::Value>) + Send + Sync + 'static,
    ) -> Result<()> {
        self.core.check_read("on_update")?;
        let core = self.core.clone();
        Ok(self.proxy.add_on_update(
            &self.core.callback_id,
            Arc::new(move |old: &Vec<A::Stored>, new: &Vec<A::Stored>| {
                if core.is_closed() {
                    return;
                }
                let old_ids: BTreeSet<&str> = old.iter().map(|item| item.id()).collect();
                let new_ids: BTreeSet<&str> = new.iter().map(|item| item.id()).collect();
                callback(CollectionDelta {
                    added: core.live_values(new.iter().filter(|item| !old_ids.contains(item.id()))),
                    removed: core
                        .live_values(old.iter().filter(|item| !new_ids.contains(item.id()))),
                });
            }),
        )?)
    }

    pub fn on_desync(&self, callback: impl Fn() + Send + Sync + 'static) -> Result<()> {
        self.core.check_read("on_desync")?;
        let callback = HandleCore::guarded(&self.core, callback);
        Ok(self.proxy.add_on_desync(&self.core.callback_id, callback)?)
    }

    pub fn on_resync(&self, callback: impl Fn() + Send + Sync + 'static) -> Result<()> {
        self.core.check_read("on_resync")?;
        let callback = HandleCore::guarded(&self.core, callback);
        Ok(self.proxy.add_on_resync(&self.core.callback_id, callback)?)
    }

    /// Detach from the proxy; every later call fails
    pub fn close(&self) {
        if self.core.close() {
            self.proxy.remove_callbacks_for_name(&self.core.callback_id);
        }
    }
}

impl<S: EntitySpec> CollectionHandle<EntityStorageAdapter<S>> {
    /// Reference to `entity`, which must be in this collection
    pub fn create_reference(&self, entity: &S::Entity) -> Result<Reference> {
        self.core.check_open()?;
        let id = self.core.adapter.value_id(entity).ok_or_else(|| {
            HandleError::ReferenceIntegrity(
                "Entity must have an ID before it can be referenced.".to_string(),
            )
        })?;
        let backing_key = match self.proxy.storage_key() {
            StorageKey::ReferenceMode(key) => (*key.backing_key).clone(),
            _ => {
                return Err(HandleError::ReferenceIntegrity(
                    "ReferenceModeStorageKey required in order to create references.".to_string(),
                )
                .into())
            }
        };
        if !self.stored()?.iter().any(|stored| stored.id == id) {
            return Err(HandleError::ReferenceIntegrity(
                "Entity is not stored in the Collection.".to_string(),
            )
            .into());
        }
        Ok(self.core.adapter.reference_to(&id, backing_key))
    }

    /// Reference to a foreign entity, if the foreign checker accepts `id`
    pub fn create_foreign_reference(
        &self,
        schema: &Arc<Schema>,
        id: &str,
    ) -> Result<Option<Reference>> {
        self.core.check_open()?;
        Ok(self.core.adapter.dereferencers().foreign_reference(schema, id))
    }
}

impl<A: StorageAdapter> ParticleHandle for CollectionHandle<A> {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn mode(&self) -> HandleMode {
        self.core.mode
    }

    fn proxy_state(&self) -> ProxyState {
        self.proxy.state()
    }

    fn maybe_initiate_sync(&self) {
        self.proxy.maybe_initiate_sync();
    }

    fn register_for_storage_events(&self, callback: EventCallback) -> Result<()> {
        self.core.check_open()?;
        Ok(self
            .proxy
            .register_for_storage_events(&self.core.callback_id, callback)?)
    }

    fn unregister_for_storage_events(&self) {
        self.proxy
            .unregister_for_storage_events(&self.core.callback_id);
    }

    fn close(&self) {
        CollectionHandle::close(self);
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}
