use super::{
    EntityStorageAdapter, HandleCore, HandleMode, ParticleHandle, SingletonDelta, StorageAdapter,
};
use crate::data::{EntitySpec, Reference, Schema};
use crate::error::{HandleError, Result};
use crate::scheduler::Completion;
use crate::storage::{EventCallback, ProxyState, StorageKey, StorageProxy};
use std::sync::Arc;
use tapestry_crdt::{CrdtSingleton, CrdtSingletonOp};

type SingletonProxy<A> = Arc<dyn StorageProxy<CrdtSingleton<<A as StorageAdapter>::Stored>>>;

/// Handle over a storage key holding at most one value
pub struct SingletonHandle<A: StorageAdapter> {
    core: Arc<HandleCore<A>>,
    proxy: SingletonProxy<A>,
}

impl<A: StorageAdapter> Clone for SingletonHandle<A> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            proxy: self.proxy.clone(),
        }
    }
}

impl<A: StorageAdapter> SingletonHandle<A> {
    pub(crate) fn new(core: HandleCore<A>, proxy: SingletonProxy<A>) -> Self {
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

    /// Current value, or `None` when empty or expired
    pub fn fetch(&self) -> Result<Option<A::Value>> {
        self.core.check_read("fetch")?;
        let stored = self.proxy.get_particle_view_unsafe()?;
        Ok(self.core.live_values(stored.as_ref()).pop())
    }

    /// Replace the value; assigns an id to entities that have none
    pub fn store(&self, value: &mut A::Value) -> Result<Completion<bool>> {
        self.core.check_write("store")?;
        let stored = self.core.adapter.store_value(value)?;
        let mut version_map = self.proxy.version_map()?;
        version_map.increment(&self.core.name);
        Ok(self.proxy.apply_op(CrdtSingletonOp::Update {
            actor: self.core.name.clone(),
            version_map,
            value: stored,
        })?)
    }

    pub fn clear(&self) -> Result<Completion<bool>> {
        self.core.check_write("clear")?;
        let version_map = self.proxy.version_map()?;
        Ok(self.proxy.apply_op(CrdtSingletonOp::Clear {
            actor: self.core.name.clone(),
            version_map,
        })?)
    }

    pub fn on_ready(&self, callback: impl Fn() + Send + Sync + 'static) -> Result<()> {
        self.core.check_read("on_ready")?;
        let callback = HandleCore::guarded(&self.core, callback);
        Ok(self.proxy.add_on_ready(&self.core.callback_id, callback)?)
    }

    pub fn on_update(
        &self,
        callback: impl Fn(SingletonDelta<A::Value>) + Send + Sync + 'static,
    ) -> Result<()> {
        self.core.check_read("on_update")?;
        let core = self.core.clone();
        Ok(self.proxy.add_on_update(
            &self.core.callback_id,
            Arc::new(move |old: &Option<A::Stored>, new: &Option<A::Stored>| {
                if core.is_closed() {
                    return;
                }
                callback(SingletonDelta {
                    old: core.live_values(old.as_ref()).pop(),
                    new: core.live_values(new.as_ref()).pop(),
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

impl<S: EntitySpec> SingletonHandle<EntityStorageAdapter<S>> {
    /// Reference to `entity`, which must be this handle's current value
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
        let current = self.proxy.get_particle_view_unsafe()?;
        if current.map(|stored| stored.id) != Some(id.clone()) {
            return Err(HandleError::ReferenceIntegrity(
                "Entity is not stored in the Singleton.".to_string(),
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

impl<A: StorageAdapter> ParticleHandle for SingletonHandle<A> {
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
        SingletonHandle::close(self);
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}
