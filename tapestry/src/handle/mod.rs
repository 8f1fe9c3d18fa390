//! Handles: typed, capability-checked access to storage proxies
//!
//! A handle pairs a shared [`StorageProxy`](crate::storage::StorageProxy)
//! with a [`StorageAdapter`] that turns stored CRDT payloads into the values
//! callers work with. Writes are visible to the writing handle's next read
//! at once; the returned [`Completion`](crate::scheduler::Completion)
//! resolves when the store has answered.

mod adapter;
mod collection;
mod manager;
mod singleton;
mod spec;

pub use adapter::{EntityStorageAdapter, ReferenceStorageAdapter, StorageAdapter};
pub use collection::CollectionHandle;
pub use manager::{HandleManager, HandleManagerBuilder, HandleOptions};
pub use singleton::SingletonHandle;
pub use spec::{HandleContainerType, HandleDataType, HandleMode, HandleSpec};

use crate::data::EntitySpec;
use crate::error::{HandleError, Result};
use crate::storage::{EventCallback, ProxyState};
use crate::types::CallbackIdentifier;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// What the particle lifecycle needs from a handle
pub trait ParticleHandle: Send + Sync {
    fn name(&self) -> &str;

    fn mode(&self) -> HandleMode;

    fn proxy_state(&self) -> ProxyState;

    fn maybe_initiate_sync(&self);

    fn register_for_storage_events(&self, callback: EventCallback) -> Result<()>;

    fn unregister_for_storage_events(&self);

    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Change seen by a singleton handle
#[derive(Debug, Clone, PartialEq)]
pub struct SingletonDelta<V> {
    pub old: Option<V>,
    pub new: Option<V>,
}

/// Change seen by a collection handle, matched by entity id
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionDelta<V> {
    pub added: Vec<V>,
    pub removed: Vec<V>,
}

/// State shared by every clone of one handle
pub(crate) struct HandleCore<A: StorageAdapter> {
    pub(crate) name: String,
    pub(crate) mode: HandleMode,
    pub(crate) callback_id: CallbackIdentifier,
    pub(crate) adapter: A,
    closed: AtomicBool,
    on_close: Option<Box<dyn Fn() + Send + Sync>>,
}

impl<A: StorageAdapter> HandleCore<A> {
    pub(crate) fn new(
        name: String,
        mode: HandleMode,
        callback_id: CallbackIdentifier,
        adapter: A,
        on_close: Option<Box<dyn Fn() + Send + Sync>>,
    ) -> Self {
        Self {
            name,
            mode,
            callback_id,
            adapter,
            closed: AtomicBool::new(false),
            on_close,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn check_open(&self) -> std::result::Result<(), HandleError> {
        if self.is_closed() {
            Err(HandleError::Closed(self.name.clone()))
        } else {
            Ok(())
        }
    }

    fn check(&self, allowed: bool, operation: &str) -> std::result::Result<(), HandleError> {
        self.check_open()?;
        if allowed {
            Ok(())
        } else {
            Err(HandleError::NotPermitted {
                handle: self.name.clone(),
                operation: operation.to_string(),
                mode: self.mode.to_string(),
            })
        }
    }

    pub(crate) fn check_read(&self, operation: &str) -> std::result::Result<(), HandleError> {
        self.check(self.mode.can_read(), operation)
    }

    pub(crate) fn check_write(&self, operation: &str) -> std::result::Result<(), HandleError> {
        self.check(self.mode.can_write(), operation)
    }

    pub(crate) fn check_query(&self, operation: &str) -> std::result::Result<(), HandleError> {
        self.check(self.mode.can_query(), operation)
    }

    /// Mark closed; true only for the call that did it
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(on_close) = &self.on_close {
            on_close();
        }
        debug!(handle = %self.name, "Handle closed");
        true
    }

    /// Live values from stored payloads; expired or unreadable ones are skipped
    pub(crate) fn live_values<'a>(
        &self,
        stored: impl IntoIterator<Item = &'a A::Stored>,
    ) -> Vec<A::Value> {
        stored
            .into_iter()
            .filter(|item| !self.adapter.is_expired(item))
            .filter_map(|item| match self.adapter.to_value(item) {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!(handle = %self.name, error = %err, "Skipping unreadable value");
                    None
                }
            })
            .collect()
    }

    /// Wrap a callback so it stays silent once the handle is closed
    pub(crate) fn guarded<F>(core: &Arc<Self>, callback: F) -> Arc<dyn Fn() + Send + Sync>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let core = core.clone();
        Arc::new(move || {
            if !core.is_closed() {
                callback();
            }
        })
    }
}

/// Any handle a [`HandleManager`] can build for an entity spec
pub enum AnyHandle<S: EntitySpec> {
    EntitySingleton(SingletonHandle<EntityStorageAdapter<S>>),
    EntityCollection(CollectionHandle<EntityStorageAdapter<S>>),
    ReferenceSingleton(SingletonHandle<ReferenceStorageAdapter>),
    ReferenceCollection(CollectionHandle<ReferenceStorageAdapter>),
}

impl<S: EntitySpec> AnyHandle<S> {
    fn as_particle_handle(&self) -> &dyn ParticleHandle {
        match self {
            AnyHandle::EntitySingleton(handle) => handle,
            AnyHandle::EntityCollection(handle) => handle,
            AnyHandle::ReferenceSingleton(handle) => handle,
            AnyHandle::ReferenceCollection(handle) => handle,
        }
    }

    /// Shareable handle for a particle's lifecycle
    pub fn into_particle_handle(self) -> Arc<dyn ParticleHandle> {
        match self {
            AnyHandle::EntitySingleton(handle) => Arc::new(handle),
            AnyHandle::EntityCollection(handle) => Arc::new(handle),
            AnyHandle::ReferenceSingleton(handle) => Arc::new(handle),
            AnyHandle::ReferenceCollection(handle) => Arc::new(handle),
        }
    }

    pub fn into_entity_singleton(self) -> Option<SingletonHandle<EntityStorageAdapter<S>>> {
        match self {
            AnyHandle::EntitySingleton(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn into_entity_collection(self) -> Option<CollectionHandle<EntityStorageAdapter<S>>> {
        match self {
            AnyHandle::EntityCollection(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn into_reference_singleton(self) -> Option<SingletonHandle<ReferenceStorageAdapter>> {
        match self {
            AnyHandle::ReferenceSingleton(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn into_reference_collection(self) -> Option<CollectionHandle<ReferenceStorageAdapter>> {
        match self {
            AnyHandle::ReferenceCollection(handle) => Some(handle),
            _ => None,
        }
    }
}

impl<S: EntitySpec> ParticleHandle for AnyHandle<S> {
    fn name(&self) -> &str {
        self.as_particle_handle().name()
    }

    fn mode(&self) -> HandleMode {
        self.as_particle_handle().mode()
    }

    fn proxy_state(&self) -> ProxyState {
        self.as_particle_handle().proxy_state()
    }

    fn maybe_initiate_sync(&self) {
        self.as_particle_handle().maybe_initiate_sync()
    }

    fn register_for_storage_events(&self, callback: EventCallback) -> Result<()> {
        self.as_particle_handle().register_for_storage_events(callback)
    }

    fn unregister_for_storage_events(&self) {
        self.as_particle_handle().unregister_for_storage_events()
    }

    fn close(&self) {
        self.as_particle_handle().close()
    }

    fn is_closed(&self) -> bool {
        self.as_particle_handle().is_closed()
    }
}
