//! Building handles and owning the proxies behind them
//!
//! One manager serves one particle host within an arc. It keeps a single
//! proxy per storage key, shared by every handle opened on that key, and a
//! single backing proxy per reference-mode backing key.

use super::{
    AnyHandle, CollectionHandle, EntityStorageAdapter, HandleContainerType, HandleCore,
    HandleDataType, HandleSpec, ParticleHandle, ReferenceStorageAdapter, SingletonHandle,
    StorageAdapter,
};
use crate::config::HandleConfig;
use crate::data::{EntitySpec, RawEntity, Reference, Schema, SchemaRegistry, Ttl};
use crate::error::{HandleError, Result};
use crate::scheduler::Scheduler;
use crate::storage::{
    AnyStorageProxy, DereferencerFactory, ForeignReferenceChecker, ForeignReferenceCheckerImpl,
    ReferenceModeModel, ReferenceModeProxy, StorageKey, StorageProxy, StorageProxyImpl, Store,
    StoreManager,
};
use crate::time::{SystemTime, Time};
use crate::types::{CallbackIdentifier, IdGenerator};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tapestry_crdt::{CrdtModel, CrdtSet, CrdtSingleton};
use tracing::{debug, info};

/// Per-handle settings supplied by the particle host
#[derive(Debug, Clone, Default)]
pub struct HandleOptions {
    /// Owning particle; scopes callbacks and the handle's actor name
    pub particle: String,
    /// Overrides the manager's default TTL
    pub ttl: Option<Ttl>,
}

impl HandleOptions {
    pub fn for_particle(particle: impl Into<String>) -> Self {
        Self {
            particle: particle.into(),
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Ttl) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

struct ProxyEntry {
    container: HandleContainerType,
    /// Holds an `Arc<dyn StorageProxy<M>>` for the key's model
    proxy: Arc<dyn Any + Send + Sync>,
    control: Arc<dyn AnyStorageProxy>,
    handles: usize,
}

#[derive(Default)]
struct Registry {
    closed: bool,
    proxies: HashMap<StorageKey, ProxyEntry>,
    backing: HashMap<StorageKey, Arc<StorageProxyImpl<CrdtSet<RawEntity>>>>,
    /// Open handles by slot; a slot is freed when its handle closes
    handles: HashMap<u64, Arc<dyn ParticleHandle>>,
    next_slot: u64,
}

pub struct HandleManagerBuilder {
    arc_id: String,
    host: String,
    scheduler: Scheduler,
    stores: Option<Arc<StoreManager>>,
    schemas: Option<Arc<SchemaRegistry>>,
    time: Option<Arc<dyn Time>>,
    ids: Option<IdGenerator>,
    checker: Option<Arc<dyn ForeignReferenceChecker>>,
    config: HandleConfig,
}

impl HandleManagerBuilder {
    /// Share stores with other managers in the process
    pub fn stores(mut self, stores: Arc<StoreManager>) -> Self {
        self.stores = Some(stores);
        self
    }

    pub fn schemas(mut self, schemas: Arc<SchemaRegistry>) -> Self {
        self.schemas = Some(schemas);
        self
    }

    pub fn time(mut self, time: Arc<dyn Time>) -> Self {
        self.time = Some(time);
        self
    }

    pub fn ids(mut self, ids: IdGenerator) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn foreign_checker(mut self, checker: Arc<dyn ForeignReferenceChecker>) -> Self {
        self.checker = Some(checker);
        self
    }

    pub fn config(mut self, config: HandleConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<HandleManager> {
        let default_ttl = match &self.config.default_ttl {
            Some(text) => Ttl::parse(text)?,
            None => Ttl::Infinite,
        };
        let stores = self.stores.unwrap_or_default();
        let schemas = self.schemas.unwrap_or_default();
        let checker = self
            .checker
            .unwrap_or_else(|| Arc::new(ForeignReferenceCheckerImpl::empty()));
        let dereferencers = DereferencerFactory::new(schemas, checker);
        debug!(arc = %self.arc_id, host = %self.host, ttl = %default_ttl, "Handle manager created");
        Ok(HandleManager {
            arc_id: self.arc_id,
            host: self.host,
            scheduler: self.scheduler,
            stores,
            time: self.time.unwrap_or_else(|| Arc::new(SystemTime)),
            ids: self.ids.unwrap_or_default(),
            default_ttl,
            dereferencers,
            registry: Arc::new(Mutex::new(Registry::default())),
        })
    }
}

/// Creates handles for one host in one arc
pub struct HandleManager {
    arc_id: String,
    host: String,
    scheduler: Scheduler,
    stores: Arc<StoreManager>,
    time: Arc<dyn Time>,
    ids: IdGenerator,
    default_ttl: Ttl,
    dereferencers: Arc<DereferencerFactory>,
    registry: Arc<Mutex<Registry>>,
}

impl HandleManager {
    pub fn builder(
        arc_id: impl Into<String>,
        host: impl Into<String>,
        scheduler: Scheduler,
    ) -> HandleManagerBuilder {
        HandleManagerBuilder {
            arc_id: arc_id.into(),
            host: host.into(),
            scheduler,
            stores: None,
            schemas: None,
            time: None,
            ids: None,
            checker: None,
            config: HandleConfig::default(),
        }
    }

    pub fn arc_id(&self) -> &str {
        &self.arc_id
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn time(&self) -> &Arc<dyn Time> {
        &self.time
    }

    pub fn dereferencers(&self) -> &Arc<DereferencerFactory> {
        &self.dereferencers
    }

    pub fn is_closed(&self) -> bool {
        self.registry.lock().closed
    }

    /// Handles created here and not yet closed
    pub fn handle_count(&self) -> usize {
        self.registry.lock().handles.len()
    }

    /// Build whichever handle `spec` describes
    pub fn create_handle<S: EntitySpec>(
        &self,
        spec: &HandleSpec<S>,
        key: StorageKey,
        options: &HandleOptions,
    ) -> Result<AnyHandle<S>> {
        Ok(match (spec.container, spec.data_type) {
            (HandleContainerType::Singleton, HandleDataType::Entity) => {
                AnyHandle::EntitySingleton(self.entity_singleton_handle(spec, key, options)?)
            }
            (HandleContainerType::Collection, HandleDataType::Entity) => {
                AnyHandle::EntityCollection(self.entity_collection_handle(spec, key, options)?)
            }
            (HandleContainerType::Singleton, HandleDataType::Reference) => {
                AnyHandle::ReferenceSingleton(self.reference_singleton_handle(spec, key, options)?)
            }
            (HandleContainerType::Collection, HandleDataType::Reference) => {
                AnyHandle::ReferenceCollection(
                    self.reference_collection_handle(spec, key, options)?,
                )
            }
        })
    }

    pub fn entity_singleton_handle<S: EntitySpec>(
        &self,
        spec: &HandleSpec<S>,
        key: StorageKey,
        options: &HandleOptions,
    ) -> Result<SingletonHandle<EntityStorageAdapter<S>>> {
        expect_kind(spec, HandleContainerType::Singleton, HandleDataType::Entity)?;
        let proxy = self.entity_proxy::<CrdtSingleton<RawEntity>>(&key, spec.container)?;
        let (core, slot) = self.core(spec, &key, options, |name, ttl| {
            self.entity_adapter(name, spec, ttl)
        });
        let handle = SingletonHandle::new(core, proxy.clone());
        self.finish(spec, &*proxy, slot, Arc::new(handle.clone()))?;
        Ok(handle)
    }

    pub fn entity_collection_handle<S: EntitySpec>(
        &self,
        spec: &HandleSpec<S>,
        key: StorageKey,
        options: &HandleOptions,
    ) -> Result<CollectionHandle<EntityStorageAdapter<S>>> {
        expect_kind(spec, HandleContainerType::Collection, HandleDataType::Entity)?;
        let proxy = self.entity_proxy::<CrdtSet<RawEntity>>(&key, spec.container)?;
        let (core, slot) = self.core(spec, &key, options, |name, ttl| {
            self.entity_adapter(name, spec, ttl)
        });
        let handle = CollectionHandle::new(core, proxy.clone());
        self.finish(spec, &*proxy, slot, Arc::new(handle.clone()))?;
        Ok(handle)
    }

    pub fn reference_singleton_handle<S: EntitySpec>(
        &self,
        spec: &HandleSpec<S>,
        key: StorageKey,
        options: &HandleOptions,
    ) -> Result<SingletonHandle<ReferenceStorageAdapter>> {
        expect_kind(spec, HandleContainerType::Singleton, HandleDataType::Reference)?;
        let proxy = self.reference_proxy::<CrdtSingleton<Reference>>(&key, spec.container)?;
        let (core, slot) = self.core(spec, &key, options, |_, ttl| {
            self.reference_adapter(spec.entity_spec.schema(), ttl)
        });
        let handle = SingletonHandle::new(core, proxy.clone());
        self.finish(spec, &*proxy, slot, Arc::new(handle.clone()))?;
        Ok(handle)
    }

    pub fn reference_collection_handle<S: EntitySpec>(
        &self,
        spec: &HandleSpec<S>,
        key: StorageKey,
        options: &HandleOptions,
    ) -> Result<CollectionHandle<ReferenceStorageAdapter>> {
        expect_kind(spec, HandleContainerType::Collection, HandleDataType::Reference)?;
        let proxy = self.reference_proxy::<CrdtSet<Reference>>(&key, spec.container)?;
        let (core, slot) = self.core(spec, &key, options, |_, ttl| {
            self.reference_adapter(spec.entity_spec.schema(), ttl)
        });
        let handle = CollectionHandle::new(core, proxy.clone());
        self.finish(spec, &*proxy, slot, Arc::new(handle.clone()))?;
        Ok(handle)
    }

    /// Reference to a foreign entity, if the foreign checker accepts `id`
    pub fn create_foreign_reference(&self, schema: &Arc<Schema>, id: &str) -> Option<Reference> {
        self.dereferencers.foreign_reference(schema, id)
    }

    /// Every proxy this manager owns, backing proxies included
    pub fn all_storage_proxies(&self) -> Vec<Arc<dyn AnyStorageProxy>> {
        let registry = self.registry.lock();
        let mut proxies: Vec<Arc<dyn AnyStorageProxy>> = registry
            .proxies
            .values()
            .map(|entry| entry.control.clone())
            .collect();
        for backing in registry.backing.values() {
            let proxy: Arc<dyn StorageProxy<CrdtSet<RawEntity>>> = backing.clone();
            proxies.push(Arc::new(proxy));
        }
        proxies
    }

    /// Let pending work finish, then close every handle and proxy
    pub async fn close(&self) -> Result<()> {
        self.scheduler.wait_for_idle().await?;
        let (handles, proxies, backing) = {
            let mut registry = self.registry.lock();
            if registry.closed {
                return Ok(());
            }
            registry.closed = true;
            (
                std::mem::take(&mut registry.handles),
                std::mem::take(&mut registry.proxies),
                std::mem::take(&mut registry.backing),
            )
        };
        for handle in handles.values() {
            handle.close();
        }
        for entry in proxies.values() {
            entry.control.close();
        }
        for proxy in backing.values() {
            StorageProxy::close(&**proxy);
        }
        info!(arc = %self.arc_id, host = %self.host, handles = handles.len(), "Handle manager closed");
        Ok(())
    }

    fn entity_adapter<S: EntitySpec>(
        &self,
        name: &str,
        spec: &HandleSpec<S>,
        ttl: Ttl,
    ) -> EntityStorageAdapter<S> {
        EntityStorageAdapter::new(
            name,
            spec.entity_spec.clone(),
            ttl,
            self.time.clone(),
            self.ids.clone(),
            self.dereferencers.clone(),
        )
    }

    fn reference_adapter(&self, schema: &Arc<Schema>, ttl: Ttl) -> ReferenceStorageAdapter {
        ReferenceStorageAdapter::new(
            schema.clone(),
            ttl,
            self.time.clone(),
            self.dereferencers.clone(),
        )
    }

    fn core<S, A: StorageAdapter>(
        &self,
        spec: &HandleSpec<S>,
        key: &StorageKey,
        options: &HandleOptions,
        adapter: impl FnOnce(&str, Ttl) -> A,
    ) -> (HandleCore<A>, u64) {
        let name = format!(
            "{}:{}:{}:{}",
            self.arc_id, self.host, options.particle, spec.name
        );
        let ttl = options.ttl.unwrap_or(self.default_ttl);
        let callback_id = CallbackIdentifier::new(name.clone(), Some(options.particle.clone()));
        let adapter = adapter(&name, ttl);
        let slot = {
            let mut registry = self.registry.lock();
            registry.next_slot += 1;
            registry.next_slot
        };
        let core = HandleCore::new(
            name,
            spec.mode,
            callback_id,
            adapter,
            Some(self.release(key.clone(), slot)),
        );
        (core, slot)
    }

    /// Runs when a handle closes; the last handle on a key closes its proxy
    fn release(&self, key: StorageKey, slot: u64) -> Box<dyn Fn() + Send + Sync> {
        let registry: Weak<Mutex<Registry>> = Arc::downgrade(&self.registry);
        Box::new(move || {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            let released = {
                let mut registry = registry.lock();
                registry.handles.remove(&slot);
                let last = match registry.proxies.get_mut(&key) {
                    Some(entry) => {
                        entry.handles = entry.handles.saturating_sub(1);
                        entry.handles == 0
                    }
                    None => false,
                };
                if last {
                    registry.proxies.remove(&key)
                } else {
                    None
                }
            };
            if let Some(entry) = released {
                debug!(storage_key = %key, "Last handle closed, closing proxy");
                entry.control.close();
            }
        })
    }

    /// Start syncing where the handle can read, then remember the handle
    fn finish<S, M: CrdtModel>(
        &self,
        spec: &HandleSpec<S>,
        proxy: &dyn StorageProxy<M>,
        slot: u64,
        handle: Arc<dyn ParticleHandle>,
    ) -> Result<()> {
        if spec.mode.can_read() || spec.mode.can_query() {
            proxy.prepare_for_sync();
        }
        proxy.maybe_initiate_sync();
        debug!(handle = %handle.name(), storage_key = %proxy.storage_key(), mode = %spec.mode, "Handle created");
        let mut registry = self.registry.lock();
        if registry.closed {
            drop(registry);
            handle.close();
            return Err(self.closed_error().into());
        }
        registry.handles.insert(slot, handle);
        Ok(())
    }

    fn closed_error(&self) -> HandleError {
        HandleError::Construction(format!("HandleManager for arc {} is closed", self.arc_id))
    }

    /// Shared proxy for `key`, built by `create` on first use
    fn proxy<M: CrdtModel>(
        &self,
        key: &StorageKey,
        container: HandleContainerType,
        create: impl FnOnce(&mut Registry) -> Result<Arc<dyn StorageProxy<M>>>,
    ) -> Result<Arc<dyn StorageProxy<M>>> {
        let mut registry = self.registry.lock();
        if registry.closed {
            return Err(self.closed_error().into());
        }
        if let Some(entry) = registry.proxies.get_mut(key) {
            if entry.container != container {
                return Err(HandleError::Construction(format!(
                    "Storage key is already being used for a {}, it cannot be reused for a {}.",
                    entry.container, container
                ))
                .into());
            }
            let proxy = entry
                .proxy
                .clone()
                .downcast::<Arc<dyn StorageProxy<M>>>()
                .map_err(|_| {
                    HandleError::Construction(format!(
                        "Storage key {} is already being used for a different data type.",
                        key
                    ))
                })?;
            entry.handles += 1;
            return Ok((*proxy).clone());
        }

        let proxy = create(&mut *registry)?;
        registry.proxies.insert(
            key.clone(),
            ProxyEntry {
                container,
                proxy: Arc::new(proxy.clone()),
                control: Arc::new(proxy.clone()),
                handles: 1,
            },
        );
        debug!(storage_key = %key, container = %container, "Proxy created");
        Ok(proxy)
    }

    fn direct_proxy<M: CrdtModel>(&self, key: &StorageKey) -> Arc<dyn StorageProxy<M>> {
        let store: Arc<dyn Store<M>> = self.stores.get_or_create::<M>(key);
        StorageProxyImpl::new(store, self.scheduler.clone())
    }

    /// Entity proxies split reference-mode keys into pointer and backing
    fn entity_proxy<M: ReferenceModeModel>(
        &self,
        key: &StorageKey,
        container: HandleContainerType,
    ) -> Result<Arc<dyn StorageProxy<M>>> {
        self.proxy::<M>(key, container, |registry| match key {
            StorageKey::ReferenceMode(inner) => {
                let backing_key = (*inner.backing_key).clone();
                let backing = registry
                    .backing
                    .entry(backing_key.clone())
                    .or_insert_with(|| {
                        let store: Arc<dyn Store<CrdtSet<RawEntity>>> =
                            self.stores.get_or_create::<CrdtSet<RawEntity>>(&backing_key);
                        let backing = StorageProxyImpl::new(store, self.scheduler.clone());
                        self.dereferencers.register_backing(&backing);
                        backing
                    })
                    .clone();
                let pointer_store: Arc<dyn Store<M::Pointer>> =
                    self.stores.get_or_create::<M::Pointer>(&inner.storage_key);
                let pointer = StorageProxyImpl::new(pointer_store, self.scheduler.clone());
                let proxy: Arc<dyn StorageProxy<M>> =
                    ReferenceModeProxy::<M>::new(key.clone(), pointer, backing)?;
                Ok(proxy)
            }
            _ => Ok(self.direct_proxy::<M>(key)),
        })
    }

    fn reference_proxy<M: CrdtModel>(
        &self,
        key: &StorageKey,
        container: HandleContainerType,
    ) -> Result<Arc<dyn StorageProxy<M>>> {
        if key.is_reference_mode() {
            return Err(HandleError::Construction(
                "Reference-mode storage keys are not supported for reference-typed handles."
                    .to_string(),
            )
            .into());
        }
        self.proxy::<M>(key, container, |_| Ok(self.direct_proxy::<M>(key)))
    }
}

fn expect_kind<S>(
    spec: &HandleSpec<S>,
    container: HandleContainerType,
    data_type: HandleDataType,
) -> std::result::Result<(), HandleError> {
    if spec.container == container && spec.data_type == data_type {
        Ok(())
    } else {
        Err(HandleError::Construction(format!(
            "Handle {} is a {:?} {}, not a {:?} {}",
            spec.name, spec.data_type, spec.container, data_type, container
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{BaseEntitySpec, FieldType, FieldValue};
    use crate::error::Error;
    use crate::handle::HandleMode;
    use crate::storage::ProxyState;
    use crate::time::FakeTime;

    fn person_spec() -> Arc<BaseEntitySpec> {
        let schema = Schema::builder("Person")
            .singleton("name", FieldType::Text)
            .build();
        Arc::new(BaseEntitySpec::new("Person", Arc::new(schema)))
    }

    fn spec(
        name: &str,
        mode: HandleMode,
        container: HandleContainerType,
        data_type: HandleDataType,
    ) -> HandleSpec<BaseEntitySpec> {
        HandleSpec::new(name, mode, container, data_type, person_spec()).unwrap()
    }

    fn manager(scheduler: &Scheduler, stores: &Arc<StoreManager>) -> HandleManager {
        HandleManager::builder("arc", "host", scheduler.clone())
            .stores(stores.clone())
            .time(Arc::new(FakeTime::new(1_000)))
            .ids(IdGenerator::with_session("s"))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_handles_on_one_key_share_a_proxy() {
        let scheduler = Scheduler::current("arc");
        let stores = Arc::new(StoreManager::new());
        let manager = manager(&scheduler, &stores);
        let key = StorageKey::ram("people");
        let options = HandleOptions::for_particle("p");

        let writer = manager
            .entity_collection_handle(
                &spec("w", HandleMode::Write, HandleContainerType::Collection, HandleDataType::Entity),
                key.clone(),
                &options,
            )
            .unwrap();
        let reader = manager
            .entity_collection_handle(
                &spec("r", HandleMode::Read, HandleContainerType::Collection, HandleDataType::Entity),
                key.clone(),
                &options,
            )
            .unwrap();
        scheduler.wait_for_idle().await.unwrap();
        assert_eq!(manager.all_storage_proxies().len(), 1);
        assert_eq!(writer.name(), "arc:host:p:w");

        let mut person = person_spec().create();
        person
            .set_singleton("name", Some(FieldValue::from("Ada")))
            .unwrap();
        writer.store(&mut person).unwrap();
        // Same replica, so the reader sees the write before any round trip
        assert_eq!(reader.fetch_all().unwrap(), vec![person]);
    }

    #[tokio::test]
    async fn test_container_mismatch_is_rejected() {
        let scheduler = Scheduler::current("arc");
        let manager = manager(&scheduler, &Arc::new(StoreManager::new()));
        let key = StorageKey::ram("people");
        let options = HandleOptions::for_particle("p");
        manager
            .entity_collection_handle(
                &spec("c", HandleMode::Read, HandleContainerType::Collection, HandleDataType::Entity),
                key.clone(),
                &options,
            )
            .unwrap();

        let err = manager
            .entity_singleton_handle(
                &spec("s", HandleMode::Read, HandleContainerType::Singleton, HandleDataType::Entity),
                key,
                &options,
            )
            .err()
            .unwrap();
        assert_eq!(
            err.to_string(),
            "Storage key is already being used for a collection, it cannot be reused for a singleton."
        );
    }

    #[tokio::test]
    async fn test_reference_handles_reject_reference_mode_keys() {
        let scheduler = Scheduler::current("arc");
        let manager = manager(&scheduler, &Arc::new(StoreManager::new()));
        let err = manager
            .create_handle(
                &spec(
                    "refs",
                    HandleMode::Read,
                    HandleContainerType::Collection,
                    HandleDataType::Reference,
                ),
                StorageKey::reference_mode_for("people", "ram"),
                &HandleOptions::for_particle("p"),
            )
            .err()
            .unwrap();
        assert!(matches!(err, Error::Handle(HandleError::Construction(_))));
        assert_eq!(
            err.to_string(),
            "Reference-mode storage keys are not supported for reference-typed handles."
        );
    }

    #[tokio::test]
    async fn test_reference_mode_keys_share_backing_proxy() {
        let scheduler = Scheduler::current("arc");
        let manager = manager(&scheduler, &Arc::new(StoreManager::new()));
        let options = HandleOptions::for_particle("p");
        let backing = StorageKey::ram("backing");
        for name in ["a", "b"] {
            manager
                .entity_collection_handle(
                    &spec(name, HandleMode::Read, HandleContainerType::Collection, HandleDataType::Entity),
                    StorageKey::reference_mode(backing.clone(), StorageKey::ram(name)),
                    &options,
                )
                .unwrap();
        }
        // Two reference-mode proxies plus one shared backing proxy
        assert_eq!(manager.all_storage_proxies().len(), 3);
    }

    #[tokio::test]
    async fn test_last_handle_close_closes_proxy() {
        let scheduler = Scheduler::current("arc");
        let manager = manager(&scheduler, &Arc::new(StoreManager::new()));
        let options = HandleOptions::for_particle("p");
        let handle_spec = spec(
            "s",
            HandleMode::ReadWrite,
            HandleContainerType::Singleton,
            HandleDataType::Entity,
        );
        let first = manager
            .entity_singleton_handle(&handle_spec, StorageKey::ram("one"), &options)
            .unwrap();
        let second = manager
            .entity_singleton_handle(&handle_spec, StorageKey::ram("one"), &options)
            .unwrap();
        let proxy = manager.all_storage_proxies().pop().unwrap();

        first.close();
        assert_ne!(proxy.state(), ProxyState::Closed);
        second.close();
        assert_eq!(proxy.state(), ProxyState::Closed);
        assert!(manager.all_storage_proxies().is_empty());
    }

    #[tokio::test]
    async fn test_closed_handles_are_pruned() {
        let scheduler = Scheduler::current("arc");
        let manager = manager(&scheduler, &Arc::new(StoreManager::new()));
        let options = HandleOptions::for_particle("p");
        let handle_spec = spec(
            "c",
            HandleMode::Read,
            HandleContainerType::Collection,
            HandleDataType::Entity,
        );
        let first = manager
            .entity_collection_handle(&handle_spec, StorageKey::ram("one"), &options)
            .unwrap();
        let _second = manager
            .entity_collection_handle(&handle_spec, StorageKey::ram("two"), &options)
            .unwrap();
        assert_eq!(manager.handle_count(), 2);

        first.close();
        first.close();
        assert_eq!(manager.handle_count(), 1);

        manager.close().await.unwrap();
        assert_eq!(manager.handle_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_manager_refuses_new_handles() {
        let scheduler = Scheduler::current("arc");
        let manager = manager(&scheduler, &Arc::new(StoreManager::new()));
        let options = HandleOptions::for_particle("p");
        let handle_spec = spec(
            "s",
            HandleMode::Read,
            HandleContainerType::Singleton,
            HandleDataType::Entity,
        );
        let handle = manager
            .entity_singleton_handle(&handle_spec, StorageKey::ram("one"), &options)
            .unwrap();

        manager.close().await.unwrap();
        assert!(manager.is_closed());
        assert!(handle.is_closed());
        assert!(manager
            .entity_singleton_handle(&handle_spec, StorageKey::ram("two"), &options)
            .is_err());
    }

    #[test]
    fn test_invalid_default_ttl() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = runtime.enter();
        let result = HandleManager::builder("arc", "host", Scheduler::current("arc"))
            .config(HandleConfig {
                default_ttl: Some("forever".into()),
            })
            .build();
        assert!(matches!(result, Err(Error::Entity(_))));
    }
}
