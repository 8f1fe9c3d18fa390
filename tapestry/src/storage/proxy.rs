//! Storage proxies: local CRDT replicas kept in step with a store
//!
//! A proxy applies local ops to its replica immediately, then forwards
//! them to the store. Store traffic arrives as processor tasks on the arc's
//! scheduler; callbacks are delivered as listener tasks.
//!
//! ```text
//!  NoSync ──prepare_for_sync──▶ ReadyToSync ──maybe_initiate_sync──▶ AwaitingSync
//!     └────────────────maybe_initiate_sync──────────────────────────────┘   │ model
//!                                                                           ▼
//!                        Desync ◀──── op does not follow replica ──────── Sync
//!                          └──────────── model merged (resync) ───────────▲
//! ```

use crate::error::{StorageError, StorageResult};
use crate::scheduler::{Completion, Scheduler, Task};
use crate::storage::key::StorageKey;
use crate::storage::store::{Store, StoreEvent, StoreResponse};
use crate::types::{CallbackIdentifier, SubscriptionId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tapestry_crdt::{CrdtModel, VersionMap};
use tracing::{debug, trace, warn};

/// Synchronization state of a proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyState {
    /// Created; nobody has asked to read
    NoSync,
    /// A reader exists; sync starts when requested
    ReadyToSync,
    /// Waiting for the store's model
    AwaitingSync,
    /// Replica follows the store
    Sync,
    /// An op could not be applied; waiting for a fresh model
    Desync,
    Closed,
}

impl fmt::Display for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProxyState::NoSync => "NoSync",
            ProxyState::ReadyToSync => "ReadyToSync",
            ProxyState::AwaitingSync => "AwaitingSync",
            ProxyState::Sync => "Sync",
            ProxyState::Desync => "Desync",
            ProxyState::Closed => "Closed",
        };
        f.write_str(name)
    }
}

/// Storage-level events delivered to particles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageEvent {
    Ready,
    Update,
    Desync,
    Resync,
}

pub type ActionCallback = Arc<dyn Fn() + Send + Sync>;
/// Called with the previous and the new consumer view
pub type UpdateCallback<V> = Arc<dyn Fn(&V, &V) + Send + Sync>;
pub type EventCallback = Arc<dyn Fn(StorageEvent) + Send + Sync>;

/// Consumer-facing side of a storage proxy
pub trait StorageProxy<M: CrdtModel>: Send + Sync {
    fn storage_key(&self) -> &StorageKey;

    fn state(&self) -> ProxyState;

    /// Note that a reader exists; idempotent
    fn prepare_for_sync(&self);

    /// Request the store's model unless a sync is already under way
    fn maybe_initiate_sync(&self);

    /// Apply ops locally and forward them to the store
    ///
    /// Resolves to whether the store took them. A local rejection resolves
    /// to false without contacting the store.
    fn apply_ops(&self, ops: Vec<M::Op>) -> StorageResult<Completion<bool>>;

    fn apply_op(&self, op: M::Op) -> StorageResult<Completion<bool>> {
        self.apply_ops(vec![op])
    }

    /// Current consumer view; only valid once synced
    fn get_particle_view_unsafe(&self) -> StorageResult<M::View>;

    fn version_map(&self) -> StorageResult<VersionMap>;

    fn add_on_ready(&self, id: &CallbackIdentifier, callback: ActionCallback) -> StorageResult<()>;

    fn add_on_update(
        &self,
        id: &CallbackIdentifier,
        callback: UpdateCallback<M::View>,
    ) -> StorageResult<()>;

    fn add_on_desync(&self, id: &CallbackIdentifier, callback: ActionCallback)
        -> StorageResult<()>;

    fn add_on_resync(&self, id: &CallbackIdentifier, callback: ActionCallback)
        -> StorageResult<()>;

    /// One storage-event callback per identifier; replaces any previous one
    fn register_for_storage_events(
        &self,
        id: &CallbackIdentifier,
        callback: EventCallback,
    ) -> StorageResult<()>;

    fn unregister_for_storage_events(&self, id: &CallbackIdentifier);

    fn remove_callbacks_for_name(&self, id: &CallbackIdentifier);

    /// Unsubscribe from the store and drop every callback
    fn close(&self);
}

/// A proxy with its model type erased, for owners of proxies of many models
pub trait AnyStorageProxy: Send + Sync {
    fn storage_key(&self) -> &StorageKey;

    fn state(&self) -> ProxyState;

    fn close(&self);
}

impl<M: CrdtModel> AnyStorageProxy for Arc<dyn StorageProxy<M>> {
    fn storage_key(&self) -> &StorageKey {
        StorageProxy::storage_key(&**self)
    }

    fn state(&self) -> ProxyState {
        StorageProxy::state(&**self)
    }

    fn close(&self) {
        StorageProxy::close(&**self)
    }
}

pub(crate) fn listener_task(id: &CallbackIdentifier, run: impl FnOnce() + Send + 'static) -> Task {
    Task::listener(
        id.namespace.clone().unwrap_or_default(),
        id.handle_name.clone(),
        run,
    )
}

/// Registered callbacks, keyed by owner
pub(crate) struct CallbackSet<V> {
    ready: BTreeMap<CallbackIdentifier, Vec<ActionCallback>>,
    update: BTreeMap<CallbackIdentifier, Vec<UpdateCallback<V>>>,
    desync: BTreeMap<CallbackIdentifier, Vec<ActionCallback>>,
    resync: BTreeMap<CallbackIdentifier, Vec<ActionCallback>>,
    events: BTreeMap<CallbackIdentifier, EventCallback>,
}

impl<V> Default for CallbackSet<V> {
    fn default() -> Self {
        Self {
            ready: BTreeMap::new(),
            update: BTreeMap::new(),
            desync: BTreeMap::new(),
            resync: BTreeMap::new(),
            events: BTreeMap::new(),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> CallbackSet<V> {
    pub(crate) fn add_ready(&mut self, id: &CallbackIdentifier, callback: ActionCallback) {
        self.ready.entry(id.clone()).or_default().push(callback);
    }

    pub(crate) fn add_update(&mut self, id: &CallbackIdentifier, callback: UpdateCallback<V>) {
        self.update.entry(id.clone()).or_default().push(callback);
    }

    pub(crate) fn add_desync(&mut self, id: &CallbackIdentifier, callback: ActionCallback) {
        self.desync.entry(id.clone()).or_default().push(callback);
    }

    pub(crate) fn add_resync(&mut self, id: &CallbackIdentifier, callback: ActionCallback) {
        self.resync.entry(id.clone()).or_default().push(callback);
    }

    pub(crate) fn set_events(&mut self, id: &CallbackIdentifier, callback: EventCallback) {
        self.events.insert(id.clone(), callback);
    }

    pub(crate) fn remove_events(&mut self, id: &CallbackIdentifier) {
        self.events.remove(id);
    }

    pub(crate) fn remove(&mut self, id: &CallbackIdentifier) {
        self.ready.remove(id);
        self.update.remove(id);
        self.desync.remove(id);
        self.resync.remove(id);
        self.events.remove(id);
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }

    fn action_tasks(
        map: &BTreeMap<CallbackIdentifier, Vec<ActionCallback>>,
        tasks: &mut Vec<Task>,
    ) {
        for (id, callbacks) in map {
            for callback in callbacks {
                let callback = callback.clone();
                tasks.push(listener_task(id, move || callback()));
            }
        }
    }

    fn event_tasks(&self, event: StorageEvent, tasks: &mut Vec<Task>) {
        for (id, callback) in &self.events {
            let callback = callback.clone();
            tasks.push(listener_task(id, move || callback(event)));
        }
    }

    pub(crate) fn ready_tasks(&self) -> Vec<Task> {
        let mut tasks = Vec::new();
        Self::action_tasks(&self.ready, &mut tasks);
        self.event_tasks(StorageEvent::Ready, &mut tasks);
        tasks
    }

    pub(crate) fn desync_tasks(&self) -> Vec<Task> {
        let mut tasks = Vec::new();
        Self::action_tasks(&self.desync, &mut tasks);
        self.event_tasks(StorageEvent::Desync, &mut tasks);
        tasks
    }

    pub(crate) fn resync_tasks(&self) -> Vec<Task> {
        let mut tasks = Vec::new();
        Self::action_tasks(&self.resync, &mut tasks);
        self.event_tasks(StorageEvent::Resync, &mut tasks);
        tasks
    }

    pub(crate) fn update_tasks(&self, old: V, new: V) -> Vec<Task> {
        let views = Arc::new((old, new));
        let mut tasks = Vec::new();
        for (id, callbacks) in &self.update {
            for callback in callbacks {
                let callback = callback.clone();
                let views = views.clone();
                tasks.push(listener_task(id, move || callback(&views.0, &views.1)));
            }
        }
        self.event_tasks(StorageEvent::Update, &mut tasks);
        tasks
    }
}

struct ProxyInner<M: CrdtModel> {
    crdt: M,
    state: ProxyState,
    callbacks: CallbackSet<M::View>,
    /// Store ops that arrived before the model they build on
    stashed_ops: Vec<M::Op>,
    first_update_sent: bool,
}

impl<M: CrdtModel> ProxyInner<M> {
    fn check_open(&self) -> StorageResult<()> {
        if self.state == ProxyState::Closed {
            Err(StorageError::ProxyClosed)
        } else {
            Ok(())
        }
    }

    fn check_will_sync(&self) -> StorageResult<()> {
        self.check_open()?;
        if self.state == ProxyState::NoSync {
            return Err(StorageError::WillNotSync);
        }
        Ok(())
    }

    fn is_synced(&self) -> bool {
        matches!(self.state, ProxyState::Sync | ProxyState::Desync)
    }

    /// Update notifications for a view change; unchanged views are skipped
    /// once the first update went out
    fn update_tasks(&mut self, old: M::View, new: M::View) -> Vec<Task> {
        if self.first_update_sent && old == new {
            return Vec::new();
        }
        self.first_update_sent = true;
        self.callbacks.update_tasks(old, new)
    }
}

/// Proxy for one storage key, shared by every handle on that key
pub struct StorageProxyImpl<M: CrdtModel> {
    key: StorageKey,
    store: Arc<dyn Store<M>>,
    scheduler: Scheduler,
    subscription: SubscriptionId,
    this: Weak<Self>,
    inner: Mutex<ProxyInner<M>>,
}

impl<M: CrdtModel> StorageProxyImpl<M> {
    pub fn new(store: Arc<dyn Store<M>>, scheduler: Scheduler) -> Arc<Self> {
        let key = store.storage_key().clone();
        Arc::new_cyclic(|this: &Weak<Self>| {
            let weak = this.clone();
            let subscription = store.subscribe(Arc::new(move |event| {
                if let Some(proxy) = weak.upgrade() {
                    proxy.on_store_event(event);
                }
            }));
            Self {
                key,
                store,
                scheduler,
                subscription,
                this: this.clone(),
                inner: Mutex::new(ProxyInner {
                    crdt: M::empty(),
                    state: ProxyState::NoSync,
                    callbacks: CallbackSet::default(),
                    stashed_ops: Vec::new(),
                    first_update_sent: false,
                }),
            }
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().state == ProxyState::Closed
    }

    /// Read the local replica regardless of sync state
    pub(crate) fn with_model<R>(&self, f: impl FnOnce(&M) -> R) -> R {
        f(&self.inner.lock().crdt)
    }

    fn dispatch(&self, tasks: Vec<Task>) {
        if tasks.is_empty() {
            return;
        }
        if let Err(err) = self.scheduler.schedule_all(tasks) {
            debug!(storage_key = %self.key, error = %err, "Dropping proxy notifications");
        }
    }

    fn on_store_event(&self, event: StoreEvent<M>) {
        if self.is_closed() {
            return;
        }
        let this = self.this.clone();
        let task = Task::processor(move || {
            if let Some(proxy) = this.upgrade() {
                proxy.process_store_event(event);
            }
        });
        if let Err(err) = self.scheduler.schedule(task) {
            debug!(storage_key = %self.key, error = %err, "Dropping store event");
        }
    }

    fn process_store_event(&self, event: StoreEvent<M>) {
        let (tasks, resync) = match event {
            StoreEvent::ModelUpdate(data) => self.process_model_update(data),
            StoreEvent::Operations(ops) => self.process_model_ops(ops),
        };
        self.dispatch(tasks);
        if resync {
            self.request_synchronization();
        }
    }

    fn process_model_update(&self, data: M::Data) -> (Vec<Task>, bool) {
        let mut inner = self.inner.lock();
        let prior = inner.state;
        if !matches!(
            prior,
            ProxyState::AwaitingSync | ProxyState::Sync | ProxyState::Desync
        ) {
            debug!(storage_key = %self.key, state = %prior, "Discarding model update");
            return (Vec::new(), false);
        }

        let old = inner.crdt.consumer_view();
        inner.crdt.merge(&data);
        let stashed = std::mem::take(&mut inner.stashed_ops);
        for op in &stashed {
            if let Err(err) = inner.crdt.apply_operation(op) {
                warn!(storage_key = %self.key, error = %err, "Stashed op does not follow model");
                inner.state = if prior == ProxyState::AwaitingSync {
                    ProxyState::AwaitingSync
                } else {
                    ProxyState::Desync
                };
                let tasks = if prior == ProxyState::Sync {
                    inner.callbacks.desync_tasks()
                } else {
                    Vec::new()
                };
                return (tasks, true);
            }
        }
        let new = inner.crdt.consumer_view();
        inner.state = ProxyState::Sync;

        let tasks = match prior {
            ProxyState::AwaitingSync => {
                debug!(storage_key = %self.key, "Proxy synced");
                inner.callbacks.ready_tasks()
            }
            ProxyState::Desync => {
                debug!(storage_key = %self.key, "Proxy resynced");
                let mut tasks = inner.callbacks.resync_tasks();
                tasks.extend(inner.update_tasks(old, new));
                tasks
            }
            _ => inner.update_tasks(old, new),
        };
        (tasks, false)
    }

    fn process_model_ops(&self, ops: Vec<M::Op>) -> (Vec<Task>, bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            ProxyState::Sync => {}
            ProxyState::AwaitingSync | ProxyState::Desync => {
                inner.stashed_ops.extend(ops);
                return (Vec::new(), false);
            }
            _ => return (Vec::new(), false),
        }

        let old = inner.crdt.consumer_view();
        for op in &ops {
            if let Err(err) = inner.crdt.apply_operation(op) {
                warn!(storage_key = %self.key, error = %err, "Desynced from store");
                inner.state = ProxyState::Desync;
                return (inner.callbacks.desync_tasks(), true);
            }
        }
        trace!(storage_key = %self.key, count = ops.len(), "Applied store ops");
        let new = inner.crdt.consumer_view();
        (inner.update_tasks(old, new), false)
    }

    fn request_synchronization(&self) {
        let store = self.store.clone();
        let this = self.this.clone();
        let key = self.key.clone();
        let spawned = self.scheduler.spawn_io(async move {
            match store.get().await {
                Ok((data, _)) => {
                    if let Some(proxy) = this.upgrade() {
                        proxy.on_store_event(StoreEvent::ModelUpdate(data));
                    }
                }
                Err(err) => warn!(storage_key = %key, error = %err, "Sync request failed"),
            }
        });
        if let Err(err) = spawned {
            debug!(storage_key = %self.key, error = %err, "Cannot request sync");
        }
    }

    /// Like [`StorageProxy::apply_ops`], forwarding only after `after`
    /// resolves
    pub(crate) fn apply_ops_after(
        &self,
        ops: Vec<M::Op>,
        after: Option<Completion<bool>>,
    ) -> StorageResult<Completion<bool>> {
        let (base, tasks) = {
            let mut inner = self.inner.lock();
            inner.check_open()?;
            let base = inner.crdt.version_map().clone();
            let old = inner.crdt.consumer_view();
            // The batch lands whole or not at all
            let mut scratch = inner.crdt.clone();
            for op in &ops {
                if let Err(err) = scratch.apply_operation(op) {
                    debug!(storage_key = %self.key, error = %err, "Local op rejected");
                    return Ok(Completion::ready(false));
                }
            }
            inner.crdt = scratch;
            let tasks = if inner.is_synced() {
                let new = inner.crdt.consumer_view();
                inner.update_tasks(old, new)
            } else {
                Vec::new()
            };
            (base, tasks)
        };
        self.dispatch(tasks);

        let (tx, completion) = Completion::channel();
        let store = self.store.clone();
        let this = self.this.clone();
        let origin = self.subscription;
        let key = self.key.clone();
        let spawned = self.scheduler.spawn_io(async move {
            if let Some(after) = after {
                if !matches!(after.await, Ok(true)) {
                    debug!(storage_key = %key, "Forwarding after an unsuccessful dependency");
                }
            }
            let accepted = match store.apply_ops(ops, base, Some(origin)).await {
                Ok(StoreResponse::Accepted(_)) => true,
                Ok(StoreResponse::Rejected(current)) => match this.upgrade() {
                    Some(proxy) if !proxy.is_closed() => proxy.rebase(current).await,
                    _ => {
                        debug!(storage_key = %key, "Discarding store reply for closed proxy");
                        false
                    }
                },
                Err(err) => {
                    warn!(storage_key = %key, error = %err, "Store failed to apply ops");
                    false
                }
            };
            let _ = tx.send(accepted);
        });
        if let Err(err) = spawned {
            debug!(storage_key = %self.key, error = %err, "Cannot forward ops");
            return Ok(Completion::ready(false));
        }
        Ok(completion)
    }

    /// Fold the store's state into the replica, then push the result back
    async fn rebase(&self, current: M::Data) -> bool {
        let (tasks, local) = {
            let mut inner = self.inner.lock();
            let old = inner.crdt.consumer_view();
            inner.crdt.merge(&current);
            let tasks = if inner.is_synced() {
                let new = inner.crdt.consumer_view();
                inner.update_tasks(old, new)
            } else {
                Vec::new()
            };
            (tasks, inner.crdt.data().clone())
        };
        self.dispatch(tasks);
        debug!(storage_key = %self.key, "Rebased onto store state");

        match self.store.apply_model(local, Some(self.subscription)).await {
            Ok(merged) => {
                let tasks = {
                    let mut inner = self.inner.lock();
                    if inner.state == ProxyState::Closed {
                        return true;
                    }
                    let old = inner.crdt.consumer_view();
                    inner.crdt.merge(&merged);
                    if inner.is_synced() {
                        let new = inner.crdt.consumer_view();
                        inner.update_tasks(old, new)
                    } else {
                        Vec::new()
                    }
                };
                self.dispatch(tasks);
                true
            }
            Err(err) => {
                warn!(storage_key = %self.key, error = %err, "Store failed to take rebased model");
                false
            }
        }
    }
}

impl<M: CrdtModel> StorageProxy<M> for StorageProxyImpl<M> {
    fn storage_key(&self) -> &StorageKey {
        &self.key
    }

    fn state(&self) -> ProxyState {
        self.inner.lock().state
    }

    fn prepare_for_sync(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ProxyState::NoSync {
            inner.state = ProxyState::ReadyToSync;
        }
    }

    fn maybe_initiate_sync(&self) {
        let initiate = {
            let mut inner = self.inner.lock();
            match inner.state {
                ProxyState::NoSync | ProxyState::ReadyToSync => {
                    inner.state = ProxyState::AwaitingSync;
                    true
                }
                _ => false,
            }
        };
        if initiate {
            debug!(storage_key = %self.key, "Requesting sync");
            self.request_synchronization();
        }
    }

    fn apply_ops(&self, ops: Vec<M::Op>) -> StorageResult<Completion<bool>> {
        self.apply_ops_after(ops, None)
    }

    fn get_particle_view_unsafe(&self) -> StorageResult<M::View> {
        let inner = self.inner.lock();
        match inner.state {
            ProxyState::Sync | ProxyState::Desync => Ok(inner.crdt.consumer_view()),
            ProxyState::Closed => Err(StorageError::ProxyClosed),
            other => Err(StorageError::NotSynced(other.to_string())),
        }
    }

    fn version_map(&self) -> StorageResult<VersionMap> {
        let inner = self.inner.lock();
        inner.check_open()?;
        Ok(inner.crdt.version_map().clone())
    }

    fn add_on_ready(&self, id: &CallbackIdentifier, callback: ActionCallback) -> StorageResult<()> {
        let immediate = {
            let mut inner = self.inner.lock();
            inner.check_will_sync()?;
            inner.callbacks.add_ready(id, callback.clone());
            inner.state == ProxyState::Sync
        };
        if immediate {
            self.dispatch(vec![listener_task(id, move || callback())]);
        }
        Ok(())
    }

    fn add_on_update(
        &self,
        id: &CallbackIdentifier,
        callback: UpdateCallback<M::View>,
    ) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        inner.check_will_sync()?;
        inner.callbacks.add_update(id, callback);
        Ok(())
    }

    fn add_on_desync(
        &self,
        id: &CallbackIdentifier,
        callback: ActionCallback,
    ) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        inner.check_will_sync()?;
        inner.callbacks.add_desync(id, callback);
        Ok(())
    }

    fn add_on_resync(
        &self,
        id: &CallbackIdentifier,
        callback: ActionCallback,
    ) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        inner.check_will_sync()?;
        inner.callbacks.add_resync(id, callback);
        Ok(())
    }

    fn register_for_storage_events(
        &self,
        id: &CallbackIdentifier,
        callback: EventCallback,
    ) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.callbacks.set_events(id, callback);
        Ok(())
    }

    fn unregister_for_storage_events(&self, id: &CallbackIdentifier) {
        self.inner.lock().callbacks.remove_events(id);
    }

    fn remove_callbacks_for_name(&self, id: &CallbackIdentifier) {
        self.inner.lock().callbacks.remove(id);
    }

    fn close(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state == ProxyState::Closed {
                return;
            }
            inner.state = ProxyState::Closed;
            inner.callbacks.clear();
            inner.stashed_ops.clear();
        }
        self.store.unsubscribe(self.subscription);
        debug!(storage_key = %self.key, "Proxy closed");
    }
}

impl<M: CrdtModel> Drop for StorageProxyImpl<M> {
    fn drop(&mut self) {
        self.store.unsubscribe(self.subscription);
    }
}
