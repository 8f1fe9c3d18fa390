//! Reference-mode storage: entities split into pointers and a backing set
//!
//! Handles on a reference-mode key see whole entities. Underneath, a
//! pointer proxy holds [`Reference`]s and a backing proxy, shared by every
//! reference-mode key with the same backing key, holds the entities. Each
//! entity-level op becomes a backing write followed by a pointer op; the
//! pointer op is forwarded to its store only once the backing write has
//! been acknowledged, so a reader that sees a pointer can resolve it.

use crate::data::{RawEntity, Reference};
use crate::error::{StorageError, StorageResult};
use crate::scheduler::{Completion, Scheduler, Task};
use crate::storage::key::StorageKey;
use crate::storage::proxy::{
    listener_task, ActionCallback, CallbackSet, EventCallback, ProxyState, StorageEvent,
    StorageProxy, StorageProxyImpl, UpdateCallback,
};
use crate::types::CallbackIdentifier;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tapestry_crdt::{
    CrdtModel, CrdtSet, CrdtSetOp, CrdtSingleton, CrdtSingletonOp, VersionMap,
};
use tracing::debug;

/// Inputs for turning entity-level ops into backing and pointer ops
pub struct SplitContext<'a> {
    backing: &'a CrdtSet<RawEntity>,
    backing_version: VersionMap,
    backing_key: &'a StorageKey,
}

impl SplitContext<'_> {
    /// Backing write of `entity` and the pointer naming it
    fn write(&mut self, actor: &str, entity: RawEntity) -> (CrdtSetOp<RawEntity>, Reference) {
        self.backing_version.increment(actor);
        let clock = self.backing_version.clone();
        let mut reference = Reference::new(
            entity.id.clone(),
            self.backing_key.clone(),
            Some(clock.clone()),
        );
        reference.creation_timestamp = entity.creation_timestamp;
        reference.expiration_timestamp = entity.expiration_timestamp;
        let op = CrdtSetOp::Add {
            actor: actor.to_string(),
            version_map: clock,
            added: entity,
        };
        (op, reference)
    }

    /// Backing write replacing the entity with its tombstone; none when the
    /// backing replica never held `id`
    fn tombstone(&mut self, actor: &str, id: &str) -> Option<CrdtSetOp<RawEntity>> {
        let nulled = self.backing.get(id)?.nulled_out();
        Some(self.write(actor, nulled).0)
    }

    /// Unversioned pointer naming `id` in the backing store
    fn pointer(&self, id: &str) -> Reference {
        Reference::new(id.to_string(), self.backing_key.clone(), None)
    }
}

/// Entity containers that can be stored in reference mode
pub trait ReferenceModeModel: CrdtModel {
    /// The container of references kept in the pointer store
    type Pointer: CrdtModel;

    /// Backing write (if any) and pointer op for one entity-level op
    fn split_op(
        op: &Self::Op,
        pointers: &<Self::Pointer as CrdtModel>::View,
        ctx: &mut SplitContext<'_>,
    ) -> (Option<CrdtSetOp<RawEntity>>, <Self::Pointer as CrdtModel>::Op);

    /// Entity-level view from pointers and the backing replica
    fn resolve(
        pointers: &<Self::Pointer as CrdtModel>::View,
        backing: &CrdtSet<RawEntity>,
    ) -> Self::View;
}

impl ReferenceModeModel for CrdtSet<RawEntity> {
    type Pointer = CrdtSet<Reference>;

    fn split_op(
        op: &CrdtSetOp<RawEntity>,
        _pointers: &Vec<Reference>,
        ctx: &mut SplitContext<'_>,
    ) -> (Option<CrdtSetOp<RawEntity>>, CrdtSetOp<Reference>) {
        match op {
            CrdtSetOp::Add {
                actor,
                version_map,
                added,
            } => {
                let (backing, reference) = ctx.write(actor, added.clone());
                let pointer = CrdtSetOp::Add {
                    actor: actor.clone(),
                    version_map: version_map.clone(),
                    added: reference,
                };
                (Some(backing), pointer)
            }
            CrdtSetOp::Remove {
                actor,
                version_map,
                removed,
            } => {
                let backing = ctx.tombstone(actor, &removed.id);
                let pointer = CrdtSetOp::Remove {
                    actor: actor.clone(),
                    version_map: version_map.clone(),
                    removed: ctx.pointer(&removed.id),
                };
                (backing, pointer)
            }
        }
    }

    fn resolve(pointers: &Vec<Reference>, backing: &CrdtSet<RawEntity>) -> Vec<RawEntity> {
        pointers
            .iter()
            .filter_map(|reference| backing.get(&reference.id).cloned())
            .collect()
    }
}

impl ReferenceModeModel for CrdtSingleton<RawEntity> {
    type Pointer = CrdtSingleton<Reference>;

    fn split_op(
        op: &CrdtSingletonOp<RawEntity>,
        pointers: &Option<Reference>,
        ctx: &mut SplitContext<'_>,
    ) -> (Option<CrdtSetOp<RawEntity>>, CrdtSingletonOp<Reference>) {
        match op {
            CrdtSingletonOp::Update {
                actor,
                version_map,
                value,
            } => {
                let (backing, reference) = ctx.write(actor, value.clone());
                let pointer = CrdtSingletonOp::Update {
                    actor: actor.clone(),
                    version_map: version_map.clone(),
                    value: reference,
                };
                (Some(backing), pointer)
            }
            CrdtSingletonOp::Clear {
                actor,
                version_map,
            } => {
                let backing = pointers
                    .as_ref()
                    .and_then(|current| ctx.tombstone(actor, &current.id));
                let pointer = CrdtSingletonOp::Clear {
                    actor: actor.clone(),
                    version_map: version_map.clone(),
                };
                (backing, pointer)
            }
        }
    }

    fn resolve(pointers: &Option<Reference>, backing: &CrdtSet<RawEntity>) -> Option<RawEntity> {
        pointers
            .as_ref()
            .and_then(|reference| backing.get(&reference.id).cloned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Pointer,
    Backing,
}

struct CompositeStatus<V> {
    closed: bool,
    pointer_ready: bool,
    backing_ready: bool,
    ready_fired: bool,
    pointer_desynced: bool,
    backing_desynced: bool,
    last_view: Option<V>,
    callbacks: CallbackSet<V>,
}

impl<V> CompositeStatus<V> {
    fn any_desynced(&self) -> bool {
        self.pointer_desynced || self.backing_desynced
    }

    fn desync_flag(&mut self, side: Side) -> &mut bool {
        match side {
            Side::Pointer => &mut self.pointer_desynced,
            Side::Backing => &mut self.backing_desynced,
        }
    }
}

/// Entity-level proxy over a pointer proxy and a shared backing proxy
pub struct ReferenceModeProxy<M: ReferenceModeModel> {
    key: StorageKey,
    backing_key: StorageKey,
    pointer: Arc<StorageProxyImpl<M::Pointer>>,
    backing: Arc<StorageProxyImpl<CrdtSet<RawEntity>>>,
    scheduler: Scheduler,
    listener_id: CallbackIdentifier,
    status: Mutex<CompositeStatus<M::View>>,
}

impl<M: ReferenceModeModel> ReferenceModeProxy<M> {
    /// Compose `pointer` (owned by the new proxy) with the shared `backing`
    pub fn new(
        key: StorageKey,
        pointer: Arc<StorageProxyImpl<M::Pointer>>,
        backing: Arc<StorageProxyImpl<CrdtSet<RawEntity>>>,
    ) -> StorageResult<Arc<Self>> {
        let backing_key = match &key {
            StorageKey::ReferenceMode(inner) => (*inner.backing_key).clone(),
            other => {
                return Err(StorageError::InvalidKey {
                    key: other.to_string(),
                    reason: "not a reference-mode key".to_string(),
                })
            }
        };
        let listener_id =
            CallbackIdentifier::new(key.to_string(), Some("reference-mode".to_string()));
        let scheduler = pointer.scheduler().clone();
        let proxy = Arc::new(Self {
            key,
            backing_key,
            pointer,
            backing,
            scheduler,
            listener_id,
            status: Mutex::new(CompositeStatus {
                closed: false,
                pointer_ready: false,
                backing_ready: false,
                ready_fired: false,
                pointer_desynced: false,
                backing_desynced: false,
                last_view: None,
                callbacks: CallbackSet::default(),
            }),
        });

        for side in [Side::Pointer, Side::Backing] {
            let weak = Arc::downgrade(&proxy);
            let callback: EventCallback = Arc::new(move |event| {
                if let Some(proxy) = Weak::upgrade(&weak) {
                    proxy.on_inner_event(side, event);
                }
            });
            match side {
                Side::Pointer => proxy
                    .pointer
                    .register_for_storage_events(&proxy.listener_id, callback)?,
                Side::Backing => proxy
                    .backing
                    .register_for_storage_events(&proxy.listener_id, callback)?,
            }
        }
        Ok(proxy)
    }

    pub fn backing_key(&self) -> &StorageKey {
        &self.backing_key
    }

    fn resolve(&self) -> M::View {
        let pointers = self.pointer.with_model(|model| model.consumer_view());
        self.backing.with_model(|backing| M::resolve(&pointers, backing))
    }

    fn dispatch(&self, tasks: Vec<Task>) {
        if tasks.is_empty() {
            return;
        }
        if let Err(err) = self.scheduler.schedule_all(tasks) {
            debug!(storage_key = %self.key, error = %err, "Dropping reference-mode notifications");
        }
    }

    fn on_inner_event(&self, side: Side, event: StorageEvent) {
        let tasks = {
            let mut status = self.status.lock();
            if status.closed {
                return;
            }
            match event {
                StorageEvent::Ready => {
                    match side {
                        Side::Pointer => status.pointer_ready = true,
                        Side::Backing => status.backing_ready = true,
                    }
                    if status.ready_fired || !(status.pointer_ready && status.backing_ready) {
                        return;
                    }
                    status.ready_fired = true;
                    drop(status);
                    let view = self.resolve();
                    let mut status = self.status.lock();
                    status.last_view = Some(view);
                    debug!(storage_key = %self.key, "Reference-mode proxy synced");
                    status.callbacks.ready_tasks()
                }
                StorageEvent::Update => {
                    if !status.ready_fired {
                        return;
                    }
                    drop(status);
                    let new = self.resolve();
                    let mut status = self.status.lock();
                    match status.last_view.replace(new.clone()) {
                        Some(old) if old == new => Vec::new(),
                        Some(old) => status.callbacks.update_tasks(old, new),
                        None => Vec::new(),
                    }
                }
                StorageEvent::Desync => {
                    let was_synced = !status.any_desynced();
                    *status.desync_flag(side) = true;
                    if was_synced && status.ready_fired {
                        status.callbacks.desync_tasks()
                    } else {
                        Vec::new()
                    }
                }
                StorageEvent::Resync => {
                    let flag = status.desync_flag(side);
                    let was_desynced = *flag;
                    *flag = false;
                    if was_desynced && !status.any_desynced() && status.ready_fired {
                        status.callbacks.resync_tasks()
                    } else {
                        Vec::new()
                    }
                }
            }
        };
        self.dispatch(tasks);
    }

    fn check_open(&self) -> StorageResult<()> {
        if self.status.lock().closed {
            Err(StorageError::ProxyClosed)
        } else {
            Ok(())
        }
    }

    fn check_will_sync(&self) -> StorageResult<()> {
        self.check_open()?;
        if self.pointer.state() == ProxyState::NoSync {
            return Err(StorageError::WillNotSync);
        }
        Ok(())
    }
}

impl<M: ReferenceModeModel> StorageProxy<M> for ReferenceModeProxy<M> {
    fn storage_key(&self) -> &StorageKey {
        &self.key
    }

    fn state(&self) -> ProxyState {
        let status = self.status.lock();
        if status.closed {
            ProxyState::Closed
        } else if status.ready_fired {
            if status.any_desynced() {
                ProxyState::Desync
            } else {
                ProxyState::Sync
            }
        } else {
            match self.pointer.state() {
                ProxyState::Sync | ProxyState::Desync => ProxyState::AwaitingSync,
                other => other,
            }
        }
    }

    fn prepare_for_sync(&self) {
        self.pointer.prepare_for_sync();
        self.backing.prepare_for_sync();
    }

    fn maybe_initiate_sync(&self) {
        self.pointer.maybe_initiate_sync();
        self.backing.maybe_initiate_sync();
        // A shared backing proxy may have synced for another key already
        for (side, state) in [
            (Side::Pointer, self.pointer.state()),
            (Side::Backing, self.backing.state()),
        ] {
            if matches!(state, ProxyState::Sync | ProxyState::Desync) {
                self.on_inner_event(side, StorageEvent::Ready);
            }
        }
    }

    fn apply_ops(&self, ops: Vec<M::Op>) -> StorageResult<Completion<bool>> {
        self.check_open()?;
        let pointers = self.pointer.with_model(|model| model.consumer_view());
        let (backing_ops, pointer_ops): (Vec<_>, Vec<_>) = self.backing.with_model(|backing| {
            let mut ctx = SplitContext {
                backing,
                backing_version: backing.version_map().clone(),
                backing_key: &self.backing_key,
            };
            ops.iter()
                .map(|op| M::split_op(op, &pointers, &mut ctx))
                .unzip()
        });
        let backing_ops: Vec<_> = backing_ops.into_iter().flatten().collect();

        let after = if backing_ops.is_empty() {
            None
        } else {
            let mut written = self.backing.apply_ops(backing_ops)?;
            match written.try_take() {
                Some(false) => return Ok(Completion::ready(false)),
                Some(true) => None,
                None => Some(written),
            }
        };
        self.pointer.apply_ops_after(pointer_ops, after)
    }

    fn get_particle_view_unsafe(&self) -> StorageResult<M::View> {
        {
            let status = self.status.lock();
            if status.closed {
                return Err(StorageError::ProxyClosed);
            }
            if !status.ready_fired {
                drop(status);
                return Err(StorageError::NotSynced(self.state().to_string()));
            }
        }
        Ok(self.resolve())
    }

    fn version_map(&self) -> StorageResult<VersionMap> {
        self.check_open()?;
        self.pointer.version_map()
    }

    fn add_on_ready(&self, id: &CallbackIdentifier, callback: ActionCallback) -> StorageResult<()> {
        self.check_will_sync()?;
        let immediate = {
            let mut status = self.status.lock();
            status.callbacks.add_ready(id, callback.clone());
            status.ready_fired
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
        self.check_will_sync()?;
        self.status.lock().callbacks.add_update(id, callback);
        Ok(())
    }

    fn add_on_desync(
        &self,
        id: &CallbackIdentifier,
        callback: ActionCallback,
    ) -> StorageResult<()> {
        self.check_will_sync()?;
        self.status.lock().callbacks.add_desync(id, callback);
        Ok(())
    }

    fn add_on_resync(
        &self,
        id: &CallbackIdentifier,
        callback: ActionCallback,
    ) -> StorageResult<()> {
        self.check_will_sync()?;
        self.status.lock().callbacks.add_resync(id, callback);
        Ok(())
    }

    fn register_for_storage_events(
        &self,
        id: &CallbackIdentifier,
        callback: EventCallback,
    ) -> StorageResult<()> {
        self.check_open()?;
        self.status.lock().callbacks.set_events(id, callback);
        Ok(())
    }

    fn unregister_for_storage_events(&self, id: &CallbackIdentifier) {
        self.status.lock().callbacks.remove_events(id);
    }

    fn remove_callbacks_for_name(&self, id: &CallbackIdentifier) {
        self.status.lock().callbacks.remove(id);
    }

    fn close(&self) {
        {
            let mut status = self.status.lock();
            if status.closed {
                return;
            }
            status.closed = true;
            status.callbacks.clear();
        }
        self.pointer.close();
        self.backing.remove_callbacks_for_name(&self.listener_id);
        debug!(storage_key = %self.key, "Reference-mode proxy closed");
    }
}
