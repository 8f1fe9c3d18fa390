//! The store protocol and an in-memory store
//!
//! A [`Store`] is the authority for one storage key. Proxies send it ops
//! with the version they were based on, receive either the merged state or
//! a rejection carrying the store's current state, and subscribe to hear
//! about writes made by other proxies.

use crate::error::StorageResult;
use crate::storage::key::StorageKey;
use crate::types::SubscriptionId;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::any::{Any, TypeId};
use std::sync::Arc;
use tapestry_crdt::{CrdtModel, VersionMap};
use tracing::{debug, trace, warn};

/// Traffic pushed from a store to its subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent<M: CrdtModel> {
    /// Ops accepted from another subscriber
    Operations(Vec<M::Op>),
    /// Full state after a merge
    ModelUpdate(M::Data),
}

/// Reply to [`Store::apply_ops`]
#[derive(Debug, Clone, PartialEq)]
pub enum StoreResponse<D> {
    /// Ops applied; carries the resulting state
    Accepted(D),
    /// Ops did not follow the store's state; carries the current state
    Rejected(D),
}

pub type StoreCallback<M> = Arc<dyn Fn(StoreEvent<M>) + Send + Sync>;

/// Authority for the CRDT state at one storage key
pub trait Store<M: CrdtModel>: Send + Sync {
    fn storage_key(&self) -> &StorageKey;

    /// Apply ops written against `base_version`
    ///
    /// Subscribers other than `origin` are told about accepted ops.
    fn apply_ops(
        &self,
        ops: Vec<M::Op>,
        base_version: VersionMap,
        origin: Option<SubscriptionId>,
    ) -> BoxFuture<'_, StorageResult<StoreResponse<M::Data>>>;

    /// Merge a full model into the store, returning the merged state
    fn apply_model(
        &self,
        data: M::Data,
        origin: Option<SubscriptionId>,
    ) -> BoxFuture<'_, StorageResult<M::Data>>;

    /// Current state and version
    fn get(&self) -> BoxFuture<'_, StorageResult<(M::Data, VersionMap)>>;

    fn subscribe(&self, callback: StoreCallback<M>) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId);
}

/// Store holding its state in process memory
pub struct MemoryStore<M: CrdtModel> {
    key: StorageKey,
    state: Mutex<M>,
    subscribers: RwLock<Vec<(SubscriptionId, StoreCallback<M>)>>,
}

impl<M: CrdtModel> MemoryStore<M> {
    pub fn new(key: StorageKey) -> Self {
        Self {
            key,
            state: Mutex::new(M::empty()),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Snapshot of the stored model
    pub fn snapshot(&self) -> M {
        self.state.lock().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Hand an event to every subscriber without touching stored state
    ///
    /// Stands in for traffic relayed from a peer store.
    pub fn deliver(&self, event: StoreEvent<M>) {
        self.notify(event, None);
    }

    fn notify(&self, event: StoreEvent<M>, origin: Option<SubscriptionId>) {
        // Callbacks run outside the lock; they may call back into the store.
        let targets: Vec<StoreCallback<M>> = self
            .subscribers
            .read()
            .iter()
            .filter(|(id, _)| Some(*id) != origin)
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in targets {
            callback(event.clone());
        }
    }

    fn apply_ops_now(
        &self,
        ops: Vec<M::Op>,
        base_version: &VersionMap,
        origin: Option<SubscriptionId>,
    ) -> StoreResponse<M::Data> {
        let accepted = {
            let mut state = self.state.lock();
            let mut scratch = state.clone();
            let mut failure = None;
            for op in &ops {
                if let Err(err) = scratch.apply_operation(op) {
                    failure = Some(err);
                    break;
                }
            }
            match failure {
                Some(err) => {
                    warn!(
                        storage_key = %self.key,
                        base = %base_version,
                        error = %err,
                        "Rejecting ops"
                    );
                    return StoreResponse::Rejected(state.data().clone());
                }
                None => {
                    *state = scratch;
                    state.data().clone()
                }
            }
        };
        trace!(storage_key = %self.key, count = ops.len(), "Accepted ops");
        self.notify(StoreEvent::Operations(ops), origin);
        StoreResponse::Accepted(accepted)
    }

    fn apply_model_now(&self, data: M::Data, origin: Option<SubscriptionId>) -> M::Data {
        let (merged, changed) = {
            let mut state = self.state.lock();
            let outcome = state.merge(&data);
            (state.data().clone(), outcome.local_changed)
        };
        if changed {
            debug!(storage_key = %self.key, "Model merged into store");
            self.notify(StoreEvent::ModelUpdate(merged.clone()), origin);
        }
        merged
    }
}

impl<M: CrdtModel> Store<M> for MemoryStore<M> {
    fn storage_key(&self) -> &StorageKey {
        &self.key
    }

    fn apply_ops(
        &self,
        ops: Vec<M::Op>,
        base_version: VersionMap,
        origin: Option<SubscriptionId>,
    ) -> BoxFuture<'_, StorageResult<StoreResponse<M::Data>>> {
        Box::pin(async move { Ok(self.apply_ops_now(ops, &base_version, origin)) })
    }

    fn apply_model(
        &self,
        data: M::Data,
        origin: Option<SubscriptionId>,
    ) -> BoxFuture<'_, StorageResult<M::Data>> {
        Box::pin(async move { Ok(self.apply_model_now(data, origin)) })
    }

    fn get(&self) -> BoxFuture<'_, StorageResult<(M::Data, VersionMap)>> {
        Box::pin(async move {
            let state = self.state.lock();
            Ok((state.data().clone(), state.version_map().clone()))
        })
    }

    fn subscribe(&self, callback: StoreCallback<M>) -> SubscriptionId {
        let id = SubscriptionId::new();
        self.subscribers.write().push((id, callback));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.write().retain(|(existing, _)| *existing != id);
    }
}

/// Process-wide registry of stores keyed by storage key and model type
///
/// Every handle manager in a process shares one of these, so handles in
/// different managers see the same stores.
#[derive(Default)]
pub struct StoreManager {
    stores: DashMap<(StorageKey, TypeId), Arc<dyn Any + Send + Sync>>,
}

impl StoreManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The store for `key` holding `M`, created empty on first use
    pub fn get_or_create<M: CrdtModel>(&self, key: &StorageKey) -> Arc<MemoryStore<M>> {
        let entry = self
            .stores
            .entry((key.clone(), TypeId::of::<M>()))
            .or_insert_with(|| {
                debug!(storage_key = %key, "Creating store");
                Arc::new(MemoryStore::<M>::new(key.clone())) as Arc<dyn Any + Send + Sync>
            })
            .value()
            .clone();
        // Keyed by TypeId, so the downcast cannot fail
        entry
            .downcast::<MemoryStore<M>>()
            .expect("type mismatch in store manager")
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}
