//! Storage: keys, stores, proxies and dereferencing
//!
//! A [`Store`] is the authority for one [`StorageKey`]. Each handle manager
//! keeps one [`StorageProxy`] per key, holding a local replica that is
//! written optimistically and kept in step with the store. Reference-mode
//! keys split entities between a pointer store and a shared backing store;
//! [`ReferenceModeProxy`] puts them back together.

pub mod dereferencer;
pub mod key;
pub mod proxy;
pub mod reference_mode;
pub mod store;

pub use dereferencer::{
    BackingProxy, Dereferencer, DereferencerFactory, ForeignCheck, ForeignEntityDereferencer,
    ForeignReferenceChecker, ForeignReferenceCheckerImpl, RawEntityDereferencer,
};
pub use key::{KeyParserFn, ReferenceModeStorageKey, StorageKey, StorageKeyParser};
pub use proxy::{
    ActionCallback, AnyStorageProxy, EventCallback, ProxyState, StorageEvent, StorageProxy,
    StorageProxyImpl, UpdateCallback,
};
pub use reference_mode::{ReferenceModeModel, ReferenceModeProxy, SplitContext};
pub use store::{MemoryStore, Store, StoreCallback, StoreEvent, StoreManager, StoreResponse};
