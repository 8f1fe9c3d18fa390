//! Error types for the tapestry runtime

use crate::config::ConfigError;
use tapestry_crdt::CrdtError;
use thiserror::Error;

/// Top-level runtime error
#[derive(Debug, Error)]
pub enum Error {
    /// Handle misuse: capability, lifecycle or construction
    #[error(transparent)]
    Handle(#[from] HandleError),

    /// Storage proxy, store or key failures
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Entity field or schema failures
    #[error(transparent)]
    Entity(#[from] EntityError),

    /// Scheduler failures
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// Particle lifecycle failures
    #[error(transparent)]
    Particle(#[from] ParticleError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors raised by handles and the handle manager
#[derive(Debug, Error, Clone, PartialEq)]
pub enum HandleError {
    /// Any operation after `close()`
    #[error("Handle {0} is closed")]
    Closed(String),

    /// The handle's mode excludes the operation
    #[error("{operation} is not permitted on handle {handle} (mode {mode})")]
    NotPermitted {
        handle: String,
        operation: String,
        mode: String,
    },

    /// Invalid handle spec or key combination
    #[error("{0}")]
    Construction(String),

    /// `create_reference` preconditions not met
    #[error("{0}")]
    ReferenceIntegrity(String),

    /// Removal of an entity that was never assigned an id
    #[error("Cannot remove an item without ID.")]
    MissingId,

    /// Query on a reference-typed handle
    #[error("Queries only work with Entity-typed Handles.")]
    QueryNotSupported,
}

/// Errors raised by storage proxies, stores and storage keys
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StorageError {
    /// Operation on a proxy that has been closed
    #[error("Unexpected operation on closed StorageProxy")]
    ProxyClosed,

    /// Read before the proxy reached `Sync`
    #[error("Read operations are not valid before onReady (storage proxy state is {0})")]
    NotSynced(String),

    /// Callback registration on a proxy that will never sync
    #[error("Action handlers are not valid on a StorageProxy that has not been set up to sync (e.g. on write-only handles)")]
    WillNotSync,

    /// Storage key string could not be parsed
    #[error("Invalid storage key {key}: {reason}")]
    InvalidKey { key: String, reason: String },

    /// No parser registered for a key protocol
    #[error("No storage key parser registered for protocol {0}")]
    UnknownProtocol(String),

    /// Dereference of a reference with no live dereferencer
    #[error("No dereferencer installed on Reference object")]
    NoDereferencer,

    /// Foreign checker registered for a schema with fields
    #[error("Only schemas with no fields can be registered with a foreign reference checker: {0}")]
    ForeignSchemaHasFields(String),

    /// Store rejected or failed a request
    #[error("Store error: {0}")]
    Store(String),

    /// A CRDT op could not be applied
    #[error("CRDT error: {0}")]
    Crdt(#[from] CrdtError),
}

/// Errors raised by entity accessors and schemas
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EntityError {
    /// Field value of the wrong primitive kind
    #[error("Expected {expected} for {class}.{field}, but received {received}.")]
    KindMismatch {
        expected: String,
        class: String,
        field: String,
        received: String,
    },

    /// Field not declared by the schema
    #[error("{class} does not have a {kind} field called \"{field}\".")]
    UnknownField {
        class: String,
        kind: &'static str,
        field: String,
    },

    /// Raw entity could not be turned into a typed entity
    #[error("Cannot deserialize {class}: {reason}")]
    Deserialize { class: String, reason: String },

    /// Invalid TTL annotation
    #[error("Invalid TTL: {0}")]
    InvalidTtl(String),
}

/// Errors raised by the scheduler
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchedulerError {
    /// The scheduler was cancelled; construct a new one
    #[error("Scheduler {0} has been cancelled")]
    Cancelled(String),

    /// A task panicked and took the scheduler down
    #[error("Scheduler {name} failed: {cause}")]
    Failed { name: String, cause: String },

    /// The task was dropped before it produced a result
    #[error("Task dropped before completion")]
    TaskDropped,
}

/// Errors raised by the particle lifecycle controller
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParticleError {
    /// Lifecycle call made from a state that does not allow it
    #[error("{action}: particle {particle} is in an invalid state ({state})")]
    InvalidState {
        particle: String,
        action: &'static str,
        state: String,
    },

    /// A lifecycle callback returned an error
    #[error("Particle {particle} failed: {cause}")]
    CallbackFailed { particle: String, cause: String },

    /// Particle exhausted its restart budget
    #[error("Particle {0} failed too many times in a row")]
    MaxFailed(String),

    /// No particle registered under this name
    #[error("Particle {0} not found")]
    NotFound(String),
}

/// Result type using the top-level runtime error
pub type Result<T> = std::result::Result<T, Error>;

/// Result type using StorageError
pub type StorageResult<T> = std::result::Result<T, StorageError>;
