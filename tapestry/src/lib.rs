//! Tapestry: CRDT-backed storage handles for particles
//!
//! Particles are small units of application code that see the world only
//! through typed handles. Every handle reads and writes a CRDT replica kept
//! by a storage proxy, which stays in step with the store that owns the
//! storage key. Each particle runs on a single-threaded [`Scheduler`], so its
//! callbacks never race with one another.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ ArcHost                                                  │
//! │   ParticleContext ─── Particle (on_start, on_update, …)  │
//! │        │                                                 │
//! │        ▼ events                                          │
//! │   HandleManager ─── SingletonHandle / CollectionHandle   │
//! │        │                 │ StorageAdapter                │
//! │        ▼                 ▼                               │
//! │   StorageProxy (one per key, shared by handles)          │
//! │        │        ReferenceModeProxy (pointer + backing)   │
//! └────────┼─────────────────────────────────────────────────┘
//!          ▼ operations / model updates
//!     Store (one per StorageKey) ── CrdtSet / CrdtSingleton
//! ```
//!
//! - **Data**: [`data::RawEntity`] is the schema-agnostic form of an entity;
//!   [`data::EntityBase`] checks field access against a [`data::Schema`].
//! - **Storage**: [`storage::StorageProxyImpl`] applies writes to its local
//!   replica first, then forwards them to the [`storage::Store`].
//! - **Handles**: capability-checked reads, writes and callbacks, built by a
//!   [`HandleManager`].
//! - **Particles**: [`ParticleContext`] folds the storage events of every
//!   handle into one ready/update/desync/resync sequence per particle.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tapestry::data::{BaseEntitySpec, FieldType, Schema};
//! use tapestry::handle::{
//!     HandleContainerType, HandleDataType, HandleMode, HandleOptions, HandleSpec,
//! };
//! use tapestry::storage::StorageKey;
//! use tapestry::{HandleManager, Scheduler};
//!
//! # async fn demo() -> tapestry::Result<()> {
//! let schema = Arc::new(
//!     Schema::builder("Person")
//!         .singleton("name", FieldType::Text)
//!         .build(),
//! );
//! let manager = HandleManager::builder("arc", "host", Scheduler::current("arc")).build()?;
//! let spec = HandleSpec::new(
//!     "people",
//!     HandleMode::ReadWrite,
//!     HandleContainerType::Collection,
//!     HandleDataType::Entity,
//!     Arc::new(BaseEntitySpec::new("Person", schema.clone())),
//! )?;
//! let people = manager
//!     .entity_collection_handle(&spec, StorageKey::ram("people"), &HandleOptions::default())?;
//!
//! let mut person = BaseEntitySpec::new("Person", schema).create();
//! person.set_singleton("name", Some("Ada".into()))?;
//! people.store(&mut person)?.await?;
//! assert_eq!(people.size()?, 1);
//! manager.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod data;
pub mod error;
pub mod handle;
pub mod host;
pub mod particle;
pub mod scheduler;
pub mod storage;
pub mod telemetry;
pub mod time;
pub mod types;

pub use config::{ConfigError, EngineConfig};
pub use error::{Error, Result};
pub use handle::{CollectionHandle, HandleManager, HandleOptions, SingletonHandle};
pub use host::{ArcHost, ParticleFactory};
pub use particle::{NoopParticle, Particle, ParticleContext, ParticleInstance, ParticleState};
pub use scheduler::{Completion, Scheduler};
pub use telemetry::init_tracing;
pub use time::{FakeTime, SystemTime, Time};
pub use types::{CallbackIdentifier, Id, IdGenerator};

pub use tapestry_crdt as crdt;
