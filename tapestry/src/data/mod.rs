//! Entities, schemas, references and TTLs

pub mod entity;
pub mod raw;
pub mod reference;
pub mod schema;
pub mod ttl;

pub use entity::{
    BaseEntitySpec, Entity, EntityBase, EntityRecord, EntitySpec, VariableEntityBase,
    VariableEntitySpec,
};
pub use raw::{FieldValue, RawEntity, NO_REFERENCE_ID, UNINITIALIZED_TIMESTAMP};
pub use reference::Reference;
pub use schema::{FieldType, Schema, SchemaBuilder, SchemaFields, SchemaRegistry};
pub use ttl::Ttl;
