//! Conversion between what handles expose and what CRDTs store

use crate::data::{
    Entity, EntityRecord, EntitySpec, RawEntity, Reference, Schema, Ttl, UNINITIALIZED_TIMESTAMP,
};
use crate::error::Result;
use crate::storage::{DereferencerFactory, StorageKey};
use crate::time::Time;
use crate::types::IdGenerator;
use std::fmt;
use std::sync::Arc;
use tapestry_crdt::Referencable;

/// Maps handle values to CRDT payloads and back
pub trait StorageAdapter: Send + Sync + 'static {
    /// What callers read and write
    type Value: Clone + fmt::Debug + Send + Sync + 'static;
    /// What the CRDT holds
    type Stored: Referencable;

    /// Whether predicate queries make sense for this value type
    const QUERYABLE: bool;

    /// Fill in id and timestamps on `value` and produce its stored form
    fn store_value(&self, value: &mut Self::Value) -> Result<Self::Stored>;

    /// Stored form back to a value, with dereferencers installed
    fn to_value(&self, stored: &Self::Stored) -> Result<Self::Value>;

    fn value_id(&self, value: &Self::Value) -> Option<String>;

    /// Stand-in carrying only `id`, used for removals by id
    fn placeholder(&self, id: &str) -> Self::Stored;

    fn is_expired(&self, stored: &Self::Stored) -> bool;
}

/// Adapter for handles over entities of one spec
pub struct EntityStorageAdapter<S: EntitySpec> {
    handle_name: String,
    spec: Arc<S>,
    ttl: Ttl,
    time: Arc<dyn Time>,
    ids: IdGenerator,
    dereferencers: Arc<DereferencerFactory>,
}

impl<S: EntitySpec> EntityStorageAdapter<S> {
    pub fn new(
        handle_name: impl Into<String>,
        spec: Arc<S>,
        ttl: Ttl,
        time: Arc<dyn Time>,
        ids: IdGenerator,
        dereferencers: Arc<DereferencerFactory>,
    ) -> Self {
        Self {
            handle_name: handle_name.into(),
            spec,
            ttl,
            time,
            ids,
            dereferencers,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        self.spec.schema()
    }

    /// Reference to entity `id` in `backing_key`, ready to dereference
    pub fn reference_to(&self, id: &str, backing_key: StorageKey) -> Reference {
        let mut reference = Reference::new(id, backing_key, None);
        self.dereferencers.inject_reference(self.spec.schema(), &mut reference);
        reference
    }

    pub fn dereferencers(&self) -> &Arc<DereferencerFactory> {
        &self.dereferencers
    }
}

impl<S: EntitySpec> StorageAdapter for EntityStorageAdapter<S> {
    type Value = S::Entity;
    type Stored = RawEntity;

    const QUERYABLE: bool = true;

    fn store_value(&self, entity: &mut S::Entity) -> Result<RawEntity> {
        let now = self.time.current_time_millis();
        let record = entity.record_mut();
        if record.entity_id().is_none() {
            record.set_entity_id(self.ids.new_entity_id(&self.handle_name));
        }
        if record.creation_timestamp() == UNINITIALIZED_TIMESTAMP {
            record.set_creation_timestamp(now);
        }
        if let Some(ttl) = self.ttl.millis() {
            if record.expiration_timestamp() == UNINITIALIZED_TIMESTAMP {
                record.set_expiration_timestamp(now + ttl);
            }
        }
        Ok(record.serialize())
    }

    fn to_value(&self, stored: &RawEntity) -> Result<S::Entity> {
        let mut raw = stored.clone();
        self.dereferencers
            .inject_dereferencers(self.spec.schema(), &mut raw);
        Ok(self.spec.deserialize(&raw)?)
    }

    fn value_id(&self, entity: &S::Entity) -> Option<String> {
        entity.record().entity_id().map(str::to_string)
    }

    fn placeholder(&self, id: &str) -> RawEntity {
        RawEntity::empty(id)
    }

    fn is_expired(&self, stored: &RawEntity) -> bool {
        stored.is_expired(self.time.current_time_millis())
    }
}

/// Adapter for handles that hold references rather than entities
pub struct ReferenceStorageAdapter {
    schema: Arc<Schema>,
    ttl: Ttl,
    time: Arc<dyn Time>,
    dereferencers: Arc<DereferencerFactory>,
}

impl ReferenceStorageAdapter {
    /// `schema` describes the entities the references point at
    pub fn new(
        schema: Arc<Schema>,
        ttl: Ttl,
        time: Arc<dyn Time>,
        dereferencers: Arc<DereferencerFactory>,
    ) -> Self {
        Self {
            schema,
            ttl,
            time,
            dereferencers,
        }
    }
}

impl StorageAdapter for ReferenceStorageAdapter {
    type Value = Reference;
    type Stored = Reference;

    const QUERYABLE: bool = false;

    fn store_value(&self, reference: &mut Reference) -> Result<Reference> {
        let now = self.time.current_time_millis();
        if reference.creation_timestamp == UNINITIALIZED_TIMESTAMP {
            reference.creation_timestamp = now;
        }
        if let Some(ttl) = self.ttl.millis() {
            if reference.expiration_timestamp == UNINITIALIZED_TIMESTAMP {
                reference.expiration_timestamp = now + ttl;
            }
        }
        Ok(reference.clone())
    }

    fn to_value(&self, stored: &Reference) -> Result<Reference> {
        let mut reference = stored.clone();
        self.dereferencers
            .inject_reference(&self.schema, &mut reference);
        Ok(reference)
    }

    fn value_id(&self, reference: &Reference) -> Option<String> {
        Some(reference.id.clone())
    }

    fn placeholder(&self, id: &str) -> Reference {
        Reference::new(id, StorageKey::foreign(self.schema.name()), None)
    }

    fn is_expired(&self, stored: &Reference) -> bool {
        stored.is_expired(self.time.current_time_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{BaseEntitySpec, FieldType, FieldValue, SchemaRegistry};
    use crate::storage::ForeignReferenceCheckerImpl;
    use crate::time::FakeTime;

    fn person_spec() -> Arc<BaseEntitySpec> {
        let schema = Schema::builder("Person")
            .singleton("name", FieldType::Text)
            .build();
        Arc::new(BaseEntitySpec::new("Person", Arc::new(schema)))
    }

    fn factory() -> Arc<DereferencerFactory> {
        DereferencerFactory::new(
            Arc::new(SchemaRegistry::new()),
            Arc::new(ForeignReferenceCheckerImpl::empty()),
        )
    }

    #[test]
    fn test_store_assigns_id_once() {
        let time = Arc::new(FakeTime::new(1_000));
        let adapter = EntityStorageAdapter::new(
            "arc:host:p:h",
            person_spec(),
            Ttl::Minutes(2),
            time.clone(),
            IdGenerator::with_session("s"),
            factory(),
        );
        let mut entity = person_spec().create();
        entity
            .set_singleton("name", Some(FieldValue::from("Ada")))
            .unwrap();

        let raw = adapter.store_value(&mut entity).unwrap();
        assert_eq!(raw.id, "!s:arc:host:p:h:0");
        assert_eq!(raw.creation_timestamp, 1_000);
        assert_eq!(raw.expiration_timestamp, 1_000 + 2 * 60 * 1000);
        assert_eq!(adapter.value_id(&entity).as_deref(), Some("!s:arc:host:p:h:0"));

        time.advance(10);
        let again = adapter.store_value(&mut entity).unwrap();
        assert_eq!(again.id, raw.id);
        assert_eq!(again.creation_timestamp, 1_000);

        time.advance(5 * 60 * 1000);
        assert!(adapter.is_expired(&again));
    }

    #[test]
    fn test_round_trip_through_stored_form() {
        let adapter = EntityStorageAdapter::new(
            "h",
            person_spec(),
            Ttl::Infinite,
            Arc::new(FakeTime::new(5)),
            IdGenerator::with_session("s"),
            factory(),
        );
        let mut entity = person_spec().create();
        entity
            .set_singleton("name", Some(FieldValue::from("Bo")))
            .unwrap();
        let raw = adapter.store_value(&mut entity).unwrap();
        assert_eq!(raw.expiration_timestamp, UNINITIALIZED_TIMESTAMP);
        assert_eq!(adapter.to_value(&raw).unwrap(), entity);
    }

    #[test]
    fn test_reference_adapter_installs_dereferencer() {
        let schema = person_spec().schema().clone();
        let dereferencers = factory();
        let adapter = ReferenceStorageAdapter::new(
            schema,
            Ttl::Infinite,
            Arc::new(FakeTime::new(7)),
            dereferencers,
        );
        let mut reference = Reference::new("p1", StorageKey::ram("people"), None);
        let stored = adapter.store_value(&mut reference).unwrap();
        assert_eq!(stored.creation_timestamp, 7);
        assert!(!stored.has_dereferencer());
        assert!(adapter.to_value(&stored).unwrap().has_dereferencer());
    }
}
