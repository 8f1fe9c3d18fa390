//! Resolving references to the entities they point at

use crate::data::{FieldType, FieldValue, RawEntity, Reference, Schema, SchemaRegistry};
use crate::error::{StorageError, StorageResult};
use crate::storage::key::StorageKey;
use crate::storage::proxy::{StorageProxy, StorageProxyImpl};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tapestry_crdt::{CrdtModel, CrdtSet, ReferenceId};
use tracing::{trace, warn};

/// Resolves a [`Reference`] to its target
pub trait Dereferencer: Send + Sync {
    fn dereference<'a>(
        &'a self,
        reference: &'a Reference,
    ) -> BoxFuture<'a, StorageResult<Option<RawEntity>>>;
}

/// Decides whether an id names a live entity owned outside the engine
pub trait ForeignReferenceChecker: Send + Sync {
    fn check(&self, schema: &Schema, id: &str) -> bool;
}

pub type ForeignCheck = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Checker with one predicate per registered schema
pub struct ForeignReferenceCheckerImpl {
    checks: HashMap<String, ForeignCheck>,
}

impl ForeignReferenceCheckerImpl {
    /// Only schemas without fields may be registered
    pub fn new(
        registrations: impl IntoIterator<Item = (Arc<Schema>, ForeignCheck)>,
    ) -> StorageResult<Self> {
        let mut checks = HashMap::new();
        for (schema, check) in registrations {
            if !schema.fields.is_empty() {
                return Err(StorageError::ForeignSchemaHasFields(schema.name().to_string()));
            }
            checks.insert(schema.hash.clone(), check);
        }
        Ok(Self { checks })
    }

    /// Checker that knows no schemas
    pub fn empty() -> Self {
        Self {
            checks: HashMap::new(),
        }
    }
}

impl ForeignReferenceChecker for ForeignReferenceCheckerImpl {
    fn check(&self, schema: &Schema, id: &str) -> bool {
        match self.checks.get(&schema.hash) {
            Some(check) => check(id),
            None => {
                warn!(schema = %schema.name(), "No foreign reference check registered");
                false
            }
        }
    }
}

/// Backing proxy shared by every reference-mode key over one backing key
pub type BackingProxy = StorageProxyImpl<CrdtSet<RawEntity>>;

/// Reads targets from the local replica of the backing proxy named by each
/// reference
pub struct RawEntityDereferencer {
    schema: Arc<Schema>,
    factory: Weak<DereferencerFactory>,
}

impl RawEntityDereferencer {
    fn resolve(&self, reference: &Reference) -> Option<RawEntity> {
        let factory = self.factory.upgrade()?;
        let Some(backing) = factory.backing(&reference.storage_key) else {
            trace!(storage_key = %reference.storage_key, "No backing proxy open for reference");
            return None;
        };
        trace!(id = %reference.id, storage_key = %reference.storage_key, "Dereferencing");
        let found = backing.with_model(|model| match model.get(&reference.id) {
            Some(entity) => Some(entity.clone()),
            None => {
                // Gone from a replica that has seen the referenced version
                let seen = reference
                    .version
                    .as_ref()
                    .is_some_and(|v| !v.is_empty() && model.version_map().dominates(v));
                seen.then(|| nulled_entity(&self.schema, &reference.id))
            }
        });
        found.map(|mut entity| {
            factory.inject_dereferencers(&self.schema, &mut entity);
            entity
        })
    }
}

impl Dereferencer for RawEntityDereferencer {
    fn dereference<'a>(
        &'a self,
        reference: &'a Reference,
    ) -> BoxFuture<'a, StorageResult<Option<RawEntity>>> {
        Box::pin(async move { Ok(self.resolve(reference)) })
    }
}

fn nulled_entity(schema: &Schema, id: &ReferenceId) -> RawEntity {
    RawEntity::new(
        id.clone(),
        schema
            .fields
            .singletons
            .keys()
            .map(|field| (field.clone(), None))
            .collect(),
        schema
            .fields
            .collections
            .keys()
            .map(|field| (field.clone(), Vec::new()))
            .collect(),
    )
}

/// Resolves foreign references through a [`ForeignReferenceChecker`]
pub struct ForeignEntityDereferencer {
    schema: Arc<Schema>,
    checker: Arc<dyn ForeignReferenceChecker>,
}

impl Dereferencer for ForeignEntityDereferencer {
    fn dereference<'a>(
        &'a self,
        reference: &'a Reference,
    ) -> BoxFuture<'a, StorageResult<Option<RawEntity>>> {
        Box::pin(async move {
            Ok(self
                .checker
                .check(&self.schema, &reference.id)
                .then(|| RawEntity::empty(reference.id.clone())))
        })
    }
}

/// Creates and caches dereferencers, one per schema
pub struct DereferencerFactory {
    schemas: Arc<SchemaRegistry>,
    checker: Arc<dyn ForeignReferenceChecker>,
    cache: Mutex<HashMap<String, Arc<dyn Dereferencer>>>,
    backing: Mutex<HashMap<StorageKey, Weak<BackingProxy>>>,
    this: Weak<Self>,
}

impl DereferencerFactory {
    pub fn new(
        schemas: Arc<SchemaRegistry>,
        checker: Arc<dyn ForeignReferenceChecker>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            schemas,
            checker,
            cache: Mutex::new(HashMap::new()),
            backing: Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    /// Make `proxy` the source for references into its storage key
    pub fn register_backing(&self, proxy: &Arc<BackingProxy>) {
        self.backing
            .lock()
            .insert(proxy.storage_key().clone(), Arc::downgrade(proxy));
    }

    fn backing(&self, key: &StorageKey) -> Option<Arc<BackingProxy>> {
        self.backing.lock().get(key).and_then(Weak::upgrade)
    }

    pub fn checker(&self) -> &Arc<dyn ForeignReferenceChecker> {
        &self.checker
    }

    /// Dereferencer for entities of `schema`
    pub fn create(&self, schema: &Arc<Schema>) -> Arc<dyn Dereferencer> {
        self.cache
            .lock()
            .entry(schema.hash.clone())
            .or_insert_with(|| {
                Arc::new(RawEntityDereferencer {
                    schema: schema.clone(),
                    factory: self.this.clone(),
                }) as Arc<dyn Dereferencer>
            })
            .clone()
    }

    /// Dereferencer for foreign entities of `schema`
    pub fn create_foreign(&self, schema: &Arc<Schema>) -> Arc<dyn Dereferencer> {
        self.cache
            .lock()
            .entry(format!("foreign:{}", schema.hash))
            .or_insert_with(|| {
                Arc::new(ForeignEntityDereferencer {
                    schema: schema.clone(),
                    checker: self.checker.clone(),
                }) as Arc<dyn Dereferencer>
            })
            .clone()
    }

    /// Install a dereferencer into `reference`, whose target has `schema`
    pub fn inject_reference(&self, schema: &Arc<Schema>, reference: &mut Reference) {
        let dereferencer = match reference.storage_key {
            StorageKey::Foreign(_) => self.create_foreign(schema),
            _ => self.create(schema),
        };
        reference.set_dereferencer(&dereferencer);
    }

    /// Reference to foreign entity `id`, or `None` when the checker rejects it
    pub fn foreign_reference(&self, schema: &Arc<Schema>, id: &str) -> Option<Reference> {
        if !self.checker.check(schema, id) {
            return None;
        }
        let mut reference = Reference::new(id, StorageKey::foreign(schema.name()), None);
        self.inject_reference(schema, &mut reference);
        Some(reference)
    }

    /// Install dereferencers into every reference held by `entity`,
    /// recursing into inline entities
    pub fn inject_dereferencers(&self, schema: &Schema, entity: &mut RawEntity) {
        for (field, value) in entity.singletons.iter_mut() {
            if let (Some(ty), Some(value)) = (schema.singleton_type(field), value.as_mut()) {
                self.inject_field(ty, value);
            }
        }
        for (field, values) in entity.collections.iter_mut() {
            if let Some(ty) = schema.collection_type(field) {
                for value in values.iter_mut() {
                    self.inject_field(ty, value);
                }
            }
        }
    }

    fn inject_field(&self, ty: &FieldType, value: &mut FieldValue) {
        match (ty, value) {
            (FieldType::EntityRef(hash), FieldValue::Reference(reference)) => {
                match self.schemas.get(hash) {
                    Some(schema) => self.inject_reference(&schema, reference),
                    None => warn!(schema_hash = %hash, "Unknown schema for reference field"),
                }
            }
            (FieldType::Inline(hash), FieldValue::Inline(inner)) => {
                if let Some(schema) = self.schemas.get(hash) {
                    self.inject_dereferencers(&schema, inner);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use crate::storage::store::{Store, StoreManager};
    use tapestry_crdt::{CrdtSetOp, VersionMap};

    fn setup() -> (Arc<SchemaRegistry>, Arc<DereferencerFactory>) {
        let schemas = Arc::new(SchemaRegistry::new());
        let factory = DereferencerFactory::new(
            schemas.clone(),
            Arc::new(ForeignReferenceCheckerImpl::empty()),
        );
        (schemas, factory)
    }

    fn person_schema() -> Schema {
        Schema::builder("Person")
            .singleton("name", FieldType::Text)
            .build()
    }

    #[tokio::test]
    async fn test_dereference_reads_local_backing_replica() {
        let (schemas, factory) = setup();
        let schema = schemas.register(person_schema());
        let key = StorageKey::ram("people-backing");
        let stores = StoreManager::new();
        let backing = StorageProxyImpl::new(
            stores.get_or_create::<CrdtSet<RawEntity>>(&key) as Arc<dyn Store<CrdtSet<RawEntity>>>,
            Scheduler::current("arc"),
        );
        factory.register_backing(&backing);

        let mut ada = RawEntity::empty("p1");
        ada.singletons.insert("name".into(), Some("Ada".into()));
        // Not awaited: the local replica already holds the write
        let _pending = backing
            .apply_op(CrdtSetOp::Add {
                actor: "w".into(),
                version_map: VersionMap::from_pairs([("w", 1)]),
                added: ada.clone(),
            })
            .unwrap();

        let mut found = Reference::new("p1", key.clone(), None);
        factory.inject_reference(&schema, &mut found);
        assert_eq!(found.dereference().await.unwrap(), Some(ada));

        let mut missing = Reference::new("p2", key.clone(), None);
        factory.inject_reference(&schema, &mut missing);
        assert_eq!(missing.dereference().await.unwrap(), None);

        // A replica that has seen the referenced version reports a tombstone
        let mut removed = Reference::new("p3", key, Some(VersionMap::from_pairs([("w", 1)])));
        factory.inject_reference(&schema, &mut removed);
        let tombstone = removed.dereference().await.unwrap().unwrap();
        assert_eq!(tombstone.id, "p3");
        assert!(tombstone.is_nulled_out());
    }

    #[tokio::test]
    async fn test_unopened_backing_key_resolves_to_none() {
        let (schemas, factory) = setup();
        let schema = schemas.register(person_schema());
        let mut reference = Reference::new(
            "p1",
            StorageKey::ram("nowhere"),
            Some(VersionMap::from_pairs([("w", 1)])),
        );
        factory.inject_reference(&schema, &mut reference);
        assert_eq!(reference.dereference().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dropped_backing_proxy_is_forgotten() {
        let (schemas, factory) = setup();
        let schema = schemas.register(person_schema());
        let key = StorageKey::ram("people-backing");
        let stores = StoreManager::new();
        let backing = StorageProxyImpl::new(
            stores.get_or_create::<CrdtSet<RawEntity>>(&key) as Arc<dyn Store<CrdtSet<RawEntity>>>,
            Scheduler::current("arc"),
        );
        factory.register_backing(&backing);
        drop(backing);

        let mut reference = Reference::new("p1", key, None);
        factory.inject_reference(&schema, &mut reference);
        assert_eq!(reference.dereference().await.unwrap(), None);
    }

    #[test]
    fn test_factory_caches_per_schema() {
        let (schemas, factory) = setup();
        let schema = schemas.register(person_schema());
        assert!(Arc::ptr_eq(&factory.create(&schema), &factory.create(&schema)));
    }

    #[tokio::test]
    async fn test_nested_references_get_dereferencers() {
        let (schemas, factory) = setup();
        let person = schemas.register(person_schema());
        let team = schemas.register(
            Schema::builder("Team")
                .singleton("lead", FieldType::EntityRef(person.hash.clone()))
                .collection("members", FieldType::EntityRef(person.hash.clone()))
                .build(),
        );

        let key = StorageKey::ram("people-backing");
        let mut entity = RawEntity::empty("t1");
        entity.singletons.insert(
            "lead".into(),
            Some(Reference::new("p1", key.clone(), None).into()),
        );
        entity.collections.insert(
            "members".into(),
            vec![Reference::new("p2", key, None).into()],
        );

        factory.inject_dereferencers(&team, &mut entity);
        let lead = match entity.singletons.get("lead") {
            Some(Some(FieldValue::Reference(r))) => r.clone(),
            other => panic!("unexpected lead {:?}", other),
        };
        assert!(lead.has_dereferencer());
        match &entity.collections["members"][0] {
            FieldValue::Reference(r) => assert!(r.has_dereferencer()),
            other => panic!("unexpected member {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_foreign_references() {
        let schemas = Arc::new(SchemaRegistry::new());
        let package = schemas.register(Schema::builder("Package").build());
        let checker = ForeignReferenceCheckerImpl::new([(
            package.clone(),
            Box::new(|id: &str| id == "installed") as ForeignCheck,
        )])
        .unwrap();
        let factory = DereferencerFactory::new(schemas, Arc::new(checker));

        let mut valid = Reference::new("installed", StorageKey::foreign("Package"), None);
        factory.inject_reference(&package, &mut valid);
        assert!(valid.is_alive().await.unwrap());

        let mut invalid = Reference::new("missing", StorageKey::foreign("Package"), None);
        factory.inject_reference(&package, &mut invalid);
        assert!(invalid.is_dead().await.unwrap());

        assert!(factory.foreign_reference(&package, "missing").is_none());
        let created = factory.foreign_reference(&package, "installed").unwrap();
        assert_eq!(created.storage_key, StorageKey::foreign("Package"));
        assert!(created.is_alive().await.unwrap());
    }

    #[test]
    fn test_foreign_checker_rejects_schemas_with_fields() {
        let schema = Arc::new(person_schema());
        let err = ForeignReferenceCheckerImpl::new([(schema, Box::new(|_: &str| true) as ForeignCheck)])
            .err()
            .unwrap();
        assert_eq!(
            err.to_string(),
            "Only schemas with no fields can be registered with a foreign reference checker: Person"
        );
    }
}
