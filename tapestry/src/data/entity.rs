//! Typed entities over [`RawEntity`]
//!
//! [`EntityRecord`] is the record-storage core. Two implementations ship
//! here: [`EntityBase`] enforces its schema and drops unknown fields, while
//! [`VariableEntityBase`] keeps fields its schema does not declare so they
//! survive a read-modify-write cycle. Application types wrap one of them and
//! implement [`Entity`]; an [`EntitySpec`] turns raw records back into the
//! application type.

use crate::data::raw::{FieldValue, RawEntity, NO_REFERENCE_ID, UNINITIALIZED_TIMESTAMP};
use crate::data::reference::Reference;
use crate::data::schema::{FieldType, Schema};
use crate::error::EntityError;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Record storage shared by every entity type
pub trait EntityRecord: Clone + fmt::Debug + Send + Sync + 'static {
    /// Assigned id, `None` until the entity is first stored
    fn entity_id(&self) -> Option<&str>;

    fn set_entity_id(&mut self, id: String);

    fn creation_timestamp(&self) -> i64;

    fn set_creation_timestamp(&mut self, millis: i64);

    fn expiration_timestamp(&self) -> i64;

    fn set_expiration_timestamp(&mut self, millis: i64);

    fn schema(&self) -> &Arc<Schema>;

    /// Flatten into the untyped form stored in CRDTs
    fn serialize(&self) -> RawEntity;

    fn is_expired(&self, now: i64) -> bool {
        let expiration = self.expiration_timestamp();
        expiration != UNINITIALIZED_TIMESTAMP && expiration < now
    }
}

/// An application entity type
pub trait Entity: Clone + fmt::Debug + Send + Sync + 'static {
    type Record: EntityRecord;

    fn record(&self) -> &Self::Record;

    fn record_mut(&mut self) -> &mut Self::Record;
}

/// Turns raw records into entities of one type
pub trait EntitySpec: Send + Sync + 'static {
    type Entity: Entity;

    fn schema(&self) -> &Arc<Schema>;

    fn deserialize(&self, raw: &RawEntity) -> Result<Self::Entity, EntityError>;
}

/// Schema-checked entity storage
#[derive(Debug, Clone, PartialEq)]
pub struct EntityBase {
    class_name: String,
    schema: Arc<Schema>,
    id: Option<String>,
    singletons: BTreeMap<String, Option<FieldValue>>,
    collections: BTreeMap<String, Vec<FieldValue>>,
    creation_timestamp: i64,
    expiration_timestamp: i64,
}

impl EntityBase {
    /// Empty entity with every schema field present and unset
    pub fn new(class_name: impl Into<String>, schema: Arc<Schema>) -> Self {
        let singletons = schema
            .fields
            .singletons
            .keys()
            .map(|field| (field.clone(), None))
            .collect();
        let collections = schema
            .fields
            .collections
            .keys()
            .map(|field| (field.clone(), Vec::new()))
            .collect();
        Self {
            class_name: class_name.into(),
            schema,
            id: None,
            singletons,
            collections,
            creation_timestamp: UNINITIALIZED_TIMESTAMP,
            expiration_timestamp: UNINITIALIZED_TIMESTAMP,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Rebuild from a raw record, ignoring fields the schema does not declare
    pub fn from_raw(
        class_name: impl Into<String>,
        schema: Arc<Schema>,
        raw: &RawEntity,
    ) -> Result<Self, EntityError> {
        let mut entity = Self::new(class_name, schema);
        entity.absorb(raw, |_, _| {}, |_, _| {})?;
        Ok(entity)
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn get_singleton(&self, field: &str) -> Result<Option<&FieldValue>, EntityError> {
        self.singletons
            .get(field)
            .map(Option::as_ref)
            .ok_or_else(|| self.unknown("singleton", field))
    }

    pub fn set_singleton(
        &mut self,
        field: &str,
        value: Option<FieldValue>,
    ) -> Result<(), EntityError> {
        let ty = self
            .schema
            .singleton_type(field)
            .ok_or_else(|| self.unknown("singleton", field))?;
        if let Some(value) = &value {
            self.check_kind(field, ty, value)?;
        }
        self.singletons.insert(field.to_string(), value);
        Ok(())
    }

    pub fn get_collection(&self, field: &str) -> Result<&[FieldValue], EntityError> {
        self.collections
            .get(field)
            .map(Vec::as_slice)
            .ok_or_else(|| self.unknown("collection", field))
    }

    pub fn set_collection(
        &mut self,
        field: &str,
        values: Vec<FieldValue>,
    ) -> Result<(), EntityError> {
        let ty = self
            .schema
            .collection_type(field)
            .ok_or_else(|| self.unknown("collection", field))?;
        for value in &values {
            self.check_kind(field, ty, value)?;
        }
        self.collections.insert(field.to_string(), values);
        Ok(())
    }

    pub fn text(&self, field: &str) -> Result<Option<String>, EntityError> {
        self.typed(field, FieldType::Text, |v| match v {
            FieldValue::Text(s) => Some(s.clone()),
            _ => None,
        })
    }

    pub fn number(&self, field: &str) -> Result<Option<f64>, EntityError> {
        self.typed(field, FieldType::Number, |v| match v {
            FieldValue::Number(n) => Some(*n),
            _ => None,
        })
    }

    pub fn boolean(&self, field: &str) -> Result<Option<bool>, EntityError> {
        self.typed(field, FieldType::Boolean, |v| match v {
            FieldValue::Boolean(b) => Some(*b),
            _ => None,
        })
    }

    pub fn int(&self, field: &str) -> Result<Option<i32>, EntityError> {
        self.typed(field, FieldType::Int, |v| match v {
            FieldValue::Int(i) => Some(*i),
            _ => None,
        })
    }

    pub fn long(&self, field: &str) -> Result<Option<i64>, EntityError> {
        self.typed(field, FieldType::Long, |v| match v {
            FieldValue::Long(l) => Some(*l),
            _ => None,
        })
    }

    pub fn reference(&self, field: &str) -> Result<Option<Reference>, EntityError> {
        self.typed(field, FieldType::EntityRef(String::new()), |v| match v {
            FieldValue::Reference(r) => Some(r.clone()),
            _ => None,
        })
    }

    fn typed<T>(
        &self,
        field: &str,
        expected: FieldType,
        extract: impl Fn(&FieldValue) -> Option<T>,
    ) -> Result<Option<T>, EntityError> {
        match self.get_singleton(field)? {
            None => Ok(None),
            Some(value) => extract(value)
                .map(Some)
                .ok_or_else(|| self.mismatch(field, &expected, value)),
        }
    }

    fn check_kind(&self, field: &str, ty: &FieldType, value: &FieldValue) -> Result<(), EntityError> {
        if value.matches(ty) {
            Ok(())
        } else {
            Err(self.mismatch(field, ty, value))
        }
    }

    fn mismatch(&self, field: &str, expected: &FieldType, value: &FieldValue) -> EntityError {
        EntityError::KindMismatch {
            expected: expected.to_string(),
            class: self.class_name.clone(),
            field: field.to_string(),
            received: value.to_string(),
        }
    }

    fn unknown(&self, kind: &'static str, field: &str) -> EntityError {
        EntityError::UnknownField {
            class: self.class_name.clone(),
            kind,
            field: field.to_string(),
        }
    }

    /// Copy id, timestamps and declared fields from `raw`, handing
    /// undeclared fields to the given sinks.
    fn absorb(
        &mut self,
        raw: &RawEntity,
        mut extra_singleton: impl FnMut(&str, &Option<FieldValue>),
        mut extra_collection: impl FnMut(&str, &Vec<FieldValue>),
    ) -> Result<(), EntityError> {
        self.id = raw.has_id().then(|| raw.id.clone());
        self.creation_timestamp = raw.creation_timestamp;
        self.expiration_timestamp = raw.expiration_timestamp;
        for (field, value) in &raw.singletons {
            if self.schema.singleton_type(field).is_some() {
                self.set_singleton(field, value.clone())?;
            } else {
                extra_singleton(field, value);
            }
        }
        for (field, values) in &raw.collections {
            if self.schema.collection_type(field).is_some() {
                self.set_collection(field, values.clone())?;
            } else {
                extra_collection(field, values);
            }
        }
        Ok(())
    }
}

impl EntityRecord for EntityBase {
    fn entity_id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn set_entity_id(&mut self, id: String) {
        self.id = Some(id);
    }

    fn creation_timestamp(&self) -> i64 {
        self.creation_timestamp
    }

    fn set_creation_timestamp(&mut self, millis: i64) {
        self.creation_timestamp = millis;
    }

    fn expiration_timestamp(&self) -> i64 {
        self.expiration_timestamp
    }

    fn set_expiration_timestamp(&mut self, millis: i64) {
        self.expiration_timestamp = millis;
    }

    fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    fn serialize(&self) -> RawEntity {
        RawEntity {
            id: self.id.clone().unwrap_or_else(|| NO_REFERENCE_ID.to_string()),
            singletons: self.singletons.clone(),
            collections: self.collections.clone(),
            creation_timestamp: self.creation_timestamp,
            expiration_timestamp: self.expiration_timestamp,
        }
    }
}

impl Entity for EntityBase {
    type Record = EntityBase;

    fn record(&self) -> &EntityBase {
        self
    }

    fn record_mut(&mut self) -> &mut EntityBase {
        self
    }
}

/// Entity storage that preserves fields its schema does not know about
#[derive(Debug, Clone, PartialEq)]
pub struct VariableEntityBase {
    base: EntityBase,
    extra_singletons: BTreeMap<String, Option<FieldValue>>,
    extra_collections: BTreeMap<String, Vec<FieldValue>>,
}

impl VariableEntityBase {
    pub fn new(class_name: impl Into<String>, schema: Arc<Schema>) -> Self {
        Self {
            base: EntityBase::new(class_name, schema),
            extra_singletons: BTreeMap::new(),
            extra_collections: BTreeMap::new(),
        }
    }

    /// Rebuild from a raw record, keeping undeclared fields verbatim
    pub fn from_raw(
        class_name: impl Into<String>,
        schema: Arc<Schema>,
        raw: &RawEntity,
    ) -> Result<Self, EntityError> {
        let mut base = EntityBase::new(class_name, schema);
        let mut extra_singletons = BTreeMap::new();
        let mut extra_collections = BTreeMap::new();
        base.absorb(
            raw,
            |field, value| {
                extra_singletons.insert(field.to_string(), value.clone());
            },
            |field, values| {
                extra_collections.insert(field.to_string(), values.clone());
            },
        )?;
        Ok(Self {
            base,
            extra_singletons,
            extra_collections,
        })
    }

    pub fn base(&self) -> &EntityBase {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut EntityBase {
        &mut self.base
    }

    /// Any singleton, declared or not
    pub fn raw_singleton(&self, field: &str) -> Option<&FieldValue> {
        match self.base.get_singleton(field) {
            Ok(value) => value,
            Err(_) => self.extra_singletons.get(field).and_then(Option::as_ref),
        }
    }

    /// Set any singleton; declared fields are still kind-checked
    pub fn set_raw_singleton(
        &mut self,
        field: &str,
        value: Option<FieldValue>,
    ) -> Result<(), EntityError> {
        if self.base.schema.singleton_type(field).is_some() {
            self.base.set_singleton(field, value)
        } else {
            self.extra_singletons.insert(field.to_string(), value);
            Ok(())
        }
    }

    pub fn raw_collection(&self, field: &str) -> &[FieldValue] {
        match self.base.get_collection(field) {
            Ok(values) => values,
            Err(_) => self
                .extra_collections
                .get(field)
                .map(Vec::as_slice)
                .unwrap_or(&[]),
        }
    }
}

impl EntityRecord for VariableEntityBase {
    fn entity_id(&self) -> Option<&str> {
        self.base.entity_id()
    }

    fn set_entity_id(&mut self, id: String) {
        self.base.set_entity_id(id);
    }

    fn creation_timestamp(&self) -> i64 {
        self.base.creation_timestamp
    }

    fn set_creation_timestamp(&mut self, millis: i64) {
        self.base.creation_timestamp = millis;
    }

    fn expiration_timestamp(&self) -> i64 {
        self.base.expiration_timestamp
    }

    fn set_expiration_timestamp(&mut self, millis: i64) {
        self.base.expiration_timestamp = millis;
    }

    fn schema(&self) -> &Arc<Schema> {
        &self.base.schema
    }

    fn serialize(&self) -> RawEntity {
        let mut raw = self.base.serialize();
        for (field, value) in &self.extra_singletons {
            raw.singletons.insert(field.clone(), value.clone());
        }
        for (field, values) in &self.extra_collections {
            raw.collections.insert(field.clone(), values.clone());
        }
        raw
    }
}

impl Entity for VariableEntityBase {
    type Record = VariableEntityBase;

    fn record(&self) -> &VariableEntityBase {
        self
    }

    fn record_mut(&mut self) -> &mut VariableEntityBase {
        self
    }
}

/// Spec producing plain [`EntityBase`] values
#[derive(Debug, Clone)]
pub struct BaseEntitySpec {
    class_name: String,
    schema: Arc<Schema>,
}

impl BaseEntitySpec {
    pub fn new(class_name: impl Into<String>, schema: Arc<Schema>) -> Self {
        Self {
            class_name: class_name.into(),
            schema,
        }
    }

    /// Fresh, empty entity of this spec
    pub fn create(&self) -> EntityBase {
        EntityBase::new(self.class_name.clone(), self.schema.clone())
    }
}

impl EntitySpec for BaseEntitySpec {
    type Entity = EntityBase;

    fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    fn deserialize(&self, raw: &RawEntity) -> Result<EntityBase, EntityError> {
        EntityBase::from_raw(self.class_name.clone(), self.schema.clone(), raw)
    }
}

/// Spec producing [`VariableEntityBase`] values
#[derive(Debug, Clone)]
pub struct VariableEntitySpec {
    class_name: String,
    schema: Arc<Schema>,
}

impl VariableEntitySpec {
    pub fn new(class_name: impl Into<String>, schema: Arc<Schema>) -> Self {
        Self {
            class_name: class_name.into(),
            schema,
        }
    }
}

impl EntitySpec for VariableEntitySpec {
    type Entity = VariableEntityBase;

    fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    fn deserialize(&self, raw: &RawEntity) -> Result<VariableEntityBase, EntityError> {
        VariableEntityBase::from_raw(self.class_name.clone(), self.schema.clone(), raw)
    }
}
