//! Entity schemas and the schema registry

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Declared type of an entity field
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Boolean,
    Number,
    Text,
    Int,
    Long,
    /// Reference to an entity of the schema with this hash
    EntityRef(String),
    /// Nested entity of the schema with this hash, stored inline
    Inline(String),
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Boolean => write!(f, "Boolean"),
            FieldType::Number => write!(f, "Number"),
            FieldType::Text => write!(f, "Text"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Long => write!(f, "Long"),
            FieldType::EntityRef(_) => write!(f, "Reference"),
            FieldType::Inline(_) => write!(f, "InlineEntity"),
        }
    }
}

/// Singleton and collection fields of a schema
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaFields {
    pub singletons: BTreeMap<String, FieldType>,
    pub collections: BTreeMap<String, FieldType>,
}

impl SchemaFields {
    pub fn is_empty(&self) -> bool {
        self.singletons.is_empty() && self.collections.is_empty()
    }
}

/// Shape of an entity type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub names: Vec<String>,
    pub fields: SchemaFields,
    pub hash: String,
}

impl Schema {
    /// Create a schema; a hash is derived from names and fields when not given
    pub fn new(names: Vec<String>, fields: SchemaFields, hash: Option<String>) -> Self {
        let hash = hash.unwrap_or_else(|| Self::compute_hash(&names, &fields));
        Self {
            names,
            fields,
            hash,
        }
    }

    /// Start building a schema named `name`
    pub fn builder(name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            names: vec![name.into()],
            fields: SchemaFields::default(),
            hash: None,
        }
    }

    /// Schema with no name and no fields
    pub fn empty() -> Self {
        Self::new(Vec::new(), SchemaFields::default(), None)
    }

    /// Primary name, used in error messages
    pub fn name(&self) -> &str {
        self.names.first().map(String::as_str).unwrap_or("Anonymous")
    }

    pub fn singleton_type(&self, field: &str) -> Option<&FieldType> {
        self.fields.singletons.get(field)
    }

    pub fn collection_type(&self, field: &str) -> Option<&FieldType> {
        self.fields.collections.get(field)
    }

    fn compute_hash(names: &[String], fields: &SchemaFields) -> String {
        let mut hasher = blake3::Hasher::new();
        for name in names {
            hasher.update(name.as_bytes());
            hasher.update(&[0]);
        }
        for (kind, map) in [("s", &fields.singletons), ("c", &fields.collections)] {
            for (field, ty) in map {
                hasher.update(kind.as_bytes());
                hasher.update(field.as_bytes());
                hasher.update(format!("{:?}", ty).as_bytes());
                hasher.update(&[0]);
            }
        }
        hasher.finalize().to_hex()[..40].to_string()
    }
}

/// Builder for [`Schema`]
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    names: Vec<String>,
    fields: SchemaFields,
    hash: Option<String>,
}

impl SchemaBuilder {
    pub fn also_named(mut self, name: impl Into<String>) -> Self {
        self.names.push(name.into());
        self
    }

    pub fn singleton(mut self, field: impl Into<String>, ty: FieldType) -> Self {
        self.fields.singletons.insert(field.into(), ty);
        self
    }

    pub fn collection(mut self, field: impl Into<String>, ty: FieldType) -> Self {
        self.fields.collections.insert(field.into(), ty);
        self
    }

    pub fn hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }

    pub fn build(self) -> Schema {
        Schema::new(self.names, self.fields, self.hash)
    }
}

/// Process-scoped schema lookup by hash
///
/// Passed explicitly to every component that resolves schemas, so tests can
/// build and clear their own.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<String, Arc<Schema>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema, returning the shared copy
    pub fn register(&self, schema: Schema) -> Arc<Schema> {
        let schema = Arc::new(schema);
        self.schemas
            .write()
            .insert(schema.hash.clone(), schema.clone());
        schema
    }

    pub fn get(&self, hash: &str) -> Option<Arc<Schema>> {
        self.schemas.read().get(hash).cloned()
    }

    pub fn clear(&self) {
        self.schemas.write().clear();
    }

    pub fn len(&self) -> usize {
        self.schemas.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
