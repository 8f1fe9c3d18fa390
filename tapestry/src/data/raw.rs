//! Untyped entity representation stored in CRDTs

use crate::data::reference::Reference;
use crate::data::schema::FieldType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tapestry_crdt::Referencable;

/// Id carried by entities that have not been assigned one yet
pub const NO_REFERENCE_ID: &str = "NO REFERENCE ID";

/// Timestamp value meaning "not set"
pub const UNINITIALIZED_TIMESTAMP: i64 = -1;

/// A single field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Boolean(bool),
    Number(f64),
    Text(String),
    Int(i32),
    Long(i64),
    Reference(Reference),
    Inline(RawEntity),
}

impl FieldValue {
    /// Whether this value may be stored in a field of type `ty`
    pub fn matches(&self, ty: &FieldType) -> bool {
        matches!(
            (self, ty),
            (FieldValue::Boolean(_), FieldType::Boolean)
                | (FieldValue::Number(_), FieldType::Number)
                | (FieldValue::Text(_), FieldType::Text)
                | (FieldValue::Int(_), FieldType::Int)
                | (FieldValue::Long(_), FieldType::Long)
                | (FieldValue::Reference(_), FieldType::EntityRef(_))
                | (FieldValue::Inline(_), FieldType::Inline(_))
        )
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            FieldValue::Boolean(_) => "Boolean",
            FieldValue::Number(_) => "Number",
            FieldValue::Text(_) => "Text",
            FieldValue::Int(_) => "Int",
            FieldValue::Long(_) => "Long",
            FieldValue::Reference(_) => "Reference",
            FieldValue::Inline(_) => "InlineEntity",
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Boolean(b) => write!(f, "{}", b),
            FieldValue::Number(n) => write!(f, "{:?}", n),
            FieldValue::Text(s) => write!(f, "{}", s),
            FieldValue::Int(i) => write!(f, "{}", i),
            FieldValue::Long(l) => write!(f, "{}", l),
            FieldValue::Reference(r) => write!(f, "Reference({})", r.id),
            FieldValue::Inline(e) => write!(f, "InlineEntity({})", e.id),
        }
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Boolean(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Int(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Long(value)
    }
}

impl From<Reference> for FieldValue {
    fn from(value: Reference) -> Self {
        FieldValue::Reference(value)
    }
}

/// Schema-less entity record, the payload of entity CRDTs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEntity {
    pub id: String,
    pub singletons: BTreeMap<String, Option<FieldValue>>,
    pub collections: BTreeMap<String, Vec<FieldValue>>,
    pub creation_timestamp: i64,
    pub expiration_timestamp: i64,
}

impl RawEntity {
    pub fn new(
        id: impl Into<String>,
        singletons: BTreeMap<String, Option<FieldValue>>,
        collections: BTreeMap<String, Vec<FieldValue>>,
    ) -> Self {
        Self {
            id: id.into(),
            singletons,
            collections,
            creation_timestamp: UNINITIALIZED_TIMESTAMP,
            expiration_timestamp: UNINITIALIZED_TIMESTAMP,
        }
    }

    /// Entity with an id and no fields
    pub fn empty(id: impl Into<String>) -> Self {
        Self::new(id, BTreeMap::new(), BTreeMap::new())
    }

    pub fn with_timestamps(mut self, creation: i64, expiration: i64) -> Self {
        self.creation_timestamp = creation;
        self.expiration_timestamp = expiration;
        self
    }

    pub fn has_id(&self) -> bool {
        self.id != NO_REFERENCE_ID
    }

    /// Tombstone for this entity: same id and field names, no values
    pub fn nulled_out(&self) -> RawEntity {
        RawEntity {
            id: self.id.clone(),
            singletons: self.singletons.keys().map(|k| (k.clone(), None)).collect(),
            collections: self
                .collections
                .keys()
                .map(|k| (k.clone(), Vec::new()))
                .collect(),
            creation_timestamp: UNINITIALIZED_TIMESTAMP,
            expiration_timestamp: UNINITIALIZED_TIMESTAMP,
        }
    }

    pub fn is_nulled_out(&self) -> bool {
        self.singletons.values().all(Option::is_none)
            && self.collections.values().all(Vec::is_empty)
            && self.creation_timestamp == UNINITIALIZED_TIMESTAMP
            && self.expiration_timestamp == UNINITIALIZED_TIMESTAMP
    }

    /// Expired when an expiration is set and lies before `now`
    pub fn is_expired(&self, now: i64) -> bool {
        self.expiration_timestamp != UNINITIALIZED_TIMESTAMP && self.expiration_timestamp < now
    }
}

impl Referencable for RawEntity {
    fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person() -> RawEntity {
        let mut singletons = BTreeMap::new();
        singletons.insert("name".to_string(), Some(FieldValue::from("Ada")));
        singletons.insert("age".to_string(), Some(FieldValue::from(36.0)));
        let mut collections = BTreeMap::new();
        collections.insert("tags".to_string(), vec![FieldValue::from("math")]);
        RawEntity::new("p1", singletons, collections).with_timestamps(10, 20)
    }

    #[test]
    fn test_nulled_out_keeps_shape() {
        let tombstone = person().nulled_out();
        assert_eq!(tombstone.id, "p1");
        assert_eq!(tombstone.singletons.get("name"), Some(&None));
        assert_eq!(tombstone.collections.get("tags"), Some(&Vec::new()));
        assert!(tombstone.is_nulled_out());
        assert!(!person().is_nulled_out());
    }

    #[test]
    fn test_expiry() {
        let entity = person();
        assert!(!entity.is_expired(20));
        assert!(entity.is_expired(21));
        assert!(!RawEntity::empty("x").is_expired(i64::MAX));
    }

    #[test]
    fn test_field_value_matching() {
        assert!(FieldValue::from(true).matches(&FieldType::Boolean));
        assert!(!FieldValue::from(1.0).matches(&FieldType::Boolean));
        assert!(FieldValue::from(7i64).matches(&FieldType::Long));
        assert_eq!(FieldValue::from(1.0).to_string(), "1.0");
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_value(FieldValue::from("x")).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "text", "value": "x"}));

        let back: RawEntity = serde_json::from_str(&serde_json::to_string(&person()).unwrap()).unwrap();
        assert_eq!(back, person());
    }

    #[test]
    fn test_has_id() {
        assert!(!RawEntity::empty(NO_REFERENCE_ID).has_id());
        assert!(person().has_id());
    }
}
